//! Per-job Kubernetes parameters.
//!
//! Every accepted job gets a [`JobParameters`] value derived from the
//! runner-wide defaults plus the recognized `SFS_*` job variables.

use crate::config::RunnerConfig;
use crate::errors::{Error, Result};
use crate::protocol::spec::JobVariable;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;
use std::collections::BTreeMap;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_STORAGE: &str = "storage";
pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";

/// JSON map merged over the default resource request, requested keys win
pub const VAR_RESOURCE_REQUEST: &str = "SFS_RESOURCE_REQUEST";
/// Integer seconds before Kubernetes kills the job pod
pub const VAR_ACTIVE_DEADLINE_SEC: &str = "SFS_ACTIVE_DEADLINE_SEC";
/// JSON map replacing the default node selector
pub const VAR_NODE_SELECTOR: &str = "SFS_NODE_SELECTOR";

pub const DEFAULT_ACTIVE_DEADLINE_SEC: i64 = 3600;

/// Additional parameters for the Kubernetes job spec
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobParameters {
    pub resource_request: BTreeMap<String, Quantity>,
    pub active_deadline_sec: i64,
    pub node_selector: BTreeMap<String, String>,
}

impl JobParameters {
    /// Runner-wide defaults from the configuration file. `validate()` on the
    /// config guarantees cpu, storage and ephemeral-storage are present.
    pub fn defaults_from(config: &RunnerConfig) -> Self {
        let resource_request = config
            .default_resource_request
            .iter()
            .map(|rq| (rq.resource.clone(), Quantity(rq.quantity.clone())))
            .collect();

        Self {
            resource_request,
            active_deadline_sec: DEFAULT_ACTIVE_DEADLINE_SEC,
            node_selector: config.default_node_selector.clone(),
        }
    }

    /// Apply the `SFS_*` overrides a job carries in its variables.
    pub fn with_variables(&self, variables: &[JobVariable]) -> Result<Self> {
        let mut params = self.clone();

        for variable in variables {
            match variable.key.as_str() {
                VAR_RESOURCE_REQUEST => {
                    let requested: BTreeMap<String, String> = serde_json::from_str(&variable.value)
                        .map_err(|e| {
                            Error::Provisioning(format!("invalid {VAR_RESOURCE_REQUEST}: {e}"))
                        })?;
                    for (name, quantity) in requested {
                        params.resource_request.insert(name, Quantity(quantity));
                    }
                }
                VAR_ACTIVE_DEADLINE_SEC => {
                    params.active_deadline_sec = variable.value.trim().parse().map_err(|e| {
                        Error::Provisioning(format!("invalid {VAR_ACTIVE_DEADLINE_SEC}: {e}"))
                    })?;
                }
                VAR_NODE_SELECTOR => {
                    params.node_selector =
                        serde_json::from_str(&variable.value).map_err(|e| {
                            Error::Provisioning(format!("invalid {VAR_NODE_SELECTOR}: {e}"))
                        })?;
                }
                _ => {}
            }
        }

        Ok(params)
    }

    pub fn quantity(&self, resource: &str) -> Option<&Quantity> {
        self.resource_request.get(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> JobParameters {
        JobParameters {
            resource_request: BTreeMap::from([
                (RESOURCE_CPU.to_string(), Quantity("1000m".to_string())),
                (RESOURCE_STORAGE.to_string(), Quantity("20Gi".to_string())),
                (
                    RESOURCE_EPHEMERAL_STORAGE.to_string(),
                    Quantity("4Gi".to_string()),
                ),
            ]),
            active_deadline_sec: DEFAULT_ACTIVE_DEADLINE_SEC,
            node_selector: BTreeMap::from([("pool".to_string(), "builders".to_string())]),
        }
    }

    fn var(key: &str, value: &str) -> JobVariable {
        JobVariable {
            key: key.to_string(),
            value: value.to_string(),
            public: true,
            masked: false,
        }
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let params = defaults().with_variables(&[]).unwrap();
        assert_eq!(params, defaults());
    }

    #[test]
    fn test_resource_request_merges_over_defaults() {
        let params = defaults()
            .with_variables(&[var(VAR_RESOURCE_REQUEST, r#"{"cpu":"4000m","memory":"2Gi"}"#)])
            .unwrap();

        // requested keys win, untouched defaults survive
        assert_eq!(params.quantity(RESOURCE_CPU), Some(&Quantity("4000m".to_string())));
        assert_eq!(params.quantity("memory"), Some(&Quantity("2Gi".to_string())));
        assert_eq!(
            params.quantity(RESOURCE_STORAGE),
            Some(&Quantity("20Gi".to_string()))
        );
    }

    #[test]
    fn test_active_deadline_override() {
        let params = defaults()
            .with_variables(&[var(VAR_ACTIVE_DEADLINE_SEC, "7200")])
            .unwrap();
        assert_eq!(params.active_deadline_sec, 7200);
    }

    #[test]
    fn test_node_selector_replaces_defaults() {
        let params = defaults()
            .with_variables(&[var(VAR_NODE_SELECTOR, r#"{"class":"highmem"}"#)])
            .unwrap();

        assert_eq!(params.node_selector.len(), 1);
        assert_eq!(params.node_selector.get("class"), Some(&"highmem".to_string()));
        assert!(!params.node_selector.contains_key("pool"));
    }

    #[test]
    fn test_invalid_overrides_are_rejected() {
        assert!(defaults()
            .with_variables(&[var(VAR_RESOURCE_REQUEST, "not json")])
            .is_err());
        assert!(defaults()
            .with_variables(&[var(VAR_ACTIVE_DEADLINE_SEC, "soon")])
            .is_err());
        assert!(defaults()
            .with_variables(&[var(VAR_NODE_SELECTOR, "[]")])
            .is_err());
    }

    #[test]
    fn test_unrelated_variables_are_ignored() {
        let params = defaults()
            .with_variables(&[var("CI_COMMIT_SHA", "deadbeef")])
            .unwrap();
        assert_eq!(params, defaults());
    }
}
