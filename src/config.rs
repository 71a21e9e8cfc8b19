//! Runner configuration
//!
//! Settings are loaded from a YAML file passed via `--conf`. Validation runs
//! once at startup; a config that cannot satisfy every job's resource request
//! fails the process before the first poll.

use crate::cluster::params::{RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE, RESOURCE_STORAGE};
use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry of the default resource request list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResourceQuantity {
    /// Kubernetes resource name, e.g. `cpu` or `ephemeral-storage`
    #[serde(rename = "type")]
    pub resource: String,

    /// Quantity string in Kubernetes notation, e.g. `1000m` or `8Gi`
    pub quantity: String,
}

/// Main runner configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Base URL of the GitLab instance. Not the api url
    pub gitlab_url: String,

    /// Token of the registered runner
    pub runner_token: String,

    /// Name advertised to the coordinator when polling for jobs
    #[serde(default)]
    pub runner_name: String,

    /// Kubernetes namespace where every job object is created
    pub k8s_namespace: String,

    /// GCS bucket used by the generated build script for cache pull/push
    #[serde(default)]
    pub gcp_cache_bucket: String,

    /// Resource requests applied to jobs that do not override them
    #[serde(default)]
    pub default_resource_request: Vec<ResourceQuantity>,

    /// Node selector applied to jobs that do not override it
    #[serde(default)]
    pub default_node_selector: BTreeMap<String, String>,
}

impl RunnerConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Startup validation. The default resource request must cover cpu, the
    /// build volume and ephemeral storage, otherwise jobs without an
    /// `SFS_RESOURCE_REQUEST` override could never be provisioned.
    pub fn validate(&self) -> Result<()> {
        if self.gitlab_url.is_empty() {
            return Err(Error::Config("gitlab_url is not set".to_string()));
        }
        if self.runner_token.is_empty() {
            return Err(Error::Config("runner_token is not set".to_string()));
        }
        if self.k8s_namespace.is_empty() {
            return Err(Error::Config("k8s_namespace is not set".to_string()));
        }

        for required in [RESOURCE_CPU, RESOURCE_STORAGE, RESOURCE_EPHEMERAL_STORAGE] {
            if !self
                .default_resource_request
                .iter()
                .any(|rq| rq.resource == required)
            {
                return Err(Error::Config(format!(
                    "default_resource_request is missing an entry for '{required}'"
                )));
            }
        }

        Ok(())
    }
}
