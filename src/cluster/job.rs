//! Handle for one provisioned Kubernetes job.
//!
//! Wraps the Job created by the provisioner together with the Apis needed to
//! poll its status, pull pod logs and tear everything down. Deleting the Job
//! with background propagation garbage-collects the owned ConfigMap and PVC.

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use kube::api::{DeleteParams, ListParams, LogParams, PropagationPolicy};
use kube::Api;
use std::collections::BTreeMap;

/// The single container of the job pod that runs the entrypoint script
pub const CONTAINER_NAME_BUILDER: &str = "builder";

pub const POD_PENDING: &str = "Pending";
pub const POD_RUNNING: &str = "Running";
pub const POD_SUCCEEDED: &str = "Succeeded";
pub const POD_FAILED: &str = "Failed";
pub const POD_UNKNOWN: &str = "Unknown";

/// Composite status of the Job and the pods it controls
pub struct JobReadout {
    pub status: JobStatus,
    pub pods: Vec<Pod>,
    /// Container name to phase of the pod hosting it. Containers declared in
    /// the spec but not seen on any pod yet appear as `Unknown`.
    pub container_phases: BTreeMap<String, String>,
}

/// One job provisioned on the cluster
pub struct RunnerJob {
    pub name: String,
    job: Job,
    entrypoint_map: ConfigMap,
    pvc: PersistentVolumeClaim,
    jobs: Api<Job>,
    pods: Api<Pod>,
}

impl RunnerJob {
    pub(crate) fn new(
        job: Job,
        entrypoint_map: ConfigMap,
        pvc: PersistentVolumeClaim,
        jobs: Api<Job>,
        pods: Api<Pod>,
    ) -> Result<Self> {
        let name = job
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Provisioning("created job has no name".to_string()))?;

        Ok(Self {
            name,
            job,
            entrypoint_map,
            pvc,
            jobs,
            pods,
        })
    }

    pub fn entrypoint_map_name(&self) -> Option<&str> {
        self.entrypoint_map.metadata.name.as_deref()
    }

    pub fn pvc_name(&self) -> Option<&str> {
        self.pvc.metadata.name.as_deref()
    }

    /// Fetch the Job status together with the current phase of every
    /// container, resolved through the pods the Job controls.
    pub async fn readout(&self) -> Result<JobReadout> {
        let fetched = self.jobs.get(&self.name).await?;

        // initialize declared containers to Unknown
        let mut container_phases = BTreeMap::new();
        if let Some(template_spec) = self
            .job
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
        {
            for container in &template_spec.containers {
                container_phases.insert(container.name.clone(), POD_UNKNOWN.to_string());
            }
        }

        let pods = self.controlled_pods().await?;
        for pod in &pods {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| POD_UNKNOWN.to_string());
            if let Some(pod_spec) = pod.spec.as_ref() {
                for container in &pod_spec.containers {
                    container_phases.insert(container.name.clone(), phase.clone());
                }
            }
        }

        Ok(JobReadout {
            status: fetched.status.unwrap_or_default(),
            pods,
            container_phases,
        })
    }

    /// One finite snapshot of the builder container log, newest lines only
    /// when `since` is set. The server-side filter is inclusive; callers
    /// dedupe on the timestamp prefix.
    pub async fn fetch_log(&self, pod_name: &str, since: Option<DateTime<Utc>>) -> Result<String> {
        let params = LogParams {
            container: Some(CONTAINER_NAME_BUILDER.to_string()),
            timestamps: true,
            since_time: since,
            ..LogParams::default()
        };

        Ok(self.pods.logs(pod_name, &params).await?)
    }

    /// Delete the job. Background propagation garbage-collects the owned
    /// ConfigMap and PVC asynchronously. Safe to call on a job that is
    /// already gone.
    pub async fn delete(&self) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };

        match self.jobs.delete(&self.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List pods belonging to this Job through the controller-uid label the
    /// batch controller stamps on them.
    async fn controlled_pods(&self) -> Result<Vec<Pod>> {
        let uid = self
            .job
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| Error::Provisioning("created job has no uid".to_string()))?;

        let selector = format!("controller-uid={uid}");
        let list = self
            .pods
            .list(&ListParams::default().labels(&selector))
            .await?;

        Ok(list.items)
    }
}
