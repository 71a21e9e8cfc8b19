//! Kubernetes cluster client.
//!
//! A [`Session`] scopes every API call to the configured namespace. The
//! supervisor creates one session per accepted job so a poisoned client
//! never leaks across monitors.

pub mod job;
pub mod params;
pub mod provision;

use crate::errors::{Error, Result};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::PostParams;
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{error, info};

/// Storage class used for build PVCs. Created on first use.
pub const STORAGE_CLASS_NAME: &str = "topology-aware-fast";

static STORAGE_CLASS_INIT: OnceCell<()> = OnceCell::const_new();

/// Client session scoped to one namespace
#[derive(Clone)]
pub struct Session {
    client: Client,
    namespace: String,
}

impl Session {
    /// Start a new session, either with in-cluster service-account
    /// credentials or with the kubeconfig from the home directory.
    pub async fn create(in_cluster: bool, namespace: &str) -> Result<Session> {
        let config = if in_cluster {
            Config::incluster()
                .map_err(|e| Error::Config(format!("in-cluster kubernetes config: {e}")))?
        } else {
            Config::from_kubeconfig(&KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Config(format!("kubeconfig: {e}")))?
        };

        let client = Client::try_from(config)?;

        Ok(Session {
            client,
            namespace: namespace.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn configmaps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Make sure the build storage class exists. Guarded by a process-wide
    /// latch so concurrent monitors race through here only once; a failure is
    /// logged and left for the PVC creation to surface properly.
    pub async fn ensure_storage_class(&self) {
        let client = self.client.clone();
        STORAGE_CLASS_INIT
            .get_or_init(|| async move {
                if let Err(e) = create_storage_class_if_missing(client).await {
                    error!("failed to ensure storage class {STORAGE_CLASS_NAME}: {e}");
                }
            })
            .await;
    }
}

async fn create_storage_class_if_missing(client: Client) -> Result<()> {
    let classes: Api<StorageClass> = Api::all(client);

    match classes.get(STORAGE_CLASS_NAME).await {
        Ok(_) => return Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    let class: StorageClass = serde_json::from_value(json!({
        "apiVersion": "storage.k8s.io/v1",
        "kind": "StorageClass",
        "metadata": { "name": STORAGE_CLASS_NAME },
        "provisioner": "kubernetes.io/gce-pd",
        "volumeBindingMode": "WaitForFirstConsumer",
        "parameters": { "type": "pd-ssd" }
    }))?;

    classes.create(&PostParams::default(), &class).await?;
    info!("created storage class {STORAGE_CLASS_NAME}");

    Ok(())
}
