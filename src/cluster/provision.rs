//! Job provisioner.
//!
//! Stands up everything one job needs, in dependency order: the entrypoint
//! ConfigMap first, then the build PVC, then the Job referencing both, and
//! finally ownerReference back-patches so the Job owns the other two objects
//! and a single background-propagation delete cleans the whole bundle up.
//!
//! A failure in any step aborts provisioning. Objects created before the
//! failing step are not rolled back; the monitor never starts and the
//! orphans stay behind until removed manually.

use super::job::{RunnerJob, CONTAINER_NAME_BUILDER};
use super::params::{JobParameters, RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE, RESOURCE_STORAGE};
use super::{Session, STORAGE_CLASS_NAME};
use crate::errors::{Error, Result};
use crate::protocol::spec::JobSpec;
use crate::shell;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Patch, PatchParams, PostParams};
use kube::Api;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

const ENTRYPOINT_FILE: &str = "entrypoint.sh";
const ENTRYPOINT_MOUNT_PATH: &str = "/jobscripts";
const BUILD_MOUNT_PATH: &str = "/build";
const CONFIG_MAP_MODE: i32 = 0o744;

/// Create the ConfigMap + PVC + Job bundle for one job.
pub async fn provision(
    session: &Session,
    name_prefix: &str,
    spec: &JobSpec,
    params: &JobParameters,
    cache_bucket: &str,
) -> Result<RunnerJob> {
    session.ensure_storage_class().await;

    let script = shell::generate_script(spec, cache_bucket);

    let configmaps = session.configmaps();
    let entrypoint_map = configmaps
        .create(
            &PostParams::default(),
            &entrypoint_config_map(name_prefix, script),
        )
        .await?;
    debug!(
        "created entrypoint configmap {:?}",
        entrypoint_map.metadata.name
    );

    let storage = params
        .quantity(RESOURCE_STORAGE)
        .ok_or_else(|| Error::Provisioning("unknown quantity of storage request".to_string()))?;
    let pvcs = session.pvcs();
    let pvc = pvcs
        .create(&PostParams::default(), &build_pvc(name_prefix, storage)?)
        .await?;
    debug!("created build pvc {:?}", pvc.metadata.name);

    if params.quantity(RESOURCE_CPU).is_none() {
        return Err(Error::Provisioning(
            "unknown quantity of cpu request".to_string(),
        ));
    }

    let cm_name = entrypoint_map
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::Provisioning("created configmap has no name".to_string()))?;
    let pvc_name = pvc
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::Provisioning("created pvc has no name".to_string()))?;

    let jobs = session.jobs();
    let job = jobs
        .create(
            &PostParams::default(),
            &build_job(name_prefix, spec, params, &cm_name, &pvc_name)?,
        )
        .await?;

    // The job becomes the owner of both helper objects so that deleting it
    // garbage-collects them
    let owner = job_owner_reference(&job)?;
    patch_owner(&configmaps, &cm_name, &owner).await?;
    patch_owner(&pvcs, &pvc_name, &owner).await?;

    RunnerJob::new(job, entrypoint_map, pvc, jobs, session.pods())
}

fn entrypoint_config_map(name_prefix: &str, script: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            generate_name: Some(name_prefix.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(ENTRYPOINT_FILE.to_string(), script)])),
        ..ConfigMap::default()
    }
}

fn build_pvc(name_prefix: &str, storage: &Quantity) -> Result<PersistentVolumeClaim> {
    let pvc = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "generateName": name_prefix },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "storageClassName": STORAGE_CLASS_NAME,
            "resources": {
                "requests": { "storage": storage }
            }
        }
    });

    Ok(serde_json::from_value(pvc)?)
}

fn build_job(
    name_prefix: &str,
    spec: &JobSpec,
    params: &JobParameters,
    cm_name: &str,
    pvc_name: &str,
) -> Result<Job> {
    let env: Vec<Value> = spec
        .variables
        .iter()
        .map(|v| json!({ "name": v.key, "value": v.value }))
        .collect();

    let job = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "generateName": name_prefix },
        "spec": {
            "backoffLimit": 1,
            "template": {
                "spec": {
                    "restartPolicy": "OnFailure",
                    "activeDeadlineSeconds": params.active_deadline_sec,
                    "nodeSelector": params.node_selector,
                    "containers": [{
                        "name": CONTAINER_NAME_BUILDER,
                        "image": spec.image.name,
                        "imagePullPolicy": "Always",
                        "command": [format!("{ENTRYPOINT_MOUNT_PATH}/{ENTRYPOINT_FILE}")],
                        "env": env,
                        "volumeMounts": [
                            {
                                "name": "jobscripts",
                                "mountPath": ENTRYPOINT_MOUNT_PATH,
                                "readOnly": true
                            },
                            {
                                "name": "build",
                                "mountPath": BUILD_MOUNT_PATH
                            }
                        ],
                        "resources": { "requests": container_requests(params) }
                    }],
                    "volumes": [
                        {
                            "name": "jobscripts",
                            "configMap": {
                                "name": cm_name,
                                "defaultMode": CONFIG_MAP_MODE
                            }
                        },
                        {
                            "name": "build",
                            "persistentVolumeClaim": { "claimName": pvc_name }
                        }
                    ]
                }
            }
        }
    });

    Ok(serde_json::from_value(job)?)
}

/// Container-level resource requests. The `storage` entry sizes the PVC and
/// is not a container resource, so it stays out of the pod spec.
fn container_requests(params: &JobParameters) -> BTreeMap<String, Quantity> {
    let mut requests = BTreeMap::new();
    for resource in [RESOURCE_CPU, RESOURCE_EPHEMERAL_STORAGE] {
        if let Some(quantity) = params.quantity(resource) {
            requests.insert(resource.to_string(), quantity.clone());
        }
    }
    requests
}

fn job_owner_reference(job: &Job) -> Result<OwnerReference> {
    let name = job
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::Provisioning("created job has no name".to_string()))?;
    let uid = job
        .metadata
        .uid
        .clone()
        .ok_or_else(|| Error::Provisioning("created job has no uid".to_string()))?;

    Ok(OwnerReference {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        name,
        uid,
        ..OwnerReference::default()
    })
}

async fn patch_owner<K>(api: &Api<K>, name: &str, owner: &OwnerReference) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    let patch = json!({
        "metadata": { "ownerReferences": [owner] }
    });

    api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
        .await?;

    Ok(())
}
