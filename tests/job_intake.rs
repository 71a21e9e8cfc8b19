//! Intake path of one dispatched job, without a cluster: parse the
//! coordinator payload, derive the Kubernetes parameters from its variables
//! and synthesize the entrypoint script.

use runner::cluster::params::{JobParameters, DEFAULT_ACTIVE_DEADLINE_SEC};
use runner::config::RunnerConfig;
use runner::protocol::spec::parse_job_spec;
use runner::shell::generate_script;

const PAYLOAD: &str = r#"{
    "id": 42,
    "token": "jobtok",
    "allow_git_fetch": true,
    "job_info": {
        "name": "build",
        "stage": "test",
        "project_id": 7,
        "project_name": "widget"
    },
    "image": {"name": "ubuntu:22.04"},
    "git_info": {
        "repo_url": "https://gitlab.example.com/g/widget.git",
        "ref": "main",
        "sha": "deadbeef",
        "before_sha": "cafebabe",
        "ref_type": "branch",
        "refspecs": ["+refs/heads/*:refs/remotes/origin/*"],
        "depth": 50
    },
    "variables": [
        {"key": "CI", "value": "true", "public": true, "masked": false},
        {"key": "SFS_ACTIVE_DEADLINE_SEC", "value": "7200", "public": true, "masked": false},
        {"key": "SFS_RESOURCE_REQUEST", "value": "{\"cpu\":\"4000m\"}", "public": true, "masked": false}
    ],
    "steps": [
        {"name": "script", "script": ["make", "make test"], "timeout": 3600, "when": "on_success", "allow_failure": false},
        {"name": "after_script", "script": ["make clean"], "timeout": 3600, "when": "always", "allow_failure": true}
    ],
    "artifacts": [
        {"paths": ["target/"], "when": "on_success", "expire_in": "1 week"},
        {"paths": [], "when": "always", "expire_in": ""}
    ],
    "dependencies": [
        {"id": 41, "name": "compile", "token": "deptok"}
    ],
    "cache": [
        {"key": "cargo", "paths": [".cargo"], "policy": "pull-push"},
        {"key": "", "paths": ["dropme"], "policy": "pull"}
    ]
}"#;

fn config() -> RunnerConfig {
    RunnerConfig::from_yaml(
        r"
gitlab_url: https://gitlab.example.com
runner_token: runnertok
runner_name: builder-1
k8s_namespace: ci
gcp_cache_bucket: ci-cache
default_resource_request:
  - type: cpu
    quantity: 1000m
  - type: storage
    quantity: 20Gi
  - type: ephemeral-storage
    quantity: 4Gi
default_node_selector:
  cloud.google.com/gke-preemptible: 'true'
",
    )
    .unwrap()
}

#[test]
fn intake_of_a_dispatched_job() {
    let config = config();
    config.validate().unwrap();

    let spec = parse_job_spec(PAYLOAD.as_bytes()).unwrap();

    // sanitized at ingest: the keyless cache entry is gone, the pathless
    // artifact is gone
    assert_eq!(spec.cache.len(), 1);
    assert_eq!(spec.artifacts.len(), 1);

    let defaults = JobParameters::defaults_from(&config);
    assert_eq!(defaults.active_deadline_sec, DEFAULT_ACTIVE_DEADLINE_SEC);

    let params = defaults.with_variables(&spec.variables).unwrap();
    assert_eq!(params.active_deadline_sec, 7200);
    assert_eq!(params.quantity("cpu").unwrap().0, "4000m");
    assert_eq!(params.quantity("storage").unwrap().0, "20Gi");
    assert_eq!(
        params.node_selector.get("cloud.google.com/gke-preemptible"),
        Some(&"true".to_string())
    );

    let script = generate_script(&spec, &config.gcp_cache_bucket);
    assert!(script.starts_with("#!/usr/bin/env bash"));
    assert!(script.contains("git clone ${CI_REPOSITORY_URL} ./"));
    assert!(script.contains("Restoring cache cargo"));
    assert!(script.contains("echo 'Step `script` has 2 commands'"));
    assert!(script.contains("echo 'Step `after_script` has 1 commands'"));
    assert!(script.contains("jobs/41/artifacts"));
    assert!(script.contains("jobs/42/artifacts?expire_in=1+week"));
    assert!(script.contains("Saving cache cargo"));
    // the sanitized entries left no trace in the script
    assert!(!script.contains("dropme"));
}
