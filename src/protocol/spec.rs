//! Job descriptors received from the coordinator.
//!
//! A [`JobSpec`] is parsed once when the poll loop accepts a job and is never
//! mutated afterwards. Parsing includes ingest sanitization: cache entries
//! without a key or without paths and artifacts without paths carry no
//! information and are dropped on the spot.

use crate::errors::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobImage {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobVariable {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub masked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobStep {
    pub name: String,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(rename = "timeout", default)]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub allow_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobCache {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub policy: String,
}

impl JobCache {
    /// Whether this entry restores the cache before the build steps run.
    /// A missing policy means pull-push.
    pub fn pulls(&self) -> bool {
        matches!(self.policy.as_str(), "" | "pull" | "pull-push")
    }

    /// Whether this entry saves the cache after the build steps ran.
    pub fn pushes(&self) -> bool {
        matches!(self.policy.as_str(), "" | "push" | "pull-push")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobArtifact {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub expire_in: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobDependency {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobGitInfo {
    #[serde(default)]
    pub repo_url: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub before_sha: String,
    #[serde(default)]
    pub ref_type: String,
    #[serde(default)]
    pub refspecs: Vec<String>,
    #[serde(default)]
    pub depth: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default)]
    pub project_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobSpec {
    pub id: i64,
    #[serde(default)]
    pub job_info: JobInfo,
    /// Per-job credential, distinct from the runner token
    pub token: String,
    #[serde(default)]
    pub allow_git_fetch: bool,
    #[serde(default)]
    pub image: JobImage,
    #[serde(default)]
    pub git_info: JobGitInfo,
    #[serde(default)]
    pub variables: Vec<JobVariable>,
    #[serde(default)]
    pub steps: Vec<JobStep>,
    #[serde(default)]
    pub artifacts: Vec<JobArtifact>,
    #[serde(default)]
    pub dependencies: Vec<JobDependency>,
    #[serde(default)]
    pub cache: Vec<JobCache>,
}

impl JobSpec {
    /// Look up a job variable by key. Later entries win, matching the
    /// coordinator's override order.
    pub fn variable(&self, key: &str) -> Option<&str> {
        self.variables
            .iter()
            .rev()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Drop cache and artifact entries that cannot be acted upon.
    pub fn sanitize(&mut self) {
        self.cache
            .retain(|c| !c.key.is_empty() && !c.paths.is_empty());
        self.artifacts.retain(|a| !a.paths.is_empty());
    }
}

/// Parse a job spec from the coordinator's 201 response body.
pub fn parse_job_spec(json_data: &[u8]) -> Result<JobSpec> {
    let mut spec: JobSpec = serde_json::from_slice(json_data)?;
    spec.sanitize();
    Ok(spec)
}
