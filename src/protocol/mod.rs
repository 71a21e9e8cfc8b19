//! Coordinator protocol client.
//!
//! Typed operations against the upstream CI API: poll the next job, report a
//! job state transition, append a byte range to the remote trace. One
//! [`RunnerHttpSession`] is shared by the poll loop and every monitor; the
//! underlying reqwest client is safe for concurrent use.

pub mod spec;

use crate::errors::{Error, Result};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use spec::{parse_job_spec, JobSpec};
use std::time::Duration;
use tracing::trace;

const PATH_JOB_MAILBOX: &str = "/api/v4/jobs/request";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn path_job_state(job_id: i64) -> String {
    format!("/api/v4/jobs/{job_id}")
}

fn path_job_trace(job_id: i64) -> String {
    format!("/api/v4/jobs/{job_id}/trace")
}

/// Job states the coordinator accepts on the state PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Failed,
    Success,
}

/// Coordinator's view of a job, read from the heartbeat response. A 403
/// status means the job was canceled remotely.
#[derive(Debug, Clone)]
pub struct RemoteJobState {
    pub status_code: u16,
    /// Value of the `Job-Status` response header, e.g. "canceled"
    pub remote_state: String,
}

/// Byte range acknowledged by the coordinator on a trace PATCH. When the
/// server's bookkeeping diverges from ours, the `Range` response header is
/// authoritative and the local offset is corrected from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: usize,
    pub end: usize,
}

impl ContentRange {
    /// Parse the `Range: N-M` header value.
    pub fn parse(header: &str) -> Option<ContentRange> {
        let (start, end) = header.trim().split_once('-')?;
        Some(ContentRange {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
        })
    }
}

/// Capability advertisement sent with every poll request.
#[derive(Debug, Clone, Serialize)]
struct FeaturesInfo {
    variables: bool,
    image: bool,
    services: bool,
    artifacts: bool,
    cache: bool,
    shared: bool,
    upload_multiple_artifacts: bool,
    refspecs: bool,
}

#[derive(Debug, Clone, Serialize)]
struct VersionInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    executor: String,
    features: FeaturesInfo,
}

#[derive(Debug, Clone, Serialize)]
struct JobRequest {
    token: String,
    info: VersionInfo,
}

#[derive(Debug, Clone, Serialize)]
struct UpdateJobStateRequest {
    token: String,
    state: JobState,
}

/// The http session for the runner
pub struct RunnerHttpSession {
    base_url: Url,
    runner_name: String,
    // one client instance, shared across monitors
    client: reqwest::Client,
}

impl RunnerHttpSession {
    pub fn new(base_url: &str, runner_name: String) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid coordinator url: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url,
            runner_name,
            client,
        })
    }

    fn request_url(&self, ref_path: &str) -> Result<Url> {
        self.base_url
            .join(ref_path)
            .map_err(|e| Error::Config(format!("invalid request path '{ref_path}': {e}")))
    }

    fn new_job_request(&self, runner_token: &str) -> JobRequest {
        JobRequest {
            token: runner_token.to_string(),
            info: VersionInfo {
                name: self.runner_name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                executor: "kubernetes".to_string(),
                features: FeaturesInfo {
                    variables: true,
                    image: true,
                    artifacts: true,
                    cache: true,
                    refspecs: true,
                    shared: true,
                    upload_multiple_artifacts: true,
                    // TODO: add support for services
                    services: false,
                },
            },
        }
    }

    /// Poll the next job from the coordinator queue.
    ///
    /// 204 means the queue is empty. 201 carries a job spec in the body.
    /// Anything else is a transport error the caller logs and survives.
    pub async fn poll_next_job(&self, runner_token: &str) -> Result<Option<JobSpec>> {
        let url = self.request_url(PATH_JOB_MAILBOX)?;
        let request = self.new_job_request(runner_token);

        let resp = self.client.post(url).json(&request).send().await?;

        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CREATED => {
                let body = resp.bytes().await?;
                trace!("received new job `{}`", String::from_utf8_lossy(&body));
                Ok(Some(parse_job_spec(&body)?))
            }
            status => Err(Error::Transport {
                status: status.as_u16(),
            }),
        }
    }

    /// Synchronize the local and remote status of one job.
    pub async fn update_job_status(
        &self,
        job_id: i64,
        job_token: &str,
        state: JobState,
    ) -> Result<RemoteJobState> {
        let url = self.request_url(&path_job_state(job_id))?;
        let request = UpdateJobStateRequest {
            token: job_token.to_string(),
            state,
        };

        let resp = self.client.put(url).json(&request).send().await?;

        let remote_state = resp
            .headers()
            .get("Job-Status")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(RemoteJobState {
            status_code: resp.status().as_u16(),
            remote_state,
        })
    }

    /// Append a byte range to the remote job trace.
    ///
    /// Returns the server-acknowledged range when the response carries one.
    /// On rejection the parsed range still travels inside the error so the
    /// caller can correct its start offset before the next attempt.
    pub async fn patch_job_log(
        &self,
        job_id: i64,
        job_token: &str,
        content: &[u8],
        start_offset: usize,
    ) -> Result<Option<ContentRange>> {
        if content.is_empty() {
            return Ok(None);
        }

        let url = self.request_url(&path_job_trace(job_id))?;

        let end_offset = start_offset + content.len();
        let content_range = format!("{}-{}", start_offset, end_offset - 1);

        let resp = self
            .client
            .patch(url)
            .header("Content-Type", "text/plain")
            .header("Content-Range", content_range)
            .header("Job-Token", job_token)
            .body(content.to_vec())
            .send()
            .await?;

        let status = resp.status();
        let server_range = resp
            .headers()
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(ContentRange::parse);

        if status != StatusCode::ACCEPTED {
            return Err(Error::TraceRejected {
                status: status.as_u16(),
                range: server_range,
            });
        }

        Ok(server_range)
    }
}
