//! Error types shared across the runner.

use crate::protocol::ContentRange;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The coordinator answered with a response code the runner does not
    /// understand. Callers log it and keep polling.
    #[error("unknown coordinator response code '{status}'")]
    Transport { status: u16 },

    /// A trace PATCH was not accepted. When the coordinator sent a `Range`
    /// header alongside the rejection, it is carried here so the caller can
    /// resync its offset before retrying.
    #[error("trace append rejected with http status '{status}'")]
    TraceRejected {
        status: u16,
        range: Option<ContentRange>,
    },

    /// Standing up the Job/ConfigMap/PVC bundle failed. Fatal for that job;
    /// no monitor is spawned.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("fetching of logs from kubernetes timed out")]
    LogFetchTimeout,

    /// A pod log line without a parseable RFC 3339 timestamp prefix. The
    /// line is skipped.
    #[error("invalid log line `{0}`")]
    LogParse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_display() {
        let err = Error::Transport { status: 500 };
        assert_eq!(err.to_string(), "unknown coordinator response code '500'");
    }

    #[test]
    fn test_trace_rejected_keeps_range() {
        let err = Error::TraceRejected {
            status: 416,
            range: Some(ContentRange { start: 0, end: 150 }),
        };
        match err {
            Error::TraceRejected {
                range: Some(range), ..
            } => assert_eq!(range.end, 150),
            other => panic!("unexpected error: {other}"),
        }
    }
}
