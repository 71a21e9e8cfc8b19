//! Log pipeline for one monitored job.
//!
//! Pod log fetches are snapshots: every call returns the whole log since the
//! requested timestamp, and the server-side `sinceTime` filter is inclusive.
//! The pipeline keeps a watermark of the newest line it accepted, drops
//! everything at or below it, and buffers the remainder for the next push to
//! the coordinator.
//!
//! The buffer has two writers (the log-fetch parser and the runner's own
//! trace narration) and one drainer (the flush). All of them serialize on a
//! single async mutex so a fetch never interleaves with a flush.

use crate::cluster::job::RunnerJob;
use crate::errors::{Error, Result};
use crate::monitor::backchannel::BackChannel;
use crate::protocol::ContentRange;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

pub const LOG_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cursor into the remote append-only trace
#[derive(Debug, Default)]
struct LogCursor {
    /// Timestamp of the newest accepted pod log line. Only ever advances.
    last_seen: Option<DateTime<Utc>>,
    /// Bytes accepted but not yet acknowledged by the coordinator
    buffer: Vec<u8>,
    /// Byte offset the coordinator has acknowledged. Only ever advances.
    remote_offset: usize,
}

impl LogCursor {
    /// Ingest one log snapshot: parse, dedupe against the watermark, buffer
    /// the strictly-newer lines and advance the watermark to the last one.
    fn ingest(&mut self, text: &str) {
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }

            match parse_log_line(line) {
                Ok((timestamp, rest)) => {
                    if self.last_seen.is_none_or(|seen| timestamp > seen) {
                        self.last_seen = Some(timestamp);
                        self.buffer.extend_from_slice(rest.as_bytes());
                        self.buffer.push(b'\n');
                    }
                }
                Err(e) => warn!("{e}"),
            }
        }
    }

    fn append_line(&mut self, line: &str) {
        self.buffer.extend_from_slice(line.as_bytes());
        self.buffer.push(b'\n');
    }

    /// Reconcile the cursor after a push of `sent` bytes. The coordinator's
    /// `Range` answer overrides local bookkeeping whenever present, even on a
    /// rejected push; the buffer is only dropped once the push was accepted.
    fn apply_flush(&mut self, sent: usize, acked: Option<ContentRange>, accepted: bool) {
        if let Some(range) = acked {
            self.remote_offset = range.end;
        } else if accepted {
            self.remote_offset += sent;
        }

        if accepted {
            self.buffer.clear();
        }
    }
}

/// Split a pod log line into its RFC 3339 timestamp prefix and the text.
fn parse_log_line(line: &str) -> Result<(DateTime<Utc>, &str)> {
    let (timestamp, rest) = line
        .split_once(' ')
        .ok_or_else(|| Error::LogParse(line.to_string()))?;

    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| Error::LogParse(line.to_string()))?;

    Ok((timestamp.with_timezone(&Utc), rest))
}

/// Shared log state of one monitor
pub struct LogPipeline {
    cursor: Mutex<LogCursor>,
}

impl LogPipeline {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(LogCursor::default()),
        }
    }

    /// Fetch the builder log since the watermark and buffer the new lines.
    /// The fetch is bounded to [`LOG_FETCH_TIMEOUT`] wall-clock; a slow API
    /// server surfaces as [`Error::LogFetchTimeout`] and the next status
    /// tick simply tries again.
    pub async fn buffer_pod_logs(&self, job: &RunnerJob, pod_name: &str) -> Result<()> {
        let mut cursor = self.cursor.lock().await;

        let fetch = job.fetch_log(pod_name, cursor.last_seen);
        let text = tokio::time::timeout(LOG_FETCH_TIMEOUT, fetch)
            .await
            .map_err(|_| Error::LogFetchTimeout)??;

        cursor.ingest(&text);
        Ok(())
    }

    /// Append one line of runner narration to the remote trace, interleaved
    /// with the build output.
    pub async fn trace(&self, level: &str, message: &str) {
        let line = format!(
            "{level}[{}] {message}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        );
        self.cursor.lock().await.append_line(&line);
    }

    /// Push the buffered bytes to the coordinator and reconcile the offset
    /// with the acknowledged range.
    pub async fn flush(&self, backchannel: &BackChannel) -> Result<()> {
        let mut cursor = self.cursor.lock().await;

        if cursor.buffer.is_empty() {
            return Ok(());
        }

        let sent = cursor.buffer.len();
        let offset = cursor.remote_offset;

        match backchannel.write_log_lines(&cursor.buffer, offset).await {
            Ok(acked) => {
                cursor.apply_flush(sent, acked, true);
                Ok(())
            }
            Err(Error::TraceRejected { status, range }) => {
                cursor.apply_flush(sent, range, false);
                Err(Error::TraceRejected { status, range })
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for LogPipeline {
    fn default() -> Self {
        Self::new()
    }
}
