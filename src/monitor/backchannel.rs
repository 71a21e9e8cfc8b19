//! Per-job channel back to the coordinator.
//!
//! Bundles the job id and per-job token so the monitor never threads
//! credentials through its loop.

use crate::errors::Result;
use crate::protocol::{ContentRange, JobState, RemoteJobState, RunnerHttpSession};
use std::sync::Arc;

pub struct BackChannel {
    session: Arc<RunnerHttpSession>,
    job_id: i64,
    job_token: String,
}

impl BackChannel {
    pub fn new(session: Arc<RunnerHttpSession>, job_id: i64, job_token: String) -> Self {
        Self {
            session,
            job_id,
            job_token,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Synchronize the job state with the coordinator and read back its view.
    pub async fn sync_job_status(&self, state: JobState) -> Result<RemoteJobState> {
        self.session
            .update_job_status(self.job_id, &self.job_token, state)
            .await
    }

    /// Append a log byte range to the remote trace.
    pub async fn write_log_lines(
        &self,
        content: &[u8],
        start_offset: usize,
    ) -> Result<Option<ContentRange>> {
        self.session
            .patch_job_log(self.job_id, &self.job_token, content, start_offset)
            .await
    }
}
