//! Poll loop.
//!
//! Drains the coordinator queue once per second. The inner loop keeps
//! requesting until the coordinator answers 204, because a burst of ready
//! jobs would otherwise trickle in at one per tick. Accepted specs go into
//! the bounded channel; when every monitor slot is taken the send blocks,
//! which is the backpressure that throttles acceptance.

use crate::protocol::spec::JobSpec;
use crate::protocol::RunnerHttpSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_PERIOD: Duration = Duration::from_secs(1);

pub async fn poll_loop(
    session: Arc<RunnerHttpSession>,
    runner_token: String,
    new_jobs: mpsc::Sender<JobSpec>,
    stop: CancellationToken,
) {
    let mut ticker = interval(POLL_PERIOD);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("poll loop stopped");
                return;
            }

            _ = ticker.tick() => {
                loop {
                    match session.poll_next_job(&runner_token).await {
                        Ok(Some(spec)) => {
                            debug!("accepted job {} from project {}", spec.id, spec.job_info.project_id);
                            if new_jobs.send(spec).await.is_err() {
                                // supervisor is gone
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("polling for jobs failed: {e}");
                            break;
                        }
                    }
                }
            }
        }
    }
}
