//! Job monitor.
//!
//! One monitor per accepted job, on its own task. The monitor provisions the
//! Kubernetes job once, then ticks: every second it reads cluster status and
//! heartbeats the coordinator, every second it pushes buffered logs. It is
//! event-driven; each tick is idempotent given the outside world, so no
//! explicit state variable is needed.
//!
//! Exits: terminal Job status (reported with bounded retry), remote cancel
//! (403 on the heartbeat, reported by nobody since the coordinator already
//! decided), and runner shutdown (reported as failed). The Kubernetes job is
//! deleted on every one of these paths, exactly once.

pub mod backchannel;
pub mod logs;

use crate::cluster::job::{
    JobReadout, RunnerJob, CONTAINER_NAME_BUILDER, POD_FAILED, POD_PENDING, POD_RUNNING,
    POD_SUCCEEDED,
};
use crate::cluster::params::JobParameters;
use crate::cluster::{provision, Session};
use crate::protocol::spec::JobSpec;
use crate::protocol::{JobState, RunnerHttpSession};
use backchannel::BackChannel;
use chrono::Duration as ChronoDuration;
use k8s_openapi::api::batch::v1::JobStatus;
use k8s_openapi::api::core::v1::Pod;
use logs::LogPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TICK_PERIOD: Duration = Duration::from_secs(1);
const STATE_REPORT_RETRIES: u32 = 5;

const CONDITION_JOB_FAILED: &str = "Failed";
const CONDITION_JOB_COMPLETE: &str = "Complete";

/// Provision one job on the cluster and monitor it to completion.
pub async fn run_job(
    spec: JobSpec,
    k8s_session: Session,
    params: JobParameters,
    http_session: Arc<RunnerHttpSession>,
    cache_bucket: String,
    stop: CancellationToken,
) {
    let job_prefix = format!("ci-{}-{}-", spec.job_info.project_id, spec.id);

    let flat_params = serde_json::to_string(&params).unwrap_or_default();
    info!(
        project = %spec.job_info.project_name,
        job = %spec.job_info.name,
        job_id = spec.id,
        "starting new job with parameters {flat_params}"
    );

    let job = match provision::provision(&k8s_session, &job_prefix, &spec, &params, &cache_bucket)
        .await
    {
        Ok(job) => job,
        Err(e) => {
            error!(
                "failed to create kubernetes job for project={}, job={}, job_id={}: {e}",
                spec.job_info.project_name, spec.job_info.name, spec.id
            );
            return;
        }
    };

    monitor_job(&job, &spec, http_session, stop).await;

    // the one teardown point for every exit path above
    info!("deleting job {}", job.name);
    if let Err(e) = job.delete().await {
        error!("failed to delete job {}: {e}", job.name);
    }
}

async fn monitor_job(
    job: &RunnerJob,
    spec: &JobSpec,
    http_session: Arc<RunnerHttpSession>,
    stop: CancellationToken,
) {
    let pipeline = LogPipeline::new();
    let backchannel = BackChannel::new(http_session, spec.id, spec.token.clone());

    // The job is already queued remotely; an error here is repaired by the
    // first running heartbeat
    let _ = backchannel.sync_job_status(JobState::Pending).await;

    let mut tick_status = interval(TICK_PERIOD);
    let mut tick_log_push = interval(TICK_PERIOD);

    loop {
        tokio::select! {
            _ = tick_status.tick() => {
                let readout = match job.readout().await {
                    Ok(readout) => readout,
                    Err(e) => {
                        warn!("k8sjob={} job_id={}: {e}", job.name, spec.id);
                        pipeline.trace("WARN", &e.to_string()).await;
                        continue;
                    }
                };

                // Handle jobs canceled on the coordinator side
                match backchannel.sync_job_status(JobState::Running).await {
                    Err(e) => {
                        warn!("k8sjob={} job_id={}: {e}", job.name, spec.id);
                        continue;
                    }
                    Ok(remote) if remote.status_code == 403 => {
                        info!("job {} canceled", spec.id);
                        return;
                    }
                    Ok(remote) if remote.status_code != 200 => {
                        warn!(
                            "unknown coordinator status response code '{}', msg '{}'",
                            remote.status_code, remote.remote_state
                        );
                        continue;
                    }
                    Ok(_) => {}
                }

                step_logs(job, &pipeline, &readout).await;

                if let Some(state) = terminal_state(&readout.status) {
                    let duration = render_job_duration(&readout.status);
                    let pods = pods_info_message(&readout.pods);

                    match state {
                        JobState::Success => {
                            let msg = format!("OK: duration {duration}. {pods}");
                            info!("k8sjob={}: {msg}", job.name);
                            pipeline.trace("INFO", &msg).await;
                        }
                        _ => {
                            let msg = format!("Job Failed {duration}. {pods}");
                            warn!("k8sjob={}: {msg}", job.name);
                            pipeline.trace("ERROR", &msg).await;
                        }
                    }

                    push_logs(&pipeline, &backchannel).await;
                    sync_job_state_loop(&backchannel, state).await;
                    return;
                }
            }

            _ = tick_log_push.tick() => {
                push_logs(&pipeline, &backchannel).await;
            }

            _ = stop.cancelled() => {
                pipeline.trace("ERROR", "The runner was killed").await;
                push_logs(&pipeline, &backchannel).await;
                sync_job_state_loop(&backchannel, JobState::Failed).await;
                return;
            }
        }
    }
}

/// Per-tick log handling, driven by the builder container's phase. Only a
/// pod that reached Running (or already finished) has logs to fetch.
async fn step_logs(job: &RunnerJob, pipeline: &LogPipeline, readout: &JobReadout) {
    let builder_phase = readout
        .container_phases
        .get(CONTAINER_NAME_BUILDER)
        .map(String::as_str);

    match builder_phase {
        Some(POD_RUNNING | POD_SUCCEEDED | POD_FAILED) => {
            let pod_name = match find_pod_of_container(&readout.pods, CONTAINER_NAME_BUILDER) {
                Some(name) => name,
                None => {
                    let msg = format!(
                        "can not find pod for container '{CONTAINER_NAME_BUILDER}' {}",
                        pods_info_message(&readout.pods)
                    );
                    warn!("k8sjob={}: {msg}", job.name);
                    pipeline.trace("WARN", &msg).await;
                    return;
                }
            };

            if let Err(e) = pipeline.buffer_pod_logs(job, pod_name).await {
                warn!("k8sjob={}: {e}", job.name);
                pipeline
                    .trace("WARN", &format!("{e} {}", pods_info_message(&readout.pods)))
                    .await;
            }
        }
        Some(POD_PENDING) => {
            pipeline
                .trace(
                    "INFO",
                    &format!("PENDING {}", pods_info_message(&readout.pods)),
                )
                .await;
        }
        _ => {}
    }
}

async fn push_logs(pipeline: &LogPipeline, backchannel: &BackChannel) {
    if let Err(e) = pipeline.flush(backchannel).await {
        warn!("job_id={}: failed to push logs: {e}", backchannel.job_id());
    }
}

/// Report the terminal state with a bounded retry: up to five attempts, one
/// per second, stopping at the first success. Exhaustion is not an error the
/// monitor can do anything about.
async fn sync_job_state_loop(backchannel: &BackChannel, state: JobState) {
    let mut ticker = interval(TICK_PERIOD);

    for _ in 0..STATE_REPORT_RETRIES {
        ticker.tick().await;

        match backchannel.sync_job_status(state).await {
            Ok(_) => return,
            Err(e) => warn!("job_id={}: {e}", backchannel.job_id()),
        }
    }
}

/// Decide whether the Kubernetes job reached a terminal state. The explicit
/// counters win; the first condition of type Failed/Complete is equivalent
/// when the counters say nothing.
fn terminal_state(status: &JobStatus) -> Option<JobState> {
    if status.failed.unwrap_or(0) > 0 {
        return Some(JobState::Failed);
    }
    if status.succeeded.unwrap_or(0) > 0 && status.active.unwrap_or(0) == 0 {
        return Some(JobState::Success);
    }

    match status.conditions.as_ref().and_then(|c| c.first()) {
        Some(cond) if cond.type_ == CONDITION_JOB_FAILED => Some(JobState::Failed),
        Some(cond) if cond.type_ == CONDITION_JOB_COMPLETE => Some(JobState::Success),
        _ => None,
    }
}

fn render_job_duration(status: &JobStatus) -> String {
    match (&status.start_time, &status.completion_time) {
        (Some(start), Some(end)) => format_duration(end.0 - start.0),
        _ => "unknown".to_string(),
    }
}

fn format_duration(duration: ChronoDuration) -> String {
    let total = duration.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn find_pod_of_container<'a>(pods: &'a [Pod], container_name: &str) -> Option<&'a str> {
    for pod in pods {
        let Some(pod_spec) = pod.spec.as_ref() else {
            continue;
        };
        if pod_spec.containers.iter().any(|c| c.name == container_name) {
            return pod.metadata.name.as_deref();
        }
    }

    None
}

fn pods_info_message(pods: &[Pod]) -> String {
    let per_pod: Vec<String> = pods.iter().map(pod_status_message).collect();
    per_pod.join(", ")
}

fn pod_status_message(pod: &Pod) -> String {
    const CHECK: char = '\u{2714}';
    const CROSS: char = '\u{2718}';
    const DIAMOND: char = '\u{2756}';

    let name = pod.metadata.name.as_deref().unwrap_or_default();

    let mut phase = "";
    let mut reason = "";
    let mut message = "";
    let mut conditions = String::new();

    if let Some(status) = pod.status.as_ref() {
        phase = status.phase.as_deref().unwrap_or_default();
        reason = status.reason.as_deref().unwrap_or_default();
        message = status.message.as_deref().unwrap_or_default();

        let marked: Vec<String> = status
            .conditions
            .iter()
            .flatten()
            .map(|cond| {
                let mark = match cond.status.as_str() {
                    "True" => CHECK,
                    "False" => CROSS,
                    _ => DIAMOND,
                };
                format!("{} {mark}", cond.type_)
            })
            .collect();
        conditions = marked.join(", ");
    }

    format!("[pod='{name}' phase='{phase}' conditions='{conditions}' reason='{reason}' msg='{message}']")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobCondition;
    use k8s_openapi::api::core::v1::{Container, PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn status(active: i32, succeeded: i32, failed: i32) -> JobStatus {
        JobStatus {
            active: Some(active),
            succeeded: Some(succeeded),
            failed: Some(failed),
            ..JobStatus::default()
        }
    }

    fn condition(type_: &str) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            ..JobCondition::default()
        }
    }

    #[test]
    fn test_terminal_state_from_counters() {
        assert_eq!(terminal_state(&status(1, 0, 0)), None);
        assert_eq!(terminal_state(&status(0, 0, 1)), Some(JobState::Failed));
        assert_eq!(terminal_state(&status(0, 1, 0)), Some(JobState::Success));
        // still active pods hold the success report back
        assert_eq!(terminal_state(&status(1, 1, 0)), None);
        assert_eq!(terminal_state(&JobStatus::default()), None);
    }

    #[test]
    fn test_terminal_state_from_conditions() {
        let failed = JobStatus {
            conditions: Some(vec![condition("Failed")]),
            ..JobStatus::default()
        };
        assert_eq!(terminal_state(&failed), Some(JobState::Failed));

        let complete = JobStatus {
            conditions: Some(vec![condition("Complete")]),
            ..JobStatus::default()
        };
        assert_eq!(terminal_state(&complete), Some(JobState::Success));

        let other = JobStatus {
            conditions: Some(vec![condition("Suspended"), condition("Failed")]),
            ..JobStatus::default()
        };
        // only the first condition is consulted
        assert_eq!(terminal_state(&other), None);
    }

    #[test]
    fn test_counters_win_over_conditions() {
        let status = JobStatus {
            conditions: Some(vec![condition("Complete")]),
            ..status(0, 0, 1)
        };
        assert_eq!(terminal_state(&status), Some(JobState::Failed));
    }

    #[test]
    fn test_render_job_duration() {
        assert_eq!(render_job_duration(&JobStatus::default()), "unknown");

        let status = JobStatus {
            start_time: Some(Time("2024-05-01T10:00:00Z".parse().unwrap())),
            completion_time: Some(Time("2024-05-01T10:02:05Z".parse().unwrap())),
            ..JobStatus::default()
        };
        assert_eq!(render_job_duration(&status), "2m5s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(ChronoDuration::seconds(59)), "59s");
        assert_eq!(format_duration(ChronoDuration::seconds(61)), "1m1s");
        assert_eq!(format_duration(ChronoDuration::seconds(3_725)), "1h2m5s");
        assert_eq!(format_duration(ChronoDuration::seconds(-5)), "0s");
    }

    fn pod(name: &str, container: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: container.to_string(),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![
                    PodCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..PodCondition::default()
                    },
                    PodCondition {
                        type_: "PodScheduled".to_string(),
                        status: "False".to_string(),
                        ..PodCondition::default()
                    },
                ]),
                reason: Some("Started".to_string()),
                message: Some("all good".to_string()),
                ..PodStatus::default()
            }),
        }
    }

    #[test]
    fn test_find_pod_of_container() {
        let pods = vec![pod("pod-a", "sidecar"), pod("pod-b", "builder")];
        assert_eq!(find_pod_of_container(&pods, "builder"), Some("pod-b"));
        assert_eq!(find_pod_of_container(&pods, "missing"), None);
    }

    #[test]
    fn test_pod_status_message_rendering() {
        let rendered = pod_status_message(&pod("pod-a", "builder"));
        assert_eq!(
            rendered,
            "[pod='pod-a' phase='Running' conditions='Ready \u{2714}, PodScheduled \u{2718}' reason='Started' msg='all good']"
        );
    }

    #[test]
    fn test_pods_info_message_joins_pods() {
        let pods = vec![pod("pod-a", "builder"), pod("pod-b", "builder")];
        let rendered = pods_info_message(&pods);
        assert!(rendered.contains("pod='pod-a'"));
        assert!(rendered.contains("], [pod='pod-b'"));
    }
}
