//! Supervisor.
//!
//! Boots the shared dependencies, runs the poll loop and spawns one monitor
//! per accepted job. INT/TERM close the process-wide cancellation token;
//! every monitor sees it, reports its job failed and tears its Kubernetes
//! objects down within the shutdown grace window.

use crate::cluster::params::JobParameters;
use crate::cluster::Session;
use crate::config::RunnerConfig;
use crate::errors::Result;
use crate::monitor;
use crate::poll;
use crate::protocol::spec::JobSpec;
use crate::protocol::RunnerHttpSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Capacity of the accepted-jobs channel; doubles as the poll burst limit
const NEW_JOBS_BACKLOG: usize = 5;

/// Time every in-flight monitor gets to send its terminal report
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runtime options that come from the command line rather than the config
/// file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerOptions {
    /// Use in-cluster Kubernetes credentials instead of the home kubeconfig
    pub in_cluster: bool,
}

/// Run the supervisor until shutdown. Returns an error only for startup
/// failures; once the loops are running, nothing a single job does can take
/// the process down.
pub async fn run(config: RunnerConfig, options: RunnerOptions) -> Result<()> {
    config.validate()?;
    let defaults = JobParameters::defaults_from(&config);

    let http_session = Arc::new(RunnerHttpSession::new(
        &config.gitlab_url,
        config.runner_name.clone(),
    )?);

    let (new_jobs_tx, mut new_jobs_rx) = mpsc::channel::<JobSpec>(NEW_JOBS_BACKLOG);
    let stop = CancellationToken::new();

    tokio::spawn(poll::poll_loop(
        http_session.clone(),
        config.runner_token.clone(),
        new_jobs_tx,
        stop.clone(),
    ));

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            stop.cancel();
        });
    }

    info!(
        "runner started: coordinator={}, namespace={}",
        config.gitlab_url, config.k8s_namespace
    );

    loop {
        tokio::select! {
            () = stop.cancelled() => {
                info!("stop requested, giving monitors {SHUTDOWN_GRACE:?} to report");
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                info!("runner shut down");
                return Ok(());
            }

            next = new_jobs_rx.recv() => {
                let Some(spec) = next else {
                    // poll loop dropped the sender; nothing more will arrive
                    return Ok(());
                };

                spawn_monitor(spec, &config, &defaults, options, &http_session, &stop).await;
            }
        }
    }
}

/// Derive the job parameters, open a per-job cluster session and hand the
/// job to its monitor. Failures here skip the job; they never stop the
/// supervisor.
async fn spawn_monitor(
    spec: JobSpec,
    config: &RunnerConfig,
    defaults: &JobParameters,
    options: RunnerOptions,
    http_session: &Arc<RunnerHttpSession>,
    stop: &CancellationToken,
) {
    let params = match defaults.with_variables(&spec.variables) {
        Ok(params) => params,
        Err(e) => {
            error!("skipping job {}: {e}", spec.id);
            return;
        }
    };

    // One session per job so a broken cluster client never poisons the
    // other monitors
    let k8s_session = match Session::create(options.in_cluster, &config.k8s_namespace).await {
        Ok(session) => session,
        Err(e) => {
            error!("skipping job {}: kubernetes session failed: {e}", spec.id);
            return;
        }
    };

    tokio::spawn(monitor::run_job(
        spec,
        k8s_session,
        params,
        http_session.clone(),
        config.gcp_cache_bucket.clone(),
        stop.clone(),
    ));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
