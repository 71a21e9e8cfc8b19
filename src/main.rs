/*
 * 5D Labs Agent Platform - GitLab CI Runner for Kubernetes
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Runner entry point: flags, logging, configuration, then the supervisor.

use anyhow::Context;
use clap::Parser;
use runner::supervisor::{self, RunnerOptions};
use runner::RunnerConfig;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// GitLab CI runner that executes build jobs as Kubernetes batch jobs
#[derive(Parser)]
#[command(name = "runner")]
#[command(about = "GitLab CI runner that executes build jobs as Kubernetes batch jobs")]
#[command(version)]
struct Cli {
    /// Path to the runner configuration YAML
    #[arg(long)]
    conf: PathBuf,

    /// Use the in-cluster Kubernetes configuration instead of ~/.kube/config
    #[arg(long)]
    in_cluster: bool,

    /// Enable the GCE profiler agent
    #[arg(long)]
    gce_profiler: bool,

    /// Emit JSON-structured logs
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,runner=debug".into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting runner v{}", env!("CARGO_PKG_VERSION"));

    if cli.gce_profiler {
        warn!("--gce-profiler was passed but no profiler agent is linked into this build");
    }

    let raw = std::fs::read_to_string(&cli.conf)
        .with_context(|| format!("reading configuration from {}", cli.conf.display()))?;
    let config = RunnerConfig::from_yaml(&raw).context("parsing configuration")?;

    supervisor::run(
        config,
        RunnerOptions {
            in_cluster: cli.in_cluster,
        },
    )
    .await?;

    Ok(())
}
