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

//! Runner core library
//!
//! Bridges a GitLab-compatible coordinator with a Kubernetes cluster: polls
//! the coordinator for dispatched jobs, materializes each one as a batch Job
//! plus its entrypoint ConfigMap and build PVC, and drives it to a terminal
//! state while streaming logs back to the coordinator.

pub mod cluster;
pub mod config;
pub mod errors;
pub mod monitor;
pub mod poll;
pub mod protocol;
pub mod shell;
pub mod supervisor;

// Re-export commonly used types
pub use config::RunnerConfig;
pub use errors::{Error, Result};
pub use protocol::spec::JobSpec;
pub use protocol::RunnerHttpSession;
