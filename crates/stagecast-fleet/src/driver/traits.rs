// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The [`WorkloadDriver`] trait and its data types.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a workload driver can produce.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// A workload with this name already exists.
    #[error("Workload '{0}' already exists")]
    AlreadyExists(String),

    /// No workload with this name.
    #[error("Workload '{0}' not found")]
    NotFound(String),

    /// The operation did not complete within the allowed time.
    #[error("Operation '{operation}' on '{name}' timed out after {seconds}s")]
    Timeout {
        /// The driver operation that timed out.
        operation: &'static str,
        /// Workload name.
        name: String,
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// Any other runtime failure (daemon unreachable, image pull, etc).
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Observed runtime state of a workload.
///
/// This is what the container runtime reports, as opposed to the intended
/// [`InstanceStatus`](crate::store::InstanceStatus) in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    /// Created but never started.
    Created,
    /// Up and running.
    Running,
    /// Paused by the runtime.
    Paused,
    /// Being restarted by the runtime's restart policy.
    Restarting,
    /// Removal in progress.
    Removing,
    /// Exited (cleanly or not).
    Exited,
    /// Dead per the runtime.
    Dead,
    /// No such workload exists.
    NotFound,
}

impl RuntimeState {
    /// Whether the workload is actually executing.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }

    /// Whether the workload has terminated and can be reclaimed.
    pub fn is_reclaimable(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::NotFound => "not_found",
        };
        write!(f, "{s}")
    }
}

/// Resource limits applied to a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory cap in bytes.
    pub memory_bytes: i64,
    /// Relative CPU weight.
    pub cpu_shares: i64,
    /// Swap cap in bytes. -1 means unlimited swap.
    pub memory_swap_bytes: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_shares: 512,
            memory_swap_bytes: -1,
        }
    }
}

/// Everything needed to create a workload.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    /// Workload name. Unique within the runtime.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Command override. `None` runs the image default.
    pub command: Option<Vec<String>>,
    /// Host port bound to the workload's service port, if any.
    pub port: Option<u16>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Volume binds, `volume:/container/path` form.
    pub binds: Vec<String>,
    /// Labels identifying the owning instance.
    pub labels: HashMap<String, String>,
    /// Resource limits.
    pub resources: ResourceLimits,
    /// Whether the runtime should restart the workload unless stopped.
    pub restart_unless_stopped: bool,
}

impl WorkloadSpec {
    /// Minimal spec with default resources and no restart policy.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: None,
            port: None,
            env: HashMap::new(),
            binds: Vec::new(),
            labels: HashMap::new(),
            resources: ResourceLimits::default(),
            restart_unless_stopped: false,
        }
    }
}

/// Point-in-time resource usage of a workload.
///
/// Zeroed when the workload is missing or the runtime cannot be queried;
/// metrics reads never fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStats {
    /// CPU usage as a percentage of all host CPUs.
    pub cpu_percent: f64,
    /// Memory usage as a percentage of the memory limit.
    pub memory_percent: f64,
    /// Total bytes received across all interfaces.
    pub network_rx_bytes: u64,
    /// Total bytes transmitted across all interfaces.
    pub network_tx_bytes: u64,
}

/// Summary of a labeled workload, as returned by [`WorkloadDriver::list_by_label`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSummary {
    /// Workload name.
    pub name: String,
    /// Labels attached to the workload.
    pub labels: HashMap<String, String>,
    /// Observed state.
    pub state: RuntimeState,
    /// Host ports published by the workload.
    pub ports: Vec<u16>,
}

/// Driver over a container runtime.
///
/// Implementations must be safe to share across tasks; callers serialize
/// per-instance mutations above this layer.
#[async_trait]
pub trait WorkloadDriver: Send + Sync {
    /// Short identifier for logging ("docker", "mock").
    fn driver_type(&self) -> &'static str;

    /// Create a workload from a spec. [`DriverError::AlreadyExists`] if the
    /// name is taken.
    async fn create(&self, spec: &WorkloadSpec) -> DriverResult<()>;

    /// Start a created or stopped workload.
    async fn start(&self, name: &str) -> DriverResult<()>;

    /// Stop a workload, giving it `grace` to exit before it is killed.
    async fn stop(&self, name: &str, grace: Duration) -> DriverResult<()>;

    /// Force-remove a workload.
    async fn remove(&self, name: &str) -> DriverResult<()>;

    /// Observed state. Infallible: missing workloads and runtime failures
    /// both report [`RuntimeState::NotFound`].
    async fn inspect(&self, name: &str) -> RuntimeState;

    /// Resource usage. Infallible: zeroed stats on any failure.
    async fn stats(&self, name: &str) -> WorkloadStats;

    /// Recent log output. Infallible: empty string on any failure.
    async fn logs(&self, name: &str, tail: usize) -> String;

    /// Adjust resource limits on a live workload.
    async fn update_resources(&self, name: &str, limits: &ResourceLimits) -> DriverResult<()>;

    /// All workloads carrying the given label key, regardless of state.
    async fn list_by_label(&self, label: &str) -> DriverResult<Vec<WorkloadSummary>>;

    /// Remove every labeled workload that has exited or died.
    /// Returns the number removed.
    async fn remove_if_exited(&self, label: &str) -> DriverResult<u64>;

    /// Block until the workload exits, returning its exit code.
    async fn wait(&self, name: &str, timeout: Duration) -> DriverResult<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resource_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_bytes, 536_870_912);
        assert_eq!(limits.cpu_shares, 512);
        assert_eq!(limits.memory_swap_bytes, -1);
    }

    #[test]
    fn test_runtime_state_predicates() {
        assert!(RuntimeState::Running.is_running());
        assert!(RuntimeState::Restarting.is_running());
        assert!(!RuntimeState::Exited.is_running());
        assert!(!RuntimeState::NotFound.is_running());

        assert!(RuntimeState::Exited.is_reclaimable());
        assert!(RuntimeState::Dead.is_reclaimable());
        assert!(!RuntimeState::Running.is_reclaimable());
        assert!(!RuntimeState::Created.is_reclaimable());
    }

    #[test]
    fn test_runtime_state_display() {
        assert_eq!(RuntimeState::NotFound.to_string(), "not_found");
        assert_eq!(RuntimeState::Running.to_string(), "running");
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Timeout {
            operation: "start",
            name: "instance-abc".to_string(),
            seconds: 120,
        };
        assert_eq!(
            err.to_string(),
            "Operation 'start' on 'instance-abc' timed out after 120s"
        );
    }
}
