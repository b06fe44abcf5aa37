// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory mock driver for tests.
//!
//! Tracks workloads in a map and records every mutating call so tests can
//! assert on ordering. Failure modes are opt-in via the `failing_*`
//! constructors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::traits::{
    DriverError, DriverResult, ResourceLimits, RuntimeState, WorkloadDriver, WorkloadSpec,
    WorkloadStats, WorkloadSummary,
};

#[derive(Debug, Clone)]
struct MockWorkload {
    spec: WorkloadSpec,
    state: RuntimeState,
}

/// Mock implementation of [`WorkloadDriver`].
#[derive(Clone, Default)]
pub struct MockDriver {
    workloads: Arc<Mutex<HashMap<String, MockWorkload>>>,
    operations: Arc<Mutex<Vec<String>>>,
    fail_create: bool,
    fail_start: bool,
    fail_stop: bool,
    stats: WorkloadStats,
    logs: String,
    exit_code: i64,
}

impl MockDriver {
    /// Driver where every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver whose `create` calls fail.
    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// Driver whose `start` calls fail.
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// Driver whose `stop` calls fail.
    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    /// Set the stats returned for running workloads.
    pub fn with_stats(mut self, stats: WorkloadStats) -> Self {
        self.stats = stats;
        self
    }

    /// Set the log output returned for existing workloads.
    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    /// Set the exit code reported by `wait`.
    pub fn with_exit_code(mut self, exit_code: i64) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Whether a workload with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.workloads.lock().unwrap().contains_key(name)
    }

    /// Spec the workload was created with, if it exists.
    pub fn spec_of(&self, name: &str) -> Option<WorkloadSpec> {
        self.workloads
            .lock()
            .unwrap()
            .get(name)
            .map(|w| w.spec.clone())
    }

    /// Force a workload into a state, simulating external interference
    /// (crash, OOM kill, manual removal of a sibling).
    pub fn set_state(&self, name: &str, state: RuntimeState) {
        if let Some(workload) = self.workloads.lock().unwrap().get_mut(name) {
            workload.state = state;
        }
    }

    /// Drop a workload without going through `remove`, simulating removal
    /// behind the control plane's back.
    pub fn vanish(&self, name: &str) {
        self.workloads.lock().unwrap().remove(name);
    }

    /// Every mutating call so far, in order, as `"op name"` strings.
    pub fn recorded_operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    fn record(&self, operation: &str, name: &str) {
        self.operations
            .lock()
            .unwrap()
            .push(format!("{operation} {name}"));
    }
}

#[async_trait]
impl WorkloadDriver for MockDriver {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, spec: &WorkloadSpec) -> DriverResult<()> {
        self.record("create", &spec.name);
        if self.fail_create {
            return Err(DriverError::Runtime("create failed (mock)".to_string()));
        }
        let mut workloads = self.workloads.lock().unwrap();
        if workloads.contains_key(&spec.name) {
            return Err(DriverError::AlreadyExists(spec.name.clone()));
        }
        workloads.insert(
            spec.name.clone(),
            MockWorkload {
                spec: spec.clone(),
                state: RuntimeState::Created,
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> DriverResult<()> {
        self.record("start", name);
        if self.fail_start {
            return Err(DriverError::Runtime("start failed (mock)".to_string()));
        }
        let mut workloads = self.workloads.lock().unwrap();
        match workloads.get_mut(name) {
            Some(workload) => {
                workload.state = RuntimeState::Running;
                Ok(())
            }
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }

    async fn stop(&self, name: &str, _grace: Duration) -> DriverResult<()> {
        self.record("stop", name);
        if self.fail_stop {
            return Err(DriverError::Runtime("stop failed (mock)".to_string()));
        }
        let mut workloads = self.workloads.lock().unwrap();
        match workloads.get_mut(name) {
            Some(workload) => {
                workload.state = RuntimeState::Exited;
                Ok(())
            }
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str) -> DriverResult<()> {
        self.record("remove", name);
        let mut workloads = self.workloads.lock().unwrap();
        match workloads.remove(name) {
            Some(_) => Ok(()),
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }

    async fn inspect(&self, name: &str) -> RuntimeState {
        self.workloads
            .lock()
            .unwrap()
            .get(name)
            .map(|w| w.state)
            .unwrap_or(RuntimeState::NotFound)
    }

    async fn stats(&self, name: &str) -> WorkloadStats {
        let workloads = self.workloads.lock().unwrap();
        match workloads.get(name) {
            Some(workload) if workload.state.is_running() => self.stats,
            _ => WorkloadStats::default(),
        }
    }

    async fn logs(&self, name: &str, _tail: usize) -> String {
        if self.contains(name) {
            self.logs.clone()
        } else {
            String::new()
        }
    }

    async fn update_resources(&self, name: &str, limits: &ResourceLimits) -> DriverResult<()> {
        self.record("update_resources", name);
        let mut workloads = self.workloads.lock().unwrap();
        match workloads.get_mut(name) {
            Some(workload) => {
                workload.spec.resources = *limits;
                Ok(())
            }
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }

    async fn list_by_label(&self, label: &str) -> DriverResult<Vec<WorkloadSummary>> {
        let workloads = self.workloads.lock().unwrap();
        Ok(workloads
            .values()
            .filter(|w| w.spec.labels.contains_key(label))
            .map(|w| WorkloadSummary {
                name: w.spec.name.clone(),
                labels: w.spec.labels.clone(),
                state: w.state,
                ports: w.spec.port.into_iter().collect(),
            })
            .collect())
    }

    async fn remove_if_exited(&self, label: &str) -> DriverResult<u64> {
        self.record("remove_if_exited", label);
        let mut workloads = self.workloads.lock().unwrap();
        let before = workloads.len();
        workloads.retain(|_, w| !(w.spec.labels.contains_key(label) && w.state.is_reclaimable()));
        Ok((before - workloads.len()) as u64)
    }

    async fn wait(&self, name: &str, _timeout: Duration) -> DriverResult<i64> {
        self.record("wait", name);
        let mut workloads = self.workloads.lock().unwrap();
        match workloads.get_mut(name) {
            Some(workload) => {
                workload.state = RuntimeState::Exited;
                Ok(self.exit_code)
            }
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled_spec(name: &str) -> WorkloadSpec {
        let mut spec = WorkloadSpec::new(name, "stagecast/studio:latest");
        spec.labels
            .insert("stagecast.instance.id".to_string(), name.to_string());
        spec
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let driver = MockDriver::new();
        let spec = labeled_spec("instance-a");

        assert_eq!(driver.inspect("instance-a").await, RuntimeState::NotFound);

        driver.create(&spec).await.unwrap();
        assert_eq!(driver.inspect("instance-a").await, RuntimeState::Created);

        driver.start("instance-a").await.unwrap();
        assert_eq!(driver.inspect("instance-a").await, RuntimeState::Running);

        driver
            .stop("instance-a", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(driver.inspect("instance-a").await, RuntimeState::Exited);

        driver.remove("instance-a").await.unwrap();
        assert_eq!(driver.inspect("instance-a").await, RuntimeState::NotFound);
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let driver = MockDriver::new();
        driver.create(&labeled_spec("instance-a")).await.unwrap();
        let err = driver.create(&labeled_spec("instance-a")).await.unwrap_err();
        assert!(matches!(err, DriverError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_missing_workload_errors() {
        let driver = MockDriver::new();
        assert!(matches!(
            driver.start("ghost").await.unwrap_err(),
            DriverError::NotFound(_)
        ));
        assert!(matches!(
            driver.stop("ghost", Duration::from_secs(1)).await.unwrap_err(),
            DriverError::NotFound(_)
        ));
        assert!(matches!(
            driver.remove("ghost").await.unwrap_err(),
            DriverError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_infallible_reads() {
        let driver = MockDriver::new().with_logs("hello");
        assert_eq!(driver.logs("ghost", 100).await, "");
        assert_eq!(driver.stats("ghost").await, WorkloadStats::default());

        driver.create(&labeled_spec("instance-a")).await.unwrap();
        assert_eq!(driver.logs("instance-a", 100).await, "hello");
        // Stats stay zeroed until the workload runs.
        assert_eq!(driver.stats("instance-a").await, WorkloadStats::default());
    }

    #[tokio::test]
    async fn test_failing_constructors() {
        let driver = MockDriver::failing_start();
        driver.create(&labeled_spec("instance-a")).await.unwrap();
        assert!(driver.start("instance-a").await.is_err());

        let driver = MockDriver::failing_stop();
        driver.create(&labeled_spec("instance-a")).await.unwrap();
        driver.start("instance-a").await.unwrap();
        assert!(
            driver
                .stop("instance-a", Duration::from_secs(1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_list_by_label_reports_port_bindings() {
        let driver = MockDriver::new();
        let mut published = labeled_spec("instance-a");
        published.port = Some(5656);
        driver.create(&published).await.unwrap();
        driver.create(&labeled_spec("instance-b")).await.unwrap();

        let mut summaries = driver
            .list_by_label("stagecast.instance.id")
            .await
            .unwrap();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(summaries[0].ports, vec![5656]);
        assert!(summaries[1].ports.is_empty());
    }

    #[tokio::test]
    async fn test_remove_if_exited() {
        let driver = MockDriver::new();
        for name in ["instance-a", "instance-b", "instance-c"] {
            driver.create(&labeled_spec(name)).await.unwrap();
            driver.start(name).await.unwrap();
        }
        driver.set_state("instance-a", RuntimeState::Exited);
        driver.set_state("instance-b", RuntimeState::Dead);

        let removed = driver
            .remove_if_exited("stagecast.instance.id")
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!driver.contains("instance-a"));
        assert!(!driver.contains("instance-b"));
        assert!(driver.contains("instance-c"));
    }

    #[tokio::test]
    async fn test_wait_flips_to_exited() {
        let driver = MockDriver::new().with_exit_code(0);
        driver.create(&labeled_spec("instance-a")).await.unwrap();
        driver.start("instance-a").await.unwrap();

        let code = driver
            .wait("instance-a", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(driver.inspect("instance-a").await, RuntimeState::Exited);
    }

    #[tokio::test]
    async fn test_operation_recording() {
        let driver = MockDriver::new();
        driver.create(&labeled_spec("instance-a")).await.unwrap();
        driver.start("instance-a").await.unwrap();
        assert_eq!(
            driver.recorded_operations(),
            vec!["create instance-a", "start instance-a"]
        );
    }
}
