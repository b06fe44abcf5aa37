// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health reconciler.
//!
//! Periodically compares intended status against observed runtime state and
//! corrects drift in one direction only: a RUNNING instance whose workload is
//! not actually running is marked ERROR. Nothing is ever promoted back to
//! RUNNING and no workload is restarted; recovery is an explicit operator or
//! user action.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::driver::{WorkloadDriver, workload_name};
use crate::error::Result;
use crate::locks::InstanceLocks;
use crate::store::{InstanceStatus, Store};

/// Configuration for the health reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to poll.
    pub poll_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Background worker reconciling record status with runtime state.
pub struct HealthReconciler {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkloadDriver>,
    locks: InstanceLocks,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl HealthReconciler {
    /// Build a reconciler sharing the manager's lock registry.
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn WorkloadDriver>,
        locks: InstanceLocks,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            driver,
            locks,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop the run loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shut down.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "Health reconciler started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Health reconciler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(corrected) => {
                            info!(corrected = corrected, "Health pass corrected drifted instances");
                        }
                        Err(e) => {
                            error!(error = %e, "Health pass failed");
                        }
                    }
                }
            }
        }
    }

    /// One reconciliation pass. Returns how many instances were corrected.
    /// A failure on one instance does not stop the pass.
    pub async fn run_once(&self) -> Result<u64> {
        let running = self
            .store
            .list_instances(None, Some(InstanceStatus::Running))
            .await?;

        let mut corrected = 0u64;
        for record in running {
            match self.check_instance(&record.instance_id).await {
                Ok(true) => corrected += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(instance_id = %record.instance_id, error = %e,
                        "Health check failed for instance");
                }
            }
        }
        Ok(corrected)
    }

    /// Check one instance under its lock. Returns whether it was corrected.
    async fn check_instance(&self, instance_id: &str) -> Result<bool> {
        let _guard = self.locks.acquire(instance_id).await;

        // Re-read under the lock; a stop or delete may have won the race.
        let Some(record) = self.store.get_instance(instance_id).await? else {
            return Ok(false);
        };
        if record.status != InstanceStatus::Running {
            return Ok(false);
        }

        let state = self.driver.inspect(&workload_name(instance_id)).await;
        if state.is_running() {
            debug!(instance_id = %instance_id, "Instance healthy");
            return Ok(false);
        }

        warn!(instance_id = %instance_id, observed = %state,
            "RUNNING instance has no running workload, marking ERROR");
        self.store
            .update_status(instance_id, InstanceStatus::Error)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockDriver, RuntimeState, WorkloadSpec};
    use crate::store::SqliteStore;
    use chrono::Utc;
    use serde_json::json;

    async fn seeded_store(entries: &[(&str, InstanceStatus)]) -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().await.unwrap();
        for (i, (id, status)) in entries.iter().enumerate() {
            let now = Utc::now();
            store
                .create_instance(&crate::store::InstanceRecord {
                    instance_id: id.to_string(),
                    name: id.to_string(),
                    description: None,
                    port: 5656 + i as u16,
                    status: *status,
                    config: json!({}),
                    owner_user_id: "user-1".to_string(),
                    organization_id: "org-1".to_string(),
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    async fn spawn_workload(driver: &MockDriver, instance_id: &str, state: RuntimeState) {
        let name = workload_name(instance_id);
        driver
            .create(&WorkloadSpec::new(&name, "stagecast/studio:latest"))
            .await
            .unwrap();
        driver.set_state(&name, state);
    }

    fn reconciler(store: Arc<SqliteStore>, driver: MockDriver) -> HealthReconciler {
        HealthReconciler::new(
            store,
            Arc::new(driver),
            InstanceLocks::new(),
            ReconcilerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_dead_workload_marks_error() {
        let store = seeded_store(&[("a", InstanceStatus::Running)]).await;
        let driver = MockDriver::new();
        spawn_workload(&driver, "a", RuntimeState::Exited).await;

        let corrected = reconciler(store.clone(), driver).run_once().await.unwrap();
        assert_eq!(corrected, 1);
        let record = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_missing_workload_marks_error() {
        let store = seeded_store(&[("a", InstanceStatus::Running)]).await;
        let corrected = reconciler(store.clone(), MockDriver::new())
            .run_once()
            .await
            .unwrap();
        assert_eq!(corrected, 1);
        let record = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_healthy_instance_untouched() {
        let store = seeded_store(&[("a", InstanceStatus::Running)]).await;
        let driver = MockDriver::new();
        spawn_workload(&driver, "a", RuntimeState::Running).await;

        let corrected = reconciler(store.clone(), driver).run_once().await.unwrap();
        assert_eq!(corrected, 0);
        let record = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_drift_is_one_directional() {
        // A STOPPED instance with a workload somehow running is left alone.
        let store = seeded_store(&[("a", InstanceStatus::Stopped)]).await;
        let driver = MockDriver::new();
        spawn_workload(&driver, "a", RuntimeState::Running).await;

        let corrected = reconciler(store.clone(), driver).run_once().await.unwrap();
        assert_eq!(corrected, 0);
        let record = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_pass_covers_all_running_instances() {
        let store = seeded_store(&[
            ("a", InstanceStatus::Running),
            ("b", InstanceStatus::Running),
            ("c", InstanceStatus::Stopped),
        ])
        .await;
        let driver = MockDriver::new();
        spawn_workload(&driver, "b", RuntimeState::Running).await;

        let corrected = reconciler(store.clone(), driver).run_once().await.unwrap();
        assert_eq!(corrected, 1);
        assert_eq!(
            store.get_instance("a").await.unwrap().unwrap().status,
            InstanceStatus::Error
        );
        assert_eq!(
            store.get_instance("b").await.unwrap().unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_error_status_is_never_repaired() {
        // Recovery from ERROR is an explicit user action, not the reconciler's.
        let store = seeded_store(&[("a", InstanceStatus::Error)]).await;
        let driver = MockDriver::new();
        spawn_workload(&driver, "a", RuntimeState::Running).await;

        let corrected = reconciler(store.clone(), driver).run_once().await.unwrap();
        assert_eq!(corrected, 0);
        let record = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = seeded_store(&[]).await;
        let worker = reconciler(store, MockDriver::new());
        let shutdown = worker.shutdown_handle();

        let handle = tokio::spawn(worker.run());
        tokio::task::yield_now().await;
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler did not shut down")
            .unwrap();
    }
}
