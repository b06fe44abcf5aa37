// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance metrics and backups.
//!
//! Metrics are a read-only snapshot and never fail on runtime trouble; a
//! missing or unreachable workload reads as zeroed usage. Backups run a
//! short-lived helper workload that archives the instance's data volume into
//! its backup volume, serialized against lifecycle operations through the
//! shared per-instance locks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::driver::{
    self, DriverError, LABEL_INSTANCE_ID, WorkloadDriver, WorkloadSpec, WorkloadStats,
};
use crate::error::{Error, Result};
use crate::locks::InstanceLocks;
use crate::store::{InstanceStatus, Store};

/// Image used for backup helper workloads.
pub const BACKUP_IMAGE: &str = "alpine:latest";

/// Archive path inside the backup volume.
pub const BACKUP_ARCHIVE: &str = "data.tar.gz";

/// Point-in-time metrics for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMetrics {
    /// Recorded status at sample time.
    pub status: InstanceStatus,
    /// Resource usage. Zeroed unless the workload is running.
    pub stats: WorkloadStats,
    /// Seconds since the instance record was created, 0 unless RUNNING.
    pub uptime_secs: u64,
}

/// Outcome of a completed backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReceipt {
    /// The backed-up instance.
    pub instance_id: String,
    /// Volume the archive was written into.
    pub volume: String,
    /// Archive file name within the volume.
    pub archive: String,
    /// Completion time.
    pub completed_at: chrono::DateTime<Utc>,
}

/// Metrics and backup operations over instances.
pub struct Telemetry {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkloadDriver>,
    locks: InstanceLocks,
    backup_timeout: Duration,
}

impl Telemetry {
    /// Build a telemetry adapter sharing the manager's lock registry.
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn WorkloadDriver>,
        locks: InstanceLocks,
    ) -> Self {
        Self {
            store,
            driver,
            locks,
            backup_timeout: Duration::from_secs(600),
        }
    }

    /// Override the backup helper timeout.
    pub fn with_backup_timeout(mut self, timeout: Duration) -> Self {
        self.backup_timeout = timeout;
        self
    }

    /// Sample metrics for an instance. Fails only when the record is missing.
    pub async fn metrics(&self, instance_id: &str) -> Result<InstanceMetrics> {
        let record = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                instance_id: instance_id.to_string(),
            })?;

        let stats = self
            .driver
            .stats(&driver::workload_name(instance_id))
            .await;
        let uptime_secs = if record.status == InstanceStatus::Running {
            (Utc::now() - record.created_at).num_seconds().max(0) as u64
        } else {
            0
        };

        Ok(InstanceMetrics {
            status: record.status,
            stats,
            uptime_secs,
        })
    }

    /// Archive the instance's data volume into its backup volume.
    ///
    /// Holds the instance lock for the duration, so a backup never overlaps a
    /// start, stop, or delete of the same instance. The helper workload is
    /// removed on every exit path.
    pub async fn backup(&self, instance_id: &str) -> Result<BackupReceipt> {
        let _guard = self.locks.acquire(instance_id).await;

        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                instance_id: instance_id.to_string(),
            })?;

        let helper_name = format!(
            "backup-{}-{}",
            driver::workload_name(instance_id),
            Utc::now().timestamp()
        );
        let mut spec = WorkloadSpec::new(&helper_name, BACKUP_IMAGE);
        spec.command = Some(
            ["tar", "czf", "/backup/data.tar.gz", "-C", "/data", "."]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        spec.binds = vec![
            format!("{}:/data", driver::data_volume(instance_id)),
            format!("{}:/backup", driver::backup_volume(instance_id)),
        ];
        // Labeled so the sweeper reclaims it if we die before cleanup.
        spec.labels
            .insert(LABEL_INSTANCE_ID.to_string(), instance_id.to_string());

        self.driver.create(&spec).await?;
        let outcome = self.run_helper(&helper_name).await;

        if let Err(e) = self.driver.remove(&helper_name).await {
            warn!(instance_id = %instance_id, helper = %helper_name, error = %e,
                "Failed to remove backup helper");
        }

        let exit_code = outcome?;
        if exit_code != 0 {
            return Err(Error::Driver(DriverError::Runtime(format!(
                "backup helper exited with code {exit_code}"
            ))));
        }

        info!(instance_id = %instance_id, "Backup completed");
        Ok(BackupReceipt {
            instance_id: instance_id.to_string(),
            volume: driver::backup_volume(instance_id),
            archive: BACKUP_ARCHIVE.to_string(),
            completed_at: Utc::now(),
        })
    }

    async fn run_helper(&self, name: &str) -> Result<i64> {
        self.driver.start(name).await?;
        Ok(self.driver.wait(name, self.backup_timeout).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockDriver, RuntimeState};
    use crate::store::{InstanceRecord, SqliteStore};
    use serde_json::json;

    async fn seeded(status: InstanceStatus) -> (Arc<SqliteStore>, InstanceLocks) {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        store
            .create_instance(&InstanceRecord {
                instance_id: "a".to_string(),
                name: "a".to_string(),
                description: None,
                port: 5656,
                status,
                config: json!({}),
                owner_user_id: "user-1".to_string(),
                organization_id: "org-1".to_string(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        (Arc::new(store), InstanceLocks::new())
    }

    #[tokio::test]
    async fn test_metrics_zeroed_when_stopped() {
        let (store, locks) = seeded(InstanceStatus::Stopped).await;
        let telemetry = Telemetry::new(store, Arc::new(MockDriver::new()), locks);

        let metrics = telemetry.metrics("a").await.unwrap();
        assert_eq!(metrics.status, InstanceStatus::Stopped);
        assert_eq!(metrics.stats, WorkloadStats::default());
        assert_eq!(metrics.uptime_secs, 0);
    }

    #[tokio::test]
    async fn test_metrics_reflect_running_workload() {
        let (store, locks) = seeded(InstanceStatus::Running).await;
        let stats = WorkloadStats {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            network_rx_bytes: 1024,
            network_tx_bytes: 2048,
        };
        let driver = MockDriver::new().with_stats(stats);
        driver
            .create(&WorkloadSpec::new("instance-a", "stagecast/studio:latest"))
            .await
            .unwrap();
        driver.set_state("instance-a", RuntimeState::Running);

        let telemetry = Telemetry::new(store, Arc::new(driver), locks);
        let metrics = telemetry.metrics("a").await.unwrap();
        assert_eq!(metrics.stats, stats);
    }

    #[tokio::test]
    async fn test_metrics_missing_instance() {
        let (store, locks) = seeded(InstanceStatus::Stopped).await;
        let telemetry = Telemetry::new(store, Arc::new(MockDriver::new()), locks);
        let err = telemetry.metrics("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_backup_runs_and_removes_helper() {
        let (store, locks) = seeded(InstanceStatus::Running).await;
        let driver = MockDriver::new();
        let telemetry = Telemetry::new(store, Arc::new(driver.clone()), locks);

        let receipt = telemetry.backup("a").await.unwrap();
        assert_eq!(receipt.instance_id, "a");
        assert_eq!(receipt.volume, "backup-a");
        assert_eq!(receipt.archive, "data.tar.gz");

        let ops = driver.recorded_operations();
        assert_eq!(ops.len(), 4, "unexpected ops: {ops:?}");
        assert!(ops[0].starts_with("create backup-instance-a-"));
        assert!(ops[1].starts_with("start backup-instance-a-"));
        assert!(ops[2].starts_with("wait backup-instance-a-"));
        assert!(ops[3].starts_with("remove backup-instance-a-"));

        // Helper is gone.
        let leftover = driver
            .list_by_label(LABEL_INSTANCE_ID)
            .await
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_backup_nonzero_exit_fails_and_cleans_up() {
        let (store, locks) = seeded(InstanceStatus::Running).await;
        let driver = MockDriver::new().with_exit_code(2);
        let telemetry = Telemetry::new(store, Arc::new(driver.clone()), locks);

        let err = telemetry.backup("a").await.unwrap_err();
        assert_eq!(err.error_code(), "DRIVER_FAILURE");
        assert!(
            driver
                .list_by_label(LABEL_INSTANCE_ID)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_backup_missing_instance() {
        let (store, locks) = seeded(InstanceStatus::Running).await;
        let telemetry = Telemetry::new(store, Arc::new(MockDriver::new()), locks);
        let err = telemetry.backup("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_backup_waits_for_instance_lock() {
        let (store, locks) = seeded(InstanceStatus::Running).await;
        let telemetry = Arc::new(Telemetry::new(store, Arc::new(MockDriver::new()), locks.clone()));

        let guard = locks.acquire("a").await;
        let pending = {
            let telemetry = telemetry.clone();
            tokio::spawn(async move { telemetry.backup("a").await })
        };

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        drop(guard);
        pending.await.unwrap().unwrap();
    }
}
