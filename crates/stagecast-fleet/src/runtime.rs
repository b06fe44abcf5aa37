// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable fleet runtime.
//!
//! This module provides [`FleetRuntime`] which allows embedding the fleet
//! control plane into an existing tokio application instead of running it as
//! the standalone `stagecast-fleet` binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stagecast_fleet::driver::DockerDriver;
//! use stagecast_fleet::runtime::FleetRuntime;
//! use stagecast_fleet::store::PostgresStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = PostgresStore::connect("postgres://...").await?;
//!     store.apply_schema().await?;
//!
//!     let runtime = FleetRuntime::builder()
//!         .store(Arc::new(store))
//!         .driver(Arc::new(DockerDriver::connect()?))
//!         .image("stagecast/studio:latest")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve your API using runtime.manager() and runtime.telemetry() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::DEFAULT_IMAGE;
use crate::driver::WorkloadDriver;
use crate::manager::{LifecycleManager, ManagerConfig};
use crate::ports;
use crate::reconciler::{HealthReconciler, ReconcilerConfig};
use crate::store::Store;
use crate::sweeper::{SweeperConfig, WorkloadSweeper};
use crate::telemetry::Telemetry;

/// Builder for creating a [`FleetRuntime`].
pub struct FleetRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    driver: Option<Arc<dyn WorkloadDriver>>,
    image: String,
    base_port: u16,
    port_range: u16,
    stop_grace: Duration,
    transition_timeout: Duration,
    reconcile_interval: Duration,
    sweep_interval: Duration,
}

impl Default for FleetRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            driver: None,
            image: DEFAULT_IMAGE.to_string(),
            base_port: ports::BASE_PORT,
            port_range: ports::DEFAULT_PORT_RANGE,
            stop_grace: Duration::from_secs(30),
            transition_timeout: Duration::from_secs(120),
            reconcile_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl FleetRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the workload driver (required).
    pub fn driver(mut self, driver: Arc<dyn WorkloadDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the image instances run.
    ///
    /// Default: `stagecast/studio:latest`
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Set the first port considered for allocation.
    ///
    /// Default: 5656
    pub fn base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Set the number of ports scanned above the base.
    ///
    /// Default: 10000
    pub fn port_range(mut self, range: u16) -> Self {
        self.port_range = range;
        self
    }

    /// Set the grace period given to workloads on stop.
    ///
    /// Default: 30 seconds
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the upper bound on a single start or stop transition.
    ///
    /// Default: 2 minutes
    pub fn transition_timeout(mut self, timeout: Duration) -> Self {
        self.transition_timeout = timeout;
        self
    }

    /// Set the health reconciler poll interval.
    ///
    /// Default: 30 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the workload sweeper interval.
    ///
    /// Default: 1 hour
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FleetRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver is required"))?;

        Ok(FleetRuntimeConfig {
            store,
            driver,
            manager_config: ManagerConfig {
                image: self.image,
                base_port: self.base_port,
                port_range: self.port_range,
                stop_grace: self.stop_grace,
                transition_timeout: self.transition_timeout,
            },
            reconcile_interval: self.reconcile_interval,
            sweep_interval: self.sweep_interval,
        })
    }
}

/// Configuration for a [`FleetRuntime`].
pub struct FleetRuntimeConfig {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkloadDriver>,
    manager_config: ManagerConfig,
    reconcile_interval: Duration,
    sweep_interval: Duration,
}

impl FleetRuntimeConfig {
    /// Start the runtime, spawning the reconciler and sweeper tasks.
    pub async fn start(self) -> Result<FleetRuntime> {
        let manager = Arc::new(LifecycleManager::new(
            self.store.clone(),
            self.driver.clone(),
            self.manager_config,
        ));
        let locks = manager.locks();
        let telemetry = Arc::new(Telemetry::new(
            self.store.clone(),
            self.driver.clone(),
            locks.clone(),
        ));

        let reconciler = HealthReconciler::new(
            self.store.clone(),
            self.driver.clone(),
            locks,
            ReconcilerConfig {
                poll_interval: self.reconcile_interval,
            },
        );
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move {
            reconciler.run().await;
        });

        let sweeper = WorkloadSweeper::new(
            self.driver.clone(),
            SweeperConfig {
                sweep_interval: self.sweep_interval,
            },
        );
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        info!(
            driver = self.driver.driver_type(),
            "FleetRuntime started"
        );

        Ok(FleetRuntime {
            store: self.store,
            manager,
            telemetry,
            reconciler_handle,
            sweeper_handle,
            reconciler_shutdown,
            sweeper_shutdown,
        })
    }
}

/// A running fleet control plane that can be embedded in an application.
///
/// The runtime manages:
/// - Lifecycle manager for instance operations
/// - Telemetry adapter for metrics and backups
/// - Health reconciler correcting status drift
/// - Workload sweeper reclaiming dead workloads
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FleetRuntime {
    store: Arc<dyn Store>,
    manager: Arc<LifecycleManager>,
    telemetry: Arc<Telemetry>,
    reconciler_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
    reconciler_shutdown: Arc<Notify>,
    sweeper_shutdown: Arc<Notify>,
}

impl FleetRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::new()
    }

    /// The lifecycle manager, for serving instance operations.
    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// The telemetry adapter, for metrics and backups.
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the reconciler and sweeper to stop, then waits for them.
    /// In-flight lifecycle transitions run to completion on their own tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("FleetRuntime shutting down...");

        self.reconciler_shutdown.notify_one();
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.reconciler_handle.await {
            error!("Health reconciler task panicked: {}", e);
        }
        if let Err(e) = self.sweeper_handle.await {
            error!("Workload sweeper task panicked: {}", e);
        }

        info!("FleetRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background workers are still running.
    pub fn is_running(&self) -> bool {
        !self.reconciler_handle.is_finished() && !self.sweeper_handle.is_finished()
    }

    /// Readiness probe: whether the record store is reachable.
    pub async fn health_check(&self) -> bool {
        self.store.health_check_db().await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::store::SqliteStore;

    #[test]
    fn test_builder_default_values() {
        let builder = FleetRuntimeBuilder::default();

        assert!(builder.store.is_none());
        assert!(builder.driver.is_none());
        assert_eq!(builder.image, "stagecast/studio:latest");
        assert_eq!(builder.base_port, 5656);
        assert_eq!(builder.port_range, 10_000);
        assert_eq!(builder.stop_grace, Duration::from_secs(30));
        assert_eq!(builder.transition_timeout, Duration::from_secs(120));
        assert_eq!(builder.reconcile_interval, Duration::from_secs(30));
        assert_eq!(builder.sweep_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_builder_chaining() {
        let builder = FleetRuntimeBuilder::new()
            .image("stagecast/studio:canary")
            .base_port(7000)
            .port_range(100)
            .stop_grace(Duration::from_secs(5))
            .reconcile_interval(Duration::from_secs(1))
            .sweep_interval(Duration::from_secs(60));

        assert_eq!(builder.image, "stagecast/studio:canary");
        assert_eq!(builder.base_port, 7000);
        assert_eq!(builder.port_range, 100);
        assert_eq!(builder.stop_grace, Duration::from_secs(5));
        assert_eq!(builder.reconcile_interval, Duration::from_secs(1));
        assert_eq!(builder.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_builder_overwrite_values() {
        let builder = FleetRuntimeBuilder::new().base_port(7000).base_port(8000);

        // Last value wins.
        assert_eq!(builder.base_port, 8000);
    }

    #[test]
    fn test_builder_build_fails_without_store() {
        let result = FleetRuntimeBuilder::new()
            .driver(Arc::new(MockDriver::new()))
            .build();

        assert!(result.is_err());
        if let Err(err) = result {
            assert!(err.to_string().contains("store is required"));
        }
    }

    #[tokio::test]
    async fn test_builder_build_fails_without_driver() {
        let store = SqliteStore::in_memory().await.unwrap();
        let result = FleetRuntimeBuilder::new().store(Arc::new(store)).build();

        assert!(result.is_err());
        if let Err(err) = result {
            assert!(err.to_string().contains("driver is required"));
        }
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let store = SqliteStore::in_memory().await.unwrap();
        let runtime = FleetRuntime::builder()
            .store(Arc::new(store))
            .driver(Arc::new(MockDriver::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert!(runtime.health_check().await);

        tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("runtime did not shut down")
            .unwrap();
    }
}
