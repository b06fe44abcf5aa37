// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload sweeper.
//!
//! Long-interval janitor that asks the driver to reclaim labeled workloads
//! left behind in exited or dead state (crashed instances, interrupted
//! transitions, finished backup helpers). Sweeping never touches instance
//! records; the reconciler owns status corrections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::driver::{LABEL_INSTANCE_ID, WorkloadDriver};
use crate::error::Result;

/// Configuration for the workload sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to sweep.
    pub sweep_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Background worker reclaiming dead workloads.
pub struct WorkloadSweeper {
    driver: Arc<dyn WorkloadDriver>,
    config: SweeperConfig,
    shutdown: Arc<Notify>,
}

impl WorkloadSweeper {
    /// Build a sweeper over the given driver.
    pub fn new(driver: Arc<dyn WorkloadDriver>, config: SweeperConfig) -> Self {
        Self {
            driver,
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
            interval_secs = self.config.sweep_interval.as_secs(),
            "Workload sweeper started"
        );
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Workload sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(removed) => {
                            info!(removed = removed, "Sweep reclaimed dead workloads");
                        }
                        Err(e) => {
                            error!(error = %e, "Sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// One sweep pass. Returns how many workloads were reclaimed.
    pub async fn sweep_once(&self) -> Result<u64> {
        Ok(self.driver.remove_if_exited(LABEL_INSTANCE_ID).await?)
    }
}
