// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle manager.
//!
//! Owns the state machine over instance records and drives the workload
//! driver accordingly:
//!
//! ```text
//!             create                    start
//!   (none) ──────────▶ STOPPED ──────────────────▶ STARTING ──▶ RUNNING
//!               ▲         ▲                            │            │
//!               │         │          stop              ▼            │
//!             delete      └──────── STOPPING ◀── ERROR ◀────────────┘
//!                                                 (driver failure or
//!                                                  reconciler drift)
//! ```
//!
//! Start and stop transitions run in a spawned task holding the instance
//! lock, so a caller that gives up on the future cannot strand a workload
//! half-started; the transition always runs to a terminal status write.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_IMAGE;
use crate::driver::{
    self, DriverError, LABEL_INSTANCE_ID, LABEL_ORGANIZATION_ID, LABEL_USER_ID, ResourceLimits,
    RuntimeState, WorkloadDriver, WorkloadSpec, WorkloadSummary,
};
use crate::error::{Error, Result};
use crate::locks::InstanceLocks;
use crate::ports;
use crate::store::{InstanceRecord, InstanceStatus, Store};

/// Tunables for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Image new instances run.
    pub image: String,
    /// First port considered for allocation.
    pub base_port: u16,
    /// Number of ports scanned above the base.
    pub port_range: u16,
    /// Grace period given to workloads on stop.
    pub stop_grace: Duration,
    /// Upper bound on a single start or stop transition.
    pub transition_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            base_port: ports::BASE_PORT,
            port_range: ports::DEFAULT_PORT_RANGE,
            stop_grace: Duration::from_secs(30),
            transition_timeout: Duration::from_secs(120),
        }
    }
}

/// Request to create an instance.
#[derive(Debug, Clone)]
pub struct CreateInstance {
    /// Display name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Owning user.
    pub owner_user_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Initial configuration. Defaults to an empty object.
    pub config: Option<serde_json::Value>,
    /// Per-owner instance quota supplied by the caller's plan, if any.
    pub instance_limit: Option<i64>,
}

/// Request to update an instance's mutable fields. `None` keeps the
/// current value; config entries are merged shallowly.
#[derive(Debug, Clone, Default)]
pub struct UpdateInstance {
    /// New display name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// Config entries to merge in.
    pub config: Option<serde_json::Value>,
}

/// Everything a spawned transition task needs, detached from `&self`.
struct TransitionCtx {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkloadDriver>,
    instance_id: String,
    image: String,
    stop_grace: Duration,
    timeout: Duration,
}

/// Lifecycle manager over a record store and a workload driver.
pub struct LifecycleManager {
    store: Arc<dyn Store>,
    driver: Arc<dyn WorkloadDriver>,
    locks: InstanceLocks,
    allocation_lock: tokio::sync::Mutex<()>,
    config: ManagerConfig,
}

impl LifecycleManager {
    /// Build a manager over the given store and driver.
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn WorkloadDriver>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            driver,
            locks: InstanceLocks::new(),
            allocation_lock: tokio::sync::Mutex::new(()),
            config,
        }
    }

    /// Lock registry shared with the background workers.
    pub fn locks(&self) -> InstanceLocks {
        self.locks.clone()
    }

    /// Create an instance record with a freshly allocated port.
    /// The workload is not created until the first start.
    pub async fn create(&self, request: CreateInstance) -> Result<InstanceRecord> {
        if let Some(limit) = request.instance_limit {
            let count = self.store.count_instances(&request.owner_user_id).await?;
            if count >= limit {
                return Err(Error::LimitExceeded { limit });
            }
        }

        // Read-allocate-insert must not interleave with other creations.
        let _allocation = self.allocation_lock.lock().await;
        let occupied = self.store.list_ports().await?.into_iter().collect();
        let port = ports::allocate(&occupied, self.config.base_port, self.config.port_range)?;

        let now = chrono::Utc::now();
        let record = InstanceRecord {
            instance_id: Uuid::new_v4().to_string(),
            name: request.name,
            description: request.description,
            port,
            status: InstanceStatus::Stopped,
            config: request.config.unwrap_or_else(|| json!({})),
            owner_user_id: request.owner_user_id,
            organization_id: request.organization_id,
            created_at: now,
            updated_at: now,
        };
        self.store.create_instance(&record).await?;
        info!(instance_id = %record.instance_id, port = record.port, "Created instance");
        Ok(record)
    }

    /// Start an instance's workload, creating it on first start.
    pub async fn start(&self, instance_id: &str) -> Result<InstanceRecord> {
        let guard = self.locks.acquire(instance_id).await;
        let ctx = self.transition_ctx(instance_id);
        let task = tokio::spawn(async move {
            let _guard = guard;
            Self::start_locked(&ctx).await
        });
        flatten(task.await)
    }

    /// Stop an instance's workload and remove it from the runtime.
    pub async fn stop(&self, instance_id: &str) -> Result<InstanceRecord> {
        let guard = self.locks.acquire(instance_id).await;
        let ctx = self.transition_ctx(instance_id);
        let task = tokio::spawn(async move {
            let _guard = guard;
            Self::stop_locked(&ctx).await
        });
        flatten(task.await)
    }

    /// Stop then start, holding the instance lock across both phases.
    ///
    /// The two phases are not atomic: a crash after the stop leaves the
    /// instance cleanly STOPPED rather than half-restarted.
    pub async fn restart(&self, instance_id: &str) -> Result<InstanceRecord> {
        let guard = self.locks.acquire(instance_id).await;
        let ctx = self.transition_ctx(instance_id);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let record = Self::fetch(&ctx).await?;
            if record.status != InstanceStatus::Stopped {
                Self::stop_locked(&ctx).await?;
            }
            Self::start_locked(&ctx).await
        });
        flatten(task.await)
    }

    /// Delete an instance: best-effort teardown of its workload, then the
    /// record. The port is released for reuse.
    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        let guard = self.locks.acquire(instance_id).await;
        let record = self.get(instance_id).await?;
        let name = driver::workload_name(instance_id);

        // Teardown is best-effort: a wedged runtime must not make the
        // record undeletable.
        if record.status == InstanceStatus::Running
            || record.status == InstanceStatus::Starting
            || self.driver.inspect(&name).await != RuntimeState::NotFound
        {
            if let Err(e) = self.driver.stop(&name, self.config.stop_grace).await {
                warn!(instance_id = %instance_id, error = %e, "Workload stop during delete failed");
            }
            if let Err(e) = self.driver.remove(&name).await {
                warn!(instance_id = %instance_id, error = %e, "Workload removal during delete failed");
            }
        }

        self.store.delete_instance(instance_id).await?;
        self.locks.forget(instance_id);
        drop(guard);
        info!(instance_id = %instance_id, port = record.port, "Deleted instance");
        Ok(())
    }

    /// Update name, description, and config. Config entries merge shallowly
    /// into the existing object; omitted keys are preserved.
    pub async fn update(&self, instance_id: &str, update: UpdateInstance) -> Result<InstanceRecord> {
        let record = self.get(instance_id).await?;

        let name = update.name.unwrap_or(record.name);
        let description = update.description.or(record.description);
        let config = merge_config(record.config, update.config);

        self.store
            .update_instance(instance_id, &name, description.as_deref(), &config)
            .await?;
        self.get(instance_id).await
    }

    /// Fetch a single instance.
    pub async fn get(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                instance_id: instance_id.to_string(),
            })
    }

    /// List instances, optionally filtered by owner and/or status.
    pub async fn list(
        &self,
        owner_user_id: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceRecord>> {
        self.store.list_instances(owner_user_id, status).await
    }

    /// What the runtime actually reports for this instance's workload.
    pub async fn observed_state(&self, instance_id: &str) -> Result<RuntimeState> {
        self.get(instance_id).await?;
        Ok(self
            .driver
            .inspect(&driver::workload_name(instance_id))
            .await)
    }

    /// Recent workload logs. Empty when the workload does not exist.
    pub async fn logs(&self, instance_id: &str, tail: usize) -> Result<String> {
        self.get(instance_id).await?;
        Ok(self
            .driver
            .logs(&driver::workload_name(instance_id), tail)
            .await)
    }

    /// Adjust resource limits on a live workload.
    pub async fn scale(&self, instance_id: &str, limits: ResourceLimits) -> Result<()> {
        self.get(instance_id).await?;
        self.driver
            .update_resources(&driver::workload_name(instance_id), &limits)
            .await?;
        Ok(())
    }

    /// All workloads in the runtime that carry the instance label.
    pub async fn running_workloads(&self) -> Result<Vec<WorkloadSummary>> {
        Ok(self.driver.list_by_label(LABEL_INSTANCE_ID).await?)
    }

    fn transition_ctx(&self, instance_id: &str) -> TransitionCtx {
        TransitionCtx {
            store: self.store.clone(),
            driver: self.driver.clone(),
            instance_id: instance_id.to_string(),
            image: self.config.image.clone(),
            stop_grace: self.config.stop_grace,
            timeout: self.config.transition_timeout,
        }
    }

    async fn fetch(ctx: &TransitionCtx) -> Result<InstanceRecord> {
        ctx.store
            .get_instance(&ctx.instance_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                instance_id: ctx.instance_id.clone(),
            })
    }

    async fn start_locked(ctx: &TransitionCtx) -> Result<InstanceRecord> {
        let record = Self::fetch(ctx).await?;
        if record.status == InstanceStatus::Running {
            return Err(Error::InvalidStateTransition {
                instance_id: ctx.instance_id.clone(),
                status: record.status,
                operation: "start",
            });
        }

        ctx.store
            .update_status(&ctx.instance_id, InstanceStatus::Starting)
            .await?;

        let name = driver::workload_name(&ctx.instance_id);
        let spec = build_workload_spec(&record, &ctx.image);
        let driver = ctx.driver.clone();
        let operation = async {
            // Reuse a workload left over from a previous run.
            match driver.create(&spec).await {
                Ok(()) | Err(DriverError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
            driver.start(&name).await
        };

        match tokio::time::timeout(ctx.timeout, operation).await {
            Ok(Ok(())) => {
                ctx.store
                    .update_status(&ctx.instance_id, InstanceStatus::Running)
                    .await?;
                info!(instance_id = %ctx.instance_id, port = record.port, "Instance started");
                Self::fetch(ctx).await
            }
            Ok(Err(e)) => {
                Self::mark_error(ctx, "start", &e).await;
                Err(Error::Driver(e))
            }
            Err(_) => {
                let e = DriverError::Timeout {
                    operation: "start",
                    name,
                    seconds: ctx.timeout.as_secs(),
                };
                Self::mark_error(ctx, "start", &e).await;
                Err(Error::Driver(e))
            }
        }
    }

    async fn stop_locked(ctx: &TransitionCtx) -> Result<InstanceRecord> {
        let record = Self::fetch(ctx).await?;
        if record.status == InstanceStatus::Stopped {
            return Err(Error::InvalidStateTransition {
                instance_id: ctx.instance_id.clone(),
                status: record.status,
                operation: "stop",
            });
        }

        ctx.store
            .update_status(&ctx.instance_id, InstanceStatus::Stopping)
            .await?;

        let name = driver::workload_name(&ctx.instance_id);
        let driver = ctx.driver.clone();
        let grace = ctx.stop_grace;
        let operation = async {
            // A workload already gone counts as stopped.
            match driver.stop(&name, grace).await {
                Ok(()) | Err(DriverError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            match driver.remove(&name).await {
                Ok(()) | Err(DriverError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        };

        match tokio::time::timeout(ctx.timeout, operation).await {
            Ok(Ok(())) => {
                ctx.store
                    .update_status(&ctx.instance_id, InstanceStatus::Stopped)
                    .await?;
                info!(instance_id = %ctx.instance_id, "Instance stopped");
                Self::fetch(ctx).await
            }
            Ok(Err(e)) => {
                Self::mark_error(ctx, "stop", &e).await;
                Err(Error::Driver(e))
            }
            Err(_) => {
                let e = DriverError::Timeout {
                    operation: "stop",
                    name,
                    seconds: ctx.timeout.as_secs(),
                };
                Self::mark_error(ctx, "stop", &e).await;
                Err(Error::Driver(e))
            }
        }
    }

    async fn mark_error(ctx: &TransitionCtx, operation: &str, cause: &DriverError) {
        warn!(instance_id = %ctx.instance_id, operation = operation, error = %cause,
            "Transition failed, marking instance ERROR");
        if let Err(e) = ctx
            .store
            .update_status(&ctx.instance_id, InstanceStatus::Error)
            .await
        {
            tracing::error!(instance_id = %ctx.instance_id, error = %e,
                "Failed to record ERROR status");
        }
    }
}

fn flatten(result: std::result::Result<Result<InstanceRecord>, JoinError>) -> Result<InstanceRecord> {
    result.unwrap_or_else(|e| Err(Error::Other(format!("transition task failed: {e}"))))
}

/// Shallow merge of update entries over the existing config object.
fn merge_config(
    existing: serde_json::Value,
    update: Option<serde_json::Value>,
) -> serde_json::Value {
    let Some(update) = update else {
        return existing;
    };
    match (existing, update) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                base.insert(key, value);
            }
            serde_json::Value::Object(base)
        }
        (_, update) => update,
    }
}

/// The workload a record maps to: image, identity env and labels, volumes,
/// host port binding, default resource limits, restart unless stopped.
fn build_workload_spec(record: &InstanceRecord, image: &str) -> WorkloadSpec {
    let mut spec = WorkloadSpec::new(driver::workload_name(&record.instance_id), image);
    spec.port = Some(record.port);
    spec.restart_unless_stopped = true;

    spec.env
        .insert("STAGECAST_MODE".to_string(), "production".to_string());
    spec.env.insert("PORT".to_string(), record.port.to_string());
    spec.env
        .insert("INSTANCE_ID".to_string(), record.instance_id.clone());
    spec.env
        .insert("USER_ID".to_string(), record.owner_user_id.clone());
    spec.env.insert(
        "ORGANIZATION_ID".to_string(),
        record.organization_id.clone(),
    );
    // Scalar config entries are passed through as environment.
    if let serde_json::Value::Object(entries) = &record.config {
        for (key, value) in entries {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            spec.env.insert(key.clone(), rendered);
        }
    }

    spec.binds = vec![
        format!("{}:/app/data", driver::data_volume(&record.instance_id)),
        format!("{}:/app/assets", driver::assets_volume(&record.instance_id)),
        format!("{}:/backup", driver::backup_volume(&record.instance_id)),
    ];

    spec.labels.insert(
        LABEL_INSTANCE_ID.to_string(),
        record.instance_id.clone(),
    );
    spec.labels
        .insert(LABEL_USER_ID.to_string(), record.owner_user_id.clone());
    spec.labels.insert(
        LABEL_ORGANIZATION_ID.to_string(),
        record.organization_id.clone(),
    );

    spec
}
