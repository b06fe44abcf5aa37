// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance record store.
//!
//! The [`Store`] trait abstracts the database so the lifecycle manager and the
//! background workers never touch SQL directly. Two backends are provided:
//! PostgreSQL for production and SQLite for development and tests.
//!
//! The store is the source of truth for *intent*: an instance's `status` column
//! records what the control plane last decided, not what the container runtime
//! currently reports. The health reconciler closes the gap between the two.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle status recorded for an instance.
///
/// Transitions are driven by the lifecycle manager; the health reconciler may
/// additionally move RUNNING to ERROR when the observed workload disagrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// No workload should be running.
    Stopped,
    /// A start transition is in flight.
    Starting,
    /// The workload should be up and serving.
    Running,
    /// A stop transition is in flight.
    Stopping,
    /// The last transition failed or the workload died underneath us.
    Error,
}

impl InstanceStatus {
    /// Canonical storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Error => "ERROR",
        }
    }

    /// Parse the storage representation. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOPPED" => Some(Self::Stopped),
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "STOPPING" => Some(Self::Stopping),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tenant instance as persisted in the `instances` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique instance identifier (UUID v4).
    pub instance_id: String,
    /// Display name.
    pub name: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Host port reserved for this instance. Unique across live records.
    pub port: u16,
    /// Last intended lifecycle status.
    pub status: InstanceStatus,
    /// Opaque key/value configuration passed to the workload at start time.
    pub config: serde_json::Value,
    /// Owning user.
    pub owner_user_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Raw row shape shared by both backends.
type InstanceRow = (
    String,
    String,
    Option<String>,
    i32,
    String,
    serde_json::Value,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn record_from_row(row: InstanceRow) -> Result<InstanceRecord> {
    let (
        instance_id,
        name,
        description,
        port,
        status,
        config,
        owner_user_id,
        organization_id,
        created_at,
        updated_at,
    ) = row;

    let status = InstanceStatus::parse(&status).ok_or_else(|| {
        Error::Other(format!(
            "Instance '{}' has unknown status '{}'",
            instance_id, status
        ))
    })?;
    let port = u16::try_from(port)
        .map_err(|_| Error::Other(format!("Instance '{}' has invalid port {}", instance_id, port)))?;

    Ok(InstanceRecord {
        instance_id,
        name,
        description,
        port,
        status,
        config,
        owner_user_id,
        organization_id,
        created_at,
        updated_at,
    })
}

/// Persistence operations on instance records.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new record. Fails if the ID or port is already taken.
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()>;

    /// Fetch a record by ID.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    /// List records, optionally filtered by owner and/or status,
    /// newest first.
    async fn list_instances(
        &self,
        owner_user_id: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceRecord>>;

    /// All ports currently reserved by live records.
    async fn list_ports(&self) -> Result<Vec<u16>>;

    /// Set the status of a record and bump `updated_at`.
    async fn update_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()>;

    /// Overwrite the mutable fields of a record and bump `updated_at`.
    /// Config merging happens in the lifecycle manager; the store writes
    /// whatever it is given.
    async fn update_instance(
        &self,
        instance_id: &str,
        name: &str,
        description: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<()>;

    /// Delete a record, releasing its port for reuse.
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;

    /// Number of records owned by a user.
    async fn count_instances(&self, owner_user_id: &str) -> Result<i64>;

    /// Connectivity probe for readiness checks.
    async fn health_check_db(&self) -> Result<bool>;
}
