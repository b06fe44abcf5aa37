// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stagecast-fleet.
//!
//! The route layer maps these onto user-facing responses via [`Error::error_code`];
//! vendor error shapes (database driver, container runtime) are converted into
//! this taxonomy at the boundary adapters and never inspected by core logic.

use thiserror::Error;

use crate::driver::DriverError;
use crate::store::InstanceStatus;

/// Result type using the fleet [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Fleet errors surfaced by lifecycle, reconciliation, and telemetry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Instance record does not exist.
    #[error("Instance '{instance_id}' not found")]
    NotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// Operation is not valid for the instance's current status
    /// (e.g. `start` on a RUNNING instance).
    #[error("Cannot {operation} instance '{instance_id}' while {status}")]
    InvalidStateTransition {
        /// The instance ID.
        instance_id: String,
        /// The recorded status at the time of the call.
        status: InstanceStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// Caller-enforced instance quota was reached.
    #[error("Plan limit reached: maximum {limit} instances allowed")]
    LimitExceeded {
        /// The quota that was hit.
        limit: i64,
    },

    /// No free port within the configured range.
    #[error("No free port in range {base}..{}", base.saturating_add(*range))]
    AllocationExhausted {
        /// First port of the scan range.
        base: u16,
        /// Number of ports in the scan range.
        range: u16,
    },

    /// Workload driver operation failed. Lifecycle transitions mark the
    /// instance ERROR before propagating this.
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Record store operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable machine-readable code for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            Self::AllocationExhausted { .. } => "ALLOCATION_EXHAUSTED",
            Self::Driver(_) => "DRIVER_FAILURE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Other(_) => "INTERNAL",
        }
    }
}
