// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! # stagecast-fleet
//!
//! Fleet control plane for stagecast: allocates host ports, drives tenant
//! instance workloads over a container runtime, reconciles recorded status
//! against observed state, and reclaims dead workloads.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──────────────────────┐
//!        API layer ────▶ │  LifecycleManager     │───▶ per-instance locks
//!                        │  create/start/stop/   │
//!                        │  restart/delete/...   │
//!                        └───────┬──────────┬───┘
//!                                │          │
//!                        ┌───────▼───┐  ┌───▼────────────┐
//!                        │  Store    │  │ WorkloadDriver │
//!                        │ (Postgres │  │ (Docker, Mock) │
//!                        │ / SQLite) │  └───▲────────────┘
//!                        └───────▲───┘      │
//!                                │          │
//!          HealthReconciler ─────┴──────────┤   (every 30s: RUNNING but
//!                                           │    not running → ERROR)
//!          WorkloadSweeper ─────────────────┘   (every 1h: reclaim
//!                                                exited/dead workloads)
//! ```
//!
//! The record store holds *intent* (what the control plane last decided);
//! the driver reports *observation* (what the runtime actually runs). Drift
//! correction is one-directional: the reconciler demotes RUNNING to ERROR,
//! never the reverse, and never restarts anything on its own.
//!
//! ## Instance state machine
//!
//! ```text
//!           create                start
//!   (none) ───────▶ STOPPED ─────────────▶ STARTING ───▶ RUNNING
//!                      ▲                       │             │
//!                      │        stop           ▼             ▼
//!                      └────── STOPPING ◀─── ERROR ◀── (driver failure
//!                                                       or drift)
//! ```
//!
//! Start and stop are spawned onto their own tasks holding the instance
//! lock, so an abandoned request still drives the transition to a terminal
//! status write.
//!
//! ## Configuration
//!
//! | Variable                           | Default                   | Purpose                       |
//! |------------------------------------|---------------------------|-------------------------------|
//! | `STAGECAST_DATABASE_URL`           | (required)                | PostgreSQL connection URL     |
//! | `STAGECAST_IMAGE`                  | `stagecast/studio:latest` | Image instances run           |
//! | `STAGECAST_BASE_PORT`              | `5656`                    | First port for allocation     |
//! | `STAGECAST_PORT_RANGE`             | `10000`                   | Ports scanned above the base  |
//! | `STAGECAST_RECONCILE_INTERVAL_SECS`| `30`                      | Health reconciler poll        |
//! | `STAGECAST_SWEEP_INTERVAL_SECS`    | `3600`                    | Workload sweeper interval     |
//! | `STAGECAST_STOP_GRACE_SECS`        | `30`                      | Stop grace period             |

#![deny(missing_docs)]

/// Environment-driven configuration.
pub mod config;
/// Workload driver abstraction and implementations.
pub mod driver;
/// Error taxonomy.
pub mod error;
/// Per-instance lock registry.
pub mod locks;
/// Instance lifecycle manager.
pub mod manager;
/// Port allocation.
pub mod ports;
/// Health reconciler worker.
pub mod reconciler;
/// Embeddable fleet runtime.
pub mod runtime;
/// Instance record store.
pub mod store;
/// Workload sweeper worker.
pub mod sweeper;
/// Instance metrics and backups.
pub mod telemetry;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::{FleetRuntime, FleetRuntimeBuilder};
