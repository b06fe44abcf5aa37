// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workload driver abstraction.
//!
//! The [`WorkloadDriver`] trait is the only seam between the control plane and
//! the container runtime. The [`DockerDriver`] talks to a local Docker daemon;
//! the [`MockDriver`] is an in-memory double used throughout the test suite.
//!
//! Workload identity is derived from the instance ID, never stored: the
//! workload for instance `abc` is always named `instance-abc`, and its volumes
//! are `data-abc`, `assets-abc`, and `backup-abc`.

pub mod docker;
pub mod mock;
mod traits;

pub use docker::DockerDriver;
pub use mock::MockDriver;
pub use traits::{
    DriverError, DriverResult, ResourceLimits, RuntimeState, WorkloadDriver, WorkloadSpec,
    WorkloadStats, WorkloadSummary,
};

/// Label carrying the owning instance ID on every managed workload.
pub const LABEL_INSTANCE_ID: &str = "stagecast.instance.id";
/// Label carrying the owning user ID.
pub const LABEL_USER_ID: &str = "stagecast.user.id";
/// Label carrying the owning organization ID.
pub const LABEL_ORGANIZATION_ID: &str = "stagecast.organization.id";

/// Deterministic workload name for an instance.
pub fn workload_name(instance_id: &str) -> String {
    format!("instance-{instance_id}")
}

/// Named volume holding the instance's persistent data.
pub fn data_volume(instance_id: &str) -> String {
    format!("data-{instance_id}")
}

/// Named volume holding the instance's uploaded assets.
pub fn assets_volume(instance_id: &str) -> String {
    format!("assets-{instance_id}")
}

/// Named volume backup archives are written into.
pub fn backup_volume(instance_id: &str) -> String {
    format!("backup-{instance_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_naming() {
        assert_eq!(workload_name("abc-123"), "instance-abc-123");
        assert_eq!(data_volume("abc-123"), "data-abc-123");
        assert_eq!(assets_volume("abc-123"), "assets-abc-123");
        assert_eq!(backup_volume("abc-123"), "backup-abc-123");
    }
}
