// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance serialization.
//!
//! Every mutating operation on an instance (start, stop, restart, delete,
//! backup, health correction) runs under that instance's lock, so at most one
//! such operation is in flight per instance while operations on different
//! instances proceed in parallel. Waiters queue on the tokio mutex rather
//! than failing fast.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-instance locks.
///
/// Cloning is cheap and all clones share the same registry. Guards are owned
/// so they can be moved into spawned transition tasks.
#[derive(Clone, Default)]
pub struct InstanceLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl InstanceLocks {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for an instance, waiting if it is held.
    pub async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap();
            map.entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Acquire without waiting. `None` if the lock is held.
    pub fn try_acquire(&self, instance_id: &str) -> Option<OwnedMutexGuard<()>> {
        let mutex = {
            let mut map = self.inner.lock().unwrap();
            map.entry(instance_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        mutex.try_lock_owned().ok()
    }

    /// Drop the registry entry for a deleted instance. A guard still held on
    /// the old entry stays valid; new acquirers get a fresh lock.
    pub fn forget(&self, instance_id: &str) {
        self.inner.lock().unwrap().remove(instance_id);
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
