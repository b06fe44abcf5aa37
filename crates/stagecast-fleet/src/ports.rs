// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host port allocation for instances.
//!
//! Ports are allocated by a linear scan upward from [`BASE_PORT`], picking the
//! first value absent from the set of ports already recorded in the instance
//! table. The scan is a pure function; callers serialize the read-allocate-insert
//! sequence behind the manager's allocation lock, and the UNIQUE constraint on
//! the port column backstops any race.

use std::collections::HashSet;

use crate::error::{Error, Result};

/// First port considered for allocation.
pub const BASE_PORT: u16 = 5656;

/// Default number of ports scanned above [`BASE_PORT`].
pub const DEFAULT_PORT_RANGE: u16 = 10_000;

/// Pick the lowest free port in `[base, base + range)`.
///
/// Deterministic: the same occupied set always yields the same port, so freed
/// ports are reused. Returns [`Error::AllocationExhausted`] when every port in
/// the range is taken.
pub fn allocate(occupied: &HashSet<u16>, base: u16, range: u16) -> Result<u16> {
    let end = base.saturating_add(range);
    for port in base..end {
        if !occupied.contains(&port) {
            return Ok(port);
        }
    }
    Err(Error::AllocationExhausted { base, range })
}
