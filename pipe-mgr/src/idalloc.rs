// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

/// A simple structure for issuing and reclaiming unique 32-bit identifiers.
/// Every table that stores its entries owns one of these, and draws its entry
/// handles from it.
///
/// The free space is tracked as a set of disjoint spans, so a table that has
/// only ever been filled and emptied in order costs a single span no matter
/// how many handles it has issued.  The lowest free identifier is always
/// handed out first, which means a released handle is reused by the very next
/// allocation.  Since every allocation and release happens under the owning
/// table's lock, no caller can observe a handle being reissued while the old
/// entry is still reachable.
use std::collections::BTreeMap;

use slog::{debug, trace};

use crate::types::PipeMgrError;
use crate::types::PipeMgrResult;
use crate::types::INVALID_HDL;

pub struct IdAllocator {
    // Where debug messages are logged
    log: slog::Logger,
    // Identifiers are issued from [0, limit)
    limit: u32,
    // Free spans, keyed by their low end and mapping to their (exclusive)
    // high end.  Adjacent spans are always coalesced.
    free: BTreeMap<u32, u32>,
    // Number of identifiers currently issued
    in_use: u32,
}

impl IdAllocator {
    /// Create an allocator covering the full 32-bit space, minus the reserved
    /// [`INVALID_HDL`].
    pub fn new(log: &slog::Logger, name: impl ToString) -> Self {
        Self::with_limit(log, name, INVALID_HDL)
    }

    /// Create an allocator issuing identifiers from `[0, limit)`.
    pub fn with_limit(
        log: &slog::Logger,
        name: impl ToString,
        limit: u32,
    ) -> Self {
        let unit = format!("idalloc_{}", name.to_string());
        let log = log.new(slog::o!("unit" => unit));
        debug!(log, "created new id allocator.  limit: {limit}");
        let mut a = IdAllocator {
            log,
            limit,
            free: BTreeMap::new(),
            in_use: 0,
        };
        a.reset();
        a
    }

    /// Return every identifier to the free pool.  It is the caller's
    /// responsibility not to release identifiers issued prior to a reset.
    pub fn reset(&mut self) {
        self.free.clear();
        if self.limit > 0 {
            self.free.insert(0, self.limit);
        }
        self.in_use = 0;
    }

    /// Issue the lowest free identifier.
    pub fn allocate(&mut self) -> PipeMgrResult<u32> {
        let Some((low, high)) = self.free.pop_first() else {
            return Err(PipeMgrError::Exhausted(format!(
                "all {} identifiers in use",
                self.limit
            )));
        };
        if low + 1 < high {
            self.free.insert(low + 1, high);
        }
        self.in_use += 1;
        trace!(self.log, "allocated {low}");
        Ok(low)
    }

    /// Return an identifier to the free pool, merging it with its free
    /// neighbors.
    pub fn release(&mut self, id: u32) -> PipeMgrResult<()> {
        if !self.is_allocated(id) {
            return Err(PipeMgrError::Invalid(format!(
                "releasing unallocated id {id}"
            )));
        }

        let mut low = id;
        let mut high = id + 1;
        if let Some((&prev_low, &prev_high)) = self.free.range(..id).next_back()
        {
            if prev_high == id {
                self.free.remove(&prev_low);
                low = prev_low;
            }
        }
        if let Some(next_high) = self.free.remove(&high) {
            high = next_high;
        }
        self.free.insert(low, high);
        self.in_use -= 1;
        trace!(self.log, "released {id}");
        Ok(())
    }

    pub fn is_allocated(&self, id: u32) -> bool {
        if id >= self.limit {
            return false;
        }
        match self.free.range(..=id).next_back() {
            Some((_, &high)) => id >= high,
            None => true,
        }
    }

    /// Number of identifiers currently issued
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    #[cfg(test)]
    fn spans(&self) -> Vec<(u32, u32)> {
        self.free.iter().map(|(l, h)| (*l, *h)).collect()
    }
}

#[cfg(test)]
fn new_allocator(limit: u32) -> IdAllocator {
    let log =
        common::logging::init("test", &None, common::logging::LogFormat::Human)
            .unwrap();
    IdAllocator::with_limit(&log, "test", limit)
}

// Test simple allocation.
#[test]
fn test_basic() -> anyhow::Result<()> {
    let mut ids = new_allocator(128);

    assert_eq!(ids.allocate()?, 0);
    assert_eq!(ids.allocate()?, 1);
    assert_eq!(ids.spans(), vec![(2, 128)]);
    assert!(ids.is_allocated(0));
    assert!(ids.is_allocated(1));
    assert!(!ids.is_allocated(2));
    assert!(!ids.is_allocated(128));
    assert_eq!(ids.in_use(), 2);
    Ok(())
}

// A released identifier is the lowest free one, so it is handed out next
#[test]
fn test_reuse() -> anyhow::Result<()> {
    let mut ids = new_allocator(128);

    for _ in 0..4 {
        ids.allocate()?;
    }
    ids.release(1)?;
    assert!(!ids.is_allocated(1));
    assert_eq!(ids.allocate()?, 1);
    assert_eq!(ids.allocate()?, 4);
    Ok(())
}

#[test]
fn test_coalesce() -> anyhow::Result<()> {
    let mut ids = new_allocator(16);

    for _ in 0..6 {
        ids.allocate()?;
    }
    ids.release(1)?;
    ids.release(3)?;
    assert_eq!(ids.spans(), vec![(1, 2), (3, 4), (6, 16)]);

    // Bridging the gap merges both neighbors
    ids.release(2)?;
    assert_eq!(ids.spans(), vec![(1, 4), (6, 16)]);
    ids.release(5)?;
    ids.release(4)?;
    assert_eq!(ids.spans(), vec![(1, 16)]);
    ids.release(0)?;
    assert_eq!(ids.spans(), vec![(0, 16)]);
    assert_eq!(ids.in_use(), 0);
    Ok(())
}

#[test]
fn test_double_free() -> anyhow::Result<()> {
    let mut ids = new_allocator(16);

    let a = ids.allocate()?;
    ids.release(a)?;
    ids.release(a).unwrap_err();
    ids.release(15).unwrap_err();
    ids.release(16).unwrap_err();
    Ok(())
}

#[test]
fn test_exhaustion() -> anyhow::Result<()> {
    let mut ids = new_allocator(8);

    let mut s = Vec::new();
    for _ in 0..8 {
        s.push(ids.allocate().expect("exhausted pool prematurely"));
    }
    assert!(matches!(ids.allocate(), Err(PipeMgrError::Exhausted(_))));
    ids.release(s[5])?;
    assert_eq!(ids.allocate()?, 5);

    ids.reset();
    assert_eq!(ids.in_use(), 0);
    assert_eq!(ids.allocate()?, 0);
    Ok(())
}

// The reserved sentinel is outside the managed range
#[test]
fn test_sentinel() -> anyhow::Result<()> {
    let log =
        common::logging::init("test", &None, common::logging::LogFormat::Human)
            .unwrap();
    let mut ids = IdAllocator::new(&log, "full");
    assert!(!ids.is_allocated(INVALID_HDL));
    ids.release(INVALID_HDL).unwrap_err();
    assert_eq!(ids.spans(), vec![(0, INVALID_HDL)]);
    assert_eq!(ids.allocate()?, 0);
    Ok(())
}
