//! Location dependencies.
//!
//! An `Ld` is a client-side witness: "has anything I looked up since the
//! last reset possibly moved?". A monotonic epoch counter alone would force
//! every `Ld` stale on any collection anywhere; a short log of which zones
//! moved at which epoch lets staleness stay scoped to the zones the client
//! actually touched. The epoch bump is lock-free; reading it takes a stable
//! snapshot of the log.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::addr::Addr;
use crate::refset::{zone_of, RefSet};

const LOG_CAPACITY: usize = 64;

pub struct LdTable {
    epoch: AtomicU64,
    log: parking_lot::Mutex<Vec<(u64, RefSet)>>,
}

impl LdTable {
    pub fn new() -> Self {
        LdTable { epoch: AtomicU64::new(0), log: parking_lot::Mutex::new(Vec::new()) }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Called when a flip's `may_move` set is non-empty, to record which
    /// zones just moved.
    pub fn age(&self, moved: RefSet) {
        if moved.is_empty() {
            return;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let mut log = self.log.lock();
        log.push((epoch, moved));
        if log.len() > LOG_CAPACITY {
            log.remove(0);
        }
    }
}

impl Default for LdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Ld {
    epoch: u64,
    refset: RefSet,
}

impl Ld {
    pub fn reset(&mut self, table: &LdTable) {
        self.epoch = table.current_epoch();
        self.refset = RefSet::EMPTY;
    }

    pub fn new(table: &LdTable) -> Self {
        Ld { epoch: table.current_epoch(), refset: RefSet::EMPTY }
    }

    pub fn add(&mut self, addr: Addr, zone_shift: u32) {
        self.refset = self.refset.add_zone(zone_of(addr, zone_shift));
    }

    pub fn merge(&mut self, other: &Ld) {
        self.epoch = self.epoch.min(other.epoch);
        self.refset = self.refset.union(other.refset);
    }

    /// True if any zone this LD depends on has moved since `reset`.
    pub fn is_stale(&self, table: &LdTable) -> bool {
        if table.current_epoch() == self.epoch {
            return false;
        }
        let log = table.log.lock();
        log.iter().any(|(e, moved)| *e > self.epoch && self.refset.intersects(*moved))
    }

    /// True if *any* zone has moved since reset, regardless of whether this
    /// LD's `refset` claims that zone -- a coarser, cheaper check clients
    /// use before bothering with per-address `is_stale`.
    pub fn is_stale_any(&self, table: &LdTable) -> bool {
        table.current_epoch() != self.epoch
    }
}
