//! Generations and chains.
//!
//! Per-generation size accounting plus a nursery-to-mature promotion path,
//! with the chain represented as arena-owned generations linked by
//! `next: GenId` rather than an owning `Vec`, so the terminal generation can
//! point at itself without a cycle in ownership.

use crate::types::{BufferId, GenId};

#[derive(Clone, Copy, Default, Debug)]
pub struct PoolGenStats {
    pub total_size: usize,
    pub free_size: usize,
    pub new_size: usize,
    pub old_size: usize,
    pub buffered_size: usize,
}

pub struct Generation {
    pub id: GenId,
    pub stats: PoolGenStats,
    pub capacity: usize,
    pub mortality: f64,
    /// Forwarding buffer allocating objects evacuated into this
    /// generation's *target* (see `Chain`): the k-th generation's buffer
    /// allocates into generation `next`.
    pub forward: BufferId,
    /// The generation objects evacuated out of this one land in. The
    /// terminal ("dynamic") generation of a chain is its own `next`.
    pub next: GenId,
    /// Accumulated across a trace's reclaim: bytes of objects that
    /// survived a collection of this generation.
    pub survived: usize,
    /// Bytes condemned the last time this generation was collected.
    pub condemned: usize,
}

impl Generation {
    pub fn is_terminal(&self) -> bool {
        self.next == self.id
    }
}
