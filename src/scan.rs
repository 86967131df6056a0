//! Scan state and the fix protocol.
//!
//! `ScanState` embeds `&mut Arena` directly rather than routing fix through
//! a trait object, since every fix call happens synchronously under the
//! arena lock. The summary invariant it maintains is
//! `summary = fixed_summary ∪ (unfixed_summary \ white)`.

use crate::addr::Addr;
use crate::arena::Arena;
use crate::error::Result;
use crate::pool::amc;
use crate::refset::{zone_of, RefSet};
use crate::types::{Rank, TraceSet};

#[derive(Default, Clone, Copy, Debug)]
pub struct ScanCounters {
    pub fix_ref_count: usize,
    pub seg_ref_count: usize,
    pub white_seg_ref_count: usize,
    pub nail_count: usize,
    pub snap_count: usize,
    pub forward_count: usize,
    pub copied_size: usize,
    pub scanned_size: usize,
}

pub struct ScanState<'a> {
    pub traces: TraceSet,
    pub rank: Rank,
    pub white: RefSet,
    pub unfixed_summary: RefSet,
    pub fixed_summary: RefSet,
    pub zone_shift: u32,
    pub emergency: bool,
    pub counters: ScanCounters,
    pub arena: &'a mut Arena,
}

impl<'a> ScanState<'a> {
    pub fn new(arena: &'a mut Arena, traces: TraceSet, rank: Rank, white: RefSet) -> Self {
        let emergency = traces.iter().any(|t| arena.trace(t).map_or(false, |tr| tr.emergency));
        let zone_shift = arena.config.zone_shift;
        ScanState {
            traces,
            rank,
            white,
            unfixed_summary: RefSet::EMPTY,
            fixed_summary: RefSet::EMPTY,
            zone_shift,
            emergency,
            counters: ScanCounters::default(),
            arena,
        }
    }

    /// `fixed_summary ∪ (unfixed_summary \ white)`.
    pub fn summary(&self) -> RefSet {
        self.fixed_summary.union(self.unfixed_summary.diff(self.white))
    }

    /// The fast filter: accept a reference iff its zone is present in
    /// `ss.white`. Pure speed optimisation; falling through to
    /// the full fix never changes the outcome for a zone the filter would
    /// have rejected, because a rejected zone cannot belong to any white
    /// segment.
    #[inline]
    fn fast_white_filter(&self, addr: Addr) -> bool {
        self.white.contains_zone(zone_of(addr, self.zone_shift))
    }

    /// The fix operation: filter, resolve to a segment, check colour, then
    /// dispatch to the pool's fix (or its emergency fallback).
    pub fn fix(&mut self, slot: &mut Addr) -> Result<()> {
        self.counters.fix_ref_count += 1;
        let addr = *slot;
        if addr.is_null() {
            return Ok(());
        }
        let zone = zone_of(addr, self.zone_shift);

        if !self.fast_white_filter(addr) {
            self.unfixed_summary = self.unfixed_summary.add_zone(zone);
            return Ok(());
        }

        let seg_id = match self.arena.seg_of(addr) {
            Some(id) => id,
            None => {
                // Conservative-scan safety: an EXACT reference must always
                // resolve to a managed (or null) address.
                debug_assert!(
                    self.rank != Rank::Exact,
                    "EXACT reference {:?} does not point into any segment",
                    addr
                );
                self.unfixed_summary = self.unfixed_summary.add_zone(zone);
                return Ok(());
            }
        };
        self.counters.seg_ref_count += 1;

        let is_white = self.arena.segment(seg_id).is_white_for_any(self.traces);
        if !is_white {
            self.fixed_summary = self.fixed_summary.add_zone(zone);
            return Ok(());
        }
        self.counters.white_seg_ref_count += 1;

        if self.rank == Rank::Weak {
            // A weak reference never keeps its referent alive: if the
            // referent already moved (some exact reference forwarded it
            // first), snap to the new location; otherwise it didn't
            // survive, and the weak slot is cleared rather than forwarded.
            amc::fix_weak(self, seg_id, slot)?;
        } else if self.emergency {
            amc::fix_emergency(self, seg_id, slot)?;
        } else {
            amc::fix(self, seg_id, slot)?;
        }

        if !slot.is_null() {
            let new_zone = zone_of(*slot, self.zone_shift);
            self.fixed_summary = self.fixed_summary.add_zone(new_zone);
        }
        Ok(())
    }

    /// Scan every slot in `slots`, in place. A convenience for clients
    /// whose objects are simple reference arrays.
    pub fn scan_area(&mut self, slots: &mut [Addr]) -> Result<()> {
        for slot in slots.iter_mut() {
            self.fix(slot)?;
        }
        Ok(())
    }
}
