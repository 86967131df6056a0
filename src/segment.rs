//! Segments.
//!
//! A contiguous, aligned range of managed address space owned by exactly
//! one pool, carrying the tri-colour state per trace, with AMC-specific
//! fields appended directly rather than behind a second vtable level.

use memmap2::MmapMut;

use crate::addr::Addr;
use crate::nailboard::Nailboard;
use crate::refset::RefSet;
use crate::types::{BufferId, GenId, PoolId, RankSet, SegId, TraceSet, TRACE_MAX};

pub struct Segment {
    pub id: SegId,
    pub pool: PoolId,
    pub base: Addr,
    pub limit: Addr,

    pub white: TraceSet,
    pub grey: TraceSet,
    pub nailed: TraceSet,

    pub rank_set: RankSet,
    pub summary: RefSet,
    pub buffer: Option<BufferId>,

    pub amc: AmcSegExt,

    /// Backing storage. Kept alive for the segment's whole lifetime; the
    /// client's `Format` callbacks dereference raw addresses inside this
    /// range directly (`Addr::as_slice`/`as_ptr`).
    _map: MmapMut,
}

/// AMC-specific fields appended to the generic segment, mirroring
/// `poolamc.c`'s `amcSegStruct` comments verbatim in meaning:
/// - `accounted_as_buffered`: true if a live attached buffer is charged
///   against `PoolGen::buffered_size`.
/// - `old`: true once the segment has survived at least one collection.
/// - `deferred`: true while the segment's size is deliberately excluded
///   from `new_size` (ramp mode, or hash-array allocations).
pub struct AmcSegExt {
    pub gen: Option<GenId>,
    pub board: Option<Nailboard>,
    pub forwarded: [usize; TRACE_MAX],
    pub accounted_as_buffered: bool,
    pub old: bool,
    pub deferred: bool,
    /// How far this segment has been scanned for its current trace, as a
    /// Cheney-style cursor chasing whatever is still being allocated into
    /// it. `None` means "not started".
    pub scanned_to: Option<Addr>,
    /// Set once a buffer that was allocating into this segment detaches
    /// from it: the true end of valid object bytes, since `[that point,
    /// segment limit)` is unused reserved space a scan must never read as
    /// objects. `None` while a buffer is still attached (scan consults
    /// the buffer's `init` instead) or for a segment no buffer ever
    /// touched.
    pub committed_limit: Option<Addr>,
}

impl Default for AmcSegExt {
    fn default() -> Self {
        AmcSegExt {
            gen: None,
            board: None,
            forwarded: [0; TRACE_MAX],
            accounted_as_buffered: false,
            old: false,
            deferred: false,
            scanned_to: None,
            committed_limit: None,
        }
    }
}

impl Segment {
    pub fn new(id: SegId, pool: PoolId, size: usize) -> Self {
        let map = MmapMut::map_anon(size.max(1)).expect("segment: anonymous mapping failed");
        let base = Addr::from_ptr(map.as_ptr());
        let limit = base + size;
        Segment {
            id,
            pool,
            base,
            limit,
            white: TraceSet::EMPTY,
            grey: TraceSet::EMPTY,
            nailed: TraceSet::EMPTY,
            rank_set: RankSet::EMPTY,
            summary: RefSet::EMPTY,
            buffer: None,
            amc: AmcSegExt::default(),
            _map: map,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.limit - self.base
    }

    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        addr.0 >= self.base.0 && addr.0 < self.limit.0
    }

    #[inline]
    pub fn is_white_for_any(&self, traces: TraceSet) -> bool {
        !self.white.intersect(traces).is_empty()
    }

    #[inline]
    pub fn is_grey_for_any(&self, traces: TraceSet) -> bool {
        !self.grey.intersect(traces).is_empty()
    }

    pub fn refset(&self, zone_shift: u32) -> RefSet {
        crate::refset::refset_of_range(self.base, self.limit, zone_shift)
    }

    /// Raw write access for padding/copying. Safe to call only while the
    /// caller holds the arena lock and no mutator buffer aliases the
    /// written range.
    pub unsafe fn as_mut_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}
