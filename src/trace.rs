//! The trace state machine: create, condemn, start, flip, run, reclaim.
//!
//! A trace owns no memory of its own beyond bookkeeping: the actual
//! white/grey/black state lives on segments (`Segment::white`/`grey`), so
//! destroying a `Trace` never needs to walk anything.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use crate::addr::Addr;
use crate::arena::Arena;
use crate::error::{Res, Result};
use crate::message::Message;
use crate::pool::amc;
use crate::refset::RefSet;
use crate::root::{Root, RootId};
use crate::scan::{ScanCounters, ScanState};
use crate::types::{GenId, PoolId, Rank, SegId, TraceId, TraceSet};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceState {
    Init,
    Unflipped,
    Flipped,
    Reclaim,
    Finished,
}

pub struct Trace {
    pub id: TraceId,
    pub state: TraceState,
    pub reason: String,
    pub condemned: Vec<(PoolId, Vec<GenId>)>,
    pub white: RefSet,
    pub may_move: RefSet,
    pub emergency: bool,
    pub rate: usize,
    pub work_clock: usize,
    pub counters: ScanCounters,
    pub started_at: Option<Instant>,
    grey_segments: VecDeque<SegId>,
    grey_set: HashSet<SegId>,
    grey_roots: VecDeque<RootId>,
    weak_roots: VecDeque<RootId>,
}

impl Trace {
    fn new(id: TraceId, reason: String) -> Self {
        Trace {
            id,
            state: TraceState::Init,
            reason,
            condemned: Vec::new(),
            white: RefSet::EMPTY,
            may_move: RefSet::EMPTY,
            emergency: false,
            rate: 4096,
            work_clock: 0,
            counters: ScanCounters::default(),
            started_at: None,
            grey_segments: VecDeque::new(),
            grey_set: HashSet::new(),
            grey_roots: VecDeque::new(),
            weak_roots: VecDeque::new(),
        }
    }

    /// Push a segment onto the grey queue unless it's already on it.
    fn push_grey(&mut self, seg_id: SegId) {
        if self.grey_set.insert(seg_id) {
            self.grey_segments.push_back(seg_id);
        }
    }

    fn pop_grey(&mut self) -> Option<SegId> {
        let seg_id = self.grey_segments.pop_front()?;
        self.grey_set.remove(&seg_id);
        Some(seg_id)
    }

    pub fn condemned_size(&self, arena: &Arena) -> usize {
        self.condemned
            .iter()
            .flat_map(|(_, gens)| gens.iter())
            .map(|g| arena.generation(*g).condemned)
            .sum()
    }

    pub fn is_done_scanning(&self) -> bool {
        self.grey_segments.is_empty() && self.grey_roots.is_empty() && self.weak_roots.is_empty()
    }
}

impl Arena {
    /// Queue `seg_id` onto `id`'s grey work list. Exposed for the pool's
    /// fix path, which must grey a segment it just nailed.
    pub(crate) fn trace_grey_segment(&mut self, id: TraceId, seg_id: SegId) {
        if let Some(trace) = self.trace_mut(id) {
            trace.push_grey(seg_id);
        }
    }

    /// `TraceCreate`: allocate a trace id not currently busy.
    pub fn trace_create(&mut self, reason: impl Into<String>) -> Result<TraceId> {
        for i in 0..crate::types::TRACE_MAX as u8 {
            let id = TraceId(i);
            if !self.busy_traces.contains(id) {
                self.traces[id.index()] = Some(Trace::new(id, reason.into()));
                self.busy_traces = self.busy_traces.add(id);
                return Ok(id);
            }
        }
        Err(Res::Limit)
    }

    /// `TraceCondemnStart`: add a generation of a pool to the set this
    /// trace will collect. Must be called before `trace_start`.
    pub fn trace_condemn(&mut self, id: TraceId, pool_id: PoolId, gens: Vec<GenId>) -> Result<()> {
        let trace = self.trace_mut(id).ok_or(Res::Param)?;
        if trace.state != TraceState::Init {
            return Err(Res::Fail);
        }
        for g in &gens {
            let condemned = self.generation(*g).stats.old_size + self.generation(*g).stats.new_size;
            self.generation_mut(*g).condemned = condemned;
        }
        self.trace_mut(id).unwrap().condemned.push((pool_id, gens));
        Ok(())
    }

    /// `TraceStart`: whiten every condemned generation and queue every
    /// root for scanning, ordered by rank (ambiguous first).
    pub fn trace_start(&mut self, id: TraceId) -> Result<()> {
        let condemned = self.trace(id).ok_or(Res::Param)?.condemned.clone();
        if condemned.is_empty() {
            return Err(Res::Fail);
        }
        let mut white = RefSet::EMPTY;
        let mut total_condemned = 0usize;
        for (pool_id, gens) in &condemned {
            white = white.union(amc::whiten(self, *pool_id, id, gens));
            for g in gens {
                total_condemned += self.generation(*g).condemned;
            }
        }

        let mut root_ids: Vec<RootId> = self.roots.iter().map(|(i, _)| RootId(i)).collect();
        root_ids.sort_by_key(|r| self.roots.get(r.0).map(|root| root.rank).unwrap_or(Rank::Final));

        // Flip only scans ranks AMBIG through EXACT; WEAK (and FINAL) roots
        // must wait until every grey segment has been scanned, so a weak
        // reference is never splatted before the exact path that keeps its
        // referent alive has had a chance to forward it.
        let rank_of = |r: &RootId| self.roots.get(r.0).map(|root| root.rank).unwrap_or(Rank::Final);
        let (strong_roots, weak_roots): (Vec<RootId>, Vec<RootId>) =
            root_ids.into_iter().partition(|r| rank_of(r) <= Rank::Exact);

        let trace = self.trace_mut(id).unwrap();
        trace.white = white;
        trace.may_move = white;
        trace.rate = (total_condemned / 8).max(4096);
        trace.grey_roots = strong_roots.into_iter().collect();
        trace.weak_roots = weak_roots.into_iter().collect();
        trace.state = TraceState::Unflipped;
        trace.started_at = Some(std::time::Instant::now());

        log::debug!(
            "trace {:?} started: {} bytes condemned, reason={:?}",
            id,
            total_condemned,
            trace.reason
        );

        self.messages.post(Message::GcStart {
            timestamp: std::time::Instant::now(),
            reason: self.trace(id).unwrap().reason.clone(),
        });
        Ok(())
    }

    /// `TraceFlip`: scan every root under the shield, then derive the
    /// initial grey segment set from any segment whose summary intersects
    /// the new white set.
    pub fn trace_flip(&mut self, id: TraceId) -> Result<()> {
        if self.trace(id).ok_or(Res::Param)?.state != TraceState::Unflipped {
            return Err(Res::Fail);
        }
        let trace_set = TraceSet::single(id);
        let white = self.trace(id).unwrap().white;

        let root_ids: Vec<RootId> = self.trace(id).unwrap().grey_roots.iter().copied().collect();
        let this = self as *mut Arena;
        self.shield.suspend_resume(|| -> Result<()> {
            // SAFETY: `scan_root` accesses `self` only through the raw
            // pointer captured above, and the closure itself holds no
            // other borrow of `self`, so this does not alias.
            let arena = unsafe { &mut *this };
            for root_id in root_ids {
                scan_root(arena, root_id, trace_set, white)?;
            }
            Ok(())
        })?;

        let moved = self.trace(id).unwrap().may_move;
        self.ld.age(moved);

        let grey: Vec<SegId> = self
            .segments
            .iter()
            .filter(|(_, seg)| !seg.white.contains(id) && seg.summary.intersects(white))
            .map(|(i, _)| SegId(i))
            .collect();

        // Any generation condemned by this trace already has a forwarding
        // buffer attached to some segment; that segment will receive the
        // copies this trace makes and must be scanned too, even though it
        // started out black (it's not in `grey` above because it isn't
        // white).
        let condemned = self.trace(id).unwrap().condemned.clone();
        let forward_targets: Vec<SegId> = condemned
            .iter()
            .flat_map(|(_, gens)| gens.iter())
            .filter_map(|g| self.buffer(self.generation(*g).forward).seg)
            .collect();

        let trace = self.trace_mut(id).unwrap();
        trace.grey_roots.clear();
        // Don't clear `grey_segments`/`grey_set` here: the root scan above
        // may already have nailed and greyed segments (ambiguous references
        // pin and grey as they're fixed), and those entries must survive
        // into the queue this builds, not be discarded by it.
        for seg_id in grey.into_iter().chain(forward_targets) {
            trace.push_grey(seg_id);
        }
        trace.state = TraceState::Flipped;
        let grey_count = trace.grey_segments.len();
        self.flipped_traces = self.flipped_traces.add(id);
        log::debug!("trace {:?} flipped: {} grey segments queued", id, grey_count);
        Ok(())
    }

    /// `TraceRun`: scan grey segments until `budget` bytes have been
    /// scanned or none remain. Returns `true` if scanning is complete.
    pub fn trace_run(&mut self, id: TraceId, budget: usize) -> Result<bool> {
        if self.trace(id).ok_or(Res::Param)?.state != TraceState::Flipped {
            return Err(Res::Fail);
        }
        let trace_set = TraceSet::single(id);
        let white = self.trace(id).unwrap().white;
        let condemned_gens: Vec<GenId> = self
            .trace(id)
            .unwrap()
            .condemned
            .iter()
            .flat_map(|(_, gens)| gens.iter().copied())
            .collect();
        let mut scanned = 0usize;

        while scanned < budget {
            let seg_id = match self.trace_mut(id).unwrap().pop_grey() {
                Some(s) => s,
                None => break,
            };
            // AMC objects carry exact references only; ambiguous scanning
            // only ever happens from roots.
            let mut ss = ScanState::new(self, trace_set, Rank::Exact, white);
            let result = amc::scan(&mut ss, seg_id);
            let counters = ss.counters;
            let scan_summary = ss.summary();
            scanned += counters.scanned_size;
            let seg = self.segment_mut(seg_id);
            seg.summary = seg.summary.union(scan_summary);
            let trace = self.trace_mut(id).unwrap();
            trace.counters.fix_ref_count += counters.fix_ref_count;
            trace.counters.seg_ref_count += counters.seg_ref_count;
            trace.counters.white_seg_ref_count += counters.white_seg_ref_count;
            trace.counters.nail_count += counters.nail_count;
            trace.counters.snap_count += counters.snap_count;
            trace.counters.forward_count += counters.forward_count;
            trace.counters.copied_size += counters.copied_size;
            trace.counters.scanned_size += counters.scanned_size;
            trace.work_clock += counters.scanned_size;

            match result {
                Ok(()) => {}
                Err(Res::Memory) | Err(Res::CommitLimit) => {
                    // Allocation failed mid-scan: fall back to the
                    // emergency path for the rest of this trace, and
                    // requeue the segment so it still gets scanned.
                    let trace = self.trace_mut(id).unwrap();
                    trace.emergency = true;
                    trace.grey_segments.push_front(seg_id);
                    trace.grey_set.insert(seg_id);
                }
                Err(e) => return Err(e),
            }

            // Scanning may have copied objects into a condemned
            // generation's forwarding buffer, possibly handing that
            // buffer off to a fresh segment. Re-derive each condemned
            // generation's current target and requeue it if it holds
            // content this trace hasn't scanned yet.
            for gen_id in &condemned_gens {
                let buf_id = self.generation(*gen_id).forward;
                let seg_id = match self.buffer(buf_id).seg {
                    Some(s) => s,
                    None => continue,
                };
                let seg = self.segment(seg_id);
                let scanned_to = seg.amc.scanned_to.unwrap_or(seg.base);
                let frontier = Addr(self.buffer(buf_id).init());
                if frontier.0 > scanned_to.0 {
                    self.trace_mut(id).unwrap().push_grey(seg_id);
                }
            }
        }

        // Only once every grey segment has been scanned -- so every exact
        // path that could keep an object alive has already forwarded it --
        // do the deferred WEAK (and FINAL) roots get their turn. Root-scan
        // work isn't budgeted, so this always runs to completion rather
        // than stopping partway like the segment loop above.
        if self.trace(id).unwrap().grey_segments.is_empty() {
            let weak_root_ids: Vec<RootId> = self.trace_mut(id).unwrap().weak_roots.drain(..).collect();
            if !weak_root_ids.is_empty() {
                let this = self as *mut Arena;
                self.shield.suspend_resume(|| -> Result<()> {
                    // SAFETY: see the identical pattern in `trace_flip`.
                    let arena = unsafe { &mut *this };
                    for root_id in weak_root_ids {
                        scan_root(arena, root_id, trace_set, white)?;
                    }
                    Ok(())
                })?;
            }
        }

        Ok(self.trace(id).unwrap().is_done_scanning())
    }

    /// `TraceReclaim`: free condemned segments that survived unnailed,
    /// retire the rest as old, and post the completion message.
    pub fn trace_reclaim(&mut self, id: TraceId) -> Result<()> {
        let trace = self.trace(id).ok_or(Res::Param)?;
        if trace.state != TraceState::Reclaim {
            return Err(Res::Fail);
        }
        let condemned = trace.condemned.clone();
        let condemned_size = trace.condemned_size(self);

        for (pool_id, _gens) in &condemned {
            amc::reclaim(self, *pool_id, id)?;
        }

        let live: usize = condemned
            .iter()
            .flat_map(|(_, gens)| gens.iter())
            .map(|g| self.generation(*g).survived)
            .sum();

        let trace = self.trace_mut(id).unwrap();
        trace.state = TraceState::Finished;
        self.busy_traces = self.busy_traces.remove(id);
        self.flipped_traces = self.flipped_traces.remove(id);

        log::debug!("trace {:?} reclaimed: {} bytes condemned, {} bytes survived", id, condemned_size, live);

        self.messages.post(Message::GcEnd {
            timestamp: std::time::Instant::now(),
            start_reason: self.trace(id).unwrap().reason.clone(),
            condemned: condemned_size,
            live,
        });
        Ok(())
    }

    /// `TracePoll`: whether this trace should be given another `step`.
    /// A fuller policy would weigh this against the rate derived from
    /// `pause_time_ms`; here it is simply "not finished yet".
    pub fn trace_poll(&self, id: TraceId) -> bool {
        self.trace(id).map_or(false, |t| t.state != TraceState::Finished)
    }

    /// `TracePoll` + dispatch: advance the trace by one state-machine
    /// step, doing `rate` bytes of work if already flipped. Returns
    /// whether the trace is now finished.
    pub fn trace_step(&mut self, id: TraceId) -> Result<bool> {
        let state = self.trace(id).ok_or(Res::Param)?.state;
        match state {
            TraceState::Init => Err(Res::Fail),
            TraceState::Unflipped => {
                self.trace_flip(id)?;
                Ok(false)
            }
            TraceState::Flipped => {
                let rate = self.trace(id).unwrap().rate;
                let done = self.trace_run(id, rate)?;
                if done {
                    self.trace_mut(id).unwrap().state = TraceState::Reclaim;
                }
                Ok(false)
            }
            TraceState::Reclaim => {
                self.trace_reclaim(id)?;
                Ok(true)
            }
            TraceState::Finished => Ok(true),
        }
    }

    /// `TraceAdvance` with no step limit: run the trace to completion.
    pub fn trace_expedite(&mut self, id: TraceId) -> Result<()> {
        loop {
            if self.trace_step(id)? {
                return Ok(());
            }
        }
    }

    pub fn trace_destroy(&mut self, id: TraceId) {
        self.traces[id.index()] = None;
        self.busy_traces = self.busy_traces.remove(id);
        self.flipped_traces = self.flipped_traces.remove(id);
    }
}

/// Scan one root's references. Takes a raw `*mut Arena` detour because a
/// root lives inside `arena.roots` while `ScanState` needs `&mut Arena` to
/// dispatch fixes -- the same self-referential shape `Segment`'s
/// nailboard and `ArenaHandle` already resolve with a raw pointer.
fn scan_root(arena: &mut Arena, id: RootId, traces: TraceSet, white: RefSet) -> Result<()> {
    let root_ptr: *mut Root = arena.roots.get_mut(id.0).expect("dangling RootId");
    let rank = unsafe { (*root_ptr).rank };
    let mut ss = ScanState::new(arena, traces, rank, white);
    unsafe { (*root_ptr).scan(&mut ss) }?;
    let summary = ss.summary();
    unsafe { (*root_ptr).summary = summary };
    Ok(())
}
