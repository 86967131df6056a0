//! The mostly-copying pool.
//!
//! Whiten/scan/fix/reclaim over segments grouped into generations. The
//! copying step follows the usual semispace forwarding pattern: allocate in
//! the target, `copy_nonoverlapping`, then install a broken heart.

use std::sync::Arc;

use crate::addr::Addr;
use crate::arena::Arena;
use crate::buffer::{Buffer, BufferKind, Reserve};
use crate::error::{Res, Result};
use crate::format::Format;
use crate::generation::Generation;
use crate::pool::{AmcFlavor, RampState};
use crate::refset::RefSet;
use crate::scan::ScanState;
use crate::segment::Segment;
use crate::types::{BufferId, GenId, PoolId, Rank, SegId, TraceId};

pub struct AmcPool {
    pub id: PoolId,
    pub flavor: AmcFlavor,
    pub format: Arc<dyn Format>,
    /// Generations youngest-first; the last entry is its own `next`
    /// (`Generation::is_terminal`).
    pub chain: Vec<GenId>,
    pub segments: Vec<SegId>,
    pub large_size: usize,
    pub extend_by: usize,
    pub ramp: RampState,
}

impl AmcPool {
    pub fn new(
        id: PoolId,
        flavor: AmcFlavor,
        format: Arc<dyn Format>,
        chain: Vec<GenId>,
        large_size: usize,
        extend_by: usize,
    ) -> Self {
        AmcPool { id, flavor, format, chain, segments: Vec::new(), large_size, extend_by, ramp: RampState::Outside }
    }

    pub fn youngest(&self) -> GenId {
        *self.chain.first().expect("a chain must have at least one generation")
    }
}

/// Create a fresh segment for `pool`, sized to cover at least `min_size`,
/// and register it with both the arena and the pool.
fn grow(arena: &mut Arena, pool_id: PoolId, gen_id: GenId, min_size: usize) -> Result<SegId> {
    let extend_by = arena.pool(pool_id).extend_by;
    let size = min_size.max(extend_by);
    let align = arena.pool(pool_id).format.align();
    let size = crate::addr::size_align_up(size, align.max(4096));
    if arena.committed().saturating_add(size) > arena.config.commit_limit {
        return Err(Res::CommitLimit);
    }
    let seg_id = arena.new_segment(pool_id, size);
    arena.segment_mut(seg_id).amc.gen = Some(gen_id);
    arena.pool_mut(pool_id).segments.push(seg_id);
    arena.generation_mut(gen_id).stats.total_size += size;
    arena.generation_mut(gen_id).stats.free_size += size;
    log::trace!("pool {:?} grew generation {:?} by {} bytes ({:?})", pool_id, gen_id, size, seg_id);
    Ok(seg_id)
}

/// `BufferFill`: top up a mutator or forwarding buffer attached to
/// generation `gen_id`, growing the pool if no segment has room.
pub fn fill(arena: &mut Arena, pool_id: PoolId, buffer_id: BufferId, gen_id: GenId, min_size: usize) -> Result<()> {
    let old_seg = arena.buffer(buffer_id).seg;
    let (old_init, old_limit) = arena.buffer_mut(buffer_id).detach();
    if let Some(seg_id) = old_seg {
        arena.segment_mut(seg_id).buffer = None;
        arena.segment_mut(seg_id).amc.committed_limit = Some(Addr(old_init));
    }
    if old_limit > old_init {
        pad_tail(arena, pool_id, Addr(old_init), old_limit - old_init);
    }

    let seg_id = find_room(arena, pool_id, gen_id, min_size)
        .map(Ok)
        .unwrap_or_else(|| grow(arena, pool_id, gen_id, min_size))?;

    let seg = arena.segment(seg_id);
    let base = seg.base.0;
    let limit = seg.limit.0;
    arena.buffer_mut(buffer_id).attach(seg_id, base, limit);
    arena.segment_mut(seg_id).buffer = Some(buffer_id);
    arena.generation_mut(gen_id).stats.free_size =
        arena.generation_mut(gen_id).stats.free_size.saturating_sub(limit - base);
    arena.generation_mut(gen_id).stats.buffered_size += limit - base;
    arena.segment_mut(seg_id).amc.accounted_as_buffered = true;
    Ok(())
}

/// Find an existing, unattached, not-yet-condemned segment of `gen_id`
/// with at least `min_size` free at its end. This pool never reuses the
/// middle of a segment (objects are bump-allocated, never freed
/// individually), so "room" only ever means "a fresh segment".
fn find_room(_arena: &Arena, _pool_id: PoolId, _gen_id: GenId, _min_size: usize) -> Option<SegId> {
    None
}

fn pad_tail(arena: &mut Arena, pool_id: PoolId, addr: Addr, size: usize) {
    let format = arena.pool(pool_id).format.clone();
    format.pad(addr, size);
}

/// Allocate `size` bytes for generation `gen_id` directly, bypassing the
/// buffer protocol, for objects at or above the pool's `large_size`
/// threshold, so large objects get their own segment.
pub fn alloc_large(arena: &mut Arena, pool_id: PoolId, gen_id: GenId, size: usize) -> Result<Addr> {
    let seg_id = grow(arena, pool_id, gen_id, size)?;
    let base = arena.segment(seg_id).base;
    arena.segment_mut(seg_id).amc.committed_limit = Some(base + size);
    arena.generation_mut(gen_id).stats.free_size =
        arena.generation_mut(gen_id).stats.free_size.saturating_sub(size);
    arena.generation_mut(gen_id).stats.old_size += size;
    Ok(base)
}

/// `Reserve`/`Commit` through a buffer, filling it (possibly growing the
/// pool) on demand. Mirrors the allocation point protocol in `buffer.rs`,
/// driven from the pool side.
pub fn alloc_via_buffer(
    arena: &mut Arena,
    pool_id: PoolId,
    buffer_id: BufferId,
    gen_id: GenId,
    size: usize,
) -> Result<Addr> {
    loop {
        match arena.buffer(buffer_id).reserve(size) {
            Reserve::Ok(addr) => {
                if !arena.buffer(buffer_id).commit(size) {
                    continue;
                }
                return Ok(Addr(addr));
            }
            Reserve::NeedsFill => {
                fill(arena, pool_id, buffer_id, gen_id, size)?;
            }
        }
    }
}

/// `AMCWhiten`: condemn every segment belonging to `gen_ids` for `trace`,
/// returning the union of their summaries (the trace's `white` set).
pub fn whiten(arena: &mut Arena, pool_id: PoolId, trace_id: TraceId, gen_ids: &[GenId]) -> RefSet {
    let zone_shift = arena.config.zone_shift;
    let seg_ids: Vec<SegId> = arena
        .pool(pool_id)
        .segments
        .iter()
        .copied()
        .filter(|s| arena.segment(*s).amc.gen.map_or(false, |g| gen_ids.contains(&g)))
        .collect();

    let mut white = RefSet::EMPTY;
    for seg_id in seg_ids {
        if let Some(buf_id) = arena.segment(seg_id).buffer {
            arena.buffer_mut(buf_id).trip();
        }
        let seg = arena.segment_mut(seg_id);
        seg.white = seg.white.add(trace_id);
        seg.nailed = seg.nailed.remove(trace_id);
        seg.amc.board = None;
        seg.amc.forwarded[trace_id.index()] = 0;
        seg.amc.scanned_to = None;
        seg.amc.committed_limit = None;
        white = white.union(seg.refset(zone_shift));
    }
    white
}

/// `AMCScan`: hand the segment's live range to its format's `scan`
/// callback, advancing a cursor Cheney-style. A segment with a still-
/// attached buffer may grow while being scanned (scanning can itself
/// forward objects into the same buffer); re-sampling the buffer's
/// `init` on every pass picks up that growth until the buffer stops
/// moving. A detached segment's valid range ends at `committed_limit`,
/// never at its raw mmap size, since the tail past that point was
/// reserved but never initialised.
pub fn scan(ss: &mut ScanState, seg_id: SegId) -> Result<()> {
    let pool_id = ss.arena.segment(seg_id).pool;
    let format = ss.arena.pool(pool_id).format.clone();
    loop {
        let seg = ss.arena.segment(seg_id);
        let cursor = seg.amc.scanned_to.unwrap_or(seg.base);
        let limit = match (seg.buffer, seg.amc.committed_limit) {
            (Some(buf_id), _) => Addr(ss.arena.buffer(buf_id).init()),
            (None, Some(committed)) => committed,
            (None, None) => seg.limit,
        };
        if cursor.0 >= limit.0 {
            break;
        }
        ss.counters.scanned_size += limit - cursor;
        format.scan(ss, cursor, limit)?;
        ss.arena.segment_mut(seg_id).amc.scanned_to = Some(limit);
    }
    Ok(())
}

/// Walk from a segment's base to find the object containing `addr`.
/// Exact references are already object bases and skip the walk; only
/// ambiguous references can land mid-object.
fn find_object_base(arena: &Arena, seg_id: SegId, addr: Addr, rank: Rank, format: &dyn Format) -> Addr {
    if rank != Rank::Ambig {
        return addr;
    }
    let seg = arena.segment(seg_id);
    let mut cur = seg.base;
    while cur.0 < seg.limit.0 {
        let next = format.skip(cur);
        if next.0 > addr.0 {
            return cur;
        }
        cur = next;
    }
    addr
}

/// Record a nail on `base` and grey the segment so the pinned object's own
/// outgoing references still get scanned -- skipped for AMCZ pools, whose
/// objects hold no references at all.
fn nail(arena: &mut Arena, seg_id: SegId, trace_id: TraceId, base: Addr, align: usize) {
    let seg = arena.segment_mut(seg_id);
    seg.nailed = seg.nailed.add(trace_id);
    match seg.amc.board.as_ref() {
        Some(board) => {
            board.set(base);
        }
        None => {
            let seg_base = seg.base;
            let seg_limit = seg.limit;
            let board = crate::nailboard::Nailboard::new(seg_base, seg_limit, align);
            board.set(base);
            seg.amc.board = Some(board);
        }
    }

    let pool_id = arena.segment(seg_id).pool;
    if arena.pool(pool_id).flavor != AmcFlavor::AmcZ {
        arena.trace_grey_segment(trace_id, seg_id);
    }
}

/// Grey `seg_id` for every trace in `traces`, for non-AMCZ pools only.
fn grey_for_traces(arena: &mut Arena, seg_id: SegId, traces: crate::types::TraceSet) {
    let pool_id = arena.segment(seg_id).pool;
    if arena.pool(pool_id).flavor == AmcFlavor::AmcZ {
        return;
    }
    for trace_id in traces.iter() {
        arena.trace_grey_segment(trace_id, seg_id);
    }
}

/// `AMCFix`: the ordinary (allocating) fix path. Forward `base` into the
/// segment's generation if it has not already moved this trace; nail it
/// in place for an ambiguous reference instead of moving it.
pub fn fix(ss: &mut ScanState, seg_id: SegId, slot: &mut Addr) -> Result<()> {
    let pool_id = ss.arena.segment(seg_id).pool;
    let format = ss.arena.pool(pool_id).format.clone();
    let old = *slot;
    let base = find_object_base(ss.arena, seg_id, old, ss.rank, format.as_ref());

    // An ambiguous reference pins unconditionally: it runs before any
    // exact reference could have forwarded the same object (ambiguous
    // roots are scanned before exact ones), so there's nothing to check
    // against `isMoved` here -- and checking it first would risk writing
    // a freshly-forwarded address into a slot that must never move.
    if ss.rank == Rank::Ambig {
        let align = format.align();
        let trace_id = ss.traces.iter().next().unwrap_or(TraceId(0));
        nail(ss.arena, seg_id, trace_id, base, align);
        ss.counters.nail_count += 1;
        return Ok(());
    }

    let offset = old - base;

    if let Some(new_base) = format.is_moved(base) {
        *slot = new_base + offset;
        ss.counters.snap_count += 1;
        return Ok(());
    }

    // Some ambiguous reference already pinned this object in place: it
    // must not be moved out from under that reference, even though this
    // one is exact. Grey the segment for any trace newly nailing it and
    // leave the slot as-is.
    let nailed = ss.arena.segment(seg_id).nailed;
    if !nailed.is_empty() {
        let pinned = ss
            .arena
            .segment(seg_id)
            .amc
            .board
            .as_ref()
            .map_or(true, |board| board.get(base));
        if pinned {
            grey_for_traces(ss.arena, seg_id, ss.traces);
            ss.arena.segment_mut(seg_id).nailed = nailed.union(ss.traces);
            return Ok(());
        }
    }

    let gen_id = ss
        .arena
        .segment(seg_id)
        .amc
        .gen
        .expect("a condemned segment always belongs to a generation");
    let next_gen = ss.arena.generation(gen_id).next;
    let forward_buf = ss.arena.generation(gen_id).forward;
    let size = format.skip(base) - base;

    let new_base = alloc_via_buffer(ss.arena, pool_id, forward_buf, next_gen, size)?;
    unsafe {
        std::ptr::copy_nonoverlapping(base.as_ptr(), new_base.as_ptr(), size);
    }
    format.fwd(base, new_base);
    ss.counters.forward_count += 1;
    ss.counters.copied_size += size;
    ss.arena.generation_mut(gen_id).survived += size;

    // Moving an object from one segment to another carries its
    // references with it: union the source segment's summary into the
    // destination's so a later flip still finds the destination grey.
    if let Some(to_seg) = ss.arena.seg_of(new_base) {
        let src_summary = ss.arena.segment(seg_id).summary;
        let to_seg_mut = ss.arena.segment_mut(to_seg);
        to_seg_mut.summary = to_seg_mut.summary.union(src_summary);
    }

    *slot = new_base + offset;
    Ok(())
}

/// `AMCFixEmergency`: the non-allocating fallback used once the arena has
/// already failed one allocation mid-trace. Never grows the pool; pins
/// everything it would otherwise move.
pub fn fix_emergency(ss: &mut ScanState, seg_id: SegId, slot: &mut Addr) -> Result<()> {
    let pool_id = ss.arena.segment(seg_id).pool;
    let format = ss.arena.pool(pool_id).format.clone();
    let old = *slot;
    let base = find_object_base(ss.arena, seg_id, old, ss.rank, format.as_ref());

    if ss.rank == Rank::Ambig {
        let align = format.align();
        let trace_id = ss.traces.iter().next().unwrap_or(TraceId(0));
        nail(ss.arena, seg_id, trace_id, base, align);
        ss.counters.nail_count += 1;
        return Ok(());
    }

    let offset = old - base;

    if let Some(new_base) = format.is_moved(base) {
        *slot = new_base + offset;
        ss.counters.snap_count += 1;
        return Ok(());
    }

    let align = format.align();
    let trace_id = ss.traces.iter().next().unwrap_or(TraceId(0));
    nail(ss.arena, seg_id, trace_id, base, align);
    ss.counters.nail_count += 1;
    Ok(())
}

/// Fix a weak reference: never forwards, never nails, never allocates.
/// If the referent already moved (some exact reference got to it first),
/// snap the slot to the new location; otherwise the referent didn't
/// survive and the slot is cleared.
pub fn fix_weak(ss: &mut ScanState, seg_id: SegId, slot: &mut Addr) -> Result<()> {
    let pool_id = ss.arena.segment(seg_id).pool;
    let format = ss.arena.pool(pool_id).format.clone();
    let old = *slot;
    let base = find_object_base(ss.arena, seg_id, old, ss.rank, format.as_ref());
    let offset = old - base;

    match format.is_moved(base) {
        Some(new_base) => {
            *slot = new_base + offset;
            ss.counters.snap_count += 1;
        }
        None => {
            *slot = Addr::NULL;
        }
    }
    Ok(())
}

/// `AMCReclaim`: free every segment this trace condemned that survived
/// nailed-free, i.e. with no live reference pinning it in place; retire
/// the rest in place as "old".
pub fn reclaim(arena: &mut Arena, pool_id: PoolId, trace_id: TraceId) -> Result<()> {
    let seg_ids: Vec<SegId> = arena.pool(pool_id).segments.clone();
    let mut freed = Vec::new();
    for seg_id in seg_ids {
        let seg = arena.segment(seg_id);
        if !seg.white.contains(trace_id) {
            continue;
        }
        let nailed = seg.nailed.contains(trace_id);
        let gen_id = seg.amc.gen;
        let size = seg.size();
        if nailed {
            let seg = arena.segment_mut(seg_id);
            seg.white = seg.white.remove(trace_id);
            seg.nailed = seg.nailed.remove(trace_id);
            seg.amc.old = true;
            // Once the last trace holding a nail on this segment releases
            // it, the nailboard's bits are meaningless to any future trace
            // that might reuse this `TraceId` -- drop it rather than leave
            // stale pin state behind.
            if seg.nailed.is_empty() {
                seg.amc.board = None;
            }
            if let Some(g) = gen_id {
                arena.generation_mut(g).stats.old_size += size;
            }
        } else {
            if let Some(g) = gen_id {
                let stats = &mut arena.generation_mut(g).stats;
                stats.total_size = stats.total_size.saturating_sub(size);
                if arena.segment(seg_id).amc.accounted_as_buffered {
                    stats.buffered_size = stats.buffered_size.saturating_sub(size);
                } else {
                    stats.free_size = stats.free_size.saturating_sub(size);
                }
            }
            freed.push(seg_id);
        }
    }
    for seg_id in freed {
        arena.pool_mut(pool_id).segments.retain(|s| *s != seg_id);
        arena.free_segment(seg_id);
    }
    Ok(())
}

/// `AMCRampBegin`: enter ramp mode for this pool, deferring promotion of
/// the youngest generation's survivors.
pub fn ramp_begin(arena: &mut Arena, pool_id: PoolId) -> Result<()> {
    let pool = arena.pool_mut(pool_id);
    match pool.ramp {
        RampState::Outside => {
            pool.ramp = RampState::Begin;
            Ok(())
        }
        _ => Err(Res::Fail),
    }
}

/// `AMCRampFinish`: request a return to normal promotion; takes effect
/// after the pool's next collection flushes the ramp.
pub fn ramp_finish(arena: &mut Arena, pool_id: PoolId) -> Result<()> {
    let pool = arena.pool_mut(pool_id);
    pool.ramp = match pool.ramp {
        RampState::Begin | RampState::Outside => RampState::Outside,
        RampState::Ramping => RampState::Finish,
        RampState::Finish | RampState::CollectingFinish => RampState::CollectingFinish,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::generation::{Generation, PoolGenStats};
    use crate::types::BufferId;

    struct WordFormat;

    impl Format for WordFormat {
        fn align(&self) -> usize {
            16
        }
        fn scan(&self, ss: &mut ScanState, base: Addr, limit: Addr) -> Result<()> {
            let mut cur = base;
            while cur.0 < limit.0 {
                let slot = unsafe { &mut *(cur.0 as *mut Addr) };
                ss.fix(slot)?;
                cur = cur + self.align();
            }
            Ok(())
        }
        fn skip(&self, obj: Addr) -> Addr {
            obj + self.align()
        }
        fn is_moved(&self, obj: Addr) -> Option<Addr> {
            let tag = unsafe { *(obj.0 as *const usize) };
            if tag == usize::MAX {
                Some(Addr(unsafe { *((obj.0 + 8) as *const usize) }))
            } else {
                None
            }
        }
        fn fwd(&self, old: Addr, new: Addr) {
            unsafe {
                *(old.0 as *mut usize) = usize::MAX;
                *((old.0 + 8) as *mut usize) = new.0;
            }
        }
        fn pad(&self, addr: Addr, size: usize) {
            unsafe {
                std::ptr::write_bytes(addr.0 as *mut u8, 0, size);
            }
        }
    }

    fn setup() -> (crate::arena::ArenaHandle, PoolId, GenId, BufferId) {
        let handle = Arena::create(ArenaConfig::default()).unwrap();
        let (pool_id, gen_id, buf_id) = handle.enter(|arena| {
            let gen_id = arena.new_generation(Generation {
                id: GenId(0),
                stats: PoolGenStats::default(),
                capacity: 1 << 20,
                mortality: 0.5,
                forward: BufferId(0),
                next: GenId(0),
                survived: 0,
                condemned: 0,
            });
            arena.generation_mut(gen_id).next = gen_id;

            let pool_id = arena.new_pool_id(AmcPool::new(
                PoolId(0),
                AmcFlavor::Amc,
                Arc::new(WordFormat),
                vec![gen_id],
                1 << 16,
                1 << 16,
            ));
            arena.pool_mut(pool_id).id = pool_id;
            (pool_id, gen_id, BufferId(0))
        });
        let fwd_buf = handle.enter(|arena| {
            let buf = Buffer::new(BufferId(0), pool_id, BufferKind::Forwarding { gen: gen_id });
            let id = arena.new_buffer(buf);
            arena.generation_mut(gen_id).forward = id;
            id
        });
        (handle, pool_id, gen_id, fwd_buf)
    }

    #[test]
    fn alloc_large_tracks_generation_stats() {
        let (handle, pool_id, gen_id, _fwd) = setup();
        handle.enter(|arena| {
            let addr = alloc_large(arena, pool_id, gen_id, 4096).unwrap();
            assert!(!addr.is_null());
            assert!(arena.generation(gen_id).stats.old_size >= 4096);
        });
    }

    #[test]
    fn whiten_then_reclaim_frees_unnailed_segments() {
        let (handle, pool_id, gen_id, _fwd) = setup();
        let seg_id = handle.enter(|arena| {
            let seg_id = grow(arena, pool_id, gen_id, 4096).unwrap();
            seg_id
        });
        handle.enter(|arena| {
            let trace_id = TraceId(0);
            let summary = whiten(arena, pool_id, trace_id, &[gen_id]);
            assert!(!summary.is_empty() || arena.segment(seg_id).size() == 0);
            reclaim(arena, pool_id, trace_id).unwrap();
            assert!(arena.pool(pool_id).segments.is_empty());
        });
    }
}
