//! Arena core: the top-level handle owning every pool, segment, generation,
//! buffer, root, and trace.
//!
//! Everything is owned by stable index rather than by reference, and all
//! mutation happens behind a single lock exposed as one entry point.

use std::cell::UnsafeCell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::addr::Addr;
use crate::buffer::Buffer;
use crate::config::ArenaConfig;
use crate::error::{Res, Result};
use crate::generation::Generation;
use crate::ld::LdTable;
use crate::message::MessageQueue;
use crate::pool::amc::AmcPool;
use crate::root::{Root, RootId};
use crate::safepoint::Shield;
use crate::segment::Segment;
use crate::trace::Trace;
use crate::transform::Transform;
use crate::types::{BufferId, GenId, PoolId, SegId, Slab, TraceId, TraceSet, TRACE_MAX};

pub struct Arena {
    pub config: ArenaConfig,
    pub pools: Slab<AmcPool>,
    pub segments: Slab<Segment>,
    pub generations: Slab<Generation>,
    pub buffers: Slab<Buffer>,
    pub roots: Slab<Root>,
    pub traces: [Option<Trace>; TRACE_MAX],
    pub busy_traces: TraceSet,
    pub flipped_traces: TraceSet,
    pub messages: MessageQueue,
    pub ld: LdTable,
    pub transforms: Vec<Transform>,
    pub shield: Shield,
    pub committed: usize,
}

impl Arena {
    fn new(config: ArenaConfig) -> Self {
        Arena {
            config,
            pools: Slab::new(),
            segments: Slab::new(),
            generations: Slab::new(),
            buffers: Slab::new(),
            roots: Slab::new(),
            traces: Default::default(),
            busy_traces: TraceSet::EMPTY,
            flipped_traces: TraceSet::EMPTY,
            messages: MessageQueue::new(),
            ld: LdTable::new(),
            transforms: Vec::new(),
            shield: Shield::new(),
            committed: 0,
        }
    }

    // -- stable-index accessors -------------------------------------------------

    pub fn segment(&self, id: SegId) -> &Segment {
        self.segments.get(id.0).expect("dangling SegId")
    }
    pub fn segment_mut(&mut self, id: SegId) -> &mut Segment {
        self.segments.get_mut(id.0).expect("dangling SegId")
    }
    pub fn pool(&self, id: PoolId) -> &AmcPool {
        self.pools.get(id.0).expect("dangling PoolId")
    }
    pub fn pool_mut(&mut self, id: PoolId) -> &mut AmcPool {
        self.pools.get_mut(id.0).expect("dangling PoolId")
    }
    pub fn generation(&self, id: GenId) -> &Generation {
        self.generations.get(id.0).expect("dangling GenId")
    }
    pub fn generation_mut(&mut self, id: GenId) -> &mut Generation {
        self.generations.get_mut(id.0).expect("dangling GenId")
    }
    pub fn buffer(&self, id: BufferId) -> &Buffer {
        self.buffers.get(id.0).expect("dangling BufferId")
    }
    pub fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        self.buffers.get_mut(id.0).expect("dangling BufferId")
    }
    pub fn trace(&self, id: TraceId) -> Option<&Trace> {
        self.traces[id.index()].as_ref()
    }
    pub fn trace_mut(&mut self, id: TraceId) -> Option<&mut Trace> {
        self.traces[id.index()].as_mut()
    }

    /// Find the segment containing `addr`, if any. A linear scan: this
    /// crate targets embedding scale (hundreds to low thousands of
    /// segments), not a process-wide interval tree.
    pub fn seg_of(&self, addr: Addr) -> Option<SegId> {
        self.segments.iter().find(|(_, seg)| seg.contains(addr)).map(|(i, _)| SegId(i))
    }

    pub fn pool_of(&self, addr: Addr) -> Option<PoolId> {
        self.seg_of(addr).map(|s| self.segment(s).pool)
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn create(config: ArenaConfig) -> Result<ArenaHandle> {
        config.validate()?;
        log::debug!("arena created: commit_limit={}, zone_shift={}", config.commit_limit, config.zone_shift);
        Ok(ArenaHandle::new(Arena::new(config)))
    }

    pub fn extend(&mut self, _base: Addr, _size: usize) -> Result<()> {
        // Segments are self-contained anonymous mappings; there is no
        // address-space reservation to extend. Kept as a no-op for callers
        // that follow the external-interface contract.
        Ok(())
    }

    pub fn new_pool_id(&mut self, pool: AmcPool) -> PoolId {
        let slot = self.pools.insert(pool);
        self.pools.get_mut(slot).unwrap().id = PoolId(slot);
        PoolId(slot)
    }

    pub fn new_generation(&mut self, gen: Generation) -> GenId {
        let slot = self.generations.insert(gen);
        self.generations.get_mut(slot).unwrap().id = GenId(slot);
        GenId(slot)
    }

    pub fn new_buffer(&mut self, buf: Buffer) -> BufferId {
        let slot = self.buffers.insert(buf);
        self.buffers.get_mut(slot).unwrap().id = BufferId(slot);
        BufferId(slot)
    }

    pub fn new_segment(&mut self, pool: PoolId, size: usize) -> SegId {
        let seg = Segment::new(SegId(0), pool, size);
        let slot = self.segments.insert(seg);
        self.segments.get_mut(slot).unwrap().id = SegId(slot);
        self.committed += size;
        SegId(slot)
    }

    pub fn free_segment(&mut self, id: SegId) {
        if let Some(seg) = self.segments.remove(id.0) {
            self.committed = self.committed.saturating_sub(seg.size());
        }
    }

    pub fn new_root(&mut self, root: Root) -> RootId {
        RootId(self.roots.insert(root))
    }

    pub fn committed(&self) -> usize {
        self.committed
    }
}

/// Shared, lock-guarded handle to an `Arena`. A `ReentrantMutex` so that
/// read-only queries issued from inside an already-held `enter` can recurse
/// without deadlocking.
pub struct ArenaHandle {
    inner: Arc<UnsafeCell<Arena>>,
    lock: Arc<ReentrantMutex<()>>,
}

unsafe impl Send for ArenaHandle {}
unsafe impl Sync for ArenaHandle {}

impl Clone for ArenaHandle {
    fn clone(&self) -> Self {
        // Every clone must serialise through the same lock as the original
        // -- share the `Arc` rather than constructing a fresh mutex, or two
        // clones could both enter at once and hand out aliasing `&mut
        // Arena`s.
        ArenaHandle { inner: self.inner.clone(), lock: self.lock.clone() }
    }
}

impl ArenaHandle {
    fn new(arena: Arena) -> Self {
        ArenaHandle { inner: Arc::new(UnsafeCell::new(arena)), lock: Arc::new(ReentrantMutex::new(())) }
    }

    /// `Enter`: acquire the arena lock and run `f` with exclusive (mutable)
    /// access. Reentrant on the same thread, matching §5's stated
    /// exception for whitelisted recursive read-only queries -- callers are
    /// responsible for only recursing into `enter`/`query` from inside a
    /// pool/format callback, never from another thread.
    pub fn enter<R>(&self, f: impl FnOnce(&mut Arena) -> R) -> R {
        let _guard = self.lock.lock();
        f(unsafe { &mut *self.inner.get() })
    }

    /// `Leave` is implicit: the closure passed to `enter` returning drops
    /// the guard.
    ///
    /// A read-only recursive query, safe to call from within a callback
    /// that itself holds the lock (e.g. address-to-pool during a format
    /// scan callback).
    pub fn query<R>(&self, f: impl FnOnce(&Arena) -> R) -> R {
        let _guard = self.lock.lock();
        f(unsafe { &*self.inner.get() })
    }
}

pub fn res_if(cond: bool, err: Res) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(err)
    }
}
