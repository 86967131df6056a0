//! Allocation points / buffers.
//!
//! A bump region `[base, init, alloc, limit)` with `init == alloc` between
//! commits. Mutator buffers and pool-internal forwarding buffers share this
//! one implementation, addressed by `BufferId` rather than owned per-thread.

use atomic::{Atomic, Ordering};

use crate::types::{BufferId, GenId, PoolId, SegId};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferKind {
    /// A mutator-owned allocation point.
    Mutator,
    /// A pool-internal forwarding buffer targeting generation `gen`.
    Forwarding { gen: GenId },
}

/// Outcome of `Buffer::reserve`.
pub enum Reserve {
    Ok(usize),
    NeedsFill,
}

pub struct Buffer {
    pub id: BufferId,
    pub pool: PoolId,
    pub kind: BufferKind,
    pub seg: Option<SegId>,
    /// Base address of the attached segment's usable range, as a raw word.
    base: Atomic<usize>,
    /// High-water mark of bytes the mutator has told the collector are
    /// initialised (`Commit`'s effect).
    init: Atomic<usize>,
    /// Current bump cursor (`Reserve`'s effect).
    alloc: Atomic<usize>,
    /// One-past-the-end of the committed range. Set to zero by `trip` to
    /// signal "a flip happened since your last reserve".
    limit: Atomic<usize>,
}

impl Buffer {
    pub fn new(id: BufferId, pool: PoolId, kind: BufferKind) -> Self {
        Buffer {
            id,
            pool,
            kind,
            seg: None,
            base: Atomic::new(0),
            init: Atomic::new(0),
            alloc: Atomic::new(0),
            limit: Atomic::new(0),
        }
    }

    pub fn base(&self) -> usize {
        self.base.load(Ordering::Acquire)
    }
    pub fn init(&self) -> usize {
        self.init.load(Ordering::Acquire)
    }
    pub fn alloc(&self) -> usize {
        self.alloc.load(Ordering::Acquire)
    }
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Attach `[base, limit)` as fresh, empty space (invariant `init ==
    /// alloc == base` immediately after attach).
    pub fn attach(&mut self, seg: SegId, base: usize, limit: usize) {
        self.seg = Some(seg);
        self.base.store(base, Ordering::Release);
        self.init.store(base, Ordering::Release);
        self.alloc.store(base, Ordering::Release);
        self.limit.store(limit, Ordering::Release);
    }

    pub fn set_seg(&mut self, seg: Option<SegId>) {
        self.seg = seg;
    }

    /// `Reserve(size)`: bump `alloc` if there is room, else signal the
    /// caller to `Fill`.
    pub fn reserve(&self, size: usize) -> Reserve {
        let limit = self.limit.load(Ordering::Acquire);
        if limit == 0 {
            return Reserve::NeedsFill;
        }
        let alloc = self.alloc.load(Ordering::Acquire);
        match alloc.checked_add(size) {
            Some(new_alloc) if new_alloc <= limit => {
                self.alloc.store(new_alloc, Ordering::Release);
                Reserve::Ok(alloc)
            }
            _ => Reserve::NeedsFill,
        }
    }

    /// `Commit(p, size)`: advance `init` by `size`. Returns `false` if the
    /// buffer was tripped between the matching `reserve` and this call,
    /// meaning the caller must discard the partially-initialised object and
    /// retry from the top.
    pub fn commit(&self, size: usize) -> bool {
        if self.limit.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.init.fetch_add(size, Ordering::AcqRel);
        true
    }

    /// Collector-side: trip the buffer so the next `reserve`/`commit` fails,
    /// forcing the mutator back through `Fill`. Called during flip under
    /// the shield's suspend/resume, which acts as the fence that makes this
    /// write visible to the mutator before it is resumed.
    pub fn trip(&self) {
        self.limit.store(0, Ordering::Release);
    }

    /// True if the buffer is between reserve and commit, i.e. straddling
    /// live allocation that a collector must not observe as black without
    /// accounting for the uncommitted tail.
    pub fn is_ahead_of_init(&self) -> bool {
        self.alloc.load(Ordering::Acquire) != self.init.load(Ordering::Acquire)
    }

    /// `Detach`: flush the buffer, leaving `[init, limit)` for the caller to
    /// pad, and mark the buffer empty.
    pub fn detach(&mut self) -> (usize, usize) {
        let init = self.init.load(Ordering::Acquire);
        let limit = self.limit.load(Ordering::Acquire);
        self.base.store(0, Ordering::Release);
        self.init.store(0, Ordering::Release);
        self.alloc.store(0, Ordering::Release);
        self.limit.store(0, Ordering::Release);
        self.seg = None;
        (init, limit)
    }

    pub fn is_reset(&self) -> bool {
        self.limit.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferId, PoolId};

    fn buf() -> Buffer {
        let mut b = Buffer::new(BufferId(0), PoolId(0), BufferKind::Mutator);
        b.attach(SegId(0), 0x1000, 0x2000);
        b
    }

    #[test]
    fn detach_clears_segment_and_reports_uncommitted_tail() {
        let mut b = buf();
        match b.reserve(16) {
            Reserve::Ok(_) => {}
            Reserve::NeedsFill => panic!(),
        }
        let (init, limit) = b.detach();
        assert_eq!(init, 0x1000);
        assert_eq!(limit, 0x2000);
        assert!(b.seg.is_none());
        assert!(b.is_reset());
    }

    #[test]
    fn reserve_commit_roundtrip() {
        let b = buf();
        match b.reserve(64) {
            Reserve::Ok(addr) => assert_eq!(addr, 0x1000),
            Reserve::NeedsFill => panic!("unexpected fill"),
        }
        assert!(b.commit(64));
        assert_eq!(b.init(), 0x1040);
        assert_eq!(b.alloc(), 0x1040);
    }

    #[test]
    fn exact_fit_succeeds_one_byte_over_triggers_fill() {
        let b = buf();
        match b.reserve(0x1000) {
            Reserve::Ok(_) => {}
            Reserve::NeedsFill => panic!("exact fit should not need fill"),
        }
        assert!(b.commit(0x1000));
        match b.reserve(1) {
            Reserve::NeedsFill => {}
            Reserve::Ok(_) => panic!("should have needed fill"),
        }
    }

    #[test]
    fn trip_between_reserve_and_commit_fails_commit() {
        let b = buf();
        let addr = match b.reserve(32) {
            Reserve::Ok(a) => a,
            Reserve::NeedsFill => panic!(),
        };
        assert_eq!(addr, 0x1000);
        b.trip();
        assert!(!b.commit(32));
    }
}
