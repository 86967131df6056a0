//! End-to-end scenarios, scaled down to run in well under a second: a
//! two-generation AMC pool collecting a small heap of linked cons cells,
//! checking that reachable objects survive a collection with their
//! pointers correctly rewritten and unreachable ones are reclaimed.

use std::sync::Arc;

use crate::addr::Addr;
use crate::arena::{Arena, ArenaHandle};
use crate::buffer::{Buffer, BufferKind};
use crate::config::ArenaConfig;
use crate::error::Result;
use crate::format::Format;
use crate::generation::{Generation, PoolGenStats};
use crate::pool::amc::{self, AmcPool};
use crate::pool::AmcFlavor;
use crate::root::{Root, RootId, RootKind, RootMode};
use crate::scan::ScanState;
use crate::types::{BufferId, GenId, PoolId, Rank};

const CELL_SIZE: usize = 24; // tag + car + cdr, one word each
const FORWARDED: usize = usize::MAX;

/// A fixed-shape two-pointer cell: `[tag, car, cdr]`. `tag == FORWARDED`
/// means the slot at `car` holds the broken heart's destination.
struct ConsFormat;

impl Format for ConsFormat {
    fn align(&self) -> usize {
        8
    }

    fn scan(&self, ss: &mut ScanState, base: Addr, limit: Addr) -> Result<()> {
        let mut cur = base;
        while cur.0 < limit.0 {
            let car = unsafe { &mut *((cur.0 + 8) as *mut Addr) };
            ss.fix(car)?;
            let cdr = unsafe { &mut *((cur.0 + 16) as *mut Addr) };
            ss.fix(cdr)?;
            cur = self.skip(cur);
        }
        Ok(())
    }

    fn skip(&self, obj: Addr) -> Addr {
        obj + CELL_SIZE
    }

    fn is_moved(&self, obj: Addr) -> Option<Addr> {
        let tag = unsafe { *(obj.0 as *const usize) };
        if tag == FORWARDED {
            Some(unsafe { *((obj.0 + 8) as *const Addr) })
        } else {
            None
        }
    }

    fn fwd(&self, old: Addr, new: Addr) {
        unsafe {
            *(old.0 as *mut usize) = FORWARDED;
            *((old.0 + 8) as *mut Addr) = new;
        }
    }

    fn pad(&self, addr: Addr, size: usize) {
        unsafe {
            std::ptr::write_bytes(addr.0 as *mut u8, 0, size);
        }
    }
}

fn write_cell(addr: Addr, car: Addr, cdr: Addr) {
    unsafe {
        *(addr.0 as *mut usize) = 0;
        *((addr.0 + 8) as *mut Addr) = car;
        *((addr.0 + 16) as *mut Addr) = cdr;
    }
}

fn cell_car(addr: Addr) -> Addr {
    unsafe { *((addr.0 + 8) as *const Addr) }
}

fn cell_cdr(addr: Addr) -> Addr {
    unsafe { *((addr.0 + 16) as *const Addr) }
}

struct Harness {
    handle: ArenaHandle,
    pool: PoolId,
    young: GenId,
    old: GenId,
    mutator_buf: BufferId,
}

fn build_harness() -> Harness {
    let mut config = ArenaConfig::default();
    config.extend_by = 64 * CELL_SIZE;
    config.large_size = 1 << 20; // keep every cell on the buffer path
    let handle = Arena::create(config).unwrap();

    let (pool, young, old) = handle.enter(|arena| {
        let old = arena.new_generation(Generation {
            id: GenId(0),
            stats: PoolGenStats::default(),
            capacity: 1 << 20,
            mortality: 0.2,
            forward: BufferId(0),
            next: GenId(0),
            survived: 0,
            condemned: 0,
        });
        arena.generation_mut(old).next = old;

        let young = arena.new_generation(Generation {
            id: GenId(0),
            stats: PoolGenStats::default(),
            capacity: 64 * 1024,
            mortality: 0.9,
            forward: BufferId(0),
            next: old,
            survived: 0,
            condemned: 0,
        });

        let pool = arena.new_pool_id(AmcPool::new(
            PoolId(0),
            AmcFlavor::Amc,
            Arc::new(ConsFormat),
            vec![young, old],
            1 << 20,
            64 * CELL_SIZE,
        ));
        (pool, young, old)
    });

    let mutator_buf = handle.enter(|arena| {
        let buf = Buffer::new(BufferId(0), pool, BufferKind::Mutator);
        arena.new_buffer(buf)
    });
    let young_forward = handle.enter(|arena| {
        let buf = Buffer::new(BufferId(0), pool, BufferKind::Forwarding { gen: young });
        let id = arena.new_buffer(buf);
        arena.generation_mut(young).forward = id;
        id
    });
    let old_forward = handle.enter(|arena| {
        let buf = Buffer::new(BufferId(0), pool, BufferKind::Forwarding { gen: old });
        let id = arena.new_buffer(buf);
        arena.generation_mut(old).forward = id;
        id
    });
    let _ = (young_forward, old_forward);

    Harness { handle, pool, young, old, mutator_buf }
}

#[test]
fn reachable_list_survives_unreachable_cells_are_reclaimed() {
    let h = build_harness();

    // Build a 40-cell live list rooted in `head_storage`, interleaved with
    // 200 unreachable "garbage" cells to give the collector something to
    // actually reclaim.
    let mut head_storage = [Addr::NULL];
    let live_count = 40;
    let garbage_count = 200;

    h.handle.enter(|arena| {
        let mut head = Addr::NULL;
        for _ in 0..live_count {
            let cell = amc::alloc_via_buffer(arena, h.pool, h.mutator_buf, h.young, CELL_SIZE).unwrap();
            write_cell(cell, Addr::NULL, head);
            head = cell;
        }
        head_storage[0] = head;
        for _ in 0..garbage_count {
            let cell = amc::alloc_via_buffer(arena, h.pool, h.mutator_buf, h.young, CELL_SIZE).unwrap();
            write_cell(cell, Addr::NULL, Addr::NULL);
        }
    });

    let root_base = Addr(head_storage.as_mut_ptr() as usize);
    let committed_before = h.handle.query(|arena| arena.committed());

    let root_id = h.handle.enter(|arena| {
        let root = Root::new(
            RootId(0),
            Rank::Exact,
            RootMode::Protectable,
            RootKind::Table { slots: root_base.0 as *mut Addr, len: 1 },
        );
        arena.new_root(root)
    });

    h.handle.enter(|arena| {
        let trace = arena.trace_create("test collection").unwrap();
        arena.trace_condemn(trace, h.pool, vec![h.young]).unwrap();
        arena.trace_start(trace).unwrap();
        arena.trace_expedite(trace).unwrap();

        let mut count = 0;
        let mut cur = head_storage[0];
        while !cur.is_null() {
            count += 1;
            assert!(cell_car(cur).is_null());
            cur = cell_cdr(cur);
        }
        assert_eq!(count, live_count);

        let t = arena.trace(trace).unwrap();
        assert!(t.counters.forward_count >= live_count);
        assert_eq!(t.counters.forward_count, t.counters.copied_size / CELL_SIZE);
    });

    let committed_after = h.handle.query(|arena| arena.committed());
    assert!(
        committed_after < committed_before,
        "garbage cells should have let the young generation's segment be freed"
    );
    let _ = root_id;
}

#[test]
fn ambiguous_reference_pins_its_object_instead_of_moving_it() {
    let h = build_harness();

    // `pinned` holds a live outgoing reference to `tail`. If nailing
    // `pinned` didn't also grey its segment, `tail` would never get
    // scanned from `pinned`'s own pointer and would be reclaimed as
    // garbage despite being reachable through the pinned cell.
    let (pinned, tail) = h.handle.enter(|arena| {
        let tail = amc::alloc_via_buffer(arena, h.pool, h.mutator_buf, h.young, CELL_SIZE).unwrap();
        write_cell(tail, Addr::NULL, Addr::NULL);
        let pinned = amc::alloc_via_buffer(arena, h.pool, h.mutator_buf, h.young, CELL_SIZE).unwrap();
        write_cell(pinned, Addr::NULL, tail);
        (pinned, tail)
    });

    // An ambiguous root holding exactly one slot: a pointer straight at
    // the cell's base (no interior offset, to keep the assertion simple).
    let mut stack_slot = [pinned];
    let stack_base = Addr(stack_slot.as_mut_ptr() as usize);
    let stack_limit = stack_base + std::mem::size_of::<Addr>();

    h.handle.enter(|arena| {
        let root = Root::new(
            RootId(0),
            Rank::Ambig,
            RootMode::Protectable,
            RootKind::Thread { stack_base, stack_limit },
        );
        arena.new_root(root);

        let trace = arena.trace_create("pin test").unwrap();
        arena.trace_condemn(trace, h.pool, vec![h.young]).unwrap();
        arena.trace_start(trace).unwrap();
        arena.trace_expedite(trace).unwrap();

        // The ambiguous reference must be unchanged: the object was
        // nailed in place rather than copied.
        assert_eq!(stack_slot[0], pinned);

        // `tail` is only reachable by scanning `pinned`'s own slots, so
        // this only survives and forwards correctly if nailing `pinned`
        // also greyed its segment. `tail` itself wasn't pinned, so it
        // still moves; the pinned cell's slot must track the new location.
        let new_tail = cell_cdr(pinned);
        assert!(!new_tail.is_null(), "tail should have survived via the pinned cell's own reference");
        assert_ne!(new_tail, tail, "tail was not itself pinned, so it should have been forwarded");
        assert!(cell_car(new_tail).is_null());
        assert!(cell_cdr(new_tail).is_null());

        let t = arena.trace(trace).unwrap();
        assert!(t.counters.nail_count >= 1);
        assert!(t.counters.forward_count >= 1);
    });
}

#[test]
fn weak_reference_is_nulled_when_its_referent_does_not_survive() {
    let h = build_harness();

    // Two cells: `kept` is also reachable from an exact root, so it
    // survives and its weak slot should snap to the new location.
    // `unreachable` has nothing but the weak root pointing at it, so it
    // should be collected and the weak slot nulled.
    let (kept, unreachable) = h.handle.enter(|arena| {
        let kept = amc::alloc_via_buffer(arena, h.pool, h.mutator_buf, h.young, CELL_SIZE).unwrap();
        write_cell(kept, Addr::NULL, Addr::NULL);
        let unreachable =
            amc::alloc_via_buffer(arena, h.pool, h.mutator_buf, h.young, CELL_SIZE).unwrap();
        write_cell(unreachable, Addr::NULL, Addr::NULL);
        (kept, unreachable)
    });

    let mut exact_root_storage = [kept];
    let exact_base = Addr(exact_root_storage.as_mut_ptr() as usize);

    let mut weak_root_storage = [kept, unreachable];
    let weak_base = Addr(weak_root_storage.as_mut_ptr() as usize);

    h.handle.enter(|arena| {
        let exact_root = Root::new(
            RootId(0),
            Rank::Exact,
            RootMode::Protectable,
            RootKind::Table { slots: exact_base.0 as *mut Addr, len: 1 },
        );
        arena.new_root(exact_root);

        let weak_root = Root::new(
            RootId(1),
            Rank::Weak,
            RootMode::Protectable,
            RootKind::Table { slots: weak_base.0 as *mut Addr, len: 2 },
        );
        arena.new_root(weak_root);

        let trace = arena.trace_create("weak test").unwrap();
        arena.trace_condemn(trace, h.pool, vec![h.young]).unwrap();
        arena.trace_start(trace).unwrap();
        arena.trace_expedite(trace).unwrap();

        assert!(!weak_root_storage[0].is_null(), "the surviving cell's weak slot should snap, not null");
        assert_ne!(
            weak_root_storage[0], kept,
            "the surviving cell moved, so its weak slot should point at the new location"
        );
        assert!(
            weak_root_storage[1].is_null(),
            "the reclaimed cell's weak slot should be nulled rather than left dangling"
        );

        let t = arena.trace(trace).unwrap();
        assert!(t.counters.snap_count >= 1);
    });
}
