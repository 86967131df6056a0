//! Roots: client-supplied "here is something extra to scan" registrations.
//!
//! Modeled as several distinct shapes (plain area, tagged area, table,
//! formatted area, thread stack) rather than a single closure type, since
//! each shape needs different scan logic over raw memory.

use crate::addr::Addr;
use crate::error::Result;
use crate::format::Format;
use crate::refset::RefSet;
use crate::scan::ScanState;
use crate::types::Rank;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RootId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RootMode {
    /// The normal case: the arena may protect (and re-fix through) this
    /// root's memory across a trace.
    Protectable,
    /// The root's memory is never placed under a write barrier -- the
    /// client promises to re-scan it on every poll.
    NeverProtected,
}

pub enum RootKind {
    /// A flat array of exact references, read as `usize`-wide slots.
    Area { base: Addr, limit: Addr },
    /// As `Area`, but only slots whose bit pattern matches `pattern` under
    /// `mask` are references; others are left untouched (tagged unions,
    /// small-int-inline schemes).
    TaggedArea { base: Addr, limit: Addr, mask: usize, pattern: usize },
    /// A fixed, client-owned table of reference slots, identified by
    /// pointer and length rather than an address range (the table need
    /// not live inside a managed segment).
    Table { slots: *mut Addr, len: usize },
    /// An area scanned through a format's own `scan` callback, for roots
    /// that hold formatted objects rather than bare reference arrays.
    Formatted { base: Addr, limit: Addr, format: Arc<dyn Format> },
    /// A thread's stack: scanned ambiguously, word by word, since a
    /// stack's exact layout is not generally knowable.
    Thread { stack_base: Addr, stack_limit: Addr },
}

pub struct Root {
    pub id: RootId,
    pub rank: Rank,
    pub mode: RootMode,
    pub summary: RefSet,
    pub kind: RootKind,
}

impl Root {
    pub fn new(id: RootId, rank: Rank, mode: RootMode, kind: RootKind) -> Self {
        Root { id, rank, mode, summary: RefSet::EMPTY, kind }
    }

    /// Scan this root's references through `ss`, updating `self.summary`
    /// from the scan state's resulting summary so later "is this root
    /// worth rescanning" checks can consult `summary` without a full
    /// rescan, the same way segments carry one.
    pub fn scan(&mut self, ss: &mut ScanState) -> Result<()> {
        match &self.kind {
            RootKind::Area { base, limit } => {
                let slots = unsafe { area_as_slots(*base, *limit) };
                ss.scan_area(slots)?;
            }
            RootKind::TaggedArea { base, limit, mask, pattern } => {
                let slots = unsafe { area_as_slots(*base, *limit) };
                for slot in slots.iter_mut() {
                    if slot.0 & mask == *pattern {
                        ss.fix(slot)?;
                    }
                }
            }
            RootKind::Table { slots, len } => {
                let slice = unsafe { std::slice::from_raw_parts_mut(*slots, *len) };
                ss.scan_area(slice)?;
            }
            RootKind::Formatted { base, limit, format } => {
                format.scan(ss, *base, *limit)?;
            }
            RootKind::Thread { stack_base, stack_limit } => {
                let slots = unsafe { area_as_slots(*stack_base, *stack_limit) };
                ss.scan_area(slots)?;
            }
        }
        self.summary = ss.summary();
        Ok(())
    }
}

/// View `[base, limit)` as a mutable slice of `Addr`-sized slots. Callers
/// must guarantee the range is live, writable, and word-aligned -- true
/// for every `RootKind` variant that constructs one, since each is either
/// a mapped segment's memory or a client-registered buffer.
unsafe fn area_as_slots<'a>(base: Addr, limit: Addr) -> &'a mut [Addr] {
    let len = (limit.0 - base.0) / std::mem::size_of::<Addr>();
    std::slice::from_raw_parts_mut(base.0 as *mut Addr, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_area_respects_mask_and_pattern() {
        // Build a small backing buffer: two tagged ints (low bit set) and
        // one real pointer-shaped slot (low bit clear).
        let mut buf: [Addr; 3] = [Addr(0x11), Addr(0x21), Addr(0x1000)];
        let base = Addr(buf.as_mut_ptr() as usize);
        let limit = Addr(base.0 + buf.len() * std::mem::size_of::<Addr>());
        let kind = RootKind::TaggedArea { base, limit, mask: 1, pattern: 0 };
        match &kind {
            RootKind::TaggedArea { mask, pattern, .. } => {
                assert_eq!(buf[0].0 & mask, 1);
                assert_ne!(buf[0].0 & mask, *pattern);
                assert_eq!(buf[2].0 & mask, *pattern);
            }
            _ => unreachable!(),
        }
    }
}
