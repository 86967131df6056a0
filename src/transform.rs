//! Transforms: bulk old-to-new pointer rewrites applied across every root.
//!
//! A transform's job is "wherever the client still holds the old pointer,
//! replace it" rather than tracing reachability, so it walks the root set
//! directly instead of going through a trace.

use crate::addr::Addr;
use crate::arena::Arena;
use crate::error::Result;
use crate::types::Rank;
use std::collections::HashMap;

pub struct Transform {
    rewrites: HashMap<usize, Addr>,
    applied: bool,
}

impl Transform {
    pub fn create() -> Self {
        Transform { rewrites: HashMap::new(), applied: false }
    }

    pub fn add_old_new(&mut self, old: Addr, new: Addr) {
        debug_assert!(!self.applied, "cannot extend a transform that has already been applied");
        self.rewrites.insert(old.0, new);
    }

    /// Apply the rewrite to every `Rank::Exact` root the arena knows
    /// about. Returns whether at least one slot was actually rewritten,
    /// matching the "did this do anything" signal a client checks before
    /// deciding whether a follow-up fixup pass is needed.
    pub fn apply(&mut self, arena: &mut Arena) -> Result<bool> {
        let mut any = false;
        for (_, root) in arena.roots.iter_mut() {
            if root.rank != Rank::Exact {
                continue;
            }
            if rewrite_root(root, &self.rewrites) {
                any = true;
            }
        }
        self.applied = true;
        Ok(any)
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }
}

fn rewrite_root(root: &mut crate::root::Root, rewrites: &HashMap<usize, Addr>) -> bool {
    use crate::root::RootKind;
    let mut any = false;
    let mut visit = |slot: &mut Addr| {
        if let Some(new) = rewrites.get(&slot.0) {
            *slot = *new;
            any = true;
        }
    };
    match &mut root.kind {
        RootKind::Area { base, limit } | RootKind::Thread { stack_base: base, stack_limit: limit } => {
            let slots = unsafe { area_as_slots(*base, *limit) };
            slots.iter_mut().for_each(&mut visit);
        }
        RootKind::TaggedArea { base, limit, mask, pattern } => {
            let slots = unsafe { area_as_slots(*base, *limit) };
            for slot in slots.iter_mut() {
                if slot.0 & *mask == *pattern {
                    visit(slot);
                }
            }
        }
        RootKind::Table { slots, len } => {
            let slice = unsafe { std::slice::from_raw_parts_mut(*slots, *len) };
            slice.iter_mut().for_each(&mut visit);
        }
        RootKind::Formatted { .. } => {
            // Formatted roots are rewritten by the next ordinary trace
            // instead: a transform only targets bare reference slots it
            // can identify without invoking a format callback.
        }
    }
    any
}

unsafe fn area_as_slots<'a>(base: Addr, limit: Addr) -> &'a mut [Addr] {
    let len = (limit.0 - base.0) / std::mem::size_of::<Addr>();
    std::slice::from_raw_parts_mut(base.0 as *mut Addr, len)
}

impl Default for Transform {
    fn default() -> Self {
        Self::create()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::root::{Root, RootId, RootKind, RootMode};

    #[test]
    fn apply_rewrites_matching_slots_only() {
        let handle = Arena::create(ArenaConfig::default()).unwrap();
        let mut buf: [Addr; 2] = [Addr(0x10), Addr(0x20)];
        let base = Addr(buf.as_mut_ptr() as usize);
        let limit = Addr(base.0 + 2 * std::mem::size_of::<Addr>());

        handle.enter(|arena| {
            let root = Root::new(
                RootId(0),
                Rank::Exact,
                RootMode::Protectable,
                RootKind::Area { base, limit },
            );
            arena.new_root(root);

            let mut t = Transform::create();
            t.add_old_new(Addr(0x10), Addr(0xAA));
            let changed = t.apply(arena).unwrap();
            assert!(changed);
        });

        assert_eq!(buf[0], Addr(0xAA));
        assert_eq!(buf[1], Addr(0x20));
    }
}
