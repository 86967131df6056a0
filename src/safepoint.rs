//! The shield: suspend/resume brackets around flip and whitening.
//!
//! This crate has no mutator threads of its own (mutators call in through
//! `ArenaHandle::enter`, which already serialises everything), so `Shield`
//! degenerates to a flag marking where concurrent mutators would otherwise
//! need to be stopped. `suspend`/`resume` is still a real acquire/release
//! pair so that the buffer trip in `Trace::flip` is visible to every
//! subsequent `enter` call.
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Shield {
    suspended: AtomicBool,
}

impl Shield {
    pub fn new() -> Self {
        Shield { suspended: AtomicBool::new(false) }
    }

    /// Bracket a flip or whitening pass. `f` runs with the shield "armed";
    /// the `Release`/`Acquire` pair around it is the fence that gives the
    /// buffer triple's cross-flip writes visibility to the next mutator.
    pub fn suspend_resume<R>(&self, f: impl FnOnce() -> R) -> R {
        self.suspended.store(true, Ordering::Release);
        let r = f();
        self.suspended.store(false, Ordering::Release);
        std::sync::atomic::fence(Ordering::SeqCst);
        r
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

impl Default for Shield {
    fn default() -> Self {
        Self::new()
    }
}
