//! Pool kinds.
//!
//! A single mostly-copying implementation rather than a full vtable of pool
//! classes; `AmcPool` lives directly under this module instead of behind a
//! trait object.

pub mod amc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AmcFlavor {
    /// Ordinary mostly-copying: objects may contain outgoing references.
    Amc,
    /// "AMCZ": a leaf variant for objects that hold no references at all,
    /// so scanning is skipped entirely.
    AmcZ,
}

/// Ramp-mode state machine: a client can ask a pool to temporarily stop
/// promoting survivors into the next generation (e.g. while building a
/// large, short-lived structure), trading space for avoiding pointless
/// copying.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RampState {
    Outside,
    /// Ramp requested; takes effect at the next collection of this pool's
    /// top generation.
    Begin,
    /// Ramping: survivors of the top generation are retained in place
    /// rather than promoted.
    Ramping,
    /// `ramp_finish` called while `Ramping`; the pool collects once more
    /// to flush the ramp before returning to `Outside`.
    Finish,
    /// A `ramp_finish` raced a collection that was already under way; one
    /// more collection is required before new ramps are accepted.
    CollectingFinish,
}
