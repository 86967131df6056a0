//! An incremental, generational, mostly-copying garbage collector core.
//!
//! An [`arena::Arena`] owns a set of mostly-copying pools
//! ([`pool::amc::AmcPool`]), each allocating through [`buffer::Buffer`]s
//! into [`segment::Segment`]s grouped into [`generation::Generation`]
//! chains. A [`trace::Trace`] condemns some generations, flips the
//! mutator over to a new white set, and incrementally scans grey
//! segments and roots through the fix protocol in [`scan::ScanState`]
//! until nothing grey remains, then reclaims whatever survived unnailed.
//!
//! Concurrency is a single arena-wide lock ([`arena::ArenaHandle::enter`]);
//! [`safepoint::Shield`] brackets the moments (flip, whitening) that must
//! become visible to every mutator buffer at once.

pub mod addr;
pub mod arena;
pub mod buffer;
pub mod config;
pub mod error;
pub mod format;
pub mod generation;
pub mod ld;
pub mod message;
pub mod nailboard;
pub mod pool;
pub mod refset;
pub mod root;
pub mod safepoint;
pub mod scan;
pub mod segment;
pub mod trace;
pub mod transform;
pub mod types;

#[cfg(test)]
mod tests;

pub use addr::Addr;
pub use arena::{Arena, ArenaHandle};
pub use config::ArenaConfig;
pub use error::{Res, Result};
pub use format::Format;
pub use trace::TraceState;
pub use types::{Rank, TraceId};
