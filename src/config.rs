//! Arena-wide tuning knobs, folded into a plain struct built once at arena
//! creation rather than decoded from variable-argument class parameters.

#[derive(Clone, Debug)]
pub struct ArenaConfig {
    /// Fraction of committed memory held idle, in `0.0..=1.0`.
    pub spare: f64,
    /// Soft cap on total bytes committed from the OS.
    pub commit_limit: usize,
    /// Soft real-time budget, in milliseconds, for a trace to finish once
    /// started; used to compute the poll `rate`.
    pub pause_time_ms: f64,
    /// Default generation chain used by pools that don't specify their own.
    pub chain: ChainConfig,
    /// Whether interior pointers pin their referent (default true).
    pub interior: bool,
    /// Segment growth increment for AMC pools lacking a more specific size.
    pub extend_by: usize,
    /// Minimum allocation size treated as a "large object".
    pub large_size: usize,
    /// Bit shift used to carve `Addr` space into `RefSet` zones.
    pub zone_shift: u32,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            spare: 0.25,
            commit_limit: usize::MAX,
            pause_time_ms: 10.0,
            chain: ChainConfig::default(),
            interior: true,
            extend_by: 1024 * 1024,
            large_size: 128 * 1024,
            zone_shift: 12,
        }
    }
}

impl ArenaConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..=1.0).contains(&self.spare) {
            return Err(crate::error::Res::Param);
        }
        if self.chain.generations.is_empty() {
            return Err(crate::error::Res::Param);
        }
        Ok(())
    }

    /// Computing this as a ratio against `committed` divides by zero right
    /// after arena creation; clamp to the full `commit_limit` in that case
    /// rather than leaving the ratio undefined.
    pub fn spare_commit_limit(&self, committed: usize) -> usize {
        if committed == 0 {
            return self.commit_limit;
        }
        let ratio = (self.spare * committed as f64).min(self.commit_limit as f64);
        ratio.max(0.0) as usize
    }
}

/// One generation's capacity/mortality parameters in a chain. The terminal
/// entry is implicitly dynamic: its forwarding buffer targets itself
/// regardless of `mortality`.
#[derive(Clone, Copy, Debug)]
pub struct GenParams {
    pub capacity: usize,
    pub mortality: f64,
}

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub generations: Vec<GenParams>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            generations: vec![
                GenParams { capacity: 1024 * 1024, mortality: 0.9 },
                GenParams { capacity: 8 * 1024 * 1024, mortality: 0.5 },
            ],
        }
    }
}
