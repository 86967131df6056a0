//! Coarse zone summaries.
//!
//! The managed address space is partitioned into `ZONE_COUNT` zones by a
//! shift chosen at arena creation. A `RefSet` is a bitmap over zones: bit
//! *i* means "some address in this zone may be referenced/may live here".
//! Because it is a coarse over-approximation, union and intersection are
//! O(1) word operations, which is what lets the scan loop's fast filter
//! run inline.

pub type Zone = u32;

pub const ZONE_COUNT: u32 = 64;

/// Bitset over `[0, ZONE_COUNT)`, one bit per zone.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RefSet(pub u64);

impl RefSet {
    pub const EMPTY: RefSet = RefSet(0);
    pub const UNIV: RefSet = RefSet(u64::MAX);

    #[inline]
    pub fn single(zone: Zone) -> RefSet {
        debug_assert!(zone < ZONE_COUNT);
        RefSet(1u64 << zone)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn union(self, other: RefSet) -> RefSet {
        RefSet(self.0 | other.0)
    }

    #[inline]
    pub fn intersect(self, other: RefSet) -> RefSet {
        RefSet(self.0 & other.0)
    }

    #[inline]
    pub fn diff(self, other: RefSet) -> RefSet {
        RefSet(self.0 & !other.0)
    }

    #[inline]
    pub fn intersects(self, other: RefSet) -> bool {
        !self.intersect(other).is_empty()
    }

    /// True iff `self` is a superset of `other`: everything `other` claims,
    /// `self` also claims.
    #[inline]
    pub fn is_superset(self, other: RefSet) -> bool {
        self.intersect(other) == other
    }

    #[inline]
    pub fn is_subset(self, other: RefSet) -> bool {
        other.is_superset(self)
    }

    #[inline]
    pub fn add_zone(self, zone: Zone) -> RefSet {
        self.union(RefSet::single(zone))
    }

    #[inline]
    pub fn contains_zone(self, zone: Zone) -> bool {
        self.intersects(RefSet::single(zone))
    }
}

impl std::fmt::Debug for RefSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RefSet({:#018x})", self.0)
    }
}

/// Maps an address to its zone using the arena's configured shift.
#[inline]
pub fn zone_of(addr: crate::addr::Addr, zone_shift: u32) -> Zone {
    ((addr.0 >> zone_shift) as u32) & (ZONE_COUNT - 1)
}

/// `RefSetOfSeg`: the summary of every zone any address of `[base, limit)`
/// maps to. For most segments this is a contiguous run of zones; since
/// zones wrap at `ZONE_COUNT` a segment that straddles the wraparound point
/// claims the whole ring between its endpoints.
pub fn refset_of_range(base: crate::addr::Addr, limit: crate::addr::Addr, zone_shift: u32) -> RefSet {
    debug_assert!(limit.0 > base.0);
    let zone_size = 1usize << zone_shift;
    let first = zone_of(base, zone_shift);
    let last_addr = limit - 1;
    let last = zone_of(last_addr, zone_shift);
    let span_zones = ((limit.0 - base.0 + zone_size - 1) / zone_size) as u32;
    if span_zones >= ZONE_COUNT {
        return RefSet::UNIV;
    }
    let mut set = RefSet::EMPTY;
    let mut z = first;
    loop {
        set = set.add_zone(z);
        if z == last {
            break;
        }
        z = (z + 1) & (ZONE_COUNT - 1);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;

    #[test]
    fn union_intersection_are_bitwise() {
        let a = RefSet::single(1).union(RefSet::single(3));
        let b = RefSet::single(3).union(RefSet::single(5));
        assert_eq!(a.intersect(b), RefSet::single(3));
        assert_eq!(a.union(b), RefSet::single(1).union(RefSet::single(3)).union(RefSet::single(5)));
    }

    #[test]
    fn superset_and_diff() {
        let whole = RefSet::single(0).union(RefSet::single(1)).union(RefSet::single(2));
        let part = RefSet::single(1);
        assert!(whole.is_superset(part));
        assert_eq!(whole.diff(part), RefSet::single(0).union(RefSet::single(2)));
    }

    #[test]
    fn refset_of_range_covers_every_zone_touched() {
        let zone_shift = 12; // 4KiB zones
        let base = Addr(0);
        let limit = Addr(3 * (1 << zone_shift));
        let rs = refset_of_range(base, limit, zone_shift);
        assert!(rs.contains_zone(0));
        assert!(rs.contains_zone(1));
        assert!(rs.contains_zone(2));
        assert!(!rs.contains_zone(3));
    }

    #[test]
    fn univ_is_identity_for_intersect() {
        let s = RefSet::single(7);
        assert_eq!(s.intersect(RefSet::UNIV), s);
        assert_eq!(s.union(RefSet::EMPTY), s);
    }
}
