//! Tree levels and the per-operation "dirty levels" mask.

use crate::{BITS_PER_LEVEL, ENTRIES_PER_PGD, LEVELS};
use bitflags::bitflags;
use gpu_memory_addresses::Vpfn;

/// A level of the translation tree, `0` (root) to `3` (leaf).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level(u8);

impl Level {
    pub const ROOT: Self = Self(0);
    /// The only non-leaf level that may hold a page entry (2 MiB).
    pub const HUGE: Self = Self(2);
    pub const LEAF: Self = Self(LEVELS as u8 - 1);

    #[inline]
    #[must_use]
    pub const fn new(level: u8) -> Option<Self> {
        if (level as usize) < LEVELS {
            Some(Self(level))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Bit position of this level's index within a VPFN.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        (Self::LEAF.0 - self.0) as u32 * BITS_PER_LEVEL
    }

    /// Entry index for `vpfn` in a PGD of this level.
    #[inline]
    #[must_use]
    pub const fn index(self, vpfn: Vpfn) -> usize {
        ((vpfn.as_u64() >> self.shift()) as usize) & (ENTRIES_PER_PGD - 1)
    }

    /// GPU pages covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn span_pages(self) -> u64 {
        1 << self.shift()
    }

    /// First VPFN covered by the entry at this level that contains `vpfn`.
    #[inline]
    #[must_use]
    pub const fn entry_base(self, vpfn: Vpfn) -> Vpfn {
        Vpfn::new(vpfn.as_u64() & !(self.span_pages() - 1))
    }

    /// First VPFN covered by the PGD at this level that contains `vpfn`.
    #[inline]
    #[must_use]
    pub const fn pgd_base(self, vpfn: Vpfn) -> Vpfn {
        let span = self.span_pages() << BITS_PER_LEVEL;
        Vpfn::new(vpfn.as_u64() & !(span - 1))
    }

    #[inline]
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        Self::new(self.0 + 1)
    }

    #[inline]
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        if self.0 == 0 { None } else { Some(Self(self.0 - 1)) }
    }

    /// Whether an ATE is legal at this level.
    #[inline]
    #[must_use]
    pub const fn allows_page_entry(self) -> bool {
        self.0 == Self::HUGE.0 || self.0 == Self::LEAF.0
    }

    #[inline]
    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        (0..LEVELS as u8).map(Self)
    }
}

impl core::fmt::Display for Level {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

bitflags! {
    /// Tree levels touched by one operation.
    ///
    /// Levels not in the set are excluded from TLB invalidation.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct DirtyLevels: u8 {
        const L0 = 1 << 0;
        const L1 = 1 << 1;
        const L2 = 1 << 2;
        const L3 = 1 << 3;
    }
}

impl DirtyLevels {
    #[inline]
    #[must_use]
    pub const fn of(level: Level) -> Self {
        Self::from_bits_truncate(1 << level.0)
    }

    #[inline]
    pub fn mark(&mut self, level: Level) {
        self.insert(Self::of(level));
    }

    /// Levels that may be skipped by TLB invalidation.
    #[inline]
    #[must_use]
    pub const fn skip_levels(self) -> Self {
        self.complement()
    }
}
