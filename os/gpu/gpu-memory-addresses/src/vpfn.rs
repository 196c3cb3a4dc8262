use crate::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// GPU virtual page frame number: a virtual address divided by 4 KiB.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Vpfn(u64);

impl Vpfn {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Page containing virtual byte address `va`.
    #[inline]
    #[must_use]
    pub const fn from_address(va: u64) -> Self {
        Self(va >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// First virtual byte address of this page.
    #[inline]
    #[must_use]
    pub const fn address(self) -> u64 {
        self.0 << 12
    }

    /// Whether this page starts an `S`-sized, `S`-aligned run.
    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::GPU_PAGES - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::GPU_PAGES - 1))
    }

    /// Number of pages from `self` up to (excluding) `end`, zero if `end` is lower.
    #[inline]
    #[must_use]
    pub const fn distance_to(self, end: Self) -> u64 {
        end.0.saturating_sub(self.0)
    }
}

impl Add<u64> for Vpfn {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for Vpfn {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for Vpfn {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for Vpfn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VPFN({:#x})", self.0)
    }
}

impl fmt::Display for Vpfn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Half-open run of virtual pages `[start, start + count)`.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Debug)]
pub struct VpfnRange {
    pub start: Vpfn,
    pub count: u64,
}

impl VpfnRange {
    #[inline]
    #[must_use]
    pub const fn new(start: Vpfn, count: u64) -> Self {
        Self { start, count }
    }

    /// First page past the range.
    #[inline]
    #[must_use]
    pub const fn end(self) -> Vpfn {
        Vpfn(self.start.0 + self.count)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.count == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, vpfn: Vpfn) -> bool {
        vpfn.0 >= self.start.0 && vpfn.0 < self.start.0 + self.count
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start.0 < other.start.0 + other.count
            && other.start.0 < self.start.0 + self.count
    }

    /// Smallest range covering both.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let start = if self.start.0 < other.start.0 {
            self.start.0
        } else {
            other.start.0
        };
        let a = self.start.0 + self.count;
        let b = other.start.0 + other.count;
        let end = if a > b { a } else { b };
        Self {
            start: Vpfn(start),
            count: end - start,
        }
    }
}
