//! # GPU Address Types
//!
//! Strongly typed wrappers for the two address spaces the GPU MMU deals with:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in device-visible physical memory. |
//! | [`Vpfn`] | A GPU virtual page frame number (virtual address / 4 KiB). |
//! | [`VpfnRange`] | A half-open run of virtual pages `[start, start + count)`. |
//!
//! Page sizes are expressed with sealed marker types implementing
//! [`PageSize`]:
//!
//! - [`Size4K`]: the GPU base page
//! - [`Size2M`]: a huge page, covered by a single level-2 entry
//!
//! ```rust
//! # use gpu_memory_addresses::*;
//! let va = 0x0020_3000_u64;
//! let vpfn = Vpfn::from_address(va);
//! assert_eq!(vpfn.as_u64(), 0x203);
//! assert!(!vpfn.is_aligned::<Size2M>());
//! assert_eq!(vpfn.align_down::<Size2M>(), Vpfn::new(0x200));
//!
//! let pa = PhysicalAddress::new(0x8000_1000);
//! assert!(pa.is_aligned::<Size4K>());
//! assert_eq!(pa.pfn(), 0x8_0001);
//! ```
//!
//! All types are `#[repr(transparent)]` (or plain `Copy` pairs) and every
//! helper is a `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod vpfn;

pub use page_size::{PageSize, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use vpfn::{Vpfn, VpfnRange};

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}
