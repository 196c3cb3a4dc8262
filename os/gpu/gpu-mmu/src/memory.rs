//! Physical memory access and system frame provisioning.
//!
//! PGD entries live in device-visible physical memory. The engine never
//! dereferences physical addresses itself; it goes through [`PhysMemory`],
//! which a host maps however it likes (direct map, BAR window, or the
//! simulation in [`sim`](crate::sim)).

use gpu_memory_addresses::PhysicalAddress;

/// Word-granular access to physical memory.
pub trait PhysMemory: Send + Sync {
    /// Read the 8-byte word at `pa` (8-byte aligned).
    fn read_u64(&self, pa: PhysicalAddress) -> u64;

    /// Write the 8-byte word at `pa` (8-byte aligned).
    fn write_u64(&self, pa: PhysicalAddress, value: u64);

    /// Copy `bytes` from `from` to `to`. Ranges never overlap.
    fn copy(&self, from: PhysicalAddress, to: PhysicalAddress, bytes: u64);

    /// Zero `bytes` starting at `pa`.
    fn zero(&self, pa: PhysicalAddress, bytes: u64);

    /// Read entry `index` of the PGD at `pgd`.
    #[inline]
    fn read_entry(&self, pgd: PhysicalAddress, index: usize) -> u64 {
        self.read_u64(entry_address(pgd, index))
    }

    /// Write entry `index` of the PGD at `pgd`.
    #[inline]
    fn write_entry(&self, pgd: PhysicalAddress, index: usize, value: u64) {
        self.write_u64(entry_address(pgd, index), value);
    }
}

/// Physical address of entry `index` in the PGD at `pgd`.
#[inline]
#[must_use]
pub const fn entry_address(pgd: PhysicalAddress, index: usize) -> PhysicalAddress {
    PhysicalAddress::new(pgd.as_u64() + (index as u64) * 8)
}

/// Provides naturally aligned runs of 4 KiB frames from the system.
pub trait FrameAlloc: Send {
    /// Allocate `1 << order` contiguous frames, aligned to their size.
    fn alloc_frames(&mut self, order: u32) -> Option<PhysicalAddress>;

    /// Return a run previously handed out with the same `order`.
    fn free_frames(&mut self, base: PhysicalAddress, order: u32);
}
