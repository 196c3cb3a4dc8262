//! Sub-page allocator for PGDs.
//!
//! A PGD is always 4 KiB (512 entries). With larger pool pages several PGDs
//! share one pool page; this allocator tracks the live slots of every pool
//! page a table owns. It only keeps books: obtaining pool pages and giving
//! empty ones back is up to the caller.

use alloc::vec::Vec;
use gpu_memory_addresses::{PageSize, PhysicalAddress, Size4K};

#[derive(Debug, Clone, Copy)]
struct PgdPage {
    base: PhysicalAddress,
    /// Bit `i` set: slot `i` is live.
    used: u16,
}

/// Outcome of [`PgdAllocator::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgdFree {
    /// Other slots of the pool page are still live.
    SlotReleased,
    /// The pool page at this address has no live slots left.
    PageEmpty(PhysicalAddress),
}

#[derive(Debug)]
pub struct PgdAllocator {
    slots_per_page: usize,
    pages: Vec<PgdPage>,
    last_allocated: Option<usize>,
    last_freed: Option<usize>,
}

impl PgdAllocator {
    /// `slots_per_page` is 1, 4 or 16.
    #[must_use]
    pub fn new(slots_per_page: usize) -> Self {
        debug_assert!((1..=16).contains(&slots_per_page));
        Self {
            slots_per_page,
            pages: Vec::new(),
            last_allocated: None,
            last_freed: None,
        }
    }

    const fn full_mask(&self) -> u16 {
        if self.slots_per_page >= 16 {
            u16::MAX
        } else {
            (1 << self.slots_per_page) - 1
        }
    }

    #[inline]
    const fn slot_address(base: PhysicalAddress, slot: u32) -> PhysicalAddress {
        PhysicalAddress::new(base.as_u64() + slot as u64 * Size4K::SIZE)
    }

    fn take_slot(&mut self, index: usize) -> Option<PhysicalAddress> {
        let full = self.full_mask();
        let page = self.pages.get_mut(index)?;
        let free = !page.used & full;
        if free == 0 {
            return None;
        }
        let slot = free.trailing_zeros();
        page.used |= 1 << slot;
        let pa = Self::slot_address(page.base, slot);
        self.last_allocated = Some(index);
        Some(pa)
    }

    /// A free PGD slot in an already owned pool page, or `None`.
    ///
    /// Tries the page of the last free first, then the page of the last
    /// allocation, then scans.
    pub fn allocate(&mut self) -> Option<PhysicalAddress> {
        if self.slots_per_page == 1 {
            return None;
        }
        for hint in [self.last_freed, self.last_allocated].into_iter().flatten() {
            if let Some(pa) = self.take_slot(hint) {
                return Some(pa);
            }
        }
        let full = self.full_mask();
        let index = self.pages.iter().position(|p| p.used & full != full)?;
        self.take_slot(index)
    }

    /// Take ownership of a fresh pool page and return its first slot.
    pub fn adopt(&mut self, base: PhysicalAddress) -> PhysicalAddress {
        self.pages.push(PgdPage { base, used: 1 });
        self.last_allocated = Some(self.pages.len() - 1);
        base
    }

    /// Release the slot at `pgd`.
    ///
    /// Returns [`PgdFree::PageEmpty`] once the whole pool page is unused; the
    /// page is then forgotten and must be returned to the pool by the caller.
    pub fn free(&mut self, pgd: PhysicalAddress) -> Option<PgdFree> {
        let index = self.page_index(pgd)?;
        let page = &mut self.pages[index];
        let slot = (pgd.as_u64() - page.base.as_u64()) / Size4K::SIZE;
        page.used &= !(1 << slot);

        if page.used != 0 {
            self.last_freed = Some(index);
            return Some(PgdFree::SlotReleased);
        }

        let base = page.base;
        self.pages.swap_remove(index);
        let moved = self.pages.len();
        for hint in [&mut self.last_allocated, &mut self.last_freed] {
            *hint = match *hint {
                Some(h) if h == index => None,
                Some(h) if h == moved => Some(index),
                other => other,
            };
        }
        Some(PgdFree::PageEmpty(base))
    }

    /// Replace the pool page at `old` with `new` (page migration).
    pub fn rebase(&mut self, old: PhysicalAddress, new: PhysicalAddress) -> bool {
        match self.pages.iter_mut().find(|p| p.base == old) {
            Some(page) => {
                page.base = new;
                true
            }
            None => false,
        }
    }

    fn page_index(&self, pgd: PhysicalAddress) -> Option<usize> {
        let span = self.slots_per_page as u64 * Size4K::SIZE;
        self.pages.iter().position(|p| {
            pgd.as_u64() >= p.base.as_u64() && pgd.as_u64() < p.base.as_u64() + span
        })
    }

    /// Pool page that holds `pgd`.
    #[must_use]
    pub fn page_of(&self, pgd: PhysicalAddress) -> Option<PhysicalAddress> {
        self.page_index(pgd).map(|i| self.pages[i].base)
    }

    /// Pool pages currently owned.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Live PGD slots across all owned pages.
    #[must_use]
    pub fn live_slots(&self) -> usize {
        self.pages.iter().map(|p| p.used.count_ones() as usize).sum()
    }

    /// Every owned pool page, leaving the allocator empty.
    pub fn drain_pages(&mut self) -> Vec<PhysicalAddress> {
        self.last_allocated = None;
        self.last_freed = None;
        self.pages.drain(..).map(|p| p.base).collect()
    }
}
