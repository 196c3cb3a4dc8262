//! Physical page pool shared by every context of a device.
//!
//! Two size classes are kept on separate free lists:
//!
//! | Class | Size | Used for |
//! |-------|------|----------|
//! | [`PageClass::Small`] | one pool page (4, 16 or 64 KiB) | PGDs and regular data backing |
//! | [`PageClass::Large`] | 2 MiB | Data backing of `LARGE_PAGES` regions |
//!
//! Allocation from the free lists ([`PagePool::try_alloc`]) never blocks and
//! never calls into the system allocator, so it is safe under the region and
//! table locks. Refilling ([`PagePool::grow`]) takes frames from the system
//! and must be called with those locks released.

use crate::config::MmuConfig;
use crate::error::PoolError;
use crate::memory::{FrameAlloc, PhysMemory};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};
use gpu_memory_addresses::{PageSize, PhysicalAddress, Size2M, Size4K};
use gpu_sync::{ExclusiveFlag, SpinLock};
use log::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PageClass {
    Small,
    Large,
}

#[derive(Default)]
struct FreeLists {
    small: Vec<PhysicalAddress>,
    large: Vec<PhysicalAddress>,
}

impl FreeLists {
    const fn list(&mut self, class: PageClass) -> &mut Vec<PhysicalAddress> {
        match class {
            PageClass::Small => &mut self.small,
            PageClass::Large => &mut self.large,
        }
    }
}

pub struct PagePool {
    config: MmuConfig,
    memory: Arc<dyn PhysMemory>,
    frames: SpinLock<Box<dyn FrameAlloc>>,
    lists: SpinLock<FreeLists>,
    /// Set while [`shrink`](Self::shrink) hands pages back to the system.
    reclaiming: ExclusiveFlag,
    small_in_use: AtomicUsize,
    large_in_use: AtomicUsize,
}

impl PagePool {
    pub fn new(config: MmuConfig, memory: Arc<dyn PhysMemory>, frames: Box<dyn FrameAlloc>) -> Self {
        Self {
            config,
            memory,
            frames: SpinLock::new(frames),
            lists: SpinLock::default(),
            reclaiming: ExclusiveFlag::new(),
            small_in_use: AtomicUsize::new(0),
            large_in_use: AtomicUsize::new(0),
        }
    }

    /// Size in bytes of one page of `class`.
    #[inline]
    #[must_use]
    pub const fn page_size(&self, class: PageClass) -> u64 {
        match class {
            PageClass::Small => self.config.pool_page_size(),
            PageClass::Large => Size2M::SIZE,
        }
    }

    /// GPU pages covered by one page of `class`.
    #[inline]
    #[must_use]
    pub const fn gpu_pages(&self, class: PageClass) -> u64 {
        self.page_size(class) >> Size4K::SHIFT
    }

    const fn order(&self, class: PageClass) -> u32 {
        match class {
            PageClass::Small => self.config.pool_page_order(),
            PageClass::Large => Size2M::SHIFT - Size4K::SHIFT,
        }
    }

    const fn capacity(&self, class: PageClass) -> usize {
        match class {
            PageClass::Small => self.config.max_pool_pages,
            PageClass::Large => self.config.max_large_pool_pages,
        }
    }

    const fn in_use_counter(&self, class: PageClass) -> &AtomicUsize {
        match class {
            PageClass::Small => &self.small_in_use,
            PageClass::Large => &self.large_in_use,
        }
    }

    /// Free pages currently held in `class`.
    #[must_use]
    pub fn free_count(&self, class: PageClass) -> usize {
        self.lists.with_lock(|l| l.list(class).len())
    }

    /// Pages of `class` handed out and not yet returned.
    #[must_use]
    pub fn in_use(&self, class: PageClass) -> usize {
        self.in_use_counter(class).load(Ordering::Relaxed)
    }

    /// Take `count` pages of `class` from the free list, all or nothing.
    ///
    /// Pages are appended to `out` zeroed. Never blocks; when fewer than
    /// `count` pages are resident the pool is left untouched.
    pub fn try_alloc(
        &self,
        class: PageClass,
        count: usize,
        out: &mut Vec<PhysicalAddress>,
    ) -> Result<(), PoolError> {
        if count == 0 {
            return Ok(());
        }

        let first = out.len();
        {
            let mut lists = self.lists.lock();
            let list = lists.list(class);
            if list.len() < count {
                return Err(PoolError::OutOfMemory);
            }
            let at = list.len() - count;
            out.extend(list.drain(at..));
        }

        let bytes = self.page_size(class);
        for &pa in &out[first..] {
            self.memory.zero(pa, bytes);
        }
        self.in_use_counter(class).fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Single-page convenience over [`try_alloc`](Self::try_alloc).
    pub fn try_alloc_one(&self, class: PageClass) -> Result<PhysicalAddress, PoolError> {
        let mut out = Vec::with_capacity(1);
        self.try_alloc(class, 1, &mut out)?;
        out.pop().ok_or(PoolError::OutOfMemory)
    }

    /// Refill `class` with `count` pages from the system.
    ///
    /// Waits for a concurrent [`shrink`](Self::shrink) to finish. All or
    /// nothing: if the system runs dry, frames taken so far are returned.
    pub fn grow(&self, class: PageClass, count: usize) -> Result<(), PoolError> {
        while self.reclaiming.is_set() {
            spin_loop();
        }
        self.grow_locked(class, count)
    }

    /// Like [`grow`](Self::grow), but fails with [`PoolError::Busy`] instead
    /// of waiting for reclaim.
    pub fn try_grow(&self, class: PageClass, count: usize) -> Result<(), PoolError> {
        if self.reclaiming.is_set() {
            return Err(PoolError::Busy);
        }
        self.grow_locked(class, count)
    }

    fn grow_locked(&self, class: PageClass, count: usize) -> Result<(), PoolError> {
        let order = self.order(class);
        let mut fresh = Vec::with_capacity(count);
        {
            let mut frames = self.frames.lock();
            for _ in 0..count {
                match frames.alloc_frames(order) {
                    Some(pa) => fresh.push(pa),
                    None => {
                        for pa in fresh.drain(..) {
                            frames.free_frames(pa, order);
                        }
                        debug!("pool grow of {count} {class:?} pages failed");
                        return Err(PoolError::OutOfMemory);
                    }
                }
            }
        }

        debug!("pool grew by {count} {class:?} pages");
        self.lists.with_lock(|l| l.list(class).extend(fresh));
        Ok(())
    }

    /// Return pages to the pool. Pages beyond the class capacity go back to
    /// the system.
    pub fn free(&self, class: PageClass, pages: &[PhysicalAddress]) {
        if pages.is_empty() {
            return;
        }
        self.in_use_counter(class)
            .fetch_sub(pages.len(), Ordering::Relaxed);

        let overflow: Vec<PhysicalAddress> = {
            let mut lists = self.lists.lock();
            let cap = self.capacity(class);
            let list = lists.list(class);
            let keep = cap.saturating_sub(list.len()).min(pages.len());
            list.extend_from_slice(&pages[..keep]);
            pages[keep..].to_vec()
        };

        if !overflow.is_empty() {
            let order = self.order(class);
            let mut frames = self.frames.lock();
            for pa in overflow {
                frames.free_frames(pa, order);
            }
        }
    }

    /// Give up to `count` free pages of `class` back to the system.
    ///
    /// Returns how many pages were released. Returns `0` if another shrink
    /// is already running.
    pub fn shrink(&self, class: PageClass, count: usize) -> usize {
        let Some(_reclaim) = self.reclaiming.try_acquire() else {
            return 0;
        };

        let victims: Vec<PhysicalAddress> = self.lists.with_lock(|l| {
            let list = l.list(class);
            let at = list.len().saturating_sub(count);
            list.drain(at..).collect()
        });

        let order = self.order(class);
        let mut frames = self.frames.lock();
        for &pa in &victims {
            frames.free_frames(pa, order);
        }
        debug!("pool shrank by {} {class:?} pages", victims.len());
        victims.len()
    }
}

/// Pages charged to one context.
#[derive(Debug, Default)]
pub struct PageAccount {
    data_pages: AtomicUsize,
    pgd_pages: AtomicUsize,
}

impl PageAccount {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data_pages: AtomicUsize::new(0),
            pgd_pages: AtomicUsize::new(0),
        }
    }

    /// Pool pages backing data, in pool-page units of their class.
    #[must_use]
    pub fn data_pages(&self) -> usize {
        self.data_pages.load(Ordering::Relaxed)
    }

    /// Pool pages holding PGDs.
    #[must_use]
    pub fn pgd_pages(&self) -> usize {
        self.pgd_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn charge_data(&self, pages: usize) {
        self.data_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn uncharge_data(&self, pages: usize) {
        self.data_pages.fetch_sub(pages, Ordering::Relaxed);
    }

    pub(crate) fn charge_pgd(&self) {
        self.pgd_pages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn uncharge_pgd(&self) {
        self.pgd_pages.fetch_sub(1, Ordering::Relaxed);
    }
}
