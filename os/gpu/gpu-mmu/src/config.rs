//! Tunables of the GPU MMU.

use gpu_memory_addresses::{PageSize, Size4K};

/// Device-wide MMU configuration.
///
/// All fields have `const` defaults; adjust with the `with_*` builders:
///
/// ```rust
/// # use gpu_mmu::MmuConfig;
/// let cfg = MmuConfig::new()
///     .with_pool_page_shift(14)
///     .with_max_fault_retries(4);
/// assert_eq!(cfg.pgds_per_pool_page(), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuConfig {
    /// log2 of the pool page size: 12, 14 or 16.
    pub pool_page_shift: u32,
    /// Free small pages kept by the pool before frees go back to the system.
    pub max_pool_pages: usize,
    /// Free large (2 MiB) pages kept by the pool.
    pub max_large_pool_pages: usize,
    /// Largest virtual range (in GPU pages) still flushed by range.
    pub range_flush_limit_pages: u64,
    /// Grow-and-retry iterations per fault or root allocation.
    pub max_fault_retries: u32,
    /// Busy-retry iterations for a single hardware operation.
    pub hw_busy_retries: u32,
    /// Global enable for page migration.
    pub page_migration: bool,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MmuConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pool_page_shift: Size4K::SHIFT,
            max_pool_pages: 4096,
            max_large_pool_pages: 16,
            range_flush_limit_pages: 2048,
            max_fault_retries: 8,
            hw_busy_retries: 16,
            page_migration: true,
        }
    }

    /// Pool page size shift; anything other than 12, 14 or 16 is rounded up
    /// to the next supported value (and capped at 16).
    #[must_use]
    pub const fn with_pool_page_shift(mut self, shift: u32) -> Self {
        self.pool_page_shift = match shift {
            0..=12 => 12,
            13 | 14 => 14,
            _ => 16,
        };
        self
    }

    #[must_use]
    pub const fn with_max_pool_pages(mut self, pages: usize) -> Self {
        self.max_pool_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_max_large_pool_pages(mut self, pages: usize) -> Self {
        self.max_large_pool_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_range_flush_limit_pages(mut self, pages: u64) -> Self {
        self.range_flush_limit_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_max_fault_retries(mut self, retries: u32) -> Self {
        self.max_fault_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_hw_busy_retries(mut self, retries: u32) -> Self {
        self.hw_busy_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_page_migration(mut self, enabled: bool) -> Self {
        self.page_migration = enabled;
        self
    }

    /// Pool page size in bytes.
    #[inline]
    #[must_use]
    pub const fn pool_page_size(&self) -> u64 {
        1 << self.pool_page_shift
    }

    /// Buddy order of one pool page in 4 KiB frames.
    #[inline]
    #[must_use]
    pub const fn pool_page_order(&self) -> u32 {
        self.pool_page_shift - Size4K::SHIFT
    }

    /// GPU pages (and PGDs) that fit into one pool page.
    #[inline]
    #[must_use]
    pub const fn pgds_per_pool_page(&self) -> usize {
        1 << self.pool_page_order()
    }

    /// Same as [`pgds_per_pool_page`](Self::pgds_per_pool_page), in GPU-page units.
    #[inline]
    #[must_use]
    pub const fn gpu_pages_per_pool_page(&self) -> u64 {
        1 << self.pool_page_order()
    }

    /// Whether pages of this device can be migrated at all.
    ///
    /// Migration moves exactly one GPU page or one PGD, so it requires pool
    /// pages that hold exactly one of either.
    #[inline]
    #[must_use]
    pub const fn migration_supported(&self) -> bool {
        self.page_migration && self.pool_page_shift == Size4K::SHIFT
    }
}
