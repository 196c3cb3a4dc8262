//! The device facade: shared MMU state and the set of live contexts.

use crate::config::MmuConfig;
use crate::context::{Context, ContextId};
use crate::coordinator::{MigrationCoordinator, PowerTransition};
use crate::error::{HwError, MmuError, PoolError};
use crate::flush::FlushCoordinator;
use crate::hardware::MmuHardware;
use crate::memory::{FrameAlloc, PhysMemory};
use crate::metadata::MetadataTable;
use crate::pool::{PageAccount, PageClass, PagePool};
use crate::stats::{MmuStats, StatsSnapshot};
use crate::table::{MmuTable, TableId};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use gpu_memory_addresses::PhysicalAddress;
use gpu_sync::SpinLock;
use log::{error, info};

/// State shared by the device, its contexts and their tables.
pub(crate) struct DeviceShared {
    pub config: MmuConfig,
    pub memory: Arc<dyn PhysMemory>,
    pub hw: Arc<dyn MmuHardware>,
    pub pool: PagePool,
    pub metadata: MetadataTable,
    pub flush: FlushCoordinator,
    pub coordinator: MigrationCoordinator,
    /// Serializes register access.
    pub hw_lock: SpinLock<()>,
    pub stats: MmuStats,
    next_table: AtomicU64,
}

impl DeviceShared {
    pub fn next_table_id(&self) -> TableId {
        TableId::new(self.next_table.fetch_add(1, Ordering::Relaxed))
    }

    /// Take pages from the pool and start tracking them.
    pub fn alloc_pages(
        &self,
        class: PageClass,
        count: usize,
        out: &mut Vec<PhysicalAddress>,
    ) -> Result<(), PoolError> {
        let first = out.len();
        self.pool.try_alloc(class, count, out)?;
        for &pa in &out[first..] {
            self.metadata.allocated(pa);
        }
        Ok(())
    }

    pub fn alloc_page(&self, class: PageClass) -> Result<PhysicalAddress, PoolError> {
        let pa = self.pool.try_alloc_one(class)?;
        self.metadata.allocated(pa);
        Ok(pa)
    }

    pub fn free_pages(&self, class: PageClass, pages: &[PhysicalAddress]) {
        for &pa in pages {
            self.metadata.begin_free(pa);
        }
        for &pa in pages {
            self.metadata.finish_free(pa);
        }
        self.pool.free(class, pages);
    }

    /// Recover from a hardware failure by resetting the GPU.
    pub fn escalate(&self, e: HwError) {
        error!("MMU hardware failure ({e}), resetting the GPU");
        self.stats.device_resets();
        self.hw.reset();
    }
}

/// A GPU with its MMU.
///
/// Owns the page pool, the page metadata, the firmware table and every
/// [`Context`].
pub struct Device {
    shared: Arc<DeviceShared>,
    contexts: SpinLock<BTreeMap<ContextId, Arc<Context>>>,
    firmware: MmuTable,
    next_context: AtomicU64,
}

impl Device {
    /// Bring up the MMU.
    ///
    /// Fails if the root of the firmware table cannot be allocated.
    pub fn new(
        config: MmuConfig,
        memory: Arc<dyn PhysMemory>,
        frames: Box<dyn FrameAlloc>,
        hw: Arc<dyn MmuHardware>,
    ) -> Result<Self, MmuError> {
        let shared = Arc::new(DeviceShared {
            config,
            pool: PagePool::new(config, memory.clone(), frames),
            memory,
            hw,
            metadata: MetadataTable::new(),
            flush: FlushCoordinator::new(config.range_flush_limit_pages, config.hw_busy_retries),
            coordinator: MigrationCoordinator::new(),
            hw_lock: SpinLock::new(()),
            stats: MmuStats::default(),
            next_table: AtomicU64::new(0),
        });
        let firmware = MmuTable::new(shared.clone(), None, Arc::new(PageAccount::new()))?;
        info!(
            "GPU MMU up: {} KiB pool pages, migration {}",
            config.pool_page_size() / 1024,
            if config.migration_supported() { "on" } else { "off" }
        );
        Ok(Self {
            shared,
            contexts: SpinLock::new(BTreeMap::new()),
            firmware,
            next_context: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MmuConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn pool(&self) -> &PagePool {
        &self.shared.pool
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataTable {
        &self.shared.metadata
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            hw_lock_waits: self.shared.hw_lock.contention_count(),
            ..self.shared.stats.snapshot()
        }
    }

    /// The table used by the GPU firmware; not owned by any context.
    #[must_use]
    pub const fn firmware_table(&self) -> &MmuTable {
        &self.firmware
    }

    pub fn create_context(&self) -> Result<Arc<Context>, MmuError> {
        let id = ContextId::new(self.next_context.fetch_add(1, Ordering::Relaxed));
        let context = Arc::new(Context::new(id, self.shared.clone())?);
        self.contexts.with_lock(|c| c.insert(id, context.clone()));
        info!("context {id} created");
        Ok(context)
    }

    #[must_use]
    pub fn context(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.with_lock(|c| c.get(&id).cloned())
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.with_lock(|c| c.len())
    }

    /// Remove a context from the device.
    ///
    /// In-flight faults and migrations holding a reference see it as gone;
    /// its pages are released when the last reference drops.
    pub fn destroy_context(&self, id: ContextId) -> Option<Arc<Context>> {
        let context = self.contexts.with_lock(|c| c.remove(&id))?;
        context.mark_destroyed();
        info!("context {id} destroyed");
        Some(context)
    }

    pub fn grow_pool(&self, class: PageClass, pages: usize) -> Result<(), PoolError> {
        self.shared.pool.grow(class, pages)
    }

    pub fn try_grow_pool(&self, class: PageClass, pages: usize) -> Result<(), PoolError> {
        self.shared.pool.try_grow(class, pages)
    }

    pub fn shrink_pool(&self, class: PageClass, pages: usize) -> usize {
        self.shared.pool.shrink(class, pages)
    }

    /// Exclude a page from migration, e.g. while the CPU has it pinned.
    pub fn mark_not_movable(&self, pa: PhysicalAddress) {
        self.shared.metadata.mark_not_movable(pa);
    }

    /// Announce a GPU power transition; `None` while a migration runs.
    pub fn begin_power_transition(&self) -> Option<PowerTransition<'_>> {
        self.shared.coordinator.begin_power_transition()
    }

    pub(crate) const fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Run `f` on the table with `id`, if it still exists.
    pub(crate) fn with_table<R>(&self, id: TableId, f: impl FnOnce(&MmuTable) -> R) -> Option<R> {
        if self.firmware.id() == id {
            return Some(f(&self.firmware));
        }
        let context = self
            .contexts
            .with_lock(|c| c.values().find(|c| c.table().id() == id).cloned())?;
        Some(f(context.table()))
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.shared.config)
            .field("contexts", &self.context_count())
            .finish_non_exhaustive()
    }
}
