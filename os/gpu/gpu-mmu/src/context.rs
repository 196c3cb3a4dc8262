//! GPU contexts: one address space, its table and its regions.

use crate::device::DeviceShared;
use crate::error::{KillReason, MmuError, RegionError};
use crate::hardware::AsNr;
use crate::metadata::BackRef;
use crate::pool::{PageAccount, PageClass};
use crate::region::{Backing, Region, RegionDesc, RegionId, RegionList};
use crate::table::MmuTable;
use crate::LEVELS;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use gpu_memory_addresses::{PageSize, PhysicalAddress, Size4K, Vpfn};
use gpu_sync::SpinLock;
use log::{debug, error};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// A GPU address space.
///
/// Lock order: `regions`, then the table mutex, then the hardware mutex.
pub struct Context {
    pub(crate) id: ContextId,
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) account: Arc<PageAccount>,
    pub(crate) table: MmuTable,
    pub(crate) regions: SpinLock<RegionList>,
    killed: SpinLock<Option<KillReason>>,
    destroyed: AtomicBool,
    next_region: AtomicU64,
}

impl Context {
    pub(crate) fn new(id: ContextId, shared: Arc<DeviceShared>) -> Result<Self, MmuError> {
        let account = Arc::new(PageAccount::new());
        let table = MmuTable::new(shared.clone(), Some(id), account.clone())?;
        Ok(Self {
            id,
            shared,
            account,
            table,
            regions: SpinLock::new(RegionList::default()),
            killed: SpinLock::new(None),
            destroyed: AtomicBool::new(false),
            next_region: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    #[must_use]
    pub const fn table(&self) -> &MmuTable {
        &self.table
    }

    /// Pages charged to this context.
    #[must_use]
    pub fn account(&self) -> &PageAccount {
        &self.account
    }

    /// Bind the table to hardware address space `as_nr`.
    pub fn schedule(&self, as_nr: AsNr) {
        debug!("{} scheduled on AS{as_nr}", self.id);
        self.table.bind(as_nr);
    }

    pub fn deschedule(&self) {
        debug!("{} descheduled", self.id);
        self.table.unbind();
    }

    #[must_use]
    pub fn kill_reason(&self) -> Option<KillReason> {
        *self.killed.lock()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    /// Terminate the context. Only the first reason is kept.
    pub fn kill(&self, reason: KillReason) {
        let mut killed = self.killed.lock();
        if killed.is_some() {
            return;
        }
        *killed = Some(reason);
        drop(killed);
        error!("{} killed: {reason}", self.id);
        self.table.unbind();
        self.shared.stats.faults_killed();
    }

    /// Reserve a region and back its initial commit.
    ///
    /// Backing pages are taken from the pool before any lock is held; the
    /// pool is grown and the whole step retried if the pool or the table
    /// runs dry.
    pub fn create_region(&self, desc: RegionDesc) -> Result<RegionId, RegionError> {
        let config = self.shared.config;
        desc.validate(&config)?;
        if self.kill_reason().is_some() {
            return Err(RegionError::ContextKilled);
        }

        let id = RegionId::new(self.next_region.fetch_add(1, Ordering::Relaxed));
        let class = desc.class();
        let granule = desc.granule(&config);
        let count = usize::try_from(desc.initial_commit / granule).map_err(|_| RegionError::InvalidDesc)?;

        for _ in 0..=config.max_fault_retries {
            let mut pages = Vec::with_capacity(count);
            if self.shared.alloc_pages(class, count, &mut pages).is_err() {
                let missing = count.saturating_sub(self.shared.pool.free_count(class)).max(1);
                self.shared.pool.grow(class, missing)?;
                continue;
            }

            let mut regions = self.regions.lock();
            if let Err(e) = regions.insert(Region::new(id, desc)) {
                drop(regions);
                self.shared.free_pages(class, &pages);
                return Err(e);
            }
            let Some(region) = regions.by_id_mut(id) else {
                drop(regions);
                self.shared.free_pages(class, &pages);
                return Err(RegionError::NotFound);
            };
            match self.install(region, &pages) {
                Ok(()) => {
                    debug!("{} region {} at {:?}, {} pages", self.id, id.as_u64(), desc.start, desc.nr_pages);
                    return Ok(id);
                }
                Err(e) if e.is_retryable() => {
                    regions.remove(id);
                    drop(regions);
                    self.shared.pool.grow(PageClass::Small, LEVELS - 1)?;
                }
                Err(e) => {
                    regions.remove(id);
                    return Err(e.into());
                }
            }
        }
        Err(RegionError::OutOfMemory)
    }

    /// Map `pages` right after the backed part of `region`.
    ///
    /// On failure the pages go back to the pool and the region is unchanged.
    pub(crate) fn install(&self, region: &mut Region, pages: &[PhysicalAddress]) -> Result<(), MmuError> {
        if pages.is_empty() {
            return Ok(());
        }
        let config = &self.shared.config;
        let class = region.class();
        let granule = region.desc.granule(config);
        let gpu_pages: Vec<PhysicalAddress> = pages
            .iter()
            .flat_map(|&pa| (0..granule).map(move |i| pa + i * Size4K::SIZE))
            .collect();
        let at = region.desc.start + region.backed;

        if let Err(e) = self
            .table
            .map(at, &gpu_pages, region.desc.flags.map_flags(), region.desc.group)
        {
            self.shared.free_pages(class, pages);
            return Err(e);
        }

        let movable = class == PageClass::Small && config.migration_supported();
        for (i, &pa) in pages.iter().enumerate() {
            if movable {
                let backref = BackRef::Data {
                    context: self.id,
                    region: region.id,
                    vpfn: at + i as u64 * granule,
                };
                self.shared.metadata.set_mapped(pa, backref);
            } else {
                self.shared.metadata.mark_not_movable(pa);
            }
            region.backing.push(Backing { pa, class });
        }
        self.account.charge_data(pages.len());
        region.backed += gpu_pages.len() as u64;
        Ok(())
    }

    /// Give the backed page at `vpfn` a private copy: a fresh pool page gets
    /// the old contents and takes over the translation, and the old page
    /// goes back to the pool.
    ///
    /// The pool is not grown. Regions backed by 2 MiB pages are refused.
    /// Returns the new page.
    pub fn replace_backing(&self, vpfn: Vpfn) -> Result<PhysicalAddress, RegionError> {
        let config = self.shared.config;
        let mut regions = self.regions.lock();
        let region = regions.find_mut(vpfn).ok_or(RegionError::NotFound)?;
        let class = region.class();
        if class != PageClass::Small {
            return Err(RegionError::InvalidDesc);
        }
        let granule = region.desc.granule(&config);
        let rel = vpfn - region.desc.start;
        if rel >= region.backed {
            return Err(MmuError::NoMapping(vpfn).into());
        }
        let (index, old) = region
            .backing_of(rel, granule)
            .ok_or(MmuError::NoMapping(vpfn))?;
        let old = old.pa;
        let at = region.desc.start + index as u64 * granule;

        let new = self.shared.alloc_page(class)?;
        self.shared.memory.copy(old, new, granule * Size4K::SIZE);
        let gpu_pages: Vec<PhysicalAddress> = (0..granule).map(|i| new + i * Size4K::SIZE).collect();
        if let Err(e) = self
            .table
            .update_flags(at, &gpu_pages, region.desc.flags.map_flags())
        {
            drop(regions);
            self.shared.free_pages(class, &[new]);
            return Err(e.into());
        }
        // Movable pages got their back-reference from the table.
        if !config.migration_supported() {
            self.shared.metadata.mark_not_movable(new);
        }
        region.backing[index].pa = new;
        drop(regions);

        self.shared.free_pages(class, &[old]);
        debug!("{} backing at {at:?} replaced, {old:?} -> {new:?}", self.id);
        Ok(new)
    }

    /// Unmap a region and return its backing to the pool.
    pub fn free_region(&self, id: RegionId) -> Result<(), RegionError> {
        let mut regions = self.regions.lock();
        let region = regions.remove(id).ok_or(RegionError::NotFound)?;
        self.release(region)
    }

    fn release(&self, region: Region) -> Result<(), RegionError> {
        let unmapped = if region.backed == 0 {
            Ok(())
        } else {
            self.table.unmap(region.desc.start, region.backed).map(|_| ())
        };
        if let Err(e) = unmapped {
            error!("{} unmapping region {} failed: {e}", self.id, region.id.as_u64());
        }
        let pages: Vec<PhysicalAddress> = region.backing.iter().map(|b| b.pa).collect();
        self.shared.free_pages(region.class(), &pages);
        self.account.uncharge_data(pages.len());
        unmapped.map_err(RegionError::from)
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.with_lock(|r| r.len())
    }

    /// GPU pages currently backed in region `id`.
    #[must_use]
    pub fn region_backed_pages(&self, id: RegionId) -> Option<u64> {
        self.regions.with_lock(|r| r.by_id_mut(id).map(|r| r.backed))
    }

    /// Physical backing pages of region `id`, in mapping order.
    #[must_use]
    pub fn region_backing(&self, id: RegionId) -> Option<Vec<PhysicalAddress>> {
        self.regions
            .with_lock(|r| r.by_id_mut(id).map(|r| r.backing.iter().map(|b| b.pa).collect()))
    }

    /// The region containing `vpfn`, if any.
    #[must_use]
    pub fn region_at(&self, vpfn: Vpfn) -> Option<RegionId> {
        self.regions.with_lock(|r| r.find_mut(vpfn).map(|r| r.id))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let regions = self.regions.get_mut().drain();
        for region in regions {
            if let Err(e) = self.release(region) {
                error!("{} teardown: {e}", self.id);
            }
        }
        debug!("{} released", self.id);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("address_space", &self.table.address_space())
            .field("killed", &self.kill_reason())
            .finish_non_exhaustive()
    }
}
