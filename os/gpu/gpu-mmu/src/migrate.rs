//! Page migration.
//!
//! Moving a page claims it through its metadata (isolation), re-verifies
//! the back-reference under the owning locks, and copies and retargets it
//! with the affected virtual range locked in hardware. The device-wide
//! migration transaction keeps power transitions out while that happens.

use crate::context::ContextId;
use crate::device::Device;
use crate::error::{MigrationError, PoolError};
use crate::metadata::{BackRef, PageMetadata, PageState};
use crate::pool::PageClass;
use crate::region::RegionId;
use crate::table::RelocateTarget;
use gpu_memory_addresses::{PhysicalAddress, Vpfn};
use log::{debug, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Migration {
    /// The page moved; the old page is back in the pool.
    Done,
    /// Not possible right now (unscheduled address space or power
    /// transition); nothing changed.
    Deferred,
}

impl Device {
    /// Take a page from the pool to migrate into.
    pub fn alloc_migration_target(&self) -> Result<PhysicalAddress, PoolError> {
        self.shared().alloc_page(PageClass::Small)
    }

    /// Return a target page that was not consumed by a migration.
    pub fn release_migration_target(&self, pa: PhysicalAddress) {
        self.shared().free_pages(PageClass::Small, &[pa]);
    }

    /// Move the contents and every reference of `old` to `new`.
    ///
    /// On [`Migration::Done`] `old` is returned to the pool and `new`
    /// carries its metadata. Otherwise `new` stays with the caller.
    pub fn migrate_page(
        &self,
        old: PhysicalAddress,
        new: PhysicalAddress,
    ) -> Result<Migration, MigrationError> {
        let shared = self.shared();
        if !shared.config.migration_supported() {
            return Err(MigrationError::NotMovable);
        }
        let meta = shared.metadata.get(old).ok_or(MigrationError::NotMovable)?;
        if new == old
            || !matches!(
                shared.metadata.state(new),
                PageState::Free | PageState::AllocateInProgress
            )
        {
            return Err(MigrationError::TargetInUse);
        }

        meta.try_isolate()?;
        let result = match meta.backref() {
            Some(backref @ BackRef::Data { context, region, vpfn }) => {
                self.migrate_data(&meta, backref, context, region, vpfn, old, new)
            }
            Some(backref @ BackRef::PageTable { table, vpfn, level }) => self
                .with_table(table, |t| {
                    t.relocate(vpfn, RelocateTarget::PageTable { level }, old, new, &meta, backref)
                })
                .unwrap_or(Err(MigrationError::ContextGone)),
            None => Err(MigrationError::StateChanged),
        };

        match result {
            Ok(Migration::Done) => {
                shared.free_pages(PageClass::Small, &[old]);
                shared.stats.migrations_done();
                debug!("migrated {old:?} to {new:?}");
            }
            Ok(Migration::Deferred) => {
                meta.release_isolation();
                shared.stats.migrations_deferred();
                warn!("migration of {old:?} deferred");
            }
            Err(e) => {
                meta.release_isolation();
                shared.stats.migrations_failed();
                debug!("migration of {old:?} failed: {e}");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn migrate_data(
        &self,
        meta: &PageMetadata,
        backref: BackRef,
        context: ContextId,
        region: RegionId,
        vpfn: Vpfn,
        old: PhysicalAddress,
        new: PhysicalAddress,
    ) -> Result<Migration, MigrationError> {
        let ctx = self.context(context).ok_or(MigrationError::ContextGone)?;
        if ctx.is_destroyed() {
            return Err(MigrationError::ContextGone);
        }

        let mut regions = ctx.regions.lock();
        let region = regions
            .by_id_mut(region)
            .ok_or(MigrationError::StateChanged)?;
        let granule = region.desc.granule(&self.shared().config);
        let rel = vpfn - region.desc.start;
        let (index, backing) = region
            .backing_of(rel, granule)
            .ok_or(MigrationError::NoMapping)?;
        if backing.pa != old {
            return Err(MigrationError::StateChanged);
        }

        let outcome = ctx
            .table
            .relocate(vpfn, RelocateTarget::Data, old, new, meta, backref)?;
        if outcome == Migration::Done {
            region.backing[index].pa = new;
        }
        Ok(outcome)
    }
}
