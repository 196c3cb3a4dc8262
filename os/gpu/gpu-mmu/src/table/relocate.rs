use super::arena::PgdHandle;
use super::{MmuTable, TableInner};
use crate::entry::{EntryBits, EntryKind};
use crate::error::{HwError, MigrationError};
use crate::level::{DirtyLevels, Level};
use crate::memory::entry_address;
use crate::metadata::{BackRef, PageMetadata, PageState};
use crate::migrate::Migration;
use gpu_memory_addresses::{PageSize, PhysicalAddress, Size4K, Vpfn, VpfnRange};
use log::{debug, trace};

/// What kind of page is being moved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RelocateTarget {
    /// A 4 KiB data page mapped by a leaf ATE.
    Data,
    /// A PGD of the given level.
    PageTable { level: Level },
}

/// The entry that points at the page being moved.
struct Referrer {
    node: PgdHandle,
    index: usize,
    /// For PGD moves, the software node of the moved PGD.
    moved: Option<PgdHandle>,
}

impl MmuTable {
    /// Move the page at `old` to `new` and retarget the entry referring to
    /// it, with the affected range locked in hardware.
    ///
    /// The caller has isolated `old` via `meta`. Everything observed before
    /// taking the table lock is verified again under it.
    pub(crate) fn relocate(
        &self,
        vpfn: Vpfn,
        target: RelocateTarget,
        old: PhysicalAddress,
        new: PhysicalAddress,
        meta: &PageMetadata,
        expected: BackRef,
    ) -> Result<Migration, MigrationError> {
        let mut inner = self.inner.lock();

        let expected_state = match target {
            RelocateTarget::Data => PageState::DataMapped,
            RelocateTarget::PageTable { .. } => PageState::PageTableMapped,
        };
        if !meta.is_isolated() || meta.state() != expected_state || meta.backref() != Some(expected) {
            return Err(MigrationError::StateChanged);
        }

        let (entry_level, range) = match target {
            RelocateTarget::Data => (Level::LEAF, VpfnRange::new(vpfn, 1)),
            RelocateTarget::PageTable { level } => {
                let parent = level.parent().ok_or(MigrationError::NotMovable)?;
                let span = level.span_pages() * crate::ENTRIES_PER_PGD as u64;
                (parent, VpfnRange::new(level.pgd_base(vpfn), span))
            }
        };
        let referrer = self
            .find_referrer(&inner, vpfn, entry_level, target, old)
            .ok_or(MigrationError::StateChanged)?;
        let pgd = inner.arena[referrer.node].pa;
        let entry = self.read(pgd, referrer.index);

        let Some(as_nr) = self.address_space() else {
            debug!("{} not scheduled, deferring move of {old:?}", self.id);
            return Ok(Migration::Deferred);
        };
        let Some(_migrating) = self.shared.coordinator.begin_migration() else {
            debug!("power transition pending, deferring move of {old:?}");
            return Ok(Migration::Deferred);
        };

        let shared = &self.shared;
        let hw = &*shared.hw;
        let hw_lock = shared.hw_lock.lock();

        match self.hw_retry(|| hw.lock_range(as_nr, range)) {
            Ok(()) => {}
            Err(HwError::NotScheduled) => {
                debug!("{} lost its address space, deferring move of {old:?}", self.id);
                return Ok(Migration::Deferred);
            }
            Err(e) => {
                drop(hw_lock);
                shared.escalate(e);
                return Err(MigrationError::Hardware(e));
            }
        }

        let line = entry_address(pgd, referrer.index);
        let skip = DirtyLevels::of(entry_level).skip_levels();
        let invalidate = || match self.hw_retry(|| hw.invalidate_tlb(as_nr, range, skip)) {
            Err(HwError::NotScheduled) => Ok(()),
            other => other,
        };
        // Best effort: the device is reset right after.
        let restore = || {
            shared.memory.write_entry(pgd, referrer.index, entry.into_bits());
            let _ = self.hw_retry(|| hw.flush_cache_range(line, 8));
            let _ = invalidate();
        };

        // Everything up to the unlock happens with the range locked, so the
        // GPU never walks the new entry before its line and TLB are clean.
        let mut rewritten = false;
        let body = self
            .hw_retry(|| hw.flush_cache_range(old, Size4K::SIZE))
            .and_then(|()| {
                shared.memory.copy(old, new, Size4K::SIZE);
                shared
                    .memory
                    .write_entry(pgd, referrer.index, entry.with_physical_address(new).into_bits());
                rewritten = true;
                self.hw_retry(|| hw.flush_cache_range(line, 8))
            })
            .and_then(|()| invalidate());
        let unlocked = self.hw_retry(|| hw.unlock_range(as_nr));
        let result = body.and(unlocked);
        if result.is_err() && rewritten {
            restore();
        }
        drop(hw_lock);

        if let Err(e) = result {
            shared.escalate(e);
            return Err(MigrationError::Hardware(e));
        }

        if let Some(moved) = referrer.moved {
            inner.arena[moved].pa = new;
            inner.allocator.rebase(old, new);
        }
        shared.metadata.transfer(old, new);
        trace!("{} moved {old:?} to {new:?} at {vpfn:?}", self.id);
        Ok(Migration::Done)
    }

    fn hw_retry(&self, op: impl FnMut() -> Result<(), HwError>) -> Result<(), HwError> {
        self.shared.flush.retry(&self.shared.stats, op)
    }

    /// Locate the entry at `entry_level` on the path to `vpfn` that points
    /// at `old`.
    fn find_referrer(
        &self,
        inner: &TableInner,
        vpfn: Vpfn,
        entry_level: Level,
        target: RelocateTarget,
        old: PhysicalAddress,
    ) -> Option<Referrer> {
        let mut node = inner.root;
        while inner.arena[node].level < entry_level {
            node = inner.arena[node].child(inner.arena[node].level.index(vpfn))?;
        }
        let n = &inner.arena[node];
        let index = n.level.index(vpfn);
        let entry: EntryBits = self.read(n.pa, index);
        if entry.physical_address() != old {
            return None;
        }
        match (target, entry.kind()) {
            (RelocateTarget::Data, EntryKind::Page) => Some(Referrer {
                node,
                index,
                moved: None,
            }),
            (RelocateTarget::PageTable { level }, EntryKind::Table) => {
                let child = n.child(index)?;
                let c = &inner.arena[child];
                (c.pa == old && c.level == level).then_some(Referrer {
                    node,
                    index,
                    moved: Some(child),
                })
            }
            _ => None,
        }
    }
}
