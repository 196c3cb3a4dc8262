//! Per-page metadata for migration-tracked pages.
//!
//! ```text
//! Free -> AllocateInProgress -> PageTableMapped | DataMapped -> FreeInProgress -> Free
//!                                      |                |
//!                                      +-- ISOLATED ----+   (claimed by a migration)
//!
//! NotMovable: terminal until the page is freed
//! ```
//!
//! The state lives in an atomic byte and changes only by compare-and-swap,
//! so a migration can claim a page without taking any table lock. The
//! back-reference sits behind its own small lock.

use crate::context::ContextId;
use crate::level::Level;
use crate::region::RegionId;
use crate::table::TableId;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};
use gpu_memory_addresses::{PhysicalAddress, Vpfn};
use gpu_sync::SpinLock;

use crate::error::MigrationError;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageState {
    Free = 0,
    AllocateInProgress = 1,
    PageTableMapped = 2,
    DataMapped = 3,
    FreeInProgress = 4,
    NotMovable = 5,
}

const ISOLATED: u8 = 0x80;
const STATE_MASK: u8 = 0x7F;

impl PageState {
    const fn from_raw(raw: u8) -> Self {
        match raw & STATE_MASK {
            1 => Self::AllocateInProgress,
            2 => Self::PageTableMapped,
            3 => Self::DataMapped,
            4 => Self::FreeInProgress,
            5 => Self::NotMovable,
            _ => Self::Free,
        }
    }

    /// Whether a migration may claim a page in this state.
    #[must_use]
    pub const fn is_movable(self) -> bool {
        matches!(self, Self::PageTableMapped | Self::DataMapped)
    }
}

/// Who references a mapped page. Non-owning; resolved again on every use.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackRef {
    /// Data page of `region`, mapped at `vpfn`.
    Data {
        context: ContextId,
        region: RegionId,
        vpfn: Vpfn,
    },
    /// PGD of `table` at `level`, covering the range starting at `vpfn`.
    PageTable {
        table: TableId,
        vpfn: Vpfn,
        level: Level,
    },
}

#[derive(Debug)]
pub struct PageMetadata {
    state: AtomicU8,
    backref: SpinLock<Option<BackRef>>,
}

impl PageMetadata {
    const fn new(state: PageState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            backref: SpinLock::new(None),
        }
    }

    /// Current state, ignoring isolation.
    #[must_use]
    pub fn state(&self) -> PageState {
        PageState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.state.load(Ordering::Acquire) & ISOLATED != 0
    }

    #[must_use]
    pub fn backref(&self) -> Option<BackRef> {
        *self.backref.lock()
    }

    /// Claim the page for migration.
    ///
    /// Succeeds only for a mapped, not yet isolated page and returns its
    /// state at the time of the claim.
    pub fn try_isolate(&self) -> Result<PageState, MigrationError> {
        let mut raw = self.state.load(Ordering::Acquire);
        loop {
            let state = PageState::from_raw(raw);
            if raw & ISOLATED != 0 {
                return Err(MigrationError::StateChanged);
            }
            if state == PageState::NotMovable {
                return Err(MigrationError::NotMovable);
            }
            if !state.is_movable() {
                return Err(MigrationError::StateChanged);
            }
            match self.state.compare_exchange_weak(
                raw,
                raw | ISOLATED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(now) => raw = now,
            }
        }
    }

    /// Drop a migration claim without changing the base state.
    pub fn release_isolation(&self) {
        self.state.fetch_and(!ISOLATED, Ordering::AcqRel);
    }

    /// Replace the base state, keeping the isolation bit.
    fn set_state(&self, state: PageState) {
        let mut raw = self.state.load(Ordering::Acquire);
        loop {
            let next = (raw & ISOLATED) | state as u8;
            match self
                .state
                .compare_exchange_weak(raw, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(now) => raw = now,
            }
        }
    }

    fn reset(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
        *self.backref.lock() = None;
    }
}

/// All tracked pages of a device, keyed by pool page address.
#[derive(Debug, Default)]
pub struct MetadataTable {
    pages: SpinLock<BTreeMap<PhysicalAddress, Arc<PageMetadata>>>,
}

impl MetadataTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, pa: PhysicalAddress) -> Option<Arc<PageMetadata>> {
        self.pages.with_lock(|p| p.get(&pa).cloned())
    }

    fn entry(&self, pa: PhysicalAddress) -> Arc<PageMetadata> {
        self.pages.with_lock(|p| {
            p.entry(pa)
                .or_insert_with(|| Arc::new(PageMetadata::new(PageState::Free)))
                .clone()
        })
    }

    /// Current state of `pa`; untracked pages read as [`PageState::Free`].
    #[must_use]
    pub fn state(&self, pa: PhysicalAddress) -> PageState {
        self.get(pa).map_or(PageState::Free, |m| m.state())
    }

    /// A page left the pool.
    pub fn allocated(&self, pa: PhysicalAddress) {
        self.entry(pa).reset(PageState::AllocateInProgress);
    }

    /// A page got mapped; the state follows the kind of back-reference.
    ///
    /// Pages marked [`PageState::NotMovable`] stay so.
    pub fn set_mapped(&self, pa: PhysicalAddress, backref: BackRef) {
        let meta = self.entry(pa);
        *meta.backref.lock() = Some(backref);
        if meta.state() != PageState::NotMovable {
            meta.set_state(match backref {
                BackRef::Data { .. } => PageState::DataMapped,
                BackRef::PageTable { .. } => PageState::PageTableMapped,
            });
        }
    }

    pub fn mark_not_movable(&self, pa: PhysicalAddress) {
        self.entry(pa).set_state(PageState::NotMovable);
    }

    /// First half of returning a page: no new migration can claim it.
    pub fn begin_free(&self, pa: PhysicalAddress) {
        if let Some(meta) = self.get(pa) {
            meta.set_state(PageState::FreeInProgress);
        }
    }

    /// The page is back in the pool.
    pub fn finish_free(&self, pa: PhysicalAddress) {
        if let Some(meta) = self.get(pa) {
            meta.reset(PageState::Free);
        }
    }

    /// Move state and back-reference from `old` to `new`; `old` becomes free.
    pub fn transfer(&self, old: PhysicalAddress, new: PhysicalAddress) {
        let Some(from) = self.get(old) else {
            return;
        };
        let to = self.entry(new);
        *to.backref.lock() = from.backref();
        to.state.store(from.state() as u8, Ordering::Release);
        from.reset(PageState::Free);
    }

    /// Number of tracked pages in `state`.
    #[must_use]
    pub fn count(&self, state: PageState) -> usize {
        self.pages
            .with_lock(|p| p.values().filter(|m| m.state() == state).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_ref() -> BackRef {
        BackRef::Data {
            context: ContextId::new(1),
            region: RegionId::new(2),
            vpfn: Vpfn::new(0x40),
        }
    }

    #[test]
    fn lifecycle_of_a_data_page() {
        let t = MetadataTable::new();
        let pa = PhysicalAddress::new(0x1000);
        t.allocated(pa);
        assert_eq!(t.state(pa), PageState::AllocateInProgress);
        t.set_mapped(pa, data_ref());
        assert_eq!(t.state(pa), PageState::DataMapped);
        t.begin_free(pa);
        assert_eq!(t.state(pa), PageState::FreeInProgress);
        t.finish_free(pa);
        assert_eq!(t.state(pa), PageState::Free);
        assert_eq!(t.get(pa).unwrap().backref(), None);
    }

    #[test]
    fn isolation_is_exclusive() {
        let t = MetadataTable::new();
        let pa = PhysicalAddress::new(0x2000);
        t.allocated(pa);
        assert_eq!(
            t.get(pa).unwrap().try_isolate(),
            Err(MigrationError::StateChanged)
        );

        t.set_mapped(pa, data_ref());
        let meta = t.get(pa).unwrap();
        assert_eq!(meta.try_isolate(), Ok(PageState::DataMapped));
        assert!(meta.is_isolated());
        assert_eq!(meta.try_isolate(), Err(MigrationError::StateChanged));
        meta.release_isolation();
        assert!(!meta.is_isolated());
        assert_eq!(meta.state(), PageState::DataMapped);
    }

    #[test]
    fn not_movable_is_sticky_until_freed() {
        let t = MetadataTable::new();
        let pa = PhysicalAddress::new(0x3000);
        t.allocated(pa);
        t.mark_not_movable(pa);
        t.set_mapped(pa, data_ref());
        assert_eq!(t.state(pa), PageState::NotMovable);
        assert_eq!(
            t.get(pa).unwrap().try_isolate(),
            Err(MigrationError::NotMovable)
        );
        t.begin_free(pa);
        t.finish_free(pa);
        t.allocated(pa);
        assert_eq!(t.state(pa), PageState::AllocateInProgress);
    }

    #[test]
    fn transfer_moves_the_backref() {
        let t = MetadataTable::new();
        let old = PhysicalAddress::new(0x4000);
        let new = PhysicalAddress::new(0x5000);
        t.allocated(old);
        t.set_mapped(old, data_ref());
        t.get(old).unwrap().try_isolate().unwrap();

        t.transfer(old, new);
        assert_eq!(t.state(old), PageState::Free);
        assert!(!t.get(old).unwrap().is_isolated());
        assert_eq!(t.state(new), PageState::DataMapped);
        assert!(!t.get(new).unwrap().is_isolated());
        assert_eq!(t.get(new).unwrap().backref(), Some(data_ref()));
    }
}
