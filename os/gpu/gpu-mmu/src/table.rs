//! # Per-context translation tables
//!
//! An [`MmuTable`] owns a four-level tree of PGDs (512 entries each) that
//! maps GPU virtual page numbers to physical pages:
//!
//! | Level | Entry covers | May hold |
//! |-------|--------------|----------|
//! | 0 (root) | 512 GiB | PTE |
//! | 1 | 1 GiB | PTE |
//! | 2 | 2 MiB | PTE or huge ATE |
//! | 3 (leaf) | 4 KiB | ATE |
//!
//! All mutation happens under the table mutex. A mutation either installs
//! entries into invalid slots ([`MmuTable::map`]), removes them
//! ([`MmuTable::unmap`]) or rewrites existing ATEs in place
//! ([`MmuTable::update_flags`]); each call ends with exactly one cache/TLB
//! flush chosen by the [`FlushCoordinator`](crate::FlushCoordinator).
//!
//! ## Installing
//!
//! Missing levels are allocated deepest first, the target entries are
//! written, and only then are the new PGDs linked into their parents from
//! the bottom up. A failure before linking leaves nothing visible; a failure
//! in a later chunk of the same call tears down the chunks already written.
//! If the closing flush fails the GPU has been reset, and everything the
//! call installed is removed again without another flush.
//!
//! ## Removing
//!
//! Entries are invalidated, and a PGD whose valid count drops to zero is
//! unlinked from its parent, walking up a captured ancestor path. Unlinked
//! PGDs go to a bounded batch and are released only after the flush.

mod arena;
mod insert;
mod inspect;
mod relocate;
mod teardown;

use crate::context::ContextId;
use crate::device::DeviceShared;
use crate::entry::{EntryBits, EntryKind, MapFlags};
use crate::error::MmuError;
use crate::flush::{DirtyLines, FlushOp, FlushRequest, FlushStrategy};
use crate::hardware::AsNr;
use crate::level::{DirtyLevels, Level};
use crate::memory::entry_address;
use crate::metadata::BackRef;
use crate::pgd_alloc::{PgdAllocator, PgdFree};
use crate::pool::{PageAccount, PageClass};
use crate::{BITS_PER_LEVEL, LEVELS, MAX_FREE_PGDS};
use alloc::sync::Arc;
use alloc::vec::Vec;
use arena::{PgdArena, PgdHandle, PgdNode};
use arrayvec::ArrayVec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use gpu_memory_addresses::{PageSize, PhysicalAddress, Size2M, Size4K, Vpfn, VpfnRange};
use gpu_sync::SpinLock;
use log::{debug, error, trace, warn};

pub use inspect::{TableUsage, Translation};
pub(crate) use relocate::RelocateTarget;

/// One past the highest VPFN a four-level tree can translate.
pub const VPFN_LIMIT: u64 = 1 << (LEVELS as u32 * BITS_PER_LEVEL);

const NO_ADDRESS_SPACE: u32 = u32::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(u64);

impl TableId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

struct TableInner {
    arena: PgdArena,
    root: PgdHandle,
    allocator: PgdAllocator,
    /// PGDs unlinked by the current call, released after the next flush.
    free_batch: ArrayVec<PhysicalAddress, MAX_FREE_PGDS>,
}

/// How a failed [`MmuTable::map`] undoes its partial work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rollback {
    Flush,
    /// The GPU was already reset; PGDs can be released without a flush.
    AfterReset,
}

/// Per-call bookkeeping of a mutation.
struct OpState {
    range: VpfnRange,
    dirty: DirtyLevels,
    lines: DirtyLines,
}

impl OpState {
    const fn new(range: VpfnRange) -> Self {
        Self {
            range,
            dirty: DirtyLevels::empty(),
            lines: DirtyLines::new(),
        }
    }
}

pub struct MmuTable {
    id: TableId,
    owner: Option<ContextId>,
    shared: Arc<DeviceShared>,
    account: Arc<PageAccount>,
    address_space: AtomicU32,
    inner: SpinLock<TableInner>,
}

impl MmuTable {
    /// Create a table with its root PGD, growing the pool if needed.
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        owner: Option<ContextId>,
        account: Arc<PageAccount>,
    ) -> Result<Self, MmuError> {
        let id = shared.next_table_id();
        let mut allocator = PgdAllocator::new(shared.config.pgds_per_pool_page());

        let mut root_page = None;
        for _ in 0..=shared.config.max_fault_retries {
            match shared.alloc_page(PageClass::Small) {
                Ok(page) => {
                    root_page = Some(page);
                    break;
                }
                Err(_) => shared.pool.grow(PageClass::Small, 1)?,
            }
        }
        let page = root_page.ok_or(MmuError::OutOfMemory)?;
        account.charge_pgd();
        shared.metadata.mark_not_movable(page);
        let root_pa = allocator.adopt(page);

        let mut arena = PgdArena::default();
        let root = arena.insert(PgdNode::new(root_pa, Level::ROOT, Vpfn::new(0)));
        debug!("{id} created, root PGD at {root_pa:?}");

        Ok(Self {
            id,
            owner,
            shared,
            account,
            address_space: AtomicU32::new(NO_ADDRESS_SPACE),
            inner: SpinLock::new(TableInner {
                arena,
                root,
                allocator,
                free_batch: ArrayVec::new(),
            }),
        })
    }

    #[must_use]
    pub const fn id(&self) -> TableId {
        self.id
    }

    /// Owning context; `None` for the firmware table.
    #[must_use]
    pub const fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    /// Physical address of the root PGD.
    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        self.inner.with_lock(|i| i.arena[i.root].pa)
    }

    /// Hardware address space the table is bound to, if scheduled.
    #[must_use]
    pub fn address_space(&self) -> Option<AsNr> {
        match self.address_space.load(Ordering::Acquire) {
            NO_ADDRESS_SPACE => None,
            as_nr => Some(as_nr),
        }
    }

    pub(crate) fn bind(&self, as_nr: AsNr) {
        self.address_space.store(as_nr, Ordering::Release);
    }

    pub(crate) fn unbind(&self) {
        self.address_space
            .store(NO_ADDRESS_SPACE, Ordering::Release);
    }

    /// Install translations for `pages` starting at `vpfn`.
    ///
    /// Runs of 512 pages that start on a 2 MiB boundary in both address
    /// spaces are installed as a single huge entry. Either every page is
    /// mapped or the table is left as it was.
    pub fn map(
        &self,
        vpfn: Vpfn,
        pages: &[PhysicalAddress],
        flags: MapFlags,
        group: u8,
    ) -> Result<DirtyLevels, MmuError> {
        let count = pages.len() as u64;
        check_range(vpfn, count)?;
        if pages.iter().any(|p| !p.is_aligned::<Size4K>()) {
            return Err(MmuError::InvalidRange);
        }
        if count == 0 {
            return Ok(DirtyLevels::empty());
        }

        let mut inner = self.inner.lock();
        let mut op = OpState::new(VpfnRange::new(vpfn, count));
        let mut done = 0_u64;
        while done < count {
            let rest = &pages[done as usize..];
            match self.insert_chunk(&mut inner, &mut op, vpfn + done, rest, flags, group) {
                Ok(n) => done += n,
                Err(e) => {
                    debug!("{} map of {count} pages at {vpfn:?} failed after {done}: {e}", self.id);
                    self.roll_back(&mut inner, vpfn, done, Rollback::Flush);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.flush(&op, FlushOp::Insert) {
            // The GPU was reset, so nothing it cached survives the rollback.
            debug!("{} map of {count} pages at {vpfn:?} not flushed: {e}", self.id);
            self.roll_back(&mut inner, vpfn, count, Rollback::AfterReset);
            return Err(e);
        }
        trace!("{} mapped {count} pages at {vpfn:?}", self.id);
        Ok(op.dirty)
    }

    /// Undo the first `done` pages of a failed [`map`](Self::map).
    fn roll_back(&self, inner: &mut TableInner, vpfn: Vpfn, done: u64, how: Rollback) {
        if done == 0 {
            return;
        }
        let mut undo = OpState::new(VpfnRange::new(vpfn, done));
        if let Err(e) = self.teardown_range(inner, &mut undo, vpfn, done) {
            error!("{} rollback of {done} pages at {vpfn:?} failed: {e}", self.id);
        }
        match how {
            Rollback::Flush => {
                if let Err(e) = self.flush_and_release(inner, &mut undo) {
                    error!("{} rollback flush failed: {e}", self.id);
                }
            }
            Rollback::AfterReset => self.release_batch(inner),
        }
    }

    /// Remove the translations of `count` pages starting at `vpfn`.
    ///
    /// Holes are skipped. A huge entry must be removed as a whole; a range
    /// that covers only part of one fails with [`MmuError::HugeSplit`]
    /// before anything is changed.
    pub fn unmap(&self, vpfn: Vpfn, count: u64) -> Result<DirtyLevels, MmuError> {
        check_range(vpfn, count)?;
        if count == 0 {
            return Ok(DirtyLevels::empty());
        }

        let mut inner = self.inner.lock();
        self.check_huge_split(&inner, vpfn, count)?;

        let mut op = OpState::new(VpfnRange::new(vpfn, count));
        let removed = self.teardown_range(&mut inner, &mut op, vpfn, count);
        let flushed = self.flush_and_release(&mut inner, &mut op);
        removed?;
        flushed?;
        trace!("{} unmapped {count} pages at {vpfn:?}", self.id);
        Ok(op.dirty)
    }

    /// Rewrite existing ATEs of `pages.len()` pages at `vpfn` to point at
    /// `pages` with `flags`. Topology and valid counts do not change.
    ///
    /// A data page replaced by another hands its back-reference to the new
    /// page and is left allocated but unmapped. If the flush fails the old
    /// entries are restored.
    pub fn update_flags(
        &self,
        vpfn: Vpfn,
        pages: &[PhysicalAddress],
        flags: MapFlags,
    ) -> Result<DirtyLevels, MmuError> {
        let count = pages.len() as u64;
        check_range(vpfn, count)?;
        if pages.iter().any(|p| !p.is_aligned::<Size4K>()) {
            return Err(MmuError::InvalidRange);
        }
        if count == 0 {
            return Ok(DirtyLevels::empty());
        }

        let mut inner = self.inner.lock();

        // Validate the whole range before writing anything.
        let mut cur = 0_u64;
        while cur < count {
            let at = vpfn + cur;
            let end = walk(&self.shared, &inner, at);
            if !end.is_page() {
                return Err(MmuError::NoMapping(at));
            }
            if end.level == Level::HUGE {
                let chunk = &pages[cur as usize..];
                if !at.is_aligned::<Size2M>() || !is_huge_run(chunk) {
                    return Err(MmuError::HugeSplit(Level::HUGE.entry_base(at)));
                }
            }
            cur += end.level.span_pages();
        }

        let mut op = OpState::new(VpfnRange::new(vpfn, count));
        let mut previous = Vec::new();
        let mut moved = Vec::new();
        let mut cur = 0_u64;
        while cur < count {
            let at = vpfn + cur;
            let end = walk(&self.shared, &inner, at);
            let pgd = inner.arena[end.node].pa;
            let page = pages[cur as usize];
            let old = end.entry.physical_address();
            if old != page {
                match self.shared.metadata.get(old).and_then(|m| m.backref()) {
                    Some(backref @ BackRef::Data { vpfn: mapped, .. }) if mapped == at => {
                        moved.push((old, page, backref));
                    }
                    _ => {}
                }
            }
            previous.push((pgd, end.index, end.entry));
            self.write(&mut op, pgd, end.index, EntryBits::page(page, flags, end.entry.group_id()));
            op.dirty.mark(end.level);
            cur += end.level.span_pages();
        }

        if let Err(e) = self.flush(&op, FlushOp::Update) {
            // The GPU was reset; putting the old entries back is enough.
            for (pgd, index, entry) in previous {
                self.shared.memory.write_entry(pgd, index, entry.into_bits());
            }
            return Err(e);
        }
        // Retargeted data pages take their back-reference along; the old
        // pages go back to the caller unmapped.
        for (old, page, backref) in moved {
            self.shared.metadata.set_mapped(page, backref);
            self.shared.metadata.allocated(old);
        }
        drop(inner);
        Ok(op.dirty)
    }

    fn read(&self, pgd: PhysicalAddress, index: usize) -> EntryBits {
        EntryBits::from_bits(self.shared.memory.read_entry(pgd, index))
    }

    fn write(&self, op: &mut OpState, pgd: PhysicalAddress, index: usize, entry: EntryBits) {
        self.shared.memory.write_entry(pgd, index, entry.into_bits());
        op.lines.record(entry_address(pgd, index), 8);
    }

    fn corruption(&self, level: Level, index: usize) -> MmuError {
        error!("{} corrupt: unexpected entry at {level}[{index}]", self.id);
        MmuError::Corruption {
            level: level.get(),
            index: index as u16,
        }
    }

    /// Allocate a PGD slot for `level`, taking a pool page if no owned page
    /// has a free slot.
    fn alloc_pgd(
        &self,
        inner: &mut TableInner,
        level: Level,
        base: Vpfn,
    ) -> Result<PgdHandle, MmuError> {
        let pa = match inner.allocator.allocate() {
            Some(pa) => pa,
            None => {
                let page = self.shared.alloc_page(PageClass::Small)?;
                self.account.charge_pgd();
                if !self.shared.config.migration_supported() {
                    self.shared.metadata.mark_not_movable(page);
                }
                inner.allocator.adopt(page)
            }
        };
        trace!("{} new {level} PGD at {pa:?}", self.id);
        Ok(inner.arena.insert(PgdNode::new(pa, level, base)))
    }

    /// Record the back-reference of a freshly linked PGD.
    fn track_pgd(&self, pa: PhysicalAddress, level: Level, base: Vpfn) {
        if self.shared.config.migration_supported() {
            self.shared.metadata.set_mapped(
                pa,
                BackRef::PageTable {
                    table: self.id,
                    vpfn: base,
                    level,
                },
            );
        }
    }

    /// Give a PGD slot back; its pool page returns to the pool once empty.
    fn release_pgd(&self, inner: &mut TableInner, pa: PhysicalAddress) {
        match inner.allocator.free(pa) {
            Some(PgdFree::PageEmpty(page)) => {
                self.shared.free_pages(PageClass::Small, &[page]);
                self.account.uncharge_pgd();
            }
            Some(PgdFree::SlotReleased) => {}
            None => warn!("{} released unknown PGD {pa:?}", self.id),
        }
    }

    fn flush(&self, op: &OpState, kind: FlushOp) -> Result<FlushStrategy, MmuError> {
        let req = FlushRequest {
            as_nr: self.address_space(),
            range: op.range,
            dirty: op.dirty,
            op: kind,
            lines: &op.lines,
        };
        let shared = &self.shared;
        shared
            .flush
            .flush(&*shared.hw, &shared.hw_lock, &shared.stats, &req)
    }

    /// Flush, then release every batched PGD.
    ///
    /// Batched PGDs are released even if the flush fails: a failed flush
    /// has already reset the GPU.
    fn flush_and_release(&self, inner: &mut TableInner, op: &mut OpState) -> Result<(), MmuError> {
        let freed_pgds = !inner.free_batch.is_empty();
        let flushed = self.flush(op, FlushOp::Teardown { freed_pgds });
        self.release_batch(inner);
        op.lines.clear();
        flushed.map(|_| ())
    }

    fn release_batch(&self, inner: &mut TableInner) {
        for pa in core::mem::take(&mut inner.free_batch) {
            self.release_pgd(inner, pa);
        }
    }
}

impl Drop for MmuTable {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        let root = inner.root;
        let order = inner.arena.post_order(root);
        let count = order.len();
        for handle in order {
            if let Some(node) = inner.arena.remove(handle) {
                self.release_pgd(&mut inner, node.pa);
            }
        }
        debug!("{} destroyed, {count} PGDs released", self.id);
    }
}

impl fmt::Debug for MmuTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmuTable")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("address_space", &self.address_space())
            .finish_non_exhaustive()
    }
}

fn check_range(vpfn: Vpfn, count: u64) -> Result<(), MmuError> {
    match vpfn.as_u64().checked_add(count) {
        Some(end) if end <= VPFN_LIMIT => Ok(()),
        _ => Err(MmuError::InvalidRange),
    }
}

/// Whether `pages` starts with a physically contiguous, 2 MiB aligned run of
/// 512 pages.
fn is_huge_run(pages: &[PhysicalAddress]) -> bool {
    let span = Size2M::GPU_PAGES as usize;
    pages.len() >= span
        && pages[0].is_aligned::<Size2M>()
        && pages[..span]
            .windows(2)
            .all(|w| w[1].as_u64() == w[0].as_u64() + Size4K::SIZE)
}

/// Where a walk towards a VPFN stopped.
#[derive(Debug, Clone, Copy)]
struct WalkEnd {
    node: PgdHandle,
    level: Level,
    index: usize,
    entry: EntryBits,
}

impl WalkEnd {
    /// The walk ended on an ATE at a level that may hold one.
    fn is_page(&self) -> bool {
        self.entry.kind() == EntryKind::Page && self.level.allows_page_entry()
    }
}

/// Follow linked PTEs towards `vpfn` and stop at the first entry that is not
/// one (invalid, ATE, or a PTE the arena does not know).
fn walk(shared: &DeviceShared, inner: &TableInner, vpfn: Vpfn) -> WalkEnd {
    let mut node = inner.root;
    loop {
        let n = &inner.arena[node];
        let index = n.level.index(vpfn);
        let entry = EntryBits::from_bits(shared.memory.read_entry(n.pa, index));
        let next = match entry.kind() {
            EntryKind::Table => n
                .child(index)
                .filter(|&c| inner.arena[c].pa == entry.physical_address()),
            EntryKind::Invalid | EntryKind::Page => None,
        };
        match next {
            Some(child) => node = child,
            None => {
                return WalkEnd {
                    node,
                    level: n.level,
                    index,
                    entry,
                };
            }
        }
    }
}
