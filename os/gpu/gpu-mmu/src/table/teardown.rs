use super::arena::PgdHandle;
use super::{MmuTable, OpState, TableInner, walk};
use crate::entry::{EntryBits, EntryKind};
use crate::error::MmuError;
use crate::level::Level;
use crate::{ENTRIES_PER_PGD, LEVELS};
use arrayvec::ArrayVec;
use gpu_memory_addresses::{PhysicalAddress, Vpfn};
use log::warn;

/// What a walk for removal ended on.
enum Stop {
    /// Nothing mapped in the entry at this level.
    Hole(Level),
    /// An entry that does not match the software tree.
    Stale(Level, usize),
    /// An ATE at this level.
    Page(Level),
}

type Path = ArrayVec<(PgdHandle, usize), LEVELS>;

impl MmuTable {
    /// Reject a removal that covers only part of a huge entry.
    ///
    /// Only the first and last 2 MiB block of the range can be partially
    /// covered.
    pub(super) fn check_huge_split(
        &self,
        inner: &TableInner,
        vpfn: Vpfn,
        count: u64,
    ) -> Result<(), MmuError> {
        let start = vpfn.as_u64();
        let end = start + count;
        for at in [vpfn, Vpfn::new(end - 1)] {
            let stop = walk(&self.shared, inner, at);
            if stop.is_page() && stop.level == Level::HUGE {
                let base = Level::HUGE.entry_base(at);
                if base.as_u64() < start || base.as_u64() + Level::HUGE.span_pages() > end {
                    return Err(MmuError::HugeSplit(base));
                }
            }
        }
        Ok(())
    }

    /// Invalidate every entry in `[vpfn, vpfn + count)` and unlink PGDs
    /// that become empty. Unlinked PGDs are batched for release.
    pub(super) fn teardown_range(
        &self,
        inner: &mut TableInner,
        op: &mut OpState,
        vpfn: Vpfn,
        count: u64,
    ) -> Result<(), MmuError> {
        let end = vpfn.as_u64() + count;
        let mut cur = vpfn.as_u64();
        while cur < end {
            let at = Vpfn::new(cur);
            let mut path = Path::new();
            let stop = self.descend(inner, at, &mut path);

            cur = match stop {
                Stop::Hole(level) => next_entry(level, at),
                Stop::Stale(level, index) => {
                    warn!("{} skipping stale entry at {level}[{index}]", self.id);
                    self.shared.stats.stale_entries();
                    next_entry(level, at)
                }
                Stop::Page(level) if level == Level::HUGE => {
                    let base = Level::HUGE.entry_base(at);
                    if base != at || cur + Level::HUGE.span_pages() > end {
                        return Err(MmuError::HugeSplit(base));
                    }
                    let (node, index) = path[path.len() - 1];
                    self.invalidate(inner, op, node, index);
                    self.collapse(inner, op, &path)?;
                    cur + Level::HUGE.span_pages()
                }
                Stop::Page(_) => {
                    let (node, first) = path[path.len() - 1];
                    let pgd = inner.arena[node].pa;
                    let last = first + (ENTRIES_PER_PGD - first).min((end - cur) as usize);
                    for index in first..last {
                        match self.read(pgd, index).kind() {
                            EntryKind::Page => self.invalidate(inner, op, node, index),
                            EntryKind::Table => {
                                warn!("{} skipping stale entry at {}[{index}]", self.id, Level::LEAF);
                                self.shared.stats.stale_entries();
                            }
                            EntryKind::Invalid => {}
                        }
                    }
                    self.collapse(inner, op, &path)?;
                    cur + (last - first) as u64
                }
            };
        }
        Ok(())
    }

    /// Walk towards `at`, recording the (node, index) pair of every level.
    fn descend(&self, inner: &TableInner, at: Vpfn, path: &mut Path) -> Stop {
        let mut node = inner.root;
        loop {
            let n = &inner.arena[node];
            let level = n.level;
            let index = level.index(at);
            let entry = self.read(n.pa, index);
            path.push((node, index));
            match entry.kind() {
                EntryKind::Invalid => return Stop::Hole(level),
                EntryKind::Page if level.allows_page_entry() => return Stop::Page(level),
                EntryKind::Page => return Stop::Stale(level, index),
                EntryKind::Table => {
                    match n
                        .child(index)
                        .filter(|&c| inner.arena[c].pa == entry.physical_address())
                    {
                        Some(child) => node = child,
                        None => return Stop::Stale(level, index),
                    }
                }
            }
        }
    }

    fn invalidate(&self, inner: &mut TableInner, op: &mut OpState, node: PgdHandle, index: usize) {
        let n = &mut inner.arena[node];
        n.valid -= 1;
        let (pa, level) = (n.pa, n.level);
        self.write(op, pa, index, EntryBits::invalid());
        op.dirty.mark(level);
    }

    /// Unlink emptied PGDs along `path`, deepest first. The root stays.
    fn collapse(&self, inner: &mut TableInner, op: &mut OpState, path: &Path) -> Result<(), MmuError> {
        for depth in (1..path.len()).rev() {
            let (node, _) = path[depth];
            if inner.arena[node].valid != 0 {
                break;
            }
            let (parent, index) = path[depth - 1];
            let Some(removed) = inner.arena.remove(node) else {
                break;
            };
            inner.arena[parent].children[index] = None;
            self.invalidate(inner, op, parent, index);
            self.defer_free(inner, op, removed.pa)?;
        }
        Ok(())
    }

    /// Queue an unlinked PGD; a full batch is flushed and released first.
    fn defer_free(
        &self,
        inner: &mut TableInner,
        op: &mut OpState,
        pa: PhysicalAddress,
    ) -> Result<(), MmuError> {
        let flushed = if inner.free_batch.is_full() {
            self.flush_and_release(inner, op)
        } else {
            Ok(())
        };
        inner.free_batch.push(pa);
        flushed
    }
}

/// First VPFN past the entry at `level` that contains `at`.
const fn next_entry(level: Level, at: Vpfn) -> u64 {
    level.entry_base(at).as_u64() + level.span_pages()
}
