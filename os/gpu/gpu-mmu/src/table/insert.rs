use super::arena::PgdHandle;
use super::{MmuTable, OpState, TableInner, is_huge_run};
use crate::entry::{EntryBits, EntryKind, MapFlags};
use crate::error::MmuError;
use crate::level::Level;
use crate::{ENTRIES_PER_PGD, LEVELS};
use arrayvec::ArrayVec;
use gpu_memory_addresses::{PhysicalAddress, Size2M, Vpfn};

impl MmuTable {
    /// Install as many of `pages` at `vpfn` as fit into one target PGD and
    /// return how many were consumed.
    ///
    /// New levels are allocated deepest first, filled, and only then linked
    /// into the existing tree, so a failure here leaves the tree unchanged.
    pub(super) fn insert_chunk(
        &self,
        inner: &mut TableInner,
        op: &mut OpState,
        vpfn: Vpfn,
        pages: &[PhysicalAddress],
        flags: MapFlags,
        group: u8,
    ) -> Result<u64, MmuError> {
        let mut target = if vpfn.is_aligned::<Size2M>() && is_huge_run(pages) {
            Level::HUGE
        } else {
            Level::LEAF
        };

        // Descend as far as the tree already goes.
        let mut node = inner.root;
        let attach = loop {
            let n = &inner.arena[node];
            let level = n.level;
            let index = level.index(vpfn);
            let entry = self.read(n.pa, index);
            if level == target {
                if target == Level::HUGE && entry.kind() == EntryKind::Table {
                    // Already split into a leaf table; map 4K pages into it.
                    target = Level::LEAF;
                } else {
                    break None;
                }
            }
            match entry.kind() {
                EntryKind::Invalid => break Some((node, index)),
                EntryKind::Table => {
                    match n
                        .child(index)
                        .filter(|&c| inner.arena[c].pa == entry.physical_address())
                    {
                        Some(child) => node = child,
                        None => return Err(self.corruption(level, index)),
                    }
                }
                EntryKind::Page => return Err(self.corruption(level, index)),
            }
        };

        let index = target.index(vpfn);
        let count = if target == Level::HUGE {
            1
        } else {
            (ENTRIES_PER_PGD - index).min(pages.len())
        };

        let mut fresh: ArrayVec<PgdHandle, LEVELS> = ArrayVec::new();
        let dest = match attach {
            None => {
                let n = &inner.arena[node];
                for i in index..index + count {
                    if self.read(n.pa, i).is_valid() {
                        return Err(self.corruption(target, i));
                    }
                }
                node
            }
            Some((parent, _)) => {
                let top = inner.arena[parent].level;
                let mut level = target;
                while level > top {
                    match self.alloc_pgd(inner, level, level.pgd_base(vpfn)) {
                        Ok(handle) => fresh.push(handle),
                        Err(e) => {
                            for handle in fresh.drain(..) {
                                if let Some(n) = inner.arena.remove(handle) {
                                    self.release_pgd(inner, n.pa);
                                }
                            }
                            return Err(e);
                        }
                    }
                    let Some(up) = level.parent() else { break };
                    level = up;
                }
                fresh[0]
            }
        };

        let dest_pa = inner.arena[dest].pa;
        for (i, &page) in pages[..count].iter().enumerate() {
            self.write(op, dest_pa, index + i, EntryBits::page(page, flags, group));
        }
        inner.arena[dest].valid += count as u16;
        op.dirty.mark(target);

        // Link bottom-up; the tree becomes visible at the last write.
        if let Some((attach_node, _)) = attach {
            for (i, &child) in fresh.iter().enumerate() {
                let parent = fresh.get(i + 1).copied().unwrap_or(attach_node);
                let (child_pa, child_level, child_base) = {
                    let c = &inner.arena[child];
                    (c.pa, c.level, c.base)
                };
                let p = &mut inner.arena[parent];
                let slot = p.level.index(vpfn);
                let (parent_pa, parent_level) = (p.pa, p.level);
                p.valid += 1;
                p.children[slot] = Some(child);
                self.write(op, parent_pa, slot, EntryBits::table(child_pa));
                op.dirty.mark(parent_level);
                self.track_pgd(child_pa, child_level, child_base);
            }
        }

        Ok(if target == Level::HUGE {
            Level::HUGE.span_pages()
        } else {
            count as u64
        })
    }
}
