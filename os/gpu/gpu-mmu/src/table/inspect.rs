//! Read-only queries and self-checks of a table.

use super::{MmuTable, walk};
use crate::entry::{EntryKind, MapFlags};
use crate::error::MmuError;
use crate::level::Level;
use crate::{ENTRIES_PER_PGD, LEVELS};
use alloc::vec::Vec;
use gpu_memory_addresses::{PageSize, PhysicalAddress, Size4K, Vpfn};
use log::info;

/// Result of a software walk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    /// Physical address of the 4 KiB page backing the VPFN.
    pub pa: PhysicalAddress,
    pub flags: MapFlags,
    /// Level of the ATE: [`Level::HUGE`] or [`Level::LEAF`].
    pub level: Level,
    pub group: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct TableUsage {
    /// Live PGDs, root included.
    pub pgds: usize,
    /// Pool pages holding them.
    pub pgd_pages: usize,
    /// Valid entries summed per level.
    pub valid_entries: [usize; LEVELS],
}

impl MmuTable {
    #[must_use]
    pub fn translate(&self, vpfn: Vpfn) -> Option<Translation> {
        let inner = self.inner.lock();
        let end = walk(&self.shared, &inner, vpfn);
        if !end.is_page() {
            return None;
        }
        let offset = (vpfn - end.level.entry_base(vpfn)) * Size4K::SIZE;
        Some(Translation {
            pa: end.entry.physical_address() + offset,
            flags: end.entry.flags(),
            level: end.level,
            group: end.entry.group_id(),
        })
    }

    #[must_use]
    pub fn usage(&self) -> TableUsage {
        let inner = self.inner.lock();
        let mut usage = TableUsage {
            pgds: inner.arena.len(),
            pgd_pages: inner.allocator.page_count(),
            ..TableUsage::default()
        };
        for (_, node) in inner.arena.iter() {
            usage.valid_entries[node.level.get() as usize] += usize::from(node.valid);
        }
        usage
    }

    /// Verify that the physical tree and its software shadow agree.
    ///
    /// Checks valid counts, child links, ATE placement, that no PGD other
    /// than the root is empty and that every PGD is reachable.
    pub fn check_invariants(&self) -> Result<(), MmuError> {
        let inner = self.inner.lock();
        for (_, node) in inner.arena.iter() {
            let mut valid = 0_u16;
            for index in 0..ENTRIES_PER_PGD {
                let entry = self.read(node.pa, index);
                let child = node.child(index);
                let consistent = match entry.kind() {
                    EntryKind::Invalid => child.is_none(),
                    EntryKind::Page => node.level.allows_page_entry() && child.is_none(),
                    EntryKind::Table => child.is_some_and(|c| {
                        let c = &inner.arena[c];
                        c.pa == entry.physical_address()
                            && Some(c.level) == node.level.child()
                            && c.base == node.base + index as u64 * node.level.span_pages()
                    }),
                };
                if !consistent {
                    return Err(self.corruption(node.level, index));
                }
                if entry.is_valid() {
                    valid += 1;
                }
            }
            if valid != node.valid || (valid == 0 && node.level != Level::ROOT) {
                return Err(self.corruption(node.level, 0));
            }
        }

        let reachable = inner.arena.post_order(inner.root).len();
        if reachable != inner.arena.len() || inner.allocator.live_slots() != reachable {
            return Err(self.corruption(Level::ROOT, 0));
        }
        Ok(())
    }

    /// Level and address of every linked PGD on the path to `vpfn`, root
    /// first.
    #[must_use]
    pub fn pgd_path(&self, vpfn: Vpfn) -> Vec<(Level, PhysicalAddress)> {
        let inner = self.inner.lock();
        let mut path = Vec::with_capacity(LEVELS);
        let mut node = Some(inner.root);
        while let Some(handle) = node {
            let n = &inner.arena[handle];
            path.push((n.level, n.pa));
            node = n.child(n.level.index(vpfn));
        }
        path
    }

    /// Log every entry on the path to `vpfn`.
    pub fn dump_walk(&self, vpfn: Vpfn) {
        let inner = self.inner.lock();
        info!("{} walk of {vpfn:?}", self.id);
        let mut node = Some(inner.root);
        while let Some(handle) = node {
            let n = &inner.arena[handle];
            let index = n.level.index(vpfn);
            let entry = self.read(n.pa, index);
            info!(
                "  {} PGD {:?}[{index}] = {:#018x} ({:?}, valid {})",
                n.level,
                n.pa,
                entry.into_bits(),
                entry.kind(),
                n.valid
            );
            node = match entry.kind() {
                EntryKind::Table => n.child(index),
                EntryKind::Invalid | EntryKind::Page => None,
            };
        }
    }
}
