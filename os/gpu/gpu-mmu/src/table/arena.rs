//! Software shadow of the PGD tree.
//!
//! Nodes live in a slab and refer to their children by [`PgdHandle`], so
//! parent/child links never alias. The physical entries stay the source of
//! truth for the GPU; the arena carries what the hardware does not need:
//! valid-entry counts and child handles.

use crate::level::Level;
use crate::{ENTRIES_PER_PGD, LEVELS};
use alloc::vec;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::ops::{Index, IndexMut};
use gpu_memory_addresses::{PhysicalAddress, Vpfn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PgdHandle(u32);

#[derive(Debug)]
pub struct PgdNode {
    pub pa: PhysicalAddress,
    pub level: Level,
    /// First VPFN covered by this PGD.
    pub base: Vpfn,
    /// Non-invalid entries in the physical PGD.
    pub valid: u16,
    /// Child handle per entry; empty at the leaf level.
    pub children: Vec<Option<PgdHandle>>,
}

impl PgdNode {
    pub fn new(pa: PhysicalAddress, level: Level, base: Vpfn) -> Self {
        let children = if level == Level::LEAF {
            Vec::new()
        } else {
            vec![None; ENTRIES_PER_PGD]
        };
        Self {
            pa,
            level,
            base,
            valid: 0,
            children,
        }
    }

    #[inline]
    pub fn child(&self, index: usize) -> Option<PgdHandle> {
        self.children.get(index).copied().flatten()
    }
}

#[derive(Debug, Default)]
pub struct PgdArena {
    nodes: Vec<Option<PgdNode>>,
    vacant: Vec<u32>,
    live: usize,
}

impl PgdArena {
    pub fn insert(&mut self, node: PgdNode) -> PgdHandle {
        self.live += 1;
        if let Some(slot) = self.vacant.pop() {
            self.nodes[slot as usize] = Some(node);
            return PgdHandle(slot);
        }
        self.nodes.push(Some(node));
        PgdHandle((self.nodes.len() - 1) as u32)
    }

    pub fn remove(&mut self, handle: PgdHandle) -> Option<PgdNode> {
        let node = self.nodes.get_mut(handle.0 as usize)?.take()?;
        self.vacant.push(handle.0);
        self.live -= 1;
        Some(node)
    }

    pub fn get(&self, handle: PgdHandle) -> Option<&PgdNode> {
        self.nodes.get(handle.0 as usize)?.as_ref()
    }

    pub const fn len(&self) -> usize {
        self.live
    }

    pub fn iter(&self) -> impl Iterator<Item = (PgdHandle, &PgdNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (PgdHandle(i as u32), n)))
    }

    /// Handles of the subtree under `root`, children before parents.
    pub fn post_order(&self, root: PgdHandle) -> Vec<PgdHandle> {
        let mut out = Vec::with_capacity(self.live);
        let mut stack: ArrayVec<(PgdHandle, usize), LEVELS> = ArrayVec::new();
        stack.push((root, 0));
        while let Some((handle, next)) = stack.pop() {
            let node = &self[handle];
            let pending = node
                .children
                .iter()
                .enumerate()
                .skip(next)
                .find_map(|(i, c)| c.map(|c| (i, c)));
            match pending {
                Some((i, child)) => {
                    stack.push((handle, i + 1));
                    stack.push((child, 0));
                }
                None => out.push(handle),
            }
        }
        out
    }
}

impl Index<PgdHandle> for PgdArena {
    type Output = PgdNode;

    fn index(&self, handle: PgdHandle) -> &PgdNode {
        match self.get(handle) {
            Some(node) => node,
            None => panic!("stale PGD handle {handle:?}"),
        }
    }
}

impl IndexMut<PgdHandle> for PgdArena {
    fn index_mut(&mut self, handle: PgdHandle) -> &mut PgdNode {
        match self.nodes.get_mut(handle.0 as usize).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("stale PGD handle {handle:?}"),
        }
    }
}
