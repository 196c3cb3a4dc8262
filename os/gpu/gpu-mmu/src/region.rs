//! Virtual regions of a context and their physical backing.

use crate::config::MmuConfig;
use crate::entry::MapFlags;
use crate::error::RegionError;
use crate::pool::PageClass;
use crate::table::VPFN_LIMIT;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use gpu_memory_addresses::{PageSize, PhysicalAddress, Size2M, Vpfn, VpfnRange};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const CACHED = 1 << 3;
        const COHERENT = 1 << 4;
        /// Backing grows on demand when the GPU faults past it.
        const GROWABLE = 1 << 5;
        /// Backed by 2 MiB pages and mapped with huge entries.
        const LARGE_PAGES = 1 << 6;
    }
}

impl RegionFlags {
    /// Entry flags for pages of a region with these flags.
    #[must_use]
    pub fn map_flags(self) -> MapFlags {
        let mut flags = MapFlags::empty();
        flags.set(MapFlags::READ, self.contains(Self::READ));
        flags.set(MapFlags::WRITE, self.contains(Self::WRITE));
        flags.set(MapFlags::NO_EXECUTE, !self.contains(Self::EXECUTE));
        flags.set(MapFlags::CACHED, self.contains(Self::CACHED));
        flags.set(MapFlags::COHERENT, self.contains(Self::COHERENT));
        flags
    }
}

/// Creation parameters of a region. All sizes are in GPU pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionDesc {
    pub start: Vpfn,
    pub nr_pages: u64,
    /// Pages backed at creation.
    pub initial_commit: u64,
    /// Minimum growth step of a growable region; `0` grows by one granule.
    pub extension: u64,
    pub flags: RegionFlags,
    /// Memory group of every entry of the region, `0..16`.
    pub group: u8,
}

impl RegionDesc {
    #[must_use]
    pub const fn new(start: Vpfn, nr_pages: u64, flags: RegionFlags) -> Self {
        Self {
            start,
            nr_pages,
            initial_commit: nr_pages,
            extension: 0,
            flags,
            group: 0,
        }
    }

    #[must_use]
    pub const fn with_initial_commit(mut self, pages: u64) -> Self {
        self.initial_commit = pages;
        self
    }

    #[must_use]
    pub const fn with_extension(mut self, pages: u64) -> Self {
        self.extension = pages;
        self
    }

    #[must_use]
    pub const fn with_group(mut self, group: u8) -> Self {
        self.group = group;
        self
    }

    #[must_use]
    pub const fn range(&self) -> VpfnRange {
        VpfnRange::new(self.start, self.nr_pages)
    }

    pub(crate) const fn class(&self) -> PageClass {
        if self.flags.contains(RegionFlags::LARGE_PAGES) {
            PageClass::Large
        } else {
            PageClass::Small
        }
    }

    /// GPU pages per backing page.
    pub(crate) const fn granule(&self, config: &MmuConfig) -> u64 {
        match self.class() {
            PageClass::Large => Size2M::GPU_PAGES,
            PageClass::Small => config.gpu_pages_per_pool_page(),
        }
    }

    /// Check sizes, alignment and limits against `config`.
    pub fn validate(&self, config: &MmuConfig) -> Result<(), RegionError> {
        let granule = self.granule(config);
        let start = self.start.as_u64();
        let aligned = |v: u64| v % granule == 0;
        let fits = start
            .checked_add(self.nr_pages)
            .is_some_and(|end| end <= VPFN_LIMIT);
        let valid = self.nr_pages != 0
            && fits
            && self.initial_commit <= self.nr_pages
            && aligned(start)
            && aligned(self.nr_pages)
            && aligned(self.initial_commit)
            && aligned(self.extension)
            && self.group < 16;
        if valid {
            Ok(())
        } else {
            Err(RegionError::InvalidDesc)
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(u64);

impl RegionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// One backing page of a region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Backing {
    pub pa: PhysicalAddress,
    pub class: PageClass,
}

#[derive(Debug)]
pub(crate) struct Region {
    pub id: RegionId,
    pub desc: RegionDesc,
    /// GPU pages backed and mapped, from `desc.start`.
    pub backed: u64,
    /// Backing pages in mapping order.
    pub backing: Vec<Backing>,
}

impl Region {
    pub const fn new(id: RegionId, desc: RegionDesc) -> Self {
        Self {
            id,
            desc,
            backed: 0,
            backing: Vec::new(),
        }
    }

    pub const fn class(&self) -> PageClass {
        self.desc.class()
    }

    /// GPU pages to add so that `rel` (relative to the start) is backed.
    ///
    /// At least the missing pages, rounded up to the extension step, never
    /// past the end of the region.
    pub fn grow_amount(&self, rel: u64, granule: u64) -> u64 {
        let needed = rel + 1 - self.backed;
        let step = if self.desc.extension == 0 {
            granule
        } else {
            self.desc.extension
        };
        needed
            .div_ceil(step)
            .saturating_mul(step)
            .min(self.desc.nr_pages - self.backed)
    }

    /// Backing page and GPU page offset within it for the relative page
    /// `rel`.
    pub fn backing_of(&self, rel: u64, granule: u64) -> Option<(usize, Backing)> {
        let index = usize::try_from(rel / granule).ok()?;
        self.backing.get(index).map(|&b| (index, b))
    }
}

/// Regions of one context, ordered by start VPFN.
#[derive(Debug, Default)]
pub(crate) struct RegionList {
    regions: BTreeMap<Vpfn, Region>,
}

impl RegionList {
    pub fn insert(&mut self, region: Region) -> Result<(), RegionError> {
        let range = region.desc.range();
        let before = self.regions.range(..range.end()).next_back();
        if before.is_some_and(|(_, r)| r.desc.range().overlaps(range)) {
            return Err(RegionError::Overlap);
        }
        self.regions.insert(range.start, region);
        Ok(())
    }

    /// The region containing `vpfn`.
    pub fn find_mut(&mut self, vpfn: Vpfn) -> Option<&mut Region> {
        self.regions
            .range_mut(..=vpfn)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.desc.range().contains(vpfn))
    }

    pub fn by_id_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.values_mut().find(|r| r.id == id)
    }

    pub fn remove(&mut self, id: RegionId) -> Option<Region> {
        let start = self.regions.values().find(|r| r.id == id)?.desc.start;
        self.regions.remove(&start)
    }

    pub fn drain(&mut self) -> Vec<Region> {
        core::mem::take(&mut self.regions).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(start: u64, pages: u64) -> RegionDesc {
        RegionDesc::new(Vpfn::new(start), pages, RegionFlags::READ | RegionFlags::WRITE)
    }

    #[test]
    fn map_flags_follow_region_flags() {
        let f = (RegionFlags::READ | RegionFlags::CACHED).map_flags();
        assert_eq!(f, MapFlags::READ | MapFlags::NO_EXECUTE | MapFlags::CACHED);
        let f = (RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXECUTE).map_flags();
        assert_eq!(f, MapFlags::READ | MapFlags::WRITE);
    }

    #[test]
    fn validation() {
        let cfg = MmuConfig::new();
        assert!(desc(0x100, 16).validate(&cfg).is_ok());
        assert!(desc(0x100, 0).validate(&cfg).is_err());
        assert!(desc(0x100, 16).with_initial_commit(17).validate(&cfg).is_err());
        assert!(desc(VPFN_LIMIT - 1, 2).validate(&cfg).is_err());
        assert!(desc(0x100, 16).with_group(16).validate(&cfg).is_err());

        let packed = MmuConfig::new().with_pool_page_shift(14);
        assert!(desc(0x100, 16).validate(&packed).is_ok());
        assert!(desc(0x101, 16).validate(&packed).is_err());

        let large = RegionDesc::new(Vpfn::new(512), 1024, RegionFlags::READ | RegionFlags::LARGE_PAGES);
        assert!(large.validate(&cfg).is_ok());
        assert!(large.with_initial_commit(100).validate(&cfg).is_err());
    }

    #[test]
    fn grow_amount_rounds_to_extension() {
        let mut r = Region::new(RegionId::new(1), desc(0, 100).with_initial_commit(0).with_extension(16));
        r.backed = 4;
        assert_eq!(r.grow_amount(4, 1), 16);
        assert_eq!(r.grow_amount(20, 1), 32);
        r.backed = 96;
        assert_eq!(r.grow_amount(99, 1), 4);

        let r = Region::new(RegionId::new(2), desc(0, 100).with_initial_commit(0));
        assert_eq!(r.grow_amount(9, 1), 10);
    }

    #[test]
    fn list_rejects_overlap_and_finds_containing_region() {
        let mut list = RegionList::default();
        list.insert(Region::new(RegionId::new(1), desc(0x100, 16))).unwrap();
        list.insert(Region::new(RegionId::new(2), desc(0x200, 16))).unwrap();
        assert_eq!(
            list.insert(Region::new(RegionId::new(3), desc(0x10F, 2))),
            Err(RegionError::Overlap)
        );
        assert_eq!(
            list.insert(Region::new(RegionId::new(3), desc(0x80, 0x100))),
            Err(RegionError::Overlap)
        );
        list.insert(Region::new(RegionId::new(3), desc(0x110, 0xF0))).unwrap();

        assert_eq!(list.find_mut(Vpfn::new(0x10F)).map(|r| r.id), Some(RegionId::new(1)));
        assert_eq!(list.find_mut(Vpfn::new(0x1FF)).map(|r| r.id), Some(RegionId::new(3)));
        assert!(list.find_mut(Vpfn::new(0x210)).is_none());
        assert!(list.find_mut(Vpfn::new(0x10)).is_none());

        assert!(list.remove(RegionId::new(1)).is_some());
        assert!(list.find_mut(Vpfn::new(0x100)).is_none());
        assert_eq!(list.len(), 2);
        assert_eq!(list.drain().len(), 2);
    }
}
