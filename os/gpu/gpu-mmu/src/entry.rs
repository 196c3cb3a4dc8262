//! 64-bit translation table entries.

use bitfield_struct::bitfield;
use bitflags::bitflags;
use gpu_memory_addresses::PhysicalAddress;

/// Raw translation-table entry of the GPU MMU.
///
/// All levels share one layout. The two low bits select the entry kind:
///
/// | Bits   | Field              | Meaning |
/// |--------|--------------------|---------|
/// | 0..=1  | `kind`             | `0` invalid, `1` PTE (next-level PGD), `2` ATE (data page) |
/// | 2      | `readable`         | ATE only |
/// | 3      | `writable`         | ATE only |
/// | 4      | `no_execute`       | ATE only |
/// | 5..=7  | `memory_attribute` | Index into the attribute table: `0` uncached, `1` cached |
/// | 8      | `shareable`        | Coherent with the CPU |
/// | 9..=11 | reserved           | |
/// | 12..=47| address            | Physical address bits [47:12] |
/// | 48..=51| `group_id`         | Physical memory group of the target |
/// | 52..=63| reserved           | |
///
/// An ATE at level 2 maps a 2 MiB run ("huge entry"); at level 3 it maps one
/// 4 KiB page.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct EntryBits {
    #[bits(2)]
    kind_bits: u8,
    pub readable: bool,
    pub writable: bool,
    pub no_execute: bool,
    #[bits(3)]
    pub memory_attribute: u8,
    pub shareable: bool,
    #[bits(3)]
    __: u8,
    #[bits(36)]
    phys_addr_bits_47_12: u64,
    #[bits(4)]
    pub group_id: u8,
    #[bits(12)]
    __: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Invalid,
    /// Points at the next-level PGD.
    Table,
    /// Points at a data page.
    Page,
}

const KIND_TABLE: u8 = 1;
const KIND_PAGE: u8 = 2;

const ATTR_UNCACHED: u8 = 0;
const ATTR_CACHED: u8 = 1;

bitflags! {
    /// Access and caching attributes of a mapping.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const NO_EXECUTE = 1 << 2;
        const CACHED = 1 << 3;
        const COHERENT = 1 << 4;
    }
}

impl EntryBits {
    #[inline]
    #[must_use]
    pub const fn invalid() -> Self {
        Self::new()
    }

    /// PTE pointing at the PGD at `pgd`.
    #[inline]
    #[must_use]
    pub const fn table(pgd: PhysicalAddress) -> Self {
        Self::new()
            .with_kind_bits(KIND_TABLE)
            .with_phys_addr_bits_47_12(pgd.as_u64() >> 12)
    }

    /// ATE pointing at the data page at `page`.
    #[inline]
    #[must_use]
    pub const fn page(page: PhysicalAddress, flags: MapFlags, group: u8) -> Self {
        Self::new()
            .with_kind_bits(KIND_PAGE)
            .with_phys_addr_bits_47_12(page.as_u64() >> 12)
            .with_readable(flags.contains(MapFlags::READ))
            .with_writable(flags.contains(MapFlags::WRITE))
            .with_no_execute(flags.contains(MapFlags::NO_EXECUTE))
            .with_memory_attribute(if flags.contains(MapFlags::CACHED) {
                ATTR_CACHED
            } else {
                ATTR_UNCACHED
            })
            .with_shareable(flags.contains(MapFlags::COHERENT))
            .with_group_id(group & 0xF)
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> EntryKind {
        match self.kind_bits() {
            KIND_TABLE => EntryKind::Table,
            KIND_PAGE => EntryKind::Page,
            _ => EntryKind::Invalid,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        !matches!(self.kind(), EntryKind::Invalid)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_47_12() << 12)
    }

    /// Same entry, retargeted to `pa`. Kind and attributes are kept.
    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_phys_addr_bits_47_12(pa.as_u64() >> 12)
    }

    /// Attributes of an ATE; empty for anything else.
    #[must_use]
    pub const fn flags(&self) -> MapFlags {
        if !matches!(self.kind(), EntryKind::Page) {
            return MapFlags::empty();
        }
        let mut bits = 0;
        if self.readable() {
            bits |= MapFlags::READ.bits();
        }
        if self.writable() {
            bits |= MapFlags::WRITE.bits();
        }
        if self.no_execute() {
            bits |= MapFlags::NO_EXECUTE.bits();
        }
        if self.memory_attribute() == ATTR_CACHED {
            bits |= MapFlags::CACHED.bits();
        }
        if self.shareable() {
            bits |= MapFlags::COHERENT.bits();
        }
        MapFlags::from_bits_truncate(bits)
    }
}
