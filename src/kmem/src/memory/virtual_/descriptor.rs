//! VMSAv8-64 stage 1 translation descriptors (4 KiB granule)

use core::fmt;

use bitflags::bitflags;
use zerocopy::{FromBytes, FromZeroes};

use crate::config::MAIR_IDX_NORMAL_NOCACHE;
use crate::memory::PhysAddr;

bitflags! {
    /// Descriptor attribute bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const VALID = 1 << 0;
        /// Set on table (levels 0-2) and page (level 3) descriptors, clear on blocks
        const TABLE = 1 << 1;
        /// AttrIndx[2:0] selecting the normal non-cacheable MAIR slot
        const ATTR_NORMAL_NOCACHE = MAIR_IDX_NORMAL_NOCACHE << 2;
        /// AP[1]: EL0 may access
        const AP_EL0 = 1 << 6;
        /// AP[2]: read-only at every EL that may access
        const AP_RO = 1 << 7;
        const SH_INNER = 0b11 << 8;
        /// Access flag; clear means the first access faults
        const AF = 1 << 10;
        const NG = 1 << 11;
        const PXN = 1 << 53;
        const UXN = 1 << 54;
    }
}

impl PageFlags {
    /// MAIR slot selected by the AttrIndx field
    pub const fn attr_index(self) -> u64 {
        (self.bits() >> 2) & 0b111
    }
}

/// Attributes a leaf page is installed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MapKind {
    /// User-executable, read-only at EL0 and EL1
    UserCode = 0,
    /// User read-write, never executable
    UserMemory = 1,
}

impl MapKind {
    pub const fn attributes(self) -> PageFlags {
        let common = PageFlags::VALID
            .union(PageFlags::TABLE)
            .union(PageFlags::ATTR_NORMAL_NOCACHE)
            .union(PageFlags::AP_EL0)
            .union(PageFlags::SH_INNER)
            .union(PageFlags::AF)
            .union(PageFlags::PXN);
        match self {
            MapKind::UserCode => common.union(PageFlags::AP_RO),
            MapKind::UserMemory => common.union(PageFlags::UXN),
        }
    }
}

impl TryFrom<u32> for MapKind {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        match raw {
            0 => Ok(MapKind::UserCode),
            1 => Ok(MapKind::UserMemory),
            other => Err(other),
        }
    }
}

/// What a descriptor describes, given the level it was read at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Invalid,
    /// Next-level table (levels 0-2)
    Table,
    /// Block mapping (levels 1-2)
    Block,
    /// Page mapping (level 3)
    Page,
}

/// One 64-bit translation table entry
#[derive(Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    /// Output address bits [47:12]
    pub const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
    pub const INVALID: Self = Self(0);

    /// Table descriptor pointing at the next-level table at `pa`
    pub const fn table(pa: PhysAddr) -> Self {
        Self((pa.as_u64() & Self::ADDR_MASK) | PageFlags::VALID.bits() | PageFlags::TABLE.bits())
    }

    /// Level-3 page descriptor for the frame at `pa`
    pub const fn page(pa: PhysAddr, kind: MapKind) -> Self {
        Self((pa.as_u64() & Self::ADDR_MASK) | kind.attributes().bits())
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    pub const fn address(self) -> PhysAddr {
        PhysAddr::new((self.0 & Self::ADDR_MASK) as usize)
    }

    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Decode the type bits; `level` is 0..=3
    pub const fn kind(self, level: usize) -> DescriptorKind {
        match (self.0 & 0b11, level) {
            (0b11, 3) => DescriptorKind::Page,
            (0b11, _) => DescriptorKind::Table,
            (0b01, 1 | 2) => DescriptorKind::Block,
            _ => DescriptorKind::Invalid,
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({:#018x})", self.0)
    }
}
