//! Translation table layout

use core::ops::{Index, IndexMut};

use zerocopy::{FromBytes, FromZeroes};

use super::descriptor::Descriptor;
use crate::memory::VirtAddr;

pub const ENTRIES_PER_TABLE: usize = 512;
/// Levels walked from the root table down to the leaf
pub const LEVELS: usize = 4;
/// Shift of the VA bits indexing each level, root first
pub const LEVEL_SHIFTS: [usize; LEVELS] = [39, 30, 21, 12];

/// Index into the table at `level` for `va`
#[inline]
pub const fn table_index(va: VirtAddr, level: usize) -> usize {
    (va.as_usize() >> LEVEL_SHIFTS[level]) & (ENTRIES_PER_TABLE - 1)
}

/// Sign-extend bit 47 so upper-half addresses come out canonical
#[inline]
pub const fn canonical(va: usize) -> VirtAddr {
    let shift = usize::BITS - 48;
    VirtAddr::new((((va << shift) as isize) >> shift) as usize)
}

pub fn table_indices(va: VirtAddr) -> [usize; LEVELS] {
    core::array::from_fn(|level| table_index(va, level))
}

/// One 4 KiB translation table
#[derive(FromZeroes, FromBytes)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Descriptor; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub fn iter(&self) -> impl Iterator<Item = (usize, Descriptor)> + '_ {
        self.entries.iter().copied().enumerate()
    }
}

impl Index<usize> for PageTable {
    type Output = Descriptor;

    fn index(&self, index: usize) -> &Descriptor {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Descriptor {
        &mut self.entries[index]
    }
}
