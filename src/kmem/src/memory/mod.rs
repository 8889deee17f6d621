//! Memory Management Subsystem
//!
//! This module provides the memory management core:
//! - **Physical Memory**: the frame table and index-linked frame lists
//! - **Allocators**: Buddy allocator (frame blocks), Slab allocator (small objects)
//! - **Manager**: the `allocate`/`free` facade routing between the two
//! - **Virtual Memory**: 4-level page-table construction on top of the manager
//!
//! Addresses come in two forms that must never be mixed:
//! - [`PhysAddr`]: what the hardware sees, and what page-table descriptors store
//! - [`VirtAddr`]: what software dereferences; for arena memory this is the
//!   kernel-view alias produced by [`KernelView::to_kernel`]

use core::fmt;

pub mod allocator;
pub mod manager;
pub mod physical;
pub mod virtual_;

// Re-export commonly used types and functions
pub use allocator::buddy::{BuddyAllocator, BuddyStats, FrameBlock};
pub use allocator::slab::{SlabAllocator, SlabStats};
pub use manager::{
    get_allocation_manager, init_allocation_manager, kalloc, kfree, AllocationManager,
    ManagerStatus,
};
pub use physical::{Frame, FrameIndex, FrameList, FrameState, FrameTable, SlabList, SlotBitmap};
pub use virtual_::{
    create_table, dump_page_table, lookup_entry, map, map_raw, translate, walk, Descriptor,
    DescriptorKind, MapKind, PageFlags, PageTable, TableHandle,
};

/// Physical address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

/// Virtual address (kernel-view alias or user-space address)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }
}

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pa:0x{:016X}", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "va:0x{:016X}", self.0)
    }
}

/// Translation between physical addresses and the kernel's linear alias.
///
/// On the target the offset is [`crate::config::KERNEL_VIEW_OFFSET`], so the
/// translation is the classic `pa | 0xffff_0000_0000_0000`. Wrapping arithmetic
/// keeps it exact for any offset, which is what lets the unit tests back the
/// arena with host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelView {
    offset: usize,
}

impl KernelView {
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub const fn offset(self) -> usize {
        self.offset
    }

    /// Physical address -> kernel-view address
    #[inline]
    pub const fn to_kernel(self, pa: PhysAddr) -> VirtAddr {
        VirtAddr(pa.0.wrapping_add(self.offset))
    }

    /// Kernel-view address -> physical address
    #[inline]
    pub const fn to_phys(self, va: VirtAddr) -> PhysAddr {
        PhysAddr(va.0.wrapping_sub(self.offset))
    }
}
