//! Host-memory arenas for unit tests
//!
//! A [`TestArena`] backs a small emulated physical arena with a frame-aligned
//! heap allocation. The kernel offset is chosen so that the kernel view of the
//! emulated physical base is the host pointer, which lets the mapper write
//! page tables for real.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::boxed::Box;

use crate::config::{ArenaConfig, FRAME_SIZE};
use crate::memory::{AllocationManager, BuddyAllocator, Frame, FrameTable, PhysAddr};

/// Physical base the test arenas pretend to live at
pub const TEST_PHYS_BASE: usize = 0x4000_0000;

pub struct TestArena {
    memory: *mut u8,
    layout: Layout,
    config: ArenaConfig,
}

impl TestArena {
    /// Arena of `2^max_exponent` frames
    pub fn new(max_exponent: usize) -> Self {
        let layout = Layout::from_size_align(FRAME_SIZE << max_exponent, FRAME_SIZE).unwrap();
        let memory = unsafe { alloc_zeroed(layout) };
        assert!(!memory.is_null(), "test arena allocation failed");

        let config = ArenaConfig::new(PhysAddr::new(TEST_PHYS_BASE), max_exponent)
            .with_kernel_offset((memory as usize).wrapping_sub(TEST_PHYS_BASE));
        Self {
            memory,
            layout,
            config,
        }
    }

    pub fn config(&self) -> ArenaConfig {
        self.config
    }

    /// Fresh frame table over this arena
    pub fn frame_table(&self) -> FrameTable {
        let storage = Box::leak(vec![Frame::EMPTY; self.config.total_frames()].into_boxed_slice());
        unsafe { FrameTable::new(storage, self.config) }.unwrap()
    }

    pub fn buddy(&self) -> BuddyAllocator {
        BuddyAllocator::new(self.frame_table())
    }

    pub fn manager(&self) -> AllocationManager {
        AllocationManager::new(self.frame_table())
    }

    /// Keep the arena alive for the rest of the process
    pub fn leak(self) -> &'static TestArena {
        Box::leak(Box::new(self))
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.memory, self.layout) };
    }
}
