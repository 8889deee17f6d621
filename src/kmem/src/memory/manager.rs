//! Allocation manager
//!
//! Routes `allocate(size)` to the slab of the matching size class for small
//! requests and to the buddy allocator otherwise. `free` finds the owner from
//! the frame table, so callers only hand back the address.
//!
//! Addresses crossing this interface are kernel-view addresses.

use core::ops::Range;

use spin::{Mutex, MutexGuard, Once};

use crate::config::{SLAB_NUM_SIZE_CLASSES, SLAB_OBJ_MAX_SIZE, SLAB_OBJ_MIN_SIZE_EXP};
use crate::error::MemoryError;
use crate::memory::allocator::buddy::{BuddyAllocator, BuddyStats, FrameBlock};
use crate::memory::allocator::slab::{SlabAllocator, SlabStats};
use crate::memory::physical::{FrameState, FrameTable};
use crate::memory::{KernelView, PhysAddr, VirtAddr};

/// Size class serving `size` bytes, or `None` if the buddy allocator must
fn size_class(size: usize) -> Option<usize> {
    if size > SLAB_OBJ_MAX_SIZE {
        return None;
    }
    let exp = size.max(1).next_power_of_two().trailing_zeros() as usize;
    Some(exp.max(SLAB_OBJ_MIN_SIZE_EXP) - SLAB_OBJ_MIN_SIZE_EXP)
}

/// Snapshot of the whole allocation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStatus {
    pub buddy: BuddyStats,
    pub slabs: [SlabStats; SLAB_NUM_SIZE_CLASSES],
}

pub struct AllocationManager {
    buddy: BuddyAllocator,
    slabs: [SlabAllocator; SLAB_NUM_SIZE_CLASSES],
}

impl AllocationManager {
    pub fn new(frames: FrameTable) -> Self {
        Self {
            buddy: BuddyAllocator::new(frames),
            slabs: core::array::from_fn(SlabAllocator::new),
        }
    }

    pub fn kernel_view(&self) -> KernelView {
        self.buddy.frames().kernel_view()
    }

    pub fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    pub fn slab(&self, class: usize) -> Option<&SlabAllocator> {
        self.slabs.get(class)
    }

    /// Allocate `size` bytes.
    ///
    /// Sizes up to 512 bytes come from a slab slot aligned to its size class;
    /// larger sizes get a frame-aligned buddy block.
    pub fn allocate(&mut self, size: usize) -> Result<VirtAddr, MemoryError> {
        let pa = match size_class(size) {
            Some(class) => self.slabs[class].allocate(&mut self.buddy)?,
            None => {
                let block = self.buddy.allocate(size)?;
                self.buddy.block_addr(block)
            }
        };
        Ok(self.kernel_view().to_kernel(pa))
    }

    /// Free an address returned by [`AllocationManager::allocate`].
    ///
    /// Halts if the address was not handed out by this manager.
    pub fn free(&mut self, addr: VirtAddr) {
        let pa = self.kernel_view().to_phys(addr);
        let frames = self.buddy.frames();
        let Some(idx) = frames.index_of(pa) else {
            crate::fatal!("free of {} outside the arena", addr);
        };

        match frames[idx].state() {
            FrameState::Slab { class, .. } => self.slabs[class].free(&mut self.buddy, pa),
            FrameState::Allocated if FrameTable::frame_offset(pa) == 0 => {
                let order = frames[idx].order();
                self.buddy.free(FrameBlock::new(idx, order));
            }
            state => crate::fatal!("invalid free of {} ({:?})", addr, state),
        }
    }

    /// Carve a physical range out of the buddy free lists
    pub fn reserve(&mut self, range: Range<PhysAddr>) -> Result<usize, MemoryError> {
        self.buddy.reserve(range)
    }

    pub fn status(&self) -> ManagerStatus {
        let frames = self.buddy.frames();
        ManagerStatus {
            buddy: self.buddy.stats(),
            slabs: core::array::from_fn(|class| self.slabs[class].stats(frames)),
        }
    }

    pub fn log_status(&self) {
        let status = self.status();
        log::info!(
            "memory: free_frames={} alloc_calls={} free_calls={} split={} coalesce={}",
            status.buddy.free_frames,
            status.buddy.alloc_calls,
            status.buddy.free_calls,
            status.buddy.split_events,
            status.buddy.coalesce_events,
        );
        for slab in &status.slabs {
            log::info!(
                "memory: slab {:3}B frames={} free_slots={} allocs={} frees={}",
                slab.unit_size,
                slab.frames,
                slab.free_slots,
                slab.allocations,
                slab.frees,
            );
        }
        self.buddy.dump();
    }

    pub fn check_invariants(&self) -> bool {
        let frames = self.buddy.frames();
        self.buddy.check_invariants() && self.slabs.iter().all(|s| s.check_invariants(frames))
    }
}

static ALLOCATION_MANAGER: Once<Mutex<AllocationManager>> = Once::new();

/// Install the process-wide allocation manager. Halts if called twice.
pub fn init_allocation_manager(frames: FrameTable) {
    let mut fresh = false;
    ALLOCATION_MANAGER.call_once(|| {
        fresh = true;
        Mutex::new(AllocationManager::new(frames))
    });
    if !fresh {
        crate::fatal!("allocation manager initialised twice");
    }
    log::info!("memory: allocation manager ready");
}

/// Lock the process-wide allocation manager. Halts if it was never installed.
pub fn get_allocation_manager() -> MutexGuard<'static, AllocationManager> {
    match ALLOCATION_MANAGER.get() {
        Some(manager) => manager.lock(),
        None => crate::fatal!("allocation manager used before init"),
    }
}

/// [`AllocationManager::allocate`] on the process-wide manager
pub fn kalloc(size: usize) -> Result<VirtAddr, MemoryError> {
    get_allocation_manager().allocate(size)
}

/// [`AllocationManager::free`] on the process-wide manager
pub fn kfree(addr: VirtAddr) {
    get_allocation_manager().free(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FRAME_SIZE;
    use crate::testing::TestArena;

    #[test]
    fn test_size_class_boundaries() {
        assert_eq!(size_class(0), Some(0));
        assert_eq!(size_class(1), Some(0));
        assert_eq!(size_class(16), Some(0));
        assert_eq!(size_class(17), Some(1));
        assert_eq!(size_class(64), Some(2));
        assert_eq!(size_class(257), Some(5));
        assert_eq!(size_class(512), Some(5));
        assert_eq!(size_class(513), None);
    }

    #[test]
    fn test_small_requests_go_to_slabs() {
        let arena = TestArena::new(4);
        let mut manager = arena.manager();

        let a = manager.allocate(24).unwrap();
        let b = manager.allocate(24).unwrap();
        assert_eq!(b.as_usize() - a.as_usize(), 32);
        assert_eq!(a.as_usize() % 32, 0);
        assert_eq!(manager.status().slabs[1].allocations, 2);

        manager.free(a);
        manager.free(b);
        assert_eq!(manager.status().slabs[1].frees, 2);
        assert!(manager.check_invariants());
    }

    #[test]
    fn test_large_requests_go_to_buddy() {
        let arena = TestArena::new(4);
        let mut manager = arena.manager();

        let addr = manager.allocate(513).unwrap();
        assert_eq!(addr.as_usize() % FRAME_SIZE, 0);
        let big = manager.allocate(3 * FRAME_SIZE).unwrap();
        assert_eq!(manager.status().buddy.free_frames, 16 - 1 - 4);

        manager.free(big);
        manager.free(addr);
        assert_eq!(manager.buddy().free_blocks(4), 1);
        assert!(manager.check_invariants());
    }

    #[test]
    fn test_allocations_are_writable_through_kernel_view() {
        let arena = TestArena::new(3);
        let mut manager = arena.manager();

        let small = manager.allocate(48).unwrap();
        let page = manager.allocate(FRAME_SIZE).unwrap();
        unsafe {
            core::ptr::write_bytes(small.as_mut_ptr::<u8>(), 0xAB, 48);
            core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0xCD, FRAME_SIZE);
            assert_eq!(*small.as_ptr::<u8>().add(47), 0xAB);
            assert_eq!(*page.as_ptr::<u8>().add(FRAME_SIZE - 1), 0xCD);
        }
    }

    #[test]
    fn test_out_of_memory_is_reported() {
        let arena = TestArena::new(2);
        let mut manager = arena.manager();
        assert_eq!(manager.allocate(5 * FRAME_SIZE), Err(MemoryError::OutOfMemory));
        assert!(manager.allocate(4 * FRAME_SIZE).is_ok());
        assert_eq!(manager.allocate(16), Err(MemoryError::OutOfMemory));
    }

    #[test]
    fn test_reserve_through_manager() {
        let arena = TestArena::new(3);
        let mut manager = arena.manager();
        let base = arena.config().arena_base;
        let end = PhysAddr::new(base.as_usize() + 2 * FRAME_SIZE);
        assert_eq!(manager.reserve(base..end), Ok(2));

        let addr = manager.allocate(FRAME_SIZE).unwrap();
        let pa = manager.kernel_view().to_phys(addr);
        assert!(pa >= end);
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn test_interior_block_address_halts() {
        let arena = TestArena::new(3);
        let mut manager = arena.manager();
        let addr = manager.allocate(2 * FRAME_SIZE).unwrap();
        manager.free(VirtAddr::new(addr.as_usize() + FRAME_SIZE));
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn test_freeing_reserved_frame_halts() {
        let arena = TestArena::new(3);
        let mut manager = arena.manager();
        let base = arena.config().arena_base;
        manager
            .reserve(base..PhysAddr::new(base.as_usize() + FRAME_SIZE))
            .unwrap();
        manager.free(manager.kernel_view().to_kernel(base));
    }

    #[test]
    #[should_panic(expected = "outside the arena")]
    fn test_foreign_address_halts() {
        let arena = TestArena::new(3);
        let mut manager = arena.manager();
        manager.free(VirtAddr::new(0x10));
    }

    #[test]
    fn test_global_manager_lifecycle() {
        let arena = TestArena::new(4).leak();
        init_allocation_manager(arena.frame_table());

        let addr = kalloc(100).unwrap();
        assert!(get_allocation_manager().status().slabs[3].allocations >= 1);
        kfree(addr);

        let second = std::panic::catch_unwind(|| init_allocation_manager(arena.frame_table()));
        assert!(second.is_err());
        assert!(get_allocation_manager().check_invariants());
    }
}
