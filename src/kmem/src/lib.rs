//! kmem - kernel memory-management core
//!
//! This crate provides the memory management core of a bare-metal AArch64 kernel:
//! - **Frame Table**: one descriptor per physical frame of the managed arena
//! - **Buddy Allocator**: power-of-two blocks of frames with split/coalesce
//! - **Slab Allocator**: fixed-size object slots (16..=512 bytes) carved from frames
//! - **Allocation Manager**: the `allocate`/`free` facade over both allocators
//! - **Page-Table Mapper**: 4-level translation tables built from managed frames
//!
//! The crate is `no_std`; the host standard library is only linked for unit tests.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod memory;

#[cfg(test)]
mod testing;

#[doc(hidden)]
pub use log as __log;

pub use config::ArenaConfig;
pub use error::{ConfigError, MemoryError};
pub use memory::{
    create_table, get_allocation_manager, init_allocation_manager, kalloc, kfree, map, map_raw,
    translate, AllocationManager, BuddyAllocator, Frame, FrameBlock, FrameState, FrameTable,
    KernelView, MapKind, PhysAddr, SlabAllocator, TableHandle, VirtAddr,
};
