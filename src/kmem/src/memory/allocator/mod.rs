//! Memory allocators
//!
//! - **Buddy allocator**: power-of-two blocks of frames
//! - **Slab allocator**: fixed-size objects carved from single frames

pub mod buddy;
pub mod slab;

pub use buddy::{BuddyAllocator, BuddyStats, FrameBlock};
pub use slab::{SlabAllocator, SlabStats};
