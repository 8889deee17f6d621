//! Architecture constants and arena configuration
//!
//! The constants describe the AArch64 4 KiB-granule layout this core is built
//! for. [`ArenaConfig`] describes one concrete physical arena and is validated
//! before a frame table is built over it.

use crate::error::ConfigError;
use crate::memory::PhysAddr;

/// Size of one physical frame in bytes
pub const FRAME_SIZE: usize = 4096;
/// log2 of [`FRAME_SIZE`]
pub const FRAME_SHIFT: usize = 12;

/// Largest block order the buddy allocator can track (2^18 frames = 1 GiB)
pub const BUDDY_MAX_EXPONENT: usize = 18;
pub const BUDDY_NUM_FREE_LISTS: usize = BUDDY_MAX_EXPONENT + 1;

/// Offset of the kernel's linear view of physical memory.
///
/// Physical addresses below 2^48 map to `KERNEL_VIEW_OFFSET + pa`.
pub const KERNEL_VIEW_OFFSET: usize = 0xffff_0000_0000_0000;

/// Physical addresses a descriptor can hold (output address bits 47:12)
pub const PHYS_ADDR_LIMIT: usize = 1 << 48;

/// Default physical base of the managed arena
pub const DEFAULT_ARENA_BASE: usize = 0;

/// Smallest slab object is 2^4 = 16 bytes (AArch64 stack/ABI alignment)
pub const SLAB_OBJ_MIN_SIZE_EXP: usize = 4;
/// Largest slab object is 2^9 = 512 bytes; anything bigger goes to the buddy
pub const SLAB_OBJ_MAX_SIZE_EXP: usize = 9;
pub const SLAB_NUM_SIZE_CLASSES: usize = SLAB_OBJ_MAX_SIZE_EXP - SLAB_OBJ_MIN_SIZE_EXP + 1;
pub const SLAB_OBJ_MIN_SIZE: usize = 1 << SLAB_OBJ_MIN_SIZE_EXP;
pub const SLAB_OBJ_MAX_SIZE: usize = 1 << SLAB_OBJ_MAX_SIZE_EXP;
/// Slots in one slab frame at the smallest object size (4096 / 16)
pub const SLAB_MAX_SLOTS: usize = FRAME_SIZE / SLAB_OBJ_MIN_SIZE;

/// MAIR_EL1 attribute index for device nGnRnE memory
pub const MAIR_IDX_DEVICE_NGNRNE: u64 = 0;
/// MAIR_EL1 attribute index for normal non-cacheable memory
pub const MAIR_IDX_NORMAL_NOCACHE: u64 = 1;

/// Physical arena managed by the frame table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Physical address of frame 0
    pub arena_base: PhysAddr,
    /// The arena holds exactly `2^max_exponent` frames
    pub max_exponent: usize,
    /// Added to a physical address to obtain its kernel-view alias
    pub kernel_offset: usize,
}

impl ArenaConfig {
    pub const fn new(arena_base: PhysAddr, max_exponent: usize) -> Self {
        Self {
            arena_base,
            max_exponent,
            kernel_offset: KERNEL_VIEW_OFFSET,
        }
    }

    pub const fn with_kernel_offset(mut self, kernel_offset: usize) -> Self {
        self.kernel_offset = kernel_offset;
        self
    }

    pub const fn total_frames(&self) -> usize {
        1 << self.max_exponent
    }

    pub const fn arena_size(&self) -> usize {
        self.total_frames() * FRAME_SIZE
    }

    /// Check the configuration against the compiled-in limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_exponent > BUDDY_MAX_EXPONENT {
            return Err(ConfigError::ExponentTooLarge {
                requested: self.max_exponent,
                max: BUDDY_MAX_EXPONENT,
            });
        }
        if self.arena_base.as_usize() % FRAME_SIZE != 0 {
            return Err(ConfigError::MisalignedArenaBase(self.arena_base));
        }
        let Some(end) = self.arena_base.as_usize().checked_add(self.arena_size()) else {
            return Err(ConfigError::ArenaOverflow);
        };
        if end > PHYS_ADDR_LIMIT {
            return Err(ConfigError::ArenaAbovePhysLimit { end });
        }
        Ok(())
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new(PhysAddr::new(DEFAULT_ARENA_BASE), BUDDY_MAX_EXPONENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_geometry() {
        assert_eq!(SLAB_NUM_SIZE_CLASSES, 6);
        assert_eq!(SLAB_OBJ_MIN_SIZE, 16);
        assert_eq!(SLAB_OBJ_MAX_SIZE, 512);
        assert_eq!(SLAB_MAX_SLOTS, 256);
        assert_eq!(1 << FRAME_SHIFT, FRAME_SIZE);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ArenaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_frames(), 1 << 18);
        assert_eq!(config.arena_size(), 1 << 30);
    }

    #[test]
    fn test_config_rejects_large_exponent() {
        let config = ArenaConfig::new(PhysAddr::new(0), BUDDY_MAX_EXPONENT + 1);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ExponentTooLarge {
                requested: BUDDY_MAX_EXPONENT + 1,
                max: BUDDY_MAX_EXPONENT,
            })
        );
    }

    #[test]
    fn test_config_rejects_misaligned_base() {
        let config = ArenaConfig::new(PhysAddr::new(0x4000_0800), 4);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MisalignedArenaBase(PhysAddr::new(0x4000_0800)))
        );
    }

    #[test]
    fn test_config_rejects_overflowing_arena() {
        let config = ArenaConfig::new(PhysAddr::new(usize::MAX - 0xfff), 4);
        assert_eq!(config.validate(), Err(ConfigError::ArenaOverflow));
    }

    #[test]
    fn test_config_rejects_arena_beyond_descriptor_range() {
        let above = ArenaConfig::new(PhysAddr::new(PHYS_ADDR_LIMIT), 4);
        assert_eq!(
            above.validate(),
            Err(ConfigError::ArenaAbovePhysLimit {
                end: PHYS_ADDR_LIMIT + 16 * FRAME_SIZE,
            })
        );

        // the last frame straddling the limit is rejected too
        let straddling = ArenaConfig::new(PhysAddr::new(PHYS_ADDR_LIMIT - 8 * FRAME_SIZE), 4);
        assert!(matches!(
            straddling.validate(),
            Err(ConfigError::ArenaAbovePhysLimit { .. })
        ));

        let touching = ArenaConfig::new(PhysAddr::new(PHYS_ADDR_LIMIT - 16 * FRAME_SIZE), 4);
        assert!(touching.validate().is_ok());
    }
}
