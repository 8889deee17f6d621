//! Error types and the halt path
//!
//! Two classes of failure are kept apart:
//! - [`MemoryError`]: an allocation could not be satisfied. Callers check it.
//! - [`fatal!`]: an allocator or page-table invariant is broken. The system halts.

use core::fmt;

use crate::memory::PhysAddr;

/// Recoverable memory-management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No free block at the requested order or above
    OutOfMemory,
    /// The address range does not lie inside the managed arena
    OutOfRange,
}

impl MemoryError {
    /// Converts the error to a numeric error code
    pub fn to_error_code(&self) -> isize {
        match self {
            MemoryError::OutOfMemory => -1,
            MemoryError::OutOfRange => -2,
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "Out of memory"),
            MemoryError::OutOfRange => write!(f, "Address out of range"),
        }
    }
}

/// Rejected arena configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The arena base is not frame aligned
    MisalignedArenaBase(PhysAddr),
    /// More frames than the free-list array can track
    ExponentTooLarge { requested: usize, max: usize },
    /// The reserved frame-table storage cannot describe the whole arena
    FrameTableTooSmall { needed: usize, provided: usize },
    /// `arena_base + arena_size` does not fit in the address space
    ArenaOverflow,
    /// The arena ends above what a translation descriptor can address
    ArenaAbovePhysLimit { end: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::MisalignedArenaBase(base) => {
                write!(f, "Arena base {} is not frame aligned", base)
            }
            ConfigError::ExponentTooLarge { requested, max } => {
                write!(f, "Arena exponent {} exceeds maximum {}", requested, max)
            }
            ConfigError::FrameTableTooSmall { needed, provided } => {
                write!(f, "Frame table needs {} entries, got {}", needed, provided)
            }
            ConfigError::ArenaOverflow => write!(f, "Arena overflows the address space"),
            ConfigError::ArenaAbovePhysLimit { end } => {
                write!(f, "Arena end 0x{:X} is beyond the 48-bit physical range", end)
            }
        }
    }
}

/// Halt on an unrecoverable invariant violation.
///
/// Logs at error level, then panics; the kernel's panic handler never returns.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        match format_args!($($arg)*) {
            message => {
                $crate::__log::error!("fatal: {}", message);
                panic!("kmem fatal: {}", message)
            }
        }
    };
}
