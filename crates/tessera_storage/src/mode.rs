//! Buffer modes and store types.

use crate::error::{StorageError, StorageResult};
use std::fmt;

/// Maximum extent of fully buffered modes (one `i32` worth of bytes).
pub const MEM_MAX_EXTENT: u64 = i32::MAX as u64;

/// Maximum extent of file-backed modes.
pub const OTHER_MAX_EXTENT: u64 = i64::MAX as u64;

/// How the store reuses space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreType {
    /// Write once, read many: append-only, offsets are never reused.
    Worm,
    /// Read/write: freed records may eventually be reused.
    Rw,
}

impl StoreType {
    /// On-disk code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Worm => 0,
            Self::Rw => 1,
        }
    }

    /// Decodes an on-disk code.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for unknown codes.
    pub fn from_code(code: u8) -> StorageResult<Self> {
        match code {
            0 => Ok(Self::Worm),
            1 => Ok(Self::Rw),
            other => Err(StorageError::corrupted(format!(
                "unknown store type {other}"
            ))),
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worm => f.write_str("WORM"),
            Self::Rw => f.write_str("RW"),
        }
    }
}

/// The backing used for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferMode {
    /// Memory only; nothing survives the process.
    Transient,
    /// Memory image written through to a file.
    Direct,
    /// Memory image written back to a file on force.
    Mapped,
    /// Append-only file with positional I/O.
    #[default]
    DiskWorm,
    /// Reusable-space file with positional I/O.
    DiskRw,
}

impl BufferMode {
    /// Whether the mode survives a restart.
    #[must_use]
    pub const fn is_stable(self) -> bool {
        !matches!(self, Self::Transient)
    }

    /// Whether the whole extent is held in memory.
    #[must_use]
    pub const fn is_fully_buffered(self) -> bool {
        matches!(self, Self::Transient | Self::Direct | Self::Mapped)
    }

    /// The store type the mode implies.
    #[must_use]
    pub const fn store_type(self) -> StoreType {
        match self {
            Self::DiskRw => StoreType::Rw,
            _ => StoreType::Worm,
        }
    }

    /// Hard cap on the user extent.
    #[must_use]
    pub const fn max_extent(self) -> u64 {
        match self {
            Self::Transient | Self::Direct => MEM_MAX_EXTENT,
            Self::Mapped | Self::DiskWorm | Self::DiskRw => OTHER_MAX_EXTENT,
        }
    }
}

impl fmt::Display for BufferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::Direct => "direct",
            Self::Mapped => "mapped",
            Self::DiskWorm => "disk-worm",
            Self::DiskRw => "disk-rw",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_unstable() {
        assert!(!BufferMode::Transient.is_stable());
        assert!(BufferMode::Direct.is_stable());
        assert!(BufferMode::DiskRw.is_stable());
    }

    #[test]
    fn disk_rw_is_the_reusable_variant() {
        assert_eq!(BufferMode::DiskRw.store_type(), StoreType::Rw);
        assert_eq!(BufferMode::Mapped.store_type(), StoreType::Worm);
    }

    #[test]
    fn memory_modes_are_capped_at_i32() {
        assert_eq!(BufferMode::Transient.max_extent(), i32::MAX as u64);
        assert_eq!(BufferMode::DiskWorm.max_extent(), i64::MAX as u64);
    }

    #[test]
    fn store_type_code_rejects_unknown() {
        assert_eq!(StoreType::from_code(1).unwrap(), StoreType::Rw);
        assert!(StoreType::from_code(7).is_err());
    }
}
