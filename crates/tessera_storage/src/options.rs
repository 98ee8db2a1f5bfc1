//! Options for opening a store.

use crate::address::DEFAULT_OFFSET_BITS;
use crate::mode::BufferMode;
use std::path::{Path, PathBuf};

/// Default initial user extent (10 MiB).
pub const DEFAULT_INITIAL_EXTENT: u64 = 10 * 1024 * 1024;

/// Default minimum growth step (32 MiB).
pub const DEFAULT_MINIMUM_EXTENSION: u64 = 32 * 1024 * 1024;

/// Configuration for a buffer strategy.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Backing used for the store.
    pub buffer_mode: BufferMode,
    /// File backing the store (ignored for transient stores).
    pub path: Option<PathBuf>,
    /// User extent allocated when the store is created.
    pub initial_extent: u64,
    /// Upper bound on the user extent, 0 for none.
    pub maximum_extent: u64,
    /// Smallest growth step taken by overflow.
    pub minimum_extension: u64,
    /// Address offset width for new stores.
    pub offset_bits: u8,
    /// Whether to create the file if it is missing.
    pub create: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            buffer_mode: BufferMode::default(),
            path: None,
            initial_extent: DEFAULT_INITIAL_EXTENT,
            maximum_extent: 0,
            minimum_extension: DEFAULT_MINIMUM_EXTENSION,
            offset_bits: DEFAULT_OFFSET_BITS,
            create: true,
        }
    }
}

impl StoreOptions {
    /// Options for a memory-only store.
    #[must_use]
    pub fn transient() -> Self {
        Self {
            buffer_mode: BufferMode::Transient,
            ..Self::default()
        }
    }

    /// Options for a file-backed store at `path`.
    #[must_use]
    pub fn file(path: impl AsRef<Path>, mode: BufferMode) -> Self {
        Self {
            buffer_mode: mode,
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Sets the buffer mode.
    #[must_use]
    pub const fn buffer_mode(mut self, mode: BufferMode) -> Self {
        self.buffer_mode = mode;
        self
    }

    /// Sets the initial user extent.
    #[must_use]
    pub const fn initial_extent(mut self, bytes: u64) -> Self {
        self.initial_extent = bytes;
        self
    }

    /// Sets the maximum user extent (0 = unlimited).
    #[must_use]
    pub const fn maximum_extent(mut self, bytes: u64) -> Self {
        self.maximum_extent = bytes;
        self
    }

    /// Sets the minimum growth step.
    #[must_use]
    pub const fn minimum_extension(mut self, bytes: u64) -> Self {
        self.minimum_extension = bytes;
        self
    }

    /// Sets the address offset width.
    #[must_use]
    pub const fn offset_bits(mut self, bits: u8) -> Self {
        self.offset_bits = bits;
        self
    }

    /// Sets whether a missing file is created.
    #[must_use]
    pub const fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = StoreOptions::default();
        assert_eq!(options.initial_extent, 10 * 1024 * 1024);
        assert_eq!(options.minimum_extension, 32 * 1024 * 1024);
        assert_eq!(options.maximum_extent, 0);
        assert_eq!(options.offset_bits, 42);
        assert!(options.create);
    }

    #[test]
    fn builder_pattern() {
        let options = StoreOptions::transient()
            .initial_extent(4096)
            .maximum_extent(1 << 20)
            .offset_bits(36);

        assert_eq!(options.buffer_mode, BufferMode::Transient);
        assert_eq!(options.initial_extent, 4096);
        assert_eq!(options.maximum_extent, 1 << 20);
        assert_eq!(options.offset_bits, 36);
    }
}
