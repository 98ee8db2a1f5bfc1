//! Extent backend trait definition.

use crate::error::StorageResult;

/// A positional byte store underlying a buffer strategy.
///
/// Backends are **opaque extents**. They know nothing about headers, root
/// blocks or records; the strategy owns all layout interpretation.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes last written at that range
/// - bytes inside the extent that were never written read back as zeros
/// - `flush` pushes buffered writes to the OS, `sync` makes them durable
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - transient stores and tests
/// - [`super::FileBackend`] - positional file I/O
/// - [`super::BufferedFileBackend`] - fully buffered image over a file
pub trait ExtentBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::BufferOverrun`] if the range extends
    /// beyond the current extent, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, overwriting whatever was there.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::BufferOverrun`] if the range extends
    /// beyond the current extent, or an I/O error.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Returns the current extent in bytes.
    fn len(&self) -> u64;

    /// Returns true if the extent is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows or shrinks the extent to exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize fails.
    fn set_len(&mut self, len: u64) -> StorageResult<()>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs data and metadata to stable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Releases backing resources (deletes files for file-backed extents).
    ///
    /// # Errors
    ///
    /// Returns an error if the resources cannot be released.
    fn destroy(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
