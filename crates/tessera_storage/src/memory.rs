//! In-memory extent backend.

use crate::backend::ExtentBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory extent.
///
/// Used by the transient buffer mode and by tests. Handles created with
/// [`InMemoryBackend::share`] observe the same bytes, which lets crash tests
/// keep a view of the image after the store that owned it is gone.
///
/// # Example
///
/// ```rust
/// use tessera_storage::{ExtentBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.set_len(16).unwrap();
/// backend.write_at(4, b"data").unwrap();
/// assert_eq!(backend.read_at(4, 4).unwrap(), b"data");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a second handle onto the same bytes.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl ExtentBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let extent = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if end > extent {
            return Err(StorageError::BufferOverrun {
                offset,
                len: len as u64,
                extent,
            });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let extent = data.len() as u64;
        let end = offset.saturating_add(bytes.len() as u64);

        if end > extent {
            return Err(StorageError::BufferOverrun {
                offset,
                len: bytes.len() as u64,
                extent,
            });
        }

        data[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn set_len(&mut self, len: u64) -> StorageResult<()> {
        let len = usize::try_from(len).map_err(|_| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("extent of {len} bytes cannot be buffered in memory"),
            ))
        })?;
        self.data.write().resize(len, 0);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn destroy(&mut self) -> StorageResult<()> {
        let mut data = self.data.write();
        data.clear();
        data.shrink_to_fit();
        Ok(())
    }
}
