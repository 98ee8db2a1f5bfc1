//! Fully buffered extent over a file.

use crate::backend::ExtentBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use std::path::Path;

/// When buffered writes reach the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Every write goes to the image and the file.
    WriteThrough,
    /// Writes land in the image; dirty bytes are written back on flush.
    WriteBack,
}

/// A complete in-memory image of a file-backed extent.
///
/// Reads are always served from the image. Used for the fully buffered
/// stable modes, where the whole extent fits in memory.
#[derive(Debug)]
pub struct BufferedFileBackend {
    file: FileBackend,
    image: Vec<u8>,
    policy: WritePolicy,
    dirty: Option<(u64, u64)>,
}

impl BufferedFileBackend {
    /// Opens the file and loads its contents into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn open(path: &Path, create: bool, policy: WritePolicy) -> StorageResult<Self> {
        let file = FileBackend::open(path, create)?;
        let len = usize::try_from(file.len())
            .map_err(|_| StorageError::corrupted("file too large to buffer in memory"))?;
        let image = file.read_at(0, len)?;
        Ok(Self {
            file,
            image,
            policy,
            dirty: None,
        })
    }

    /// Returns the write policy.
    #[must_use]
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    fn mark_dirty(&mut self, start: u64, end: u64) {
        self.dirty = Some(match self.dirty {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
    }

    fn write_back(&mut self) -> StorageResult<()> {
        if let Some((lo, hi)) = self.dirty.take() {
            let hi = hi.min(self.image.len() as u64);
            if lo < hi {
                self.file
                    .write_at(lo, &self.image[lo as usize..hi as usize])?;
            }
        }
        Ok(())
    }
}

impl ExtentBackend for BufferedFileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let extent = self.image.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > extent {
            return Err(StorageError::BufferOverrun {
                offset,
                len: len as u64,
                extent,
            });
        }
        Ok(self.image[offset as usize..end as usize].to_vec())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let extent = self.image.len() as u64;
        let end = offset.saturating_add(data.len() as u64);
        if end > extent {
            return Err(StorageError::BufferOverrun {
                offset,
                len: data.len() as u64,
                extent,
            });
        }

        self.image[offset as usize..end as usize].copy_from_slice(data);
        match self.policy {
            WritePolicy::WriteThrough => self.file.write_at(offset, data)?,
            WritePolicy::WriteBack => self.mark_dirty(offset, end),
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.image.len() as u64
    }

    fn set_len(&mut self, len: u64) -> StorageResult<()> {
        let new_len = usize::try_from(len)
            .map_err(|_| StorageError::corrupted("extent too large to buffer in memory"))?;
        self.file.set_len(len)?;
        self.image.resize(new_len, 0);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.write_back()?;
        self.file.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.write_back()?;
        self.file.sync()
    }

    fn destroy(&mut self) -> StorageResult<()> {
        self.image = Vec::new();
        self.dirty = None;
        self.file.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_through_reaches_file_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("direct.tsr");

        let mut backend = BufferedFileBackend::open(&path, true, WritePolicy::WriteThrough).unwrap();
        backend.set_len(8).unwrap();
        backend.write_at(2, b"abc").unwrap();
        drop(backend);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[2..5], b"abc");
    }

    #[test]
    fn write_back_defers_until_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mapped.tsr");

        let mut backend = BufferedFileBackend::open(&path, true, WritePolicy::WriteBack).unwrap();
        backend.set_len(8).unwrap();
        backend.write_at(0, b"xy").unwrap();
        assert_eq!(&std::fs::read(&path).unwrap()[0..2], &[0, 0]);

        backend.flush().unwrap();
        assert_eq!(&std::fs::read(&path).unwrap()[0..2], b"xy");
    }

    #[test]
    fn reopen_loads_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("direct.tsr");

        {
            let mut backend =
                BufferedFileBackend::open(&path, true, WritePolicy::WriteThrough).unwrap();
            backend.set_len(4).unwrap();
            backend.write_at(0, b"data").unwrap();
            backend.sync().unwrap();
        }

        let backend = BufferedFileBackend::open(&path, false, WritePolicy::WriteThrough).unwrap();
        assert_eq!(backend.read_at(0, 4).unwrap(), b"data");
    }
}
