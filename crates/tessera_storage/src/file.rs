//! File-based extent backend.

use crate::backend::ExtentBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based extent backend using positional I/O.
///
/// The file is locked exclusively for the lifetime of the backend, so only
/// one process can have a journal open at a time.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_all()` to ensure data and length are on disk
///
/// # Example
///
/// ```no_run
/// use tessera_storage::{ExtentBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("journal.tsr"), true).unwrap();
/// backend.set_len(4096).unwrap();
/// backend.write_at(0, b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    len: u64,
}

impl FileBackend {
    /// Opens a file backend at the given path, creating the file (and its
    /// parent directories) when `create` is set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the file,
    /// or an I/O error if the file cannot be opened.
    pub fn open(path: &Path, create: bool) -> StorageResult<Self> {
        if create {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            len,
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, offset: u64, len: usize) -> StorageResult<()> {
        if offset.saturating_add(len as u64) > self.len {
            return Err(StorageError::BufferOverrun {
                offset,
                len: len as u64,
                extent: self.len,
            });
        }
        Ok(())
    }
}

impl ExtentBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.check_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn set_len(&mut self, len: u64) -> StorageResult<()> {
        let file = self.file.write();
        file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.write().flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.write().sync_all()?;
        Ok(())
    }

    fn destroy(&mut self) -> StorageResult<()> {
        {
            let file = self.file.write();
            let _ = FileExt::unlock(&*file);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tsr");

        let backend = FileBackend::open(&path, true).unwrap();
        assert_eq!(backend.len(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.tsr");

        let result = FileBackend::open(&path, false);
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[test]
    fn file_write_and_read_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tsr");

        let mut backend = FileBackend::open(&path, true).unwrap();
        backend.set_len(32).unwrap();
        backend.write_at(10, b"hello").unwrap();

        assert_eq!(backend.read_at(10, 5).unwrap(), b"hello");
        assert_eq!(backend.read_at(0, 4).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn file_write_past_extent_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tsr");

        let mut backend = FileBackend::open(&path, true).unwrap();
        backend.set_len(4).unwrap();

        let result = backend.write_at(2, b"abcd");
        assert!(matches!(result, Err(StorageError::BufferOverrun { .. })));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tsr");

        {
            let mut backend = FileBackend::open(&path, true).unwrap();
            backend.set_len(15).unwrap();
            backend.write_at(0, b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        {
            let backend = FileBackend::open(&path, false).unwrap();
            assert_eq!(backend.len(), 15);
            assert_eq!(backend.read_at(0, 15).unwrap(), b"persistent data");
        }
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tsr");

        let _first = FileBackend::open(&path, true).unwrap();
        let second = FileBackend::open(&path, false);
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[test]
    fn file_destroy_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tsr");

        let mut backend = FileBackend::open(&path, true).unwrap();
        backend.destroy().unwrap();
        assert!(!path.exists());
    }
}
