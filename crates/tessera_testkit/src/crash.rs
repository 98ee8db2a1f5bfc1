//! Crash injection for recovery tests.
//!
//! [`CrashableBackend`] wraps another extent and fails writes on command.
//! Its [`CrashControl`] handle stays with the test after the backend has
//! been handed to a store, so a crash can be armed at any point:
//!
//! - after a byte budget, leaving the crossing write partially applied
//! - on the next write to a given offset, keeping only a prefix (a torn
//!   root-block write)
//! - on flush or sync
//!
//! Once crashed, every later write, flush and sync fails until
//! [`CrashControl::reset`].
//!
//! ## Usage
//!
//! ```rust
//! use tessera_storage::{InMemoryBackend, ROOT_BLOCK1_OFFSET};
//! use tessera_testkit::crash::CrashableBackend;
//!
//! let image = InMemoryBackend::new();
//! let (backend, control) = CrashableBackend::wrap(Box::new(image.share()));
//! control.tear_write_at(ROOT_BLOCK1_OFFSET, 16);
//! // hand `backend` to a store, commit, then reopen over `image.share()`
//! # drop(backend);
//! ```

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_storage::{ExtentBackend, StorageError, StorageResult};

/// Where a simulated crash strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// After this many bytes have been written.
    AfterBytes(u64),
    /// On the next write starting at `offset`, of which only `keep` bytes
    /// reach the extent.
    TornWriteAt {
        /// Offset of the write to tear.
        offset: u64,
        /// Bytes applied before the crash.
        keep: usize,
    },
    /// On the next flush or sync.
    OnSync,
}

/// Shared switchboard for a [`CrashableBackend`].
#[derive(Debug, Default)]
pub struct CrashControl {
    armed: Mutex<Option<CrashPoint>>,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
}

impl CrashControl {
    /// Arms a crash point, replacing any armed one.
    pub fn arm(&self, point: CrashPoint) {
        *self.armed.lock() = Some(point);
    }

    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.bytes_written.load(Ordering::SeqCst);
        self.arm(CrashPoint::AfterBytes(written + bytes));
    }

    /// Tears the next write at `offset` after `keep` bytes.
    pub fn tear_write_at(&self, offset: u64, keep: usize) {
        self.arm(CrashPoint::TornWriteAt { offset, keep });
    }

    /// Fails the next flush or sync.
    pub fn fail_on_sync(&self) {
        self.arm(CrashPoint::OnSync);
    }

    /// Disarms and clears the crashed state.
    pub fn reset(&self) {
        *self.armed.lock() = None;
        self.crashed.store(false, Ordering::SeqCst);
    }

    /// True once a crash has happened.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Bytes written through the backend so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    fn crash(&self, what: &str) -> StorageError {
        self.crashed.store(true, Ordering::SeqCst);
        *self.armed.lock() = None;
        StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }

    fn dead(&self) -> StorageError {
        StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            "backend crashed earlier",
        ))
    }
}

/// An extent backend that fails on command.
pub struct CrashableBackend {
    inner: Box<dyn ExtentBackend>,
    control: Arc<CrashControl>,
}

impl CrashableBackend {
    /// Wraps `inner` and returns the backend with its control handle.
    pub fn wrap(inner: Box<dyn ExtentBackend>) -> (Self, Arc<CrashControl>) {
        let control = Arc::new(CrashControl::default());
        (
            Self {
                inner,
                control: Arc::clone(&control),
            },
            control,
        )
    }

    /// Wraps `inner` under an existing control handle, so one switchboard can
    /// follow a store across reopens.
    pub fn with_control(inner: Box<dyn ExtentBackend>, control: Arc<CrashControl>) -> Self {
        Self { inner, control }
    }

    /// The control handle.
    pub fn control(&self) -> Arc<CrashControl> {
        Arc::clone(&self.control)
    }
}

impl ExtentBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.control.has_crashed() {
            return Err(self.control.dead());
        }
        let before = self.control.bytes_written.load(Ordering::SeqCst);
        let armed = *self.control.armed.lock();
        match armed {
            Some(CrashPoint::AfterBytes(limit)) if before + data.len() as u64 > limit => {
                let keep = limit.saturating_sub(before) as usize;
                if keep > 0 {
                    self.inner.write_at(offset, &data[..keep])?;
                }
                self.control
                    .bytes_written
                    .fetch_add(keep as u64, Ordering::SeqCst);
                return Err(self.control.crash("write"));
            }
            Some(CrashPoint::TornWriteAt { offset: at, keep }) if at == offset => {
                let keep = keep.min(data.len());
                if keep > 0 {
                    self.inner.write_at(offset, &data[..keep])?;
                }
                self.control
                    .bytes_written
                    .fetch_add(keep as u64, Ordering::SeqCst);
                return Err(self.control.crash("torn write"));
            }
            _ => {}
        }
        self.inner.write_at(offset, data)?;
        self.control
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn set_len(&mut self, len: u64) -> StorageResult<()> {
        if self.control.has_crashed() {
            return Err(self.control.dead());
        }
        self.inner.set_len(len)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_sync("flush")?;
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_sync("sync")?;
        self.inner.sync()
    }

    fn destroy(&mut self) -> StorageResult<()> {
        self.inner.destroy()
    }
}

impl CrashableBackend {
    fn check_sync(&self, what: &str) -> StorageResult<()> {
        if self.control.has_crashed() {
            return Err(self.control.dead());
        }
        let armed = *self.control.armed.lock();
        if armed == Some(CrashPoint::OnSync) {
            return Err(self.control.crash(what));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CrashableBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashableBackend")
            .field("len", &self.inner.len())
            .field("control", &self.control)
            .finish()
    }
}
