//! Buffer strategies.
//!
//! A buffer strategy turns record writes and reads into extent operations
//! for one kind of store. The variant is chosen once, at open time, from
//! the [`BufferMode`]: append-only modes get a [`WormStrategy`], the
//! reusable-space mode gets an [`RwStrategy`].
//!
//! ## Lifecycle
//!
//! ```text
//! Open ──close_for_writes──▶ ReadOnly
//!   │                          │
//!   └────────close─────────────┴──▶ Closed ──destroy──▶ Destroyed
//! ```

mod rw;
mod worm;

pub use rw::RwStrategy;
pub use worm::WormStrategy;

use crate::address::{Address, AddressManager};
use crate::backend::ExtentBackend;
use crate::buffered::{BufferedFileBackend, WritePolicy};
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use crate::mode::{BufferMode, StoreType};
use crate::options::StoreOptions;
use crate::root_block::{RootBlock, RootBlockSlot};

/// Lifecycle state of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    /// Accepting reads and writes.
    Open,
    /// Accepting reads only.
    ReadOnly,
    /// Closed; the backing is still present.
    Closed,
    /// Backing resources released.
    Destroyed,
}

/// Record-level access to a store's extent.
pub trait BufferStrategy: Send + Sync {
    /// The backing used for the store.
    fn buffer_mode(&self) -> BufferMode;

    /// WORM or RW.
    fn store_type(&self) -> StoreType;

    /// Address codec for this store.
    fn address_manager(&self) -> &AddressManager;

    /// Current lifecycle state.
    fn state(&self) -> StrategyState;

    /// Appends a record and returns its address.
    ///
    /// # Errors
    ///
    /// Fails on an empty record, a record longer than the address length
    /// bits, a store that is not writable, or when the store cannot grow
    /// enough to hold the record.
    fn write(&mut self, data: &[u8]) -> StorageResult<Address>;

    /// Reads the record at `addr`.
    ///
    /// # Errors
    ///
    /// Fails for the null address, a zero length, or a record that extends
    /// past the next offset.
    fn read(&self, addr: Address) -> StorageResult<Vec<u8>>;

    /// Releases a record. WORM stores keep every record.
    ///
    /// # Errors
    ///
    /// Fails if the address is not a written record.
    fn delete(&mut self, addr: Address) -> StorageResult<()>;

    /// Grows the user extent by at least `needed` bytes.
    ///
    /// Returns `Ok(false)` when the maximum extent cannot accommodate the
    /// request; the caller fails its own operation in that case.
    ///
    /// # Errors
    ///
    /// Only I/O failures while resizing are errors.
    fn overflow(&mut self, needed: u64) -> StorageResult<bool>;

    /// Resizes the user extent.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::Truncate`] below the next offset.
    fn truncate(&mut self, extent: u64) -> StorageResult<()>;

    /// Marks everything written so far as committed.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed or allocation metadata cannot be written.
    fn commit(&mut self) -> StorageResult<()>;

    /// Discards everything written since the last commit.
    fn abort(&mut self);

    /// Discards everything written since the current root block, including
    /// a commit whose root block was never written.
    fn rewind_to_root_block(&mut self);

    /// True when there are uncommitted writes.
    fn is_dirty(&self) -> bool {
        self.next_offset() != self.commit_offset()
    }

    /// First unwritten offset of the user extent.
    fn next_offset(&self) -> u64;

    /// Next offset as of the last commit.
    fn commit_offset(&self) -> u64;

    /// Size of the user extent.
    fn user_extent(&self) -> u64;

    /// Size of the whole extent including header and root blocks.
    fn extent(&self) -> u64;

    /// Largest user extent the store may grow to.
    fn maximum_extent(&self) -> u64;

    /// Address of the allocation metadata as of the last commit.
    fn meta_bits_addr(&self) -> Address;

    /// Start of the allocation region.
    fn meta_start_addr(&self) -> u64;

    /// Flushes buffered writes; with `metadata`, syncs to stable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    fn force(&mut self, metadata: bool) -> StorageResult<()>;

    /// The current root block.
    fn root_block(&self) -> &RootBlock;

    /// Writes `rb` into its slot and makes it current.
    ///
    /// The current root block only changes once the write (and the sync,
    /// when `force` is set) has succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not writable or the write fails.
    fn write_root_block(&mut self, rb: &RootBlock, force: bool) -> StorageResult<()>;

    /// Reads the raw bytes of a root-block slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read_root_block(&self, slot: RootBlockSlot) -> StorageResult<Vec<u8>>;

    /// Switches to read-only.
    ///
    /// # Errors
    ///
    /// Fails if the store is already read-only or closed.
    fn close_for_writes(&mut self) -> StorageResult<()>;

    /// Closes the store.
    ///
    /// # Errors
    ///
    /// Fails if the store is not open.
    fn close(&mut self) -> StorageResult<()>;

    /// Releases the backing resources of a closed store.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::StillOpen`] unless the store is closed.
    fn destroy(&mut self) -> StorageResult<()>;

    /// True while reads are permitted.
    fn is_open(&self) -> bool {
        matches!(self.state(), StrategyState::Open | StrategyState::ReadOnly)
    }

    /// True once writes are refused.
    fn is_read_only(&self) -> bool {
        self.state() == StrategyState::ReadOnly
    }

    /// Whether the store needs a new root block relative to `rb`.
    fn requires_commit(&self, rb: &RootBlock) -> bool {
        self.next_offset() > rb.next_offset
    }
}

/// Opens the strategy and backing described by `options`.
///
/// # Errors
///
/// Fails if a stable mode has no path, the file cannot be opened, or an
/// existing store cannot be recovered.
pub fn open_strategy(options: &StoreOptions) -> StorageResult<Box<dyn BufferStrategy>> {
    let backend: Box<dyn ExtentBackend> = match options.buffer_mode {
        BufferMode::Transient => Box::new(InMemoryBackend::new()),
        mode => {
            let path = options.path.as_deref().ok_or_else(|| {
                StorageError::InvalidOptions(format!("buffer mode {mode} requires a path"))
            })?;
            match mode {
                BufferMode::Direct => Box::new(BufferedFileBackend::open(
                    path,
                    options.create,
                    WritePolicy::WriteThrough,
                )?),
                BufferMode::Mapped => Box::new(BufferedFileBackend::open(
                    path,
                    options.create,
                    WritePolicy::WriteBack,
                )?),
                _ => Box::new(FileBackend::open(path, options.create)?),
            }
        }
    };
    open_with_backend(options, backend)
}

/// Opens a strategy over a caller-supplied backend.
///
/// An empty backend is initialised as a new store; otherwise the store is
/// recovered from its header and root blocks.
///
/// # Errors
///
/// Fails if an existing store cannot be recovered.
pub fn open_with_backend(
    options: &StoreOptions,
    backend: Box<dyn ExtentBackend>,
) -> StorageResult<Box<dyn BufferStrategy>> {
    Ok(match options.buffer_mode.store_type() {
        StoreType::Worm => Box::new(WormStrategy::open(options, backend)?),
        StoreType::Rw => Box::new(RwStrategy::open(options, backend)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn transient_mode_needs_no_path() {
        let strategy = open_strategy(&StoreOptions::transient().initial_extent(1024)).unwrap();
        assert_eq!(strategy.buffer_mode(), BufferMode::Transient);
        assert_eq!(strategy.store_type(), StoreType::Worm);
        assert!(strategy.is_open());
    }

    #[test]
    fn stable_mode_without_path_is_rejected() {
        let options = StoreOptions::default().buffer_mode(BufferMode::DiskWorm);
        assert!(matches!(
            open_strategy(&options),
            Err(StorageError::InvalidOptions(_))
        ));
    }

    #[test]
    fn disk_rw_selects_reusable_strategy() {
        let dir = tempdir().unwrap();
        let options =
            StoreOptions::file(dir.path().join("rw.tsr"), BufferMode::DiskRw).initial_extent(4096);
        let strategy = open_strategy(&options).unwrap();
        assert_eq!(strategy.store_type(), StoreType::Rw);
    }

    #[test]
    fn every_stable_mode_reopens_committed_data() {
        for mode in [BufferMode::Direct, BufferMode::Mapped, BufferMode::DiskWorm, BufferMode::DiskRw] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("store.tsr");
            let options = StoreOptions::file(&path, mode).initial_extent(4096);

            let addr = {
                let mut strategy = open_strategy(&options).unwrap();
                let addr = strategy.write(b"durable").unwrap();
                strategy.commit().unwrap();
                let point = crate::root_block::CommitPoint {
                    next_offset: strategy.next_offset(),
                    commit_record_addr: Address::NULL,
                    meta_bits_addr: strategy.meta_bits_addr(),
                    meta_start_addr: strategy.meta_start_addr(),
                    commit_time: 7,
                };
                let next = strategy.root_block().advance(point);
                strategy.force(true).unwrap();
                strategy.write_root_block(&next, true).unwrap();
                strategy.close().unwrap();
                addr
            };

            let strategy = open_strategy(&options.clone().create(false)).unwrap();
            assert_eq!(strategy.read(addr).unwrap(), b"durable", "mode {mode}");
            assert_eq!(strategy.root_block().last_commit_time, 7);
        }
    }
}
