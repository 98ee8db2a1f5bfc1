//! Append-only buffer strategy.

use super::{BufferStrategy, StrategyState};
use crate::address::{Address, AddressManager};
use crate::backend::ExtentBackend;
use crate::error::{StorageError, StorageResult};
use crate::header::{FileHeader, HEADER_SIZE, ROOT_BLOCK_SIZE, USER_EXTENT_OFFSET};
use crate::mode::{BufferMode, StoreType};
use crate::options::StoreOptions;
use crate::root_block::{choose_root_block, RootBlock, RootBlockSlot};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Write-once, read-many strategy.
///
/// Records are appended at `next_offset` and never overwritten. `abort`
/// rewinds `next_offset` to the last commit, which discards the tail.
pub struct WormStrategy {
    mode: BufferMode,
    store_type: StoreType,
    backend: Box<dyn ExtentBackend>,
    am: AddressManager,
    state: StrategyState,
    initial_extent: u64,
    minimum_extension: u64,
    maximum_extent: u64,
    user_extent: u64,
    next_offset: u64,
    commit_offset: u64,
    root_block: RootBlock,
}

impl WormStrategy {
    /// Creates or recovers a store over `backend`.
    ///
    /// # Errors
    ///
    /// Fails if the options are invalid or an existing store's header or
    /// root blocks cannot be validated.
    pub fn open(options: &StoreOptions, backend: Box<dyn ExtentBackend>) -> StorageResult<Self> {
        Self::open_as(options, backend, StoreType::Worm)
    }

    pub(super) fn open_as(
        options: &StoreOptions,
        mut backend: Box<dyn ExtentBackend>,
        store_type: StoreType,
    ) -> StorageResult<Self> {
        if options.initial_extent == 0 {
            return Err(StorageError::InvalidOptions(
                "initial extent must be positive".into(),
            ));
        }

        let (am, root_block, user_extent) = if backend.is_empty() {
            Self::create(options, backend.as_mut(), store_type)?
        } else {
            Self::recover(backend.as_ref(), store_type)?
        };

        let mode_max = options.buffer_mode.max_extent();
        let configured_max = if options.maximum_extent == 0 {
            u64::MAX
        } else {
            options.maximum_extent
        };
        let maximum_extent = mode_max
            .min(configured_max)
            .min(am.max_offset().saturating_add(1));

        Ok(Self {
            mode: options.buffer_mode,
            store_type,
            backend,
            am,
            state: StrategyState::Open,
            initial_extent: options.initial_extent,
            minimum_extension: options.minimum_extension,
            maximum_extent,
            user_extent,
            next_offset: root_block.next_offset,
            commit_offset: root_block.next_offset,
            root_block,
        })
    }

    fn create(
        options: &StoreOptions,
        backend: &mut dyn ExtentBackend,
        store_type: StoreType,
    ) -> StorageResult<(AddressManager, RootBlock, u64)> {
        let am = AddressManager::new(options.offset_bits)?;
        let header = FileHeader::new(store_type, options.offset_bits);
        let create_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let rb0 = RootBlock::initial(store_type, options.offset_bits, Uuid::new_v4(), create_time);
        let rb1 = RootBlock {
            slot: RootBlockSlot::One,
            ..rb0
        };

        backend.set_len(USER_EXTENT_OFFSET + options.initial_extent)?;
        backend.write_at(0, &header.encode())?;
        backend.write_at(RootBlockSlot::Zero.offset(), &rb0.encode())?;
        backend.write_at(RootBlockSlot::One.offset(), &rb1.encode())?;
        backend.sync()?;

        tracing::info!(
            store_type = %store_type,
            offset_bits = options.offset_bits,
            initial_extent = options.initial_extent,
            uuid = %rb0.uuid,
            "created store"
        );

        Ok((am, rb0, options.initial_extent))
    }

    fn recover(
        backend: &dyn ExtentBackend,
        store_type: StoreType,
    ) -> StorageResult<(AddressManager, RootBlock, u64)> {
        if backend.len() < USER_EXTENT_OFFSET {
            return Err(StorageError::corrupted(format!(
                "extent of {} bytes is shorter than the header",
                backend.len()
            )));
        }

        let header = FileHeader::decode(&backend.read_at(0, HEADER_SIZE as usize)?)?;
        if header.store_type != store_type {
            return Err(StorageError::corrupted(format!(
                "store type mismatch: file is {}, opened as {}",
                header.store_type, store_type
            )));
        }
        let am = AddressManager::new(header.offset_bits)?;

        let decode = |slot: RootBlockSlot| -> StorageResult<RootBlock> {
            let bytes = backend.read_at(slot.offset(), ROOT_BLOCK_SIZE as usize)?;
            let rb = RootBlock::decode(&bytes, slot)?;
            if rb.offset_bits != header.offset_bits {
                return Err(StorageError::corrupted(format!(
                    "root block in {slot} has offset bits {}, header has {}",
                    rb.offset_bits, header.offset_bits
                )));
            }
            Ok(rb)
        };
        let root_block = choose_root_block(decode(RootBlockSlot::Zero), decode(RootBlockSlot::One))?;

        let user_extent = backend.len() - USER_EXTENT_OFFSET;
        if root_block.next_offset > user_extent {
            return Err(StorageError::corrupted(format!(
                "root block next offset {} beyond user extent {}",
                root_block.next_offset, user_extent
            )));
        }

        tracing::info!(
            slot = %root_block.slot,
            commit_counter = root_block.commit_counter,
            next_offset = root_block.next_offset,
            "recovered store"
        );

        Ok((am, root_block, user_extent))
    }

    fn ensure_readable(&self) -> StorageResult<()> {
        match self.state {
            StrategyState::Open | StrategyState::ReadOnly => Ok(()),
            _ => Err(StorageError::NotOpen),
        }
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        match self.state {
            StrategyState::Open => Ok(()),
            StrategyState::ReadOnly => Err(StorageError::ReadOnly),
            _ => Err(StorageError::NotOpen),
        }
    }

    /// Validates that `addr` names a record inside the written region.
    pub(super) fn check_written(&self, addr: Address) -> StorageResult<(u64, u64)> {
        let (offset, len) = self.am.decode(addr)?;
        if offset.saturating_add(len) > self.next_offset {
            return Err(StorageError::NotWritten {
                offset,
                len,
                next_offset: self.next_offset,
            });
        }
        Ok((offset, len))
    }
}

impl fmt::Debug for WormStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WormStrategy")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("user_extent", &self.user_extent)
            .field("next_offset", &self.next_offset)
            .field("commit_offset", &self.commit_offset)
            .finish_non_exhaustive()
    }
}

impl BufferStrategy for WormStrategy {
    fn buffer_mode(&self) -> BufferMode {
        self.mode
    }

    fn store_type(&self) -> StoreType {
        self.store_type
    }

    fn address_manager(&self) -> &AddressManager {
        &self.am
    }

    fn state(&self) -> StrategyState {
        self.state
    }

    fn write(&mut self, data: &[u8]) -> StorageResult<Address> {
        self.ensure_writable()?;
        if data.is_empty() {
            return Err(StorageError::EmptyRecord);
        }
        let len = data.len() as u64;
        if len > self.am.max_length() {
            return Err(StorageError::RecordTooLarge {
                len,
                max: self.am.max_length(),
            });
        }

        let end = self.next_offset.saturating_add(len);
        if end > self.user_extent && !self.overflow(end - self.user_extent)? {
            return Err(StorageError::MaxExtent {
                required: end,
                maximum: self.maximum_extent,
            });
        }

        let addr = self.am.encode(self.next_offset, len)?;
        self.backend
            .write_at(USER_EXTENT_OFFSET + self.next_offset, data)?;
        self.next_offset = end;
        Ok(addr)
    }

    fn read(&self, addr: Address) -> StorageResult<Vec<u8>> {
        self.ensure_readable()?;
        let (offset, len) = self.check_written(addr)?;
        self.backend
            .read_at(USER_EXTENT_OFFSET + offset, len as usize)
    }

    fn delete(&mut self, addr: Address) -> StorageResult<()> {
        self.ensure_writable()?;
        self.check_written(addr).map(|_| ())
    }

    fn overflow(&mut self, needed: u64) -> StorageResult<bool> {
        let required = self.user_extent.saturating_add(needed);
        if required > self.maximum_extent {
            tracing::warn!(
                required,
                maximum = self.maximum_extent,
                "would exceed maximum extent"
            );
            return Ok(false);
        }

        let step = needed.max(self.initial_extent.max(self.minimum_extension));
        let mut new_extent = self.user_extent.saturating_add(step);
        if new_extent > self.maximum_extent {
            new_extent = self.maximum_extent;
            if new_extent - self.user_extent < needed {
                return Ok(false);
            }
        }

        self.truncate(new_extent)?;
        Ok(true)
    }

    fn truncate(&mut self, extent: u64) -> StorageResult<()> {
        self.ensure_writable()?;
        if extent < self.next_offset {
            return Err(StorageError::Truncate {
                extent,
                next_offset: self.next_offset,
            });
        }
        self.backend.set_len(USER_EXTENT_OFFSET + extent)?;
        tracing::debug!(from = self.user_extent, to = extent, "resized user extent");
        self.user_extent = extent;
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.ensure_writable()?;
        self.commit_offset = self.next_offset;
        Ok(())
    }

    fn abort(&mut self) {
        self.next_offset = self.commit_offset;
    }

    fn rewind_to_root_block(&mut self) {
        self.next_offset = self.root_block.next_offset;
        self.commit_offset = self.root_block.next_offset;
    }

    fn next_offset(&self) -> u64 {
        self.next_offset
    }

    fn commit_offset(&self) -> u64 {
        self.commit_offset
    }

    fn user_extent(&self) -> u64 {
        self.user_extent
    }

    fn extent(&self) -> u64 {
        USER_EXTENT_OFFSET + self.user_extent
    }

    fn maximum_extent(&self) -> u64 {
        self.maximum_extent
    }

    fn meta_bits_addr(&self) -> Address {
        Address::NULL
    }

    fn meta_start_addr(&self) -> u64 {
        0
    }

    fn force(&mut self, metadata: bool) -> StorageResult<()> {
        self.ensure_readable()?;
        if metadata {
            self.backend.sync()
        } else {
            self.backend.flush()
        }
    }

    fn root_block(&self) -> &RootBlock {
        &self.root_block
    }

    fn write_root_block(&mut self, rb: &RootBlock, force: bool) -> StorageResult<()> {
        self.ensure_writable()?;
        self.backend.write_at(rb.slot.offset(), &rb.encode())?;
        if force {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        self.root_block = *rb;
        Ok(())
    }

    fn read_root_block(&self, slot: RootBlockSlot) -> StorageResult<Vec<u8>> {
        self.ensure_readable()?;
        self.backend
            .read_at(slot.offset(), ROOT_BLOCK_SIZE as usize)
    }

    fn close_for_writes(&mut self) -> StorageResult<()> {
        self.ensure_writable()?;
        self.backend.flush()?;
        self.state = StrategyState::ReadOnly;
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.ensure_readable()?;
        self.backend.flush()?;
        self.state = StrategyState::Closed;
        Ok(())
    }

    fn destroy(&mut self) -> StorageResult<()> {
        match self.state {
            StrategyState::Closed => {
                self.backend.destroy()?;
                self.state = StrategyState::Destroyed;
                Ok(())
            }
            StrategyState::Destroyed => Err(StorageError::NotOpen),
            _ => Err(StorageError::StillOpen),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::options::DEFAULT_MINIMUM_EXTENSION;
    use proptest::prelude::*;

    fn transient(initial_extent: u64) -> WormStrategy {
        let options = StoreOptions::transient().initial_extent(initial_extent);
        WormStrategy::open(&options, Box::new(InMemoryBackend::new())).unwrap()
    }

    #[test]
    fn write_then_read() {
        let mut store = transient(1024);
        let a = store.write(b"alpha").unwrap();
        let b = store.write(b"beta").unwrap();

        assert_eq!(store.read(a).unwrap(), b"alpha");
        assert_eq!(store.read(b).unwrap(), b"beta");
        assert_eq!(store.next_offset(), 9);
    }

    #[test]
    fn empty_write_fails() {
        let mut store = transient(1024);
        assert!(matches!(store.write(b""), Err(StorageError::EmptyRecord)));
        assert_eq!(store.next_offset(), 0);
    }

    #[test]
    fn read_rejects_null_and_zero_length() {
        let store = transient(1024);
        assert!(matches!(
            store.read(Address::NULL),
            Err(StorageError::NullAddress)
        ));
        let zero_len = Address::new(8 << store.address_manager().length_bits());
        assert!(matches!(
            store.read(zero_len),
            Err(StorageError::ZeroLength { .. })
        ));
    }

    #[test]
    fn read_beyond_next_offset_fails() {
        let mut store = transient(1024);
        store.write(b"abc").unwrap();
        let unwritten = store.address_manager().encode(3, 4).unwrap();
        assert!(matches!(
            store.read(unwritten),
            Err(StorageError::NotWritten { .. })
        ));
    }

    #[test]
    fn abort_discards_uncommitted_tail() {
        let mut store = transient(1024);
        let committed = store.write(b"kept").unwrap();
        store.commit().unwrap();
        let dropped = store.write(b"dropped").unwrap();
        assert!(store.is_dirty());

        store.abort();

        assert!(!store.is_dirty());
        assert_eq!(store.next_offset(), 4);
        assert_eq!(store.read(committed).unwrap(), b"kept");
        assert!(matches!(
            store.read(dropped),
            Err(StorageError::NotWritten { .. })
        ));
    }

    #[test]
    fn rewind_undoes_commit_without_root_block() {
        let mut store = transient(1024);
        store.write(b"durable").unwrap();
        store.commit().unwrap();
        let rb = store.root_block().advance(crate::root_block::CommitPoint {
            next_offset: store.next_offset(),
            commit_record_addr: Address::NULL,
            meta_bits_addr: Address::NULL,
            meta_start_addr: 0,
            commit_time: 5,
        });
        store.write_root_block(&rb, false).unwrap();

        store.write(b"lost").unwrap();
        store.commit().unwrap();
        assert_eq!(store.commit_offset(), 11);

        store.rewind_to_root_block();

        assert_eq!(store.next_offset(), 7);
        assert_eq!(store.commit_offset(), 7);
    }

    #[test]
    fn commit_is_idempotent() {
        let mut store = transient(1024);
        store.write(b"x").unwrap();
        store.commit().unwrap();
        assert!(!store.is_dirty());
        store.commit().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(store.commit_offset(), 1);
    }

    #[test]
    fn overflow_grows_by_minimum_extension() {
        let mut store = transient(1024);
        assert!(store.overflow(10).unwrap());
        assert_eq!(store.user_extent(), 1024 + DEFAULT_MINIMUM_EXTENSION);
    }

    #[test]
    fn overflow_grows_by_request_when_larger() {
        let options = StoreOptions::transient()
            .initial_extent(16)
            .minimum_extension(32);
        let mut store = WormStrategy::open(&options, Box::new(InMemoryBackend::new())).unwrap();

        assert!(store.overflow(100).unwrap());
        assert_eq!(store.user_extent(), 16 + 100);
    }

    #[test]
    fn overflow_caps_at_maximum_extent() {
        let options = StoreOptions::transient()
            .initial_extent(64)
            .minimum_extension(1024)
            .maximum_extent(200);
        let mut store = WormStrategy::open(&options, Box::new(InMemoryBackend::new())).unwrap();

        assert!(store.overflow(10).unwrap());
        assert_eq!(store.user_extent(), 200);
        assert!(!store.overflow(1).unwrap());
        assert_eq!(store.user_extent(), 200);
    }

    #[test]
    fn write_past_maximum_extent_fails() {
        let options = StoreOptions::transient()
            .initial_extent(8)
            .maximum_extent(12);
        let mut store = WormStrategy::open(&options, Box::new(InMemoryBackend::new())).unwrap();

        store.write(b"12345678").unwrap();
        store.write(b"9abc").unwrap();
        let result = store.write(b"d");
        assert!(matches!(result, Err(StorageError::MaxExtent { .. })));
        assert_eq!(store.next_offset(), 12);
    }

    #[test]
    fn write_triggers_growth() {
        let options = StoreOptions::transient()
            .initial_extent(4)
            .minimum_extension(4);
        let mut store = WormStrategy::open(&options, Box::new(InMemoryBackend::new())).unwrap();

        let addr = store.write(b"longer than four").unwrap();
        assert_eq!(store.read(addr).unwrap(), b"longer than four");
        assert!(store.user_extent() >= 16);
    }

    #[test]
    fn truncate_below_written_data_fails() {
        let mut store = transient(64);
        store.write(b"0123456789").unwrap();
        assert!(matches!(
            store.truncate(5),
            Err(StorageError::Truncate { .. })
        ));
        store.truncate(10).unwrap();
        assert_eq!(store.user_extent(), 10);
    }

    #[test]
    fn lifecycle_state_machine() {
        let mut store = transient(64);
        store.write(b"a").unwrap();

        store.close_for_writes().unwrap();
        assert!(store.is_read_only());
        assert!(matches!(store.close_for_writes(), Err(StorageError::ReadOnly)));
        assert!(matches!(store.write(b"b"), Err(StorageError::ReadOnly)));
        assert!(matches!(store.commit(), Err(StorageError::ReadOnly)));
        assert!(store.commit_offset() < store.next_offset());

        assert!(matches!(store.destroy(), Err(StorageError::StillOpen)));
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(store.close(), Err(StorageError::NotOpen)));

        store.destroy().unwrap();
        assert_eq!(store.state(), StrategyState::Destroyed);
    }

    #[test]
    fn root_block_write_flips_current() {
        let mut store = transient(64);
        assert_eq!(store.root_block().slot, RootBlockSlot::Zero);
        store.write(b"payload").unwrap();
        store.commit().unwrap();

        let next = store.root_block().advance(crate::root_block::CommitPoint {
            next_offset: store.next_offset(),
            commit_record_addr: Address::NULL,
            meta_bits_addr: Address::NULL,
            meta_start_addr: 0,
            commit_time: 42,
        });
        store.write_root_block(&next, false).unwrap();

        assert_eq!(store.root_block().slot, RootBlockSlot::One);
        let raw = store.read_root_block(RootBlockSlot::One).unwrap();
        assert_eq!(RootBlock::decode(&raw, RootBlockSlot::One).unwrap(), next);
        assert!(!store.requires_commit(&next));
    }

    #[test]
    fn reopen_ignores_uncommitted_tail() {
        let backend = InMemoryBackend::new();
        let image = backend.share();
        let options = StoreOptions::transient().initial_extent(64);

        let mut store = WormStrategy::open(&options, Box::new(backend)).unwrap();
        store.write(b"never committed").unwrap();
        drop(store);

        let store =
            WormStrategy::open(&options, Box::new(InMemoryBackend::with_data(image.data()))).unwrap();
        assert_eq!(store.next_offset(), 0);
        assert_eq!(store.root_block().commit_counter, 0);
    }

    #[test]
    fn reopen_rejects_store_type_mismatch() {
        let backend = InMemoryBackend::new();
        let image = backend.share();
        let options = StoreOptions::transient().initial_extent(64);
        drop(WormStrategy::open(&options, Box::new(backend)).unwrap());

        let result = WormStrategy::open_as(
            &options,
            Box::new(InMemoryBackend::with_data(image.data())),
            StoreType::Rw,
        );
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    proptest! {
        #[test]
        fn next_offset_never_decreases(records in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..64), 1..40)) {
            let mut store = transient(128);
            let mut last = store.next_offset();
            for record in &records {
                store.write(record).unwrap();
                prop_assert!(store.next_offset() >= last);
                last = store.next_offset();
            }
        }

        #[test]
        fn abort_restores_commit_offset(
            committed in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..32), 0..10),
            pending in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..32), 0..10),
        ) {
            let mut store = transient(64);
            for record in &committed {
                store.write(record).unwrap();
            }
            store.commit().unwrap();
            let commit_offset = store.commit_offset();
            for record in &pending {
                store.write(record).unwrap();
            }
            store.abort();
            prop_assert_eq!(store.next_offset(), commit_offset);
            prop_assert!(!store.is_dirty());
        }

        #[test]
        fn growth_policy_formula(
            initial in 1u64..4096,
            minimum in 1u64..4096,
            needed in 1u64..8192,
            cap in 0u64..16384,
        ) {
            let options = StoreOptions::transient()
                .initial_extent(initial)
                .minimum_extension(minimum)
                .maximum_extent(cap);
            let mut store = WormStrategy::open(&options, Box::new(InMemoryBackend::new())).unwrap();
            let maximum = store.maximum_extent();
            let before = store.user_extent();

            let grown = store.overflow(needed).unwrap();
            if before + needed > maximum {
                prop_assert!(!grown);
                prop_assert_eq!(store.user_extent(), before);
            } else {
                prop_assert!(grown);
                let expected = (before + needed.max(initial.max(minimum))).min(maximum);
                prop_assert_eq!(store.user_extent(), expected);
            }
        }
    }
}
