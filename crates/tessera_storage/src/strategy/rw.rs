//! Reusable-space buffer strategy.
//!
//! Allocation still appends through the WORM path; no free-list reuse is
//! attempted. What this variant adds is the bookkeeping seam: deleted
//! records are held as deferred frees and persisted at commit as a
//! meta-bits record whose address is carried in the root block.

use super::{BufferStrategy, StrategyState, WormStrategy};
use crate::address::{Address, AddressManager};
use crate::backend::ExtentBackend;
use crate::error::{StorageError, StorageResult};
use crate::header::{le_u64, USER_EXTENT_OFFSET};
use crate::mode::{BufferMode, StoreType};
use crate::options::StoreOptions;
use crate::root_block::{RootBlock, RootBlockSlot};

/// Read/write strategy with deferred frees.
#[derive(Debug)]
pub struct RwStrategy {
    inner: WormStrategy,
    pending_frees: Vec<Address>,
    meta_bits_addr: Address,
    committed_meta_bits_addr: Address,
    released: u64,
}

impl RwStrategy {
    /// Creates or recovers a reusable-space store over `backend`.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be opened or its meta-bits record is
    /// unreadable.
    pub fn open(options: &StoreOptions, backend: Box<dyn ExtentBackend>) -> StorageResult<Self> {
        let inner = WormStrategy::open_as(options, backend, StoreType::Rw)?;
        let meta_bits_addr = inner.root_block().meta_bits_addr;
        let released = if meta_bits_addr.is_null() {
            0
        } else {
            decode_frees(&inner.read(meta_bits_addr)?)?.len() as u64
        };
        Ok(Self {
            inner,
            pending_frees: Vec::new(),
            meta_bits_addr,
            committed_meta_bits_addr: meta_bits_addr,
            released,
        })
    }

    /// Frees recorded since the last commit.
    #[must_use]
    pub fn pending_frees(&self) -> &[Address] {
        &self.pending_frees
    }

    /// Number of records released by the last committed meta-bits record.
    #[must_use]
    pub fn released(&self) -> u64 {
        self.released
    }
}

fn encode_frees(frees: &[Address]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frees.len() * 8);
    for addr in frees {
        buf.extend_from_slice(&addr.as_u64().to_le_bytes());
    }
    buf
}

fn decode_frees(data: &[u8]) -> StorageResult<Vec<Address>> {
    if data.len() % 8 != 0 {
        return Err(StorageError::corrupted(format!(
            "meta-bits record length {} is not a multiple of 8",
            data.len()
        )));
    }
    Ok((0..data.len() / 8)
        .map(|i| Address::new(le_u64(data, i * 8)))
        .collect())
}

impl BufferStrategy for RwStrategy {
    fn buffer_mode(&self) -> BufferMode {
        self.inner.buffer_mode()
    }

    fn store_type(&self) -> StoreType {
        StoreType::Rw
    }

    fn address_manager(&self) -> &AddressManager {
        self.inner.address_manager()
    }

    fn state(&self) -> StrategyState {
        self.inner.state()
    }

    fn write(&mut self, data: &[u8]) -> StorageResult<Address> {
        self.inner.write(data)
    }

    fn read(&self, addr: Address) -> StorageResult<Vec<u8>> {
        self.inner.read(addr)
    }

    fn delete(&mut self, addr: Address) -> StorageResult<()> {
        self.inner.delete(addr)?;
        self.pending_frees.push(addr);
        Ok(())
    }

    fn overflow(&mut self, needed: u64) -> StorageResult<bool> {
        self.inner.overflow(needed)
    }

    fn truncate(&mut self, extent: u64) -> StorageResult<()> {
        self.inner.truncate(extent)
    }

    fn commit(&mut self) -> StorageResult<()> {
        if !self.pending_frees.is_empty() {
            let record = encode_frees(&self.pending_frees);
            self.meta_bits_addr = self.inner.write(&record)?;
            self.released = self.pending_frees.len() as u64;
            self.pending_frees.clear();
        }
        self.inner.commit()?;
        self.committed_meta_bits_addr = self.meta_bits_addr;
        Ok(())
    }

    fn abort(&mut self) {
        self.pending_frees.clear();
        self.meta_bits_addr = self.committed_meta_bits_addr;
        self.inner.abort();
    }

    fn rewind_to_root_block(&mut self) {
        self.pending_frees.clear();
        self.meta_bits_addr = self.inner.root_block().meta_bits_addr;
        self.committed_meta_bits_addr = self.meta_bits_addr;
        self.inner.rewind_to_root_block();
    }

    fn next_offset(&self) -> u64 {
        self.inner.next_offset()
    }

    fn commit_offset(&self) -> u64 {
        self.inner.commit_offset()
    }

    fn is_dirty(&self) -> bool {
        self.inner.is_dirty() || !self.pending_frees.is_empty()
    }

    fn user_extent(&self) -> u64 {
        self.inner.user_extent()
    }

    fn extent(&self) -> u64 {
        self.inner.extent()
    }

    fn maximum_extent(&self) -> u64 {
        self.inner.maximum_extent()
    }

    fn meta_bits_addr(&self) -> Address {
        self.meta_bits_addr
    }

    fn meta_start_addr(&self) -> u64 {
        USER_EXTENT_OFFSET
    }

    fn force(&mut self, metadata: bool) -> StorageResult<()> {
        self.inner.force(metadata)
    }

    fn root_block(&self) -> &RootBlock {
        self.inner.root_block()
    }

    fn write_root_block(&mut self, rb: &RootBlock, force: bool) -> StorageResult<()> {
        self.inner.write_root_block(rb, force)
    }

    fn read_root_block(&self, slot: RootBlockSlot) -> StorageResult<Vec<u8>> {
        self.inner.read_root_block(slot)
    }

    fn close_for_writes(&mut self) -> StorageResult<()> {
        self.inner.close_for_writes()
    }

    fn close(&mut self) -> StorageResult<()> {
        self.inner.close()
    }

    fn destroy(&mut self) -> StorageResult<()> {
        self.inner.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;

    fn rw_store() -> RwStrategy {
        let options = StoreOptions::transient().initial_extent(256);
        RwStrategy::open(&options, Box::new(InMemoryBackend::new())).unwrap()
    }

    #[test]
    fn delete_defers_until_commit() {
        let mut store = rw_store();
        let addr = store.write(b"short-lived").unwrap();
        store.commit().unwrap();

        store.delete(addr).unwrap();
        assert_eq!(store.pending_frees(), &[addr]);
        assert!(store.is_dirty());

        store.commit().unwrap();
        assert!(store.pending_frees().is_empty());
        assert!(!store.meta_bits_addr().is_null());
        assert_eq!(store.released(), 1);
        assert_eq!(
            decode_frees(&store.read(store.meta_bits_addr()).unwrap()).unwrap(),
            vec![addr]
        );
    }

    #[test]
    fn abort_drops_pending_frees() {
        let mut store = rw_store();
        let addr = store.write(b"record").unwrap();
        store.commit().unwrap();

        store.delete(addr).unwrap();
        store.abort();

        assert!(store.pending_frees().is_empty());
        assert!(store.meta_bits_addr().is_null());
        assert!(!store.is_dirty());
    }

    #[test]
    fn delete_of_unwritten_address_fails() {
        let mut store = rw_store();
        let bogus = store.address_manager().encode(100, 4).unwrap();
        assert!(matches!(
            store.delete(bogus),
            Err(StorageError::NotWritten { .. })
        ));
    }

    #[test]
    fn reopen_reads_committed_meta_bits() {
        let backend = InMemoryBackend::new();
        let image = backend.share();
        let options = StoreOptions::transient().initial_extent(256);

        {
            let mut store = RwStrategy::open(&options, Box::new(backend)).unwrap();
            let a = store.write(b"a").unwrap();
            let b = store.write(b"b").unwrap();
            store.delete(a).unwrap();
            store.delete(b).unwrap();
            store.commit().unwrap();
            let next = store.root_block().advance(crate::root_block::CommitPoint {
                next_offset: store.next_offset(),
                commit_record_addr: Address::NULL,
                meta_bits_addr: store.meta_bits_addr(),
                meta_start_addr: store.meta_start_addr(),
                commit_time: 1,
            });
            store.write_root_block(&next, true).unwrap();
        }

        let store =
            RwStrategy::open(&options, Box::new(InMemoryBackend::with_data(image.data()))).unwrap();
        assert_eq!(store.released(), 2);
        assert_eq!(store.meta_start_addr(), USER_EXTENT_OFFSET);
    }
}
