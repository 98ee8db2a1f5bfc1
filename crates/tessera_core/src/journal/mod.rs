//! The journal: commit protocol, commit history and live indices.
//!
//! A journal owns one buffer strategy. Index checkpoints and commit records
//! are appended to it; a commit makes them durable by writing a commit record
//! and advancing the root block. History is the chain of commit records,
//! rebuilt on open by walking back from the current root block.

mod commit_record;

pub use commit_record::{CommitRecord, COMMIT_RECORD_MAGIC, COMMIT_RECORD_VERSION};

use crate::config::{EngineConfig, ForceMode};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexMetadata, IndexSnapshot, LiveIndex, RecordStore};
use crate::stats::EngineStats;
use crate::types::Timestamp;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_storage::{
    open_strategy, open_with_backend, Address, BufferStrategy, CommitPoint, ExtentBackend,
    RootBlock, StoreOptions,
};
use tracing::{debug, info, warn};

/// Historical snapshots kept before the cache is emptied.
const SNAPSHOT_CACHE_CAPACITY: usize = 256;

/// Where a task's index handle comes from.
#[derive(Debug, Clone)]
pub enum IndexSource {
    /// The mutable index, for unisolated access.
    Live(Arc<LiveIndex>),
    /// An immutable committed view.
    Historical(Arc<IndexSnapshot>),
}

/// Resolves named indices as of a timestamp.
pub trait ResourceManager: RecordStore {
    /// Finds `name` at `timestamp`. [`Timestamp::UNISOLATED`] names the live
    /// index; any other value names the view as of the latest commit at or
    /// before it.
    ///
    /// # Errors
    ///
    /// Returns an error if a checkpoint cannot be loaded.
    fn index_sources(&self, name: &str, timestamp: Timestamp) -> CoreResult<Option<IndexSource>>;
}

/// A transactional journal over one store.
pub struct Journal {
    store: RwLock<Box<dyn BufferStrategy>>,
    force_on_commit: ForceMode,
    history: RwLock<BTreeMap<Timestamp, Arc<CommitRecord>>>,
    live: RwLock<BTreeMap<String, Arc<LiveIndex>>>,
    snapshots: Mutex<HashMap<(String, Address), Arc<IndexSnapshot>>>,
    abort_required: AtomicBool,
    closed: AtomicBool,
    stats: Arc<EngineStats>,
}

impl Journal {
    /// Opens or creates the store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or its history is
    /// unreadable.
    pub fn open(config: &EngineConfig, stats: Arc<EngineStats>) -> CoreResult<Self> {
        let store = open_strategy(&config.store)?;
        Self::recover(store, config.force_on_commit, stats)
    }

    /// Opens a journal over a caller-supplied backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or its history is
    /// unreadable.
    pub fn open_with_backend(
        options: &StoreOptions,
        backend: Box<dyn ExtentBackend>,
        force_on_commit: ForceMode,
        stats: Arc<EngineStats>,
    ) -> CoreResult<Self> {
        let store = open_with_backend(options, backend)?;
        Self::recover(store, force_on_commit, stats)
    }

    fn recover(
        store: Box<dyn BufferStrategy>,
        force_on_commit: ForceMode,
        stats: Arc<EngineStats>,
    ) -> CoreResult<Self> {
        let root = *store.root_block();

        let mut history = BTreeMap::new();
        let mut addr = root.commit_record_addr;
        let mut expected_counter = root.commit_counter;
        while !addr.is_null() {
            let record = CommitRecord::decode(&store.read(addr)?)?;
            if record.commit_counter != expected_counter {
                return Err(CoreError::codec(format!(
                    "commit record at {addr} has counter {}, expected {expected_counter}",
                    record.commit_counter
                )));
            }
            expected_counter = expected_counter.saturating_sub(1);
            addr = record.prev_addr;
            history.insert(record.commit_time, Arc::new(record));
        }

        let mut live = BTreeMap::new();
        let mut snapshots = HashMap::new();
        if let Some(latest) = history.values().next_back() {
            for (name, checkpoint) in &latest.indices {
                let bytes = store.read(*checkpoint)?;
                let snapshot = Arc::new(IndexSnapshot::decode(&bytes, *checkpoint)?);
                live.insert(name.clone(), Arc::new(LiveIndex::from_snapshot(&snapshot)));
                snapshots.insert((name.clone(), *checkpoint), snapshot);
            }
        }

        info!(
            mode = %store.buffer_mode(),
            slot = %root.slot,
            commit_counter = root.commit_counter,
            commits = history.len(),
            indices = live.len(),
            next_offset = store.next_offset(),
            "journal opened"
        );

        Ok(Self {
            store: RwLock::new(store),
            force_on_commit,
            history: RwLock::new(history),
            live: RwLock::new(live),
            snapshots: Mutex::new(snapshots),
            abort_required: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats,
        })
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::JournalClosed);
        }
        Ok(())
    }

    /// Registers a new, empty live index.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::IndexExists`] if the name is taken.
    pub fn register_index(&self, metadata: IndexMetadata) -> CoreResult<Arc<LiveIndex>> {
        self.ensure_open()?;
        let mut live = self.live.write();
        if live.contains_key(&metadata.name) {
            return Err(CoreError::IndexExists {
                name: metadata.name,
            });
        }
        debug!(index = %metadata.name, isolatable = metadata.isolatable, "index registered");
        let index = Arc::new(LiveIndex::new(metadata));
        live.insert(index.name().to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Drops an index registered since the last commit.
    pub(crate) fn forget_uncommitted_index(&self, name: &str) {
        let mut live = self.live.write();
        if live.get(name).is_some_and(|idx| idx.committed_addr().is_null()) {
            live.remove(name);
        }
    }

    /// The live form of an index.
    #[must_use]
    pub fn live_index(&self, name: &str) -> Option<Arc<LiveIndex>> {
        self.live.read().get(name).cloned()
    }

    /// Names of all live indices.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.live.read().keys().cloned().collect()
    }

    /// The commit record in effect at `timestamp`: the one with the greatest
    /// commit time not after it.
    #[must_use]
    pub fn commit_record_at(&self, timestamp: Timestamp) -> Option<Arc<CommitRecord>> {
        self.history
            .read()
            .range(..=timestamp)
            .next_back()
            .map(|(_, record)| Arc::clone(record))
    }

    /// Commit times in ascending order.
    #[must_use]
    pub fn commit_times(&self) -> Vec<Timestamp> {
        self.history.read().keys().copied().collect()
    }

    /// The committed view of `name` as of `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be loaded.
    pub fn snapshot(&self, name: &str, timestamp: Timestamp) -> CoreResult<Option<Arc<IndexSnapshot>>> {
        let Some(record) = self.commit_record_at(timestamp) else {
            return Ok(None);
        };
        let Some(&addr) = record.indices.get(name) else {
            return Ok(None);
        };

        let key = (name.to_string(), addr);
        if let Some(snapshot) = self.snapshots.lock().get(&key) {
            return Ok(Some(Arc::clone(snapshot)));
        }

        let snapshot = Arc::new(IndexSnapshot::load(self, addr)?);
        let mut cache = self.snapshots.lock();
        if cache.len() >= SNAPSHOT_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(key, Arc::clone(&snapshot));
        Ok(Some(snapshot))
    }

    /// Makes everything written since the last commit durable.
    ///
    /// Dirty live indices are checkpointed first. Returns the new root
    /// block, or `None` when there was nothing to commit.
    ///
    /// # Errors
    ///
    /// Returns an error if any step of the protocol fails. The root block
    /// has not advanced in that case and the caller should
    /// [`abort`](Self::abort).
    pub fn commit(&self, commit_time: Timestamp) -> CoreResult<Option<RootBlock>> {
        self.ensure_open()?;
        let live = self.live.read();
        for index in live.values() {
            index.checkpoint(self)?;
        }

        let mut store = self.store.write();
        if !store.is_dirty() {
            return Ok(None);
        }

        let current = *store.root_block();
        let record = CommitRecord {
            commit_time,
            commit_counter: current.commit_counter + 1,
            prev_addr: current.commit_record_addr,
            indices: live
                .iter()
                .map(|(name, index)| (name.clone(), index.checkpoint_addr()))
                .collect(),
        };
        let encoded = record.encode();
        let record_addr = store.write(&encoded)?;
        self.stats.record_bytes_written(encoded.len() as u64);

        store.commit()?;
        let force = self.force_on_commit != ForceMode::No;
        if force {
            store.force(self.force_on_commit == ForceMode::ForceMetadata)?;
        }

        let next = current.advance(CommitPoint {
            next_offset: store.next_offset(),
            commit_record_addr: record_addr,
            meta_bits_addr: store.meta_bits_addr(),
            meta_start_addr: store.meta_start_addr(),
            commit_time: commit_time.as_u64(),
        });
        store.write_root_block(&next, force)?;
        drop(store);

        for index in live.values() {
            index.mark_committed();
        }
        self.history.write().insert(commit_time, Arc::new(record));
        self.stats.record_commit();
        info!(
            %commit_time,
            commit_counter = next.commit_counter,
            slot = %next.slot,
            next_offset = next.next_offset,
            "commit"
        );
        Ok(Some(next))
    }

    /// Discards everything since the last durable commit: the store is
    /// rewound to its root block and live indices return to their committed
    /// checkpoints. Clears the abort-required signal.
    pub fn abort(&self) {
        self.store.write().rewind_to_root_block();
        self.live.write().retain(|name, index| {
            if index.committed_addr().is_null() {
                debug!(index = %name, "dropping uncommitted index");
                return false;
            }
            index.reset_to_committed();
            true
        });
        self.abort_required.store(false, Ordering::Release);
        self.stats.record_journal_abort();
        warn!("journal aborted to last commit");
    }

    /// Requests an abort cycle before further unisolated work.
    pub fn signal_abort_required(&self) {
        self.abort_required.store(true, Ordering::Release);
    }

    /// True while an abort has been requested but not performed.
    #[must_use]
    pub fn is_abort_required(&self) -> bool {
        self.abort_required.load(Ordering::Acquire)
    }

    /// Commit time of the latest commit, or [`Timestamp::UNISOLATED`] if
    /// there has been none.
    #[must_use]
    pub fn last_commit_time(&self) -> Timestamp {
        Timestamp::new(self.store.read().root_block().last_commit_time)
    }

    /// Current root block.
    #[must_use]
    pub fn root_block(&self) -> RootBlock {
        *self.store.read().root_block()
    }

    /// Current commit counter.
    #[must_use]
    pub fn commit_counter(&self) -> u64 {
        self.store.read().root_block().commit_counter
    }

    /// True when there is uncommitted data.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.store.read().is_dirty() || self.live.read().values().any(|idx| idx.is_dirty())
    }

    /// Runs `f` with read access to the underlying store.
    pub fn with_store<R>(&self, f: impl FnOnce(&dyn BufferStrategy) -> R) -> R {
        f(self.store.read().as_ref())
    }

    /// Closes the store, discarding uncommitted writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is already closed.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(CoreError::JournalClosed);
        }
        let mut store = self.store.write();
        store.rewind_to_root_block();
        store.close()?;
        info!(commit_counter = store.root_block().commit_counter, "journal closed");
        Ok(())
    }

    /// Closes the journal if needed and deletes its backing store.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be removed.
    pub fn destroy(&self) -> CoreResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.store.write().close()?;
        }
        self.store.write().destroy()?;
        Ok(())
    }

    /// True once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl RecordStore for Journal {
    fn write_record(&self, data: &[u8]) -> CoreResult<Address> {
        self.ensure_open()?;
        let addr = self.store.write().write(data)?;
        self.stats.record_bytes_written(data.len() as u64);
        Ok(addr)
    }

    fn read_record(&self, addr: Address) -> CoreResult<Vec<u8>> {
        Ok(self.store.read().read(addr)?)
    }
}

impl ResourceManager for Journal {
    fn index_sources(&self, name: &str, timestamp: Timestamp) -> CoreResult<Option<IndexSource>> {
        if timestamp.is_unisolated() {
            return Ok(self.live_index(name).map(IndexSource::Live));
        }
        Ok(self.snapshot(name, timestamp)?.map(IndexSource::Historical))
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("root_block", &self.root_block())
            .field("indices", &self.index_names())
            .field("commits", &self.history.read().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::{BufferMode, InMemoryBackend};

    fn transient() -> Journal {
        Journal::open(&EngineConfig::transient(), Arc::new(EngineStats::new())).unwrap()
    }

    fn shared_backend_journal(backend: &InMemoryBackend) -> Journal {
        Journal::open_with_backend(
            &StoreOptions::transient().initial_extent(4096),
            Box::new(backend.share()),
            ForceMode::Force,
            Arc::new(EngineStats::new()),
        )
        .unwrap()
    }

    #[test]
    fn commit_advances_root_block() {
        let journal = transient();
        let idx = journal.register_index(IndexMetadata::new("a")).unwrap();
        idx.put(b"k".to_vec(), b"v".to_vec(), 1);

        let rb = journal.commit(Timestamp::new(10)).unwrap().unwrap();

        assert_eq!(rb.commit_counter, 1);
        assert_eq!(journal.last_commit_time(), Timestamp::new(10));
        assert!(!journal.is_dirty());
        assert_eq!(journal.commit_times(), vec![Timestamp::new(10)]);
    }

    #[test]
    fn commit_without_changes_is_a_no_op() {
        let journal = transient();
        assert!(journal.commit(Timestamp::new(5)).unwrap().is_none());
        assert_eq!(journal.commit_counter(), 0);
    }

    #[test]
    fn snapshot_reads_as_of_commit_time() {
        let journal = transient();
        let idx = journal.register_index(IndexMetadata::new("a")).unwrap();
        idx.put(b"k".to_vec(), b"one".to_vec(), 1);
        journal.commit(Timestamp::new(10)).unwrap();
        idx.put(b"k".to_vec(), b"two".to_vec(), 2);
        journal.commit(Timestamp::new(20)).unwrap();

        let at = |ts| journal.snapshot("a", Timestamp::new(ts)).unwrap();
        assert!(at(5).is_none());
        assert_eq!(at(10).unwrap().get(b"k"), Some(&b"one"[..]));
        assert_eq!(at(15).unwrap().get(b"k"), Some(&b"one"[..]));
        assert_eq!(at(25).unwrap().get(b"k"), Some(&b"two"[..]));
    }

    #[test]
    fn abort_restores_committed_state() {
        let journal = transient();
        let idx = journal.register_index(IndexMetadata::new("a")).unwrap();
        idx.put(b"k".to_vec(), b"one".to_vec(), 1);
        journal.commit(Timestamp::new(10)).unwrap();
        let committed_next = journal.root_block().next_offset;

        idx.put(b"k".to_vec(), b"two".to_vec(), 2);
        idx.checkpoint(&journal).unwrap();
        journal.register_index(IndexMetadata::new("b")).unwrap();
        journal.abort();

        assert_eq!(idx.get(b"k"), Some(b"one".to_vec()));
        assert!(journal.live_index("b").is_none());
        assert_eq!(journal.with_store(|s| s.next_offset()), committed_next);
        assert!(!journal.is_dirty());
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let journal = transient();
        journal.register_index(IndexMetadata::new("a")).unwrap();
        assert!(matches!(
            journal.register_index(IndexMetadata::new("a")),
            Err(CoreError::IndexExists { .. })
        ));
    }

    #[test]
    fn reopen_rebuilds_history_and_indices() {
        let backend = InMemoryBackend::new();
        {
            let journal = shared_backend_journal(&backend);
            let idx = journal.register_index(IndexMetadata::new("a")).unwrap();
            idx.put(b"k".to_vec(), b"one".to_vec(), 1);
            journal.commit(Timestamp::new(10)).unwrap();
            idx.put(b"k".to_vec(), b"two".to_vec(), 2);
            journal.commit(Timestamp::new(20)).unwrap();
            idx.put(b"k".to_vec(), b"uncommitted".to_vec(), 3);
        }

        let journal = shared_backend_journal(&backend);
        assert_eq!(
            journal.commit_times(),
            vec![Timestamp::new(10), Timestamp::new(20)]
        );
        assert_eq!(journal.commit_counter(), 2);
        let idx = journal.live_index("a").unwrap();
        assert_eq!(idx.get(b"k"), Some(b"two".to_vec()));
        let old = journal.snapshot("a", Timestamp::new(10)).unwrap().unwrap();
        assert_eq!(old.get(b"k"), Some(&b"one"[..]));
    }

    #[test]
    fn index_sources_distinguish_live_and_historical() {
        let journal = transient();
        let idx = journal.register_index(IndexMetadata::new("a")).unwrap();
        idx.put(b"k".to_vec(), b"v".to_vec(), 1);
        journal.commit(Timestamp::new(10)).unwrap();

        assert!(matches!(
            journal.index_sources("a", Timestamp::UNISOLATED).unwrap(),
            Some(IndexSource::Live(_))
        ));
        assert!(matches!(
            journal.index_sources("a", Timestamp::new(10)).unwrap(),
            Some(IndexSource::Historical(_))
        ));
        assert!(journal.index_sources("missing", Timestamp::new(10)).unwrap().is_none());
    }

    #[test]
    fn closed_journal_refuses_writes() {
        let journal = transient();
        journal.close().unwrap();
        assert!(matches!(
            journal.write_record(b"x"),
            Err(CoreError::JournalClosed)
        ));
        assert!(matches!(journal.close(), Err(CoreError::JournalClosed)));
    }

    #[test]
    fn disk_rw_mode_commits_through_journal() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::file(dir.path().join("rw.jnl"), BufferMode::DiskRw);
        {
            let journal = Journal::open(&config, Arc::new(EngineStats::new())).unwrap();
            let idx = journal.register_index(IndexMetadata::new("a")).unwrap();
            idx.put(b"k".to_vec(), b"v".to_vec(), 1);
            journal.commit(Timestamp::new(10)).unwrap();
            journal.close().unwrap();
        }
        let journal = Journal::open(&config, Arc::new(EngineStats::new())).unwrap();
        assert_eq!(journal.live_index("a").unwrap().get(b"k"), Some(b"v".to_vec()));
    }
}
