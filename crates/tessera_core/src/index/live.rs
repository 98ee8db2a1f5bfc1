//! The mutable, unisolated form of an index.

use super::{encode_checkpoint, live_entries, IndexMetadata, IndexSnapshot, RecordStore, Tuple, TupleMap};
use crate::error::CoreResult;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tessera_storage::Address;
use tracing::trace;

/// The shared, writable version of a named index.
///
/// Three states are tracked:
///
/// - the working tuples, mutated by unisolated tasks
/// - the last checkpoint, what a task-level rollback returns to
/// - the last committed checkpoint, what a journal abort returns to
pub struct LiveIndex {
    metadata: IndexMetadata,
    state: Mutex<LiveState>,
}

struct LiveState {
    tuples: TupleMap,
    dirty: bool,
    checkpoint: Arc<TupleMap>,
    checkpoint_addr: Address,
    committed: Arc<TupleMap>,
    committed_addr: Address,
}

/// A checkpoint captured when a task started, to restore if the task fails.
#[derive(Debug, Clone)]
pub struct Savepoint {
    tuples: Arc<TupleMap>,
    addr: Address,
}

impl LiveIndex {
    /// A new, empty index that has never been checkpointed.
    #[must_use]
    pub fn new(metadata: IndexMetadata) -> Self {
        let empty = Arc::new(TupleMap::new());
        Self {
            metadata,
            state: Mutex::new(LiveState {
                tuples: TupleMap::new(),
                dirty: true,
                checkpoint: Arc::clone(&empty),
                checkpoint_addr: Address::NULL,
                committed: empty,
                committed_addr: Address::NULL,
            }),
        }
    }

    /// A live index positioned at a committed checkpoint.
    #[must_use]
    pub fn from_snapshot(snapshot: &IndexSnapshot) -> Self {
        let tuples = Arc::clone(snapshot.tuples());
        Self {
            metadata: snapshot.metadata().clone(),
            state: Mutex::new(LiveState {
                tuples: (*tuples).clone(),
                dirty: false,
                checkpoint: Arc::clone(&tuples),
                checkpoint_addr: snapshot.checkpoint_addr(),
                committed: tuples,
                committed_addr: snapshot.checkpoint_addr(),
            }),
        }
    }

    /// Index metadata.
    #[must_use]
    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Looks up a value.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().tuples.get(key).and_then(|t| t.value.clone())
    }

    /// Revision of the tuple under `key`, tombstones included.
    #[must_use]
    pub fn revision_of(&self, key: &[u8]) -> Option<u64> {
        self.state.lock().tuples.get(key).map(|t| t.revision)
    }

    /// Writes a value stamped with `revision`.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, revision: u64) {
        let mut state = self.state.lock();
        state.tuples.insert(
            key,
            Tuple {
                value: Some(value),
                revision,
            },
        );
        state.dirty = true;
    }

    /// Writes a tombstone. Returns whether a live value was removed.
    pub fn delete(&self, key: Vec<u8>, revision: u64) -> bool {
        let mut state = self.state.lock();
        let existed = state.tuples.get(&key).is_some_and(|t| !t.is_deleted());
        state.tuples.insert(
            key,
            Tuple {
                value: None,
                revision,
            },
        );
        state.dirty = true;
        existed
    }

    /// Live key/value pairs in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let state = self.state.lock();
        live_entries(&state.tuples)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        live_entries(&self.state.lock().tuples).count()
    }

    /// True if there are no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the working tuples differ from the last checkpoint.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Address of the last checkpoint.
    #[must_use]
    pub fn checkpoint_addr(&self) -> Address {
        self.state.lock().checkpoint_addr
    }

    /// Address of the last committed checkpoint, null if never committed.
    #[must_use]
    pub fn committed_addr(&self) -> Address {
        self.state.lock().committed_addr
    }

    /// Writes the working tuples to `store` if they changed.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the store write fails. The working
    /// tuples are left untouched in that case.
    pub fn checkpoint<S: RecordStore + ?Sized>(&self, store: &S) -> CoreResult<Address> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(state.checkpoint_addr);
        }
        let bytes = encode_checkpoint(&self.metadata, &state.tuples)?;
        let addr = store.write_record(&bytes)?;
        state.checkpoint = Arc::new(state.tuples.clone());
        state.checkpoint_addr = addr;
        state.dirty = false;
        trace!(index = %self.metadata.name, %addr, "checkpoint");
        Ok(addr)
    }

    /// Captures the current checkpoint.
    #[must_use]
    pub fn savepoint(&self) -> Savepoint {
        let state = self.state.lock();
        Savepoint {
            tuples: Arc::clone(&state.checkpoint),
            addr: state.checkpoint_addr,
        }
    }

    /// Returns to `savepoint`, dropping later writes and checkpoints.
    pub fn restore(&self, savepoint: &Savepoint) {
        let mut state = self.state.lock();
        state.tuples = (*savepoint.tuples).clone();
        state.checkpoint = Arc::clone(&savepoint.tuples);
        state.checkpoint_addr = savepoint.addr;
        state.dirty = savepoint.addr.is_null();
    }

    /// Promotes the last checkpoint to committed.
    pub fn mark_committed(&self) {
        let mut state = self.state.lock();
        state.committed = Arc::clone(&state.checkpoint);
        state.committed_addr = state.checkpoint_addr;
    }

    /// Returns to the last committed checkpoint.
    pub fn reset_to_committed(&self) {
        let mut state = self.state.lock();
        state.tuples = (*state.committed).clone();
        state.checkpoint = Arc::clone(&state.committed);
        state.checkpoint_addr = state.committed_addr;
        state.dirty = false;
    }

    /// An immutable view of the last checkpoint.
    #[must_use]
    pub fn checkpoint_snapshot(&self) -> IndexSnapshot {
        let state = self.state.lock();
        IndexSnapshot::new(
            self.metadata.clone(),
            Arc::clone(&state.checkpoint),
            state.checkpoint_addr,
        )
    }
}

impl fmt::Debug for LiveIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LiveIndex")
            .field("name", &self.metadata.name)
            .field("tuples", &state.tuples.len())
            .field("dirty", &state.dirty)
            .field("checkpoint_addr", &state.checkpoint_addr)
            .finish_non_exhaustive()
    }
}
