//! Immutable index views loaded from checkpoints.

use super::{decode_checkpoint, live_entries, IndexMetadata, RecordStore, Tuple, TupleMap};
use crate::error::CoreResult;
use std::fmt;
use std::sync::Arc;
use tessera_storage::Address;

/// A read-only view of an index as of one checkpoint.
///
/// Snapshots are shared between historical readers and the transactions
/// that isolate the index, so the tuple map sits behind an `Arc`.
#[derive(Clone)]
pub struct IndexSnapshot {
    metadata: IndexMetadata,
    tuples: Arc<TupleMap>,
    checkpoint_addr: Address,
}

impl IndexSnapshot {
    pub(crate) fn new(metadata: IndexMetadata, tuples: Arc<TupleMap>, checkpoint_addr: Address) -> Self {
        Self {
            metadata,
            tuples,
            checkpoint_addr,
        }
    }

    /// Loads the checkpoint at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    pub fn load<S: RecordStore + ?Sized>(store: &S, addr: Address) -> CoreResult<Self> {
        Self::decode(&store.read_record(addr)?, addr)
    }

    pub(crate) fn decode(bytes: &[u8], addr: Address) -> CoreResult<Self> {
        let (metadata, tuples) = decode_checkpoint(bytes)?;
        Ok(Self::new(metadata, Arc::new(tuples), addr))
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

    /// Address of the checkpoint this view was loaded from.
    #[must_use]
    pub fn checkpoint_addr(&self) -> Address {
        self.checkpoint_addr
    }

    /// Looks up a value.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.tuples.get(key).and_then(|t| t.value.as_deref())
    }

    /// Looks up the raw tuple, tombstones included.
    #[must_use]
    pub fn tuple(&self, key: &[u8]) -> Option<&Tuple> {
        self.tuples.get(key)
    }

    /// Live key/value pairs in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        live_entries(&self.tuples).map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// True if there are no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    pub(crate) fn tuples(&self) -> &Arc<TupleMap> {
        &self.tuples
    }
}

impl fmt::Debug for IndexSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSnapshot")
            .field("name", &self.metadata.name)
            .field("checkpoint_addr", &self.checkpoint_addr)
            .field("tuples", &self.tuples.len())
            .finish_non_exhaustive()
    }
}
