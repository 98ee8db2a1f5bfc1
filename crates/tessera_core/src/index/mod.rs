//! Named indices.
//!
//! A minimal ordered key/value index standing in for a B+Tree. It provides
//! exactly what the journal and transactions need from an index:
//!
//! - [`LiveIndex`] - the mutable, unisolated index, checkpointed to the store
//! - [`IndexSnapshot`] - an immutable view loaded from a checkpoint
//! - [`IsolatedView`] - a transaction's private write set fused over a
//!   snapshot, with validation and merge-down onto a live index
//!
//! Every tuple carries the revision timestamp of the write that produced it.
//! Deletes leave tombstones so later validation can see that a key changed.

mod checkpoint;
mod isolated;
mod live;
mod snapshot;

pub use isolated::IsolatedView;
pub use live::{LiveIndex, Savepoint};
pub use snapshot::IndexSnapshot;

pub(crate) use checkpoint::{decode_checkpoint, encode_checkpoint};

use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_storage::Address;
use uuid::Uuid;

/// Descriptive metadata for a named index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index name, unique within a journal.
    pub name: String,
    /// Identity of the index.
    pub index_uuid: Uuid,
    /// Whether transactions may isolate the index.
    pub isolatable: bool,
}

impl IndexMetadata {
    /// Metadata for a new isolatable index.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index_uuid: Uuid::new_v4(),
            isolatable: true,
        }
    }

    /// Sets whether the index can be isolated.
    #[must_use]
    pub fn isolatable(mut self, value: bool) -> Self {
        self.isolatable = value;
        self
    }
}

/// A stored value and the revision that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuple {
    /// The value, or `None` for a tombstone.
    pub value: Option<Vec<u8>>,
    /// Timestamp of the write.
    pub revision: u64,
}

impl Tuple {
    /// True for a delete marker.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }
}

pub(crate) type TupleMap = BTreeMap<Vec<u8>, Tuple>;

/// Somewhere index checkpoints can be written and read back.
pub trait RecordStore: Send + Sync {
    /// Appends a record and returns its address.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    fn write_record(&self, data: &[u8]) -> CoreResult<Address>;

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    fn read_record(&self, addr: Address) -> CoreResult<Vec<u8>>;
}

pub(crate) fn live_entries(tuples: &TupleMap) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
    tuples
        .iter()
        .filter_map(|(key, tuple)| tuple.value.as_ref().map(|value| (key, value)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Record store backed by a vector, for index unit tests.
    #[derive(Debug, Default)]
    pub struct VecStore {
        records: Mutex<Vec<Vec<u8>>>,
        pub fail_writes: std::sync::atomic::AtomicBool,
    }

    impl RecordStore for VecStore {
        fn write_record(&self, data: &[u8]) -> CoreResult<Address> {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(crate::error::CoreError::invalid_operation("write refused"));
            }
            let mut records = self.records.lock();
            records.push(data.to_vec());
            Ok(Address::new(records.len() as u64))
        }

        fn read_record(&self, addr: Address) -> CoreResult<Vec<u8>> {
            let records = self.records.lock();
            records
                .get(addr.as_u64() as usize - 1)
                .cloned()
                .ok_or_else(|| crate::error::CoreError::invalid_operation("no such record"))
        }
    }
}
