//! Transaction-local views over an index snapshot.

use super::{IndexMetadata, IndexSnapshot, LiveIndex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct PendingWrite {
    value: Option<Vec<u8>>,
    /// Revision of the ground tuple when the key was first written.
    base_revision: Option<u64>,
}

/// A private write set fused over the snapshot a transaction reads from.
///
/// Reads see the transaction's own writes first and fall back to the
/// ground snapshot. Nothing reaches the live index until
/// [`merge_down`](Self::merge_down).
pub struct IsolatedView {
    ground: Arc<IndexSnapshot>,
    writes: BTreeMap<Vec<u8>, PendingWrite>,
}

impl IsolatedView {
    /// Creates an empty write set over `ground`.
    #[must_use]
    pub fn new(ground: Arc<IndexSnapshot>) -> Self {
        Self {
            ground,
            writes: BTreeMap::new(),
        }
    }

    /// Index metadata.
    #[must_use]
    pub fn metadata(&self) -> &IndexMetadata {
        self.ground.metadata()
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.ground.name()
    }

    /// Looks up a value, own writes first.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(write) => write.value.clone(),
            None => self.ground.get(key).map(<[u8]>::to_vec),
        }
    }

    /// True if `key` has a value.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        match self.writes.get(key) {
            Some(write) => write.value.is_some(),
            None => self.ground.get(key).is_some(),
        }
    }

    /// Records a write.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.record(key, Some(value));
    }

    /// Records a delete. Returns whether a value was visible.
    pub fn delete(&mut self, key: Vec<u8>) -> bool {
        let existed = self.contains(&key);
        self.record(key, None);
        existed
    }

    fn record(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let base_revision = self.ground.tuple(&key).map(|t| t.revision);
        self.writes
            .entry(key)
            .and_modify(|write| write.value = value.clone())
            .or_insert(PendingWrite {
                value,
                base_revision,
            });
    }

    /// Visible key/value pairs in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .ground
            .entries()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        for (key, write) in &self.writes {
            match &write.value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    /// True if nothing has been written.
    #[must_use]
    pub fn is_empty_write_set(&self) -> bool {
        self.writes.is_empty()
    }

    /// Number of keys written.
    #[must_use]
    pub fn write_set_len(&self) -> usize {
        self.writes.len()
    }

    /// Checks the write set against the live index.
    ///
    /// Returns the first key whose live revision differs from the revision
    /// the transaction read from its ground snapshot.
    #[must_use]
    pub fn validate(&self, live: &LiveIndex) -> Option<Vec<u8>> {
        self.writes
            .iter()
            .find(|(key, write)| live.revision_of(key) != write.base_revision)
            .map(|(key, _)| key.clone())
    }

    /// Applies the write set to the live index, stamping every tuple with
    /// `revision_time`.
    pub fn merge_down(&self, revision_time: u64, live: &LiveIndex) {
        for (key, write) in &self.writes {
            match &write.value {
                Some(value) => live.put(key.clone(), value.clone(), revision_time),
                None => {
                    live.delete(key.clone(), revision_time);
                }
            }
        }
    }
}

impl fmt::Debug for IsolatedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedView")
            .field("name", &self.name())
            .field("ground", &self.ground.checkpoint_addr())
            .field("writes", &self.writes.len())
            .finish()
    }
}
