//! What a running task sees.

use super::Lane;
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexMetadata, IndexSnapshot, LiveIndex, Savepoint};
use crate::journal::Journal;
use crate::transaction::{Tx, TxIndex};
use crate::types::Timestamp;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

enum Handle {
    Live {
        index: Arc<LiveIndex>,
        savepoint: Savepoint,
    },
    Historical(Arc<IndexSnapshot>),
    Missing,
}

/// Index access for one task, limited to the resources it declared.
///
/// Handles are resolved before the work runs: live indices for unisolated
/// tasks, committed snapshots for historical reads, and the transaction's
/// isolated views for transaction tasks.
pub struct TaskContext {
    lane: Lane,
    timestamp: Timestamp,
    revision_time: Timestamp,
    resources: Vec<String>,
    handles: HashMap<String, Handle>,
    journal: Arc<Journal>,
    tx: Option<Arc<Tx>>,
    cancelled: Arc<AtomicBool>,
    created: Vec<String>,
}

impl TaskContext {
    fn base(
        lane: Lane,
        timestamp: Timestamp,
        journal: Arc<Journal>,
        resources: Vec<String>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            lane,
            timestamp,
            revision_time: timestamp,
            resources,
            handles: HashMap::new(),
            journal,
            tx: None,
            cancelled,
            created: Vec::new(),
        }
    }

    pub(crate) fn unisolated(
        journal: Arc<Journal>,
        resources: Vec<String>,
        revision_time: Timestamp,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let mut ctx = Self::base(Lane::Unisolated, Timestamp::UNISOLATED, journal, resources, cancelled);
        ctx.revision_time = revision_time;
        for name in &ctx.resources {
            let handle = match ctx.journal.live_index(name) {
                Some(index) => Handle::Live {
                    savepoint: index.savepoint(),
                    index,
                },
                None => Handle::Missing,
            };
            ctx.handles.insert(name.clone(), handle);
        }
        ctx
    }

    pub(crate) fn historical(
        journal: Arc<Journal>,
        timestamp: Timestamp,
        resources: Vec<String>,
        cancelled: Arc<AtomicBool>,
    ) -> CoreResult<Self> {
        let mut ctx = Self::base(Lane::Historical, timestamp, journal, resources, cancelled);
        for name in &ctx.resources {
            let handle = match ctx.journal.snapshot(name, timestamp)? {
                Some(snapshot) => Handle::Historical(snapshot),
                None => Handle::Missing,
            };
            ctx.handles.insert(name.clone(), handle);
        }
        Ok(ctx)
    }

    pub(crate) fn transactional(
        journal: Arc<Journal>,
        tx: Arc<Tx>,
        resources: Vec<String>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let mut ctx = Self::base(Lane::Transaction, tx.start_time(), journal, resources, cancelled);
        ctx.tx = Some(tx);
        ctx
    }

    /// The task timestamp: a commit time, a transaction start time, or
    /// [`Timestamp::UNISOLATED`].
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Revision stamped on tuples written by an unisolated task. Equal to
    /// [`timestamp`](Self::timestamp) on other lanes.
    #[must_use]
    pub fn revision_time(&self) -> Timestamp {
        self.revision_time
    }

    /// The lane the task runs on.
    #[must_use]
    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Declared resources.
    #[must_use]
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// True once `shutdown_now` has asked in-flight tasks to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The transaction a transaction task runs in.
    #[must_use]
    pub fn transaction(&self) -> Option<&Arc<Tx>> {
        self.tx.as_ref()
    }

    fn check_declared(&self, name: &str) -> CoreResult<()> {
        if self.resources.binary_search_by(|r| r.as_str().cmp(name)).is_err() {
            return Err(CoreError::ResourceNotDeclared {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn handle(&self, name: &str) -> CoreResult<&Handle> {
        match self.handles.get(name) {
            Some(Handle::Missing) | None => Err(CoreError::index_not_found(name)),
            Some(handle) => Ok(handle),
        }
    }

    fn tx_index<'a>(tx: &'a Tx, name: &str) -> CoreResult<TxIndex<'a>> {
        tx.get_index(name)?
            .ok_or_else(|| CoreError::index_not_found(name))
    }

    fn read_only(&self) -> CoreError {
        CoreError::invalid_operation(format!("{} tasks cannot write", self.lane))
    }

    /// True if `name` is declared and exists for this task.
    #[must_use]
    pub fn has_index(&self, name: &str) -> bool {
        if self.check_declared(name).is_err() {
            return false;
        }
        match &self.tx {
            Some(tx) => matches!(tx.get_index(name), Ok(Some(_))),
            None => self.handle(name).is_ok(),
        }
    }

    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Fails if `name` is undeclared or does not exist.
    pub fn get(&self, name: &str, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.check_declared(name)?;
        if let Some(tx) = &self.tx {
            return Self::tx_index(tx, name)?.get(key);
        }
        Ok(match self.handle(name)? {
            Handle::Live { index, .. } => index.get(key),
            Handle::Historical(snapshot) => snapshot.get(key).map(<[u8]>::to_vec),
            Handle::Missing => None,
        })
    }

    /// True if `key` has a value.
    ///
    /// # Errors
    ///
    /// Fails if `name` is undeclared or does not exist.
    pub fn contains(&self, name: &str, key: &[u8]) -> CoreResult<bool> {
        Ok(self.get(name, key)?.is_some())
    }

    /// Writes a value.
    ///
    /// # Errors
    ///
    /// Fails on historical tasks, or if `name` is undeclared or missing.
    pub fn put(&mut self, name: &str, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> CoreResult<()> {
        self.check_declared(name)?;
        if let Some(tx) = &self.tx {
            return Self::tx_index(tx, name)?.put(key, value);
        }
        match self.handle(name)? {
            Handle::Live { index, .. } => {
                index.put(key.into(), value.into(), self.revision_time.as_u64());
                Ok(())
            }
            _ => Err(self.read_only()),
        }
    }

    /// Deletes a key. Returns whether it had a value.
    ///
    /// # Errors
    ///
    /// Fails on historical tasks, or if `name` is undeclared or missing.
    pub fn delete(&mut self, name: &str, key: impl Into<Vec<u8>>) -> CoreResult<bool> {
        self.check_declared(name)?;
        if let Some(tx) = &self.tx {
            return Self::tx_index(tx, name)?.delete(key);
        }
        match self.handle(name)? {
            Handle::Live { index, .. } => Ok(index.delete(key.into(), self.revision_time.as_u64())),
            _ => Err(self.read_only()),
        }
    }

    /// All key/value pairs in key order.
    ///
    /// # Errors
    ///
    /// Fails if `name` is undeclared or does not exist.
    pub fn entries(&self, name: &str) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_declared(name)?;
        if let Some(tx) = &self.tx {
            return Self::tx_index(tx, name)?.entries();
        }
        Ok(match self.handle(name)? {
            Handle::Live { index, .. } => index.entries(),
            Handle::Historical(snapshot) => snapshot
                .entries()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect(),
            Handle::Missing => Vec::new(),
        })
    }

    /// Creates a new live index. Only unisolated tasks may do this, and
    /// `name` must be declared.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::IndexExists`] if the name is taken.
    pub fn register_index(&mut self, name: &str, isolatable: bool) -> CoreResult<()> {
        if self.lane != Lane::Unisolated {
            return Err(CoreError::invalid_operation(format!(
                "indices can only be registered by unisolated tasks, not {} tasks",
                self.lane
            )));
        }
        self.check_declared(name)?;
        let index = self
            .journal
            .register_index(IndexMetadata::new(name).isolatable(isolatable))?;
        self.handles.insert(
            name.to_string(),
            Handle::Live {
                savepoint: index.savepoint(),
                index,
            },
        );
        self.created.push(name.to_string());
        Ok(())
    }

    /// Checkpoints every live index this task could have written.
    pub(crate) fn checkpoint(&self) -> CoreResult<()> {
        for handle in self.handles.values() {
            if let Handle::Live { index, .. } = handle {
                index.checkpoint(self.journal.as_ref())?;
            }
        }
        Ok(())
    }

    /// Returns every live index to where it was when the task started and
    /// drops indices the task created.
    pub(crate) fn rollback(&self) {
        for handle in self.handles.values() {
            if let Handle::Live { index, savepoint } = handle {
                index.restore(savepoint);
            }
        }
        for name in &self.created {
            self.journal.forget_uncommitted_index(name);
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("lane", &self.lane)
            .field("timestamp", &self.timestamp)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}
