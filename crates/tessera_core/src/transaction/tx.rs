//! A single transaction.

use super::RunState;
use crate::error::{CoreError, CoreResult};
use crate::index::IsolatedView;
use crate::journal::{IndexSource, ResourceManager};
use crate::types::Timestamp;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use tessera_storage::Address;
use tracing::{debug, warn};

/// Outcome of write-set validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// No conflicts; the write sets may be merged.
    Valid,
    /// A write-write conflict.
    Conflict {
        /// Index holding the conflict.
        index: String,
        /// Conflicting key, or `None` if the live index is gone.
        key: Option<Vec<u8>>,
    },
}

impl Validation {
    /// True for [`Validation::Valid`].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

struct TxInner {
    run_state: RunState,
    /// Handed to the commit path; no further tasks or writes.
    committing: bool,
    revision_time: Option<Timestamp>,
    views: BTreeMap<String, IsolatedView>,
}

/// A snapshot-isolated transaction.
///
/// Reads see the state committed at [`reads_on_commit_time`]; writes go to
/// per-index isolated views until the transaction is prepared. All state
/// changes happen under the transaction's reentrant lock, so a task holding
/// [`Tx::lock`] may call any method.
///
/// [`reads_on_commit_time`]: Tx::reads_on_commit_time
pub struct Tx {
    start_time: Timestamp,
    reads_on_commit_time: Timestamp,
    resources: Arc<dyn ResourceManager>,
    inner: ReentrantMutex<RefCell<TxInner>>,
}

/// Proof that the current thread holds a transaction's lock.
pub struct TxLock<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<TxInner>>,
}

impl Tx {
    pub(crate) fn new(
        start_time: Timestamp,
        reads_on_commit_time: Timestamp,
        resources: Arc<dyn ResourceManager>,
    ) -> Self {
        Self {
            start_time,
            reads_on_commit_time,
            resources,
            inner: ReentrantMutex::new(RefCell::new(TxInner {
                run_state: RunState::Active,
                committing: false,
                revision_time: None,
                views: BTreeMap::new(),
            })),
        }
    }

    /// Start time, which also identifies the transaction.
    #[must_use]
    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Commit time of the state this transaction reads.
    #[must_use]
    pub fn reads_on_commit_time(&self) -> Timestamp {
        self.reads_on_commit_time
    }

    /// Revision stamped on merged tuples, set by [`prepare`](Self::prepare).
    #[must_use]
    pub fn revision_time(&self) -> Option<Timestamp> {
        self.inner.lock().borrow().revision_time
    }

    /// Takes the transaction lock. Reentrant.
    #[must_use]
    pub fn lock(&self) -> TxLock<'_> {
        TxLock {
            _guard: self.inner.lock(),
        }
    }

    /// Current run state.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        self.inner.lock().borrow().run_state
    }

    /// True while reads and writes are accepted: Active and not yet handed
    /// to the commit path.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.run_state == RunState::Active && !inner.committing
    }

    /// True once a commit has started and the write set is frozen.
    #[must_use]
    pub fn is_committing(&self) -> bool {
        self.inner.lock().borrow().committing
    }

    /// Freezes the write set for commit and returns the indices it touches.
    ///
    /// Waits for any task running against the transaction. From then on
    /// tasks and writes fail with [`CoreError::NotActive`], so the returned
    /// names are exactly the indices `prepare` may merge.
    pub(crate) fn begin_commit(&self) -> CoreResult<Vec<String>> {
        let guard = self.inner.lock();
        self.check_active()?;
        guard.borrow_mut().committing = true;
        Ok(self.dirty_indices())
    }

    /// True once committed or aborted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.run_state().is_complete()
    }

    /// Moves to `to`.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::IllegalState`] for a transition the run-state
    /// table does not allow.
    pub fn set_run_state(&self, to: RunState) -> CoreResult<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if !inner.run_state.can_transition_to(to) {
            return Err(CoreError::illegal_state(inner.run_state, to));
        }
        debug!(tx = %self.start_time, from = %inner.run_state, %to, "run state");
        inner.run_state = to;
        Ok(())
    }

    fn check_active(&self) -> CoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CoreError::NotActive {
                tx: self.start_time,
            })
        }
    }

    /// The transaction's view of `name`, created on first use over the
    /// committed state at [`reads_on_commit_time`](Self::reads_on_commit_time).
    ///
    /// Returns `Ok(None)` if the index did not exist then.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotActive`] unless active, and with
    /// [`CoreError::NotIsolatable`] if the index cannot be isolated.
    pub fn get_index(&self, name: &str) -> CoreResult<Option<TxIndex<'_>>> {
        let guard = self.inner.lock();
        self.check_active()?;
        if guard.borrow().views.contains_key(name) {
            return Ok(Some(TxIndex::new(self, name)));
        }
        if self.reads_on_commit_time.is_unisolated() {
            return Ok(None);
        }

        let snapshot = match self.resources.index_sources(name, self.reads_on_commit_time)? {
            None => return Ok(None),
            Some(IndexSource::Historical(snapshot)) => snapshot,
            Some(IndexSource::Live(_)) => {
                return Err(CoreError::invalid_operation(
                    "transaction ground state resolved to a live index",
                ))
            }
        };
        if !snapshot.metadata().isolatable {
            return Err(CoreError::NotIsolatable {
                name: name.to_string(),
            });
        }

        guard
            .borrow_mut()
            .views
            .insert(name.to_string(), IsolatedView::new(snapshot));
        Ok(Some(TxIndex::new(self, name)))
    }

    /// True if nothing has been written.
    #[must_use]
    pub fn is_empty_write_set(&self) -> bool {
        self.inner
            .lock()
            .borrow()
            .views
            .values()
            .all(IsolatedView::is_empty_write_set)
    }

    /// Names of indices with pending writes.
    #[must_use]
    pub fn dirty_indices(&self) -> Vec<String> {
        self.inner
            .lock()
            .borrow()
            .views
            .iter()
            .filter(|(_, view)| !view.is_empty_write_set())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Checks every write set against the current live indices.
    ///
    /// # Errors
    ///
    /// Returns an error if a live index cannot be resolved.
    pub fn validate_write_sets(&self) -> CoreResult<Validation> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        for (name, view) in inner.views.iter().filter(|(_, v)| !v.is_empty_write_set()) {
            let Some(IndexSource::Live(live)) =
                self.resources.index_sources(name, Timestamp::UNISOLATED)?
            else {
                warn!(tx = %self.start_time, index = %name, "live index missing at validation");
                return Ok(Validation::Conflict {
                    index: name.clone(),
                    key: None,
                });
            };
            if let Some(key) = view.validate(&live) {
                warn!(tx = %self.start_time, index = %name, "write-write conflict");
                return Ok(Validation::Conflict {
                    index: name.clone(),
                    key: Some(key),
                });
            }
        }
        Ok(Validation::Valid)
    }

    /// Validates and merges the write sets onto the live indices, stamping
    /// merged tuples with `revision_time`, then moves to Prepared.
    ///
    /// `locked` names the indices the caller holds locks on; every dirty
    /// index must be among them. A conflict is returned without merging
    /// anything.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotActive`] unless Active, with
    /// [`CoreError::ResourceNotDeclared`] for a dirty index outside `locked`,
    /// or if any index checkpoint fails.
    pub fn prepare(&self, revision_time: Timestamp, locked: &[String]) -> CoreResult<Validation> {
        let guard = self.inner.lock();
        if self.run_state() != RunState::Active {
            return Err(CoreError::NotActive {
                tx: self.start_time,
            });
        }
        if let Some(name) = self
            .dirty_indices()
            .into_iter()
            .find(|name| !locked.contains(name))
        {
            return Err(CoreError::ResourceNotDeclared { name });
        }

        if !self.is_empty_write_set() {
            let validation = self.validate_write_sets()?;
            if !validation.is_valid() {
                return Ok(validation);
            }
            self.merge_onto_global_state(revision_time)?;
            guard.borrow_mut().revision_time = Some(revision_time);
        }

        self.set_run_state(RunState::Prepared)?;
        debug!(tx = %self.start_time, %revision_time, "prepared");
        Ok(Validation::Valid)
    }

    /// Merges each dirty view into its live index and checkpoints it, one
    /// scoped thread per index.
    fn merge_onto_global_state(&self, revision_time: Timestamp) -> CoreResult<()> {
        let guard = self.inner.lock();
        let inner = guard.borrow();

        let mut targets = Vec::new();
        for (name, view) in inner.views.iter().filter(|(_, v)| !v.is_empty_write_set()) {
            match self.resources.index_sources(name, Timestamp::UNISOLATED)? {
                Some(IndexSource::Live(live)) => targets.push((view, live)),
                _ => return Err(CoreError::index_not_found(name.clone())),
            }
        }

        let store: &dyn ResourceManager = self.resources.as_ref();
        let revision = revision_time.as_u64();
        let results: Vec<CoreResult<Address>> = thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|(view, live)| {
                    scope.spawn(move || {
                        view.merge_down(revision, live);
                        live.checkpoint(store)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(CoreError::invalid_operation("index checkpoint panicked"))
                    })
                })
                .collect()
        });

        results.into_iter().try_for_each(|result| result.map(|_| ()))
    }

    /// Moves to Aborted unless already complete. Returns whether it moved.
    pub(crate) fn abort_if_incomplete(&self) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.run_state.is_complete() {
            return false;
        }
        inner.run_state = RunState::Aborted;
        true
    }

    /// Drops the isolated views.
    pub(crate) fn release_views(&self) {
        self.inner.lock().borrow_mut().views.clear();
    }
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("start_time", &self.start_time)
            .field("reads_on_commit_time", &self.reads_on_commit_time)
            .field("run_state", &self.run_state())
            .finish_non_exhaustive()
    }
}

/// A transaction's handle on one isolated index.
pub struct TxIndex<'a> {
    tx: &'a Tx,
    name: String,
}

impl<'a> TxIndex<'a> {
    fn new(tx: &'a Tx, name: &str) -> Self {
        Self {
            tx,
            name: name.to_string(),
        }
    }

    fn with_view<R>(&self, f: impl FnOnce(&mut IsolatedView) -> R) -> CoreResult<R> {
        let guard = self.tx.inner.lock();
        self.tx.check_active()?;
        let mut inner = guard.borrow_mut();
        let view = inner
            .views
            .get_mut(&self.name)
            .ok_or_else(|| CoreError::index_not_found(self.name.clone()))?;
        Ok(f(view))
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads a value, own writes first.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is no longer active.
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.with_view(|view| view.get(key))
    }

    /// True if `key` has a value.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is no longer active.
    pub fn contains(&self, key: &[u8]) -> CoreResult<bool> {
        self.with_view(|view| view.contains(key))
    }

    /// Buffers a write.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is no longer active.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> CoreResult<()> {
        let (key, value) = (key.into(), value.into());
        self.with_view(|view| view.put(key, value))
    }

    /// Buffers a delete. Returns whether a value was visible.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is no longer active.
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> CoreResult<bool> {
        let key = key.into();
        self.with_view(|view| view.delete(key))
    }

    /// Visible key/value pairs in key order.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is no longer active.
    pub fn entries(&self) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_view(|view| view.entries())
    }
}

impl fmt::Debug for TxIndex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxIndex")
            .field("tx", &self.tx.start_time)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::index::IndexMetadata;
    use crate::journal::Journal;
    use crate::stats::EngineStats;

    fn journal_with(name: &str, isolatable: bool, pairs: &[(&[u8], &[u8])]) -> Arc<Journal> {
        let journal =
            Arc::new(Journal::open(&EngineConfig::transient(), Arc::new(EngineStats::new())).unwrap());
        let idx = journal
            .register_index(IndexMetadata::new(name).isolatable(isolatable))
            .unwrap();
        for (k, v) in pairs {
            idx.put(k.to_vec(), v.to_vec(), 1);
        }
        journal.commit(Timestamp::new(10)).unwrap();
        journal
    }

    fn tx(journal: &Arc<Journal>, start: u64) -> Tx {
        let resources: Arc<dyn ResourceManager> = journal.clone();
        Tx::new(Timestamp::new(start), journal.last_commit_time(), resources)
    }

    fn locked(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn missing_index_is_none() {
        let journal = journal_with("a", true, &[]);
        let tx = tx(&journal, 11);
        assert!(tx.get_index("nope").unwrap().is_none());
    }

    #[test]
    fn non_isolatable_index_is_rejected() {
        let journal = journal_with("plain", false, &[]);
        let tx = tx(&journal, 11);
        assert!(matches!(
            tx.get_index("plain"),
            Err(CoreError::NotIsolatable { .. })
        ));
    }

    #[test]
    fn reads_ground_state_not_live_writes() {
        let journal = journal_with("a", true, &[(b"k", b"old")]);
        let tx = tx(&journal, 11);
        journal
            .live_index("a")
            .unwrap()
            .put(b"k".to_vec(), b"new".to_vec(), 12);

        let idx = tx.get_index("a").unwrap().unwrap();
        assert_eq!(idx.get(b"k").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn prepare_merges_with_revision_time() {
        let journal = journal_with("a", true, &[(b"k", b"v")]);
        let tx = tx(&journal, 11);
        let idx = tx.get_index("a").unwrap().unwrap();
        idx.put(b"k", b"v2").unwrap();
        idx.put(b"j", b"w").unwrap();

        assert_eq!(tx.dirty_indices(), vec!["a".to_string()]);
        assert_eq!(tx.prepare(Timestamp::new(20), &locked(&["a"])).unwrap(), Validation::Valid);

        let live = journal.live_index("a").unwrap();
        assert_eq!(live.get(b"k"), Some(b"v2".to_vec()));
        assert_eq!(live.revision_of(b"j"), Some(20));
        assert!(!live.is_dirty());
        assert_eq!(tx.run_state(), RunState::Prepared);
        assert_eq!(tx.revision_time(), Some(Timestamp::new(20)));
    }

    #[test]
    fn second_writer_of_same_key_conflicts() {
        let journal = journal_with("a", true, &[(b"k", b"v")]);
        let first = tx(&journal, 11);
        let second = tx(&journal, 12);
        first.get_index("a").unwrap().unwrap().put(b"k", b"1").unwrap();
        second.get_index("a").unwrap().unwrap().put(b"k", b"2").unwrap();

        assert!(first.prepare(Timestamp::new(20), &locked(&["a"])).unwrap().is_valid());
        let outcome = second.prepare(Timestamp::new(21), &locked(&["a"])).unwrap();

        assert_eq!(
            outcome,
            Validation::Conflict {
                index: "a".to_string(),
                key: Some(b"k".to_vec()),
            }
        );
        assert_eq!(second.run_state(), RunState::Active);
        assert_eq!(
            journal.live_index("a").unwrap().get(b"k"),
            Some(b"1".to_vec())
        );
    }

    #[test]
    fn empty_write_set_prepares_without_merge() {
        let journal = journal_with("a", true, &[]);
        let tx = tx(&journal, 11);
        tx.get_index("a").unwrap().unwrap();
        assert!(tx.is_empty_write_set());
        assert!(tx.prepare(Timestamp::new(20), &locked(&["a"])).unwrap().is_valid());
        assert_eq!(tx.revision_time(), None);
    }

    #[test]
    fn inactive_transaction_refuses_work() {
        let journal = journal_with("a", true, &[]);
        let tx = tx(&journal, 11);
        let idx = tx.get_index("a").unwrap().unwrap();
        tx.set_run_state(RunState::Aborted).unwrap();

        assert!(matches!(idx.put(b"k", b"v"), Err(CoreError::NotActive { .. })));
        assert!(matches!(tx.get_index("a"), Err(CoreError::NotActive { .. })));
        assert!(matches!(
            tx.prepare(Timestamp::new(20), &locked(&["a"])),
            Err(CoreError::NotActive { .. })
        ));
    }

    #[test]
    fn prepare_refuses_dirty_index_outside_lock_set() {
        let journal = journal_with("a", true, &[]);
        journal
            .register_index(IndexMetadata::new("b").isolatable(true))
            .unwrap();
        journal.commit(Timestamp::new(15)).unwrap();
        let tx = tx(&journal, 16);
        tx.get_index("a").unwrap().unwrap().put(b"ka", b"1").unwrap();
        tx.get_index("b").unwrap().unwrap().put(b"kb", b"2").unwrap();

        assert!(matches!(
            tx.prepare(Timestamp::new(20), &locked(&["a"])),
            Err(CoreError::ResourceNotDeclared { name }) if name == "b"
        ));
        assert_eq!(journal.live_index("a").unwrap().get(b"ka"), None);
        assert_eq!(journal.live_index("b").unwrap().get(b"kb"), None);
        assert_eq!(tx.run_state(), RunState::Active);
    }

    #[test]
    fn begin_commit_freezes_the_write_set() {
        let journal = journal_with("a", true, &[]);
        let tx = tx(&journal, 11);
        let idx = tx.get_index("a").unwrap().unwrap();
        idx.put(b"k", b"v").unwrap();

        assert_eq!(tx.begin_commit().unwrap(), locked(&["a"]));
        assert!(tx.is_committing());
        assert!(!tx.is_active());
        assert!(matches!(idx.put(b"j", b"w"), Err(CoreError::NotActive { .. })));
        assert!(matches!(tx.begin_commit(), Err(CoreError::NotActive { .. })));
        assert!(tx.prepare(Timestamp::new(20), &locked(&["a"])).unwrap().is_valid());
        assert_eq!(journal.live_index("a").unwrap().get(b"j"), None);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let journal = journal_with("a", true, &[]);
        let tx = tx(&journal, 11);
        tx.set_run_state(RunState::Committed).unwrap();
        assert!(matches!(
            tx.set_run_state(RunState::Prepared),
            Err(CoreError::IllegalState { .. })
        ));
        assert!(!tx.abort_if_incomplete());
    }

    #[test]
    fn lock_is_reentrant() {
        let journal = journal_with("a", true, &[]);
        let tx = tx(&journal, 11);
        let _outer = tx.lock();
        let _inner = tx.lock();
        assert!(tx.get_index("a").unwrap().is_some());
    }
}
