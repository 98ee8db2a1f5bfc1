//! Transaction manager.

use super::{RunState, Tx, Validation};
use crate::concurrency::{ConcurrencyManager, Task};
use crate::error::{CoreError, CoreResult};
use crate::journal::{Journal, ResourceManager};
use crate::stats::EngineStats;
use crate::timestamp::TimestampSource;
use crate::types::Timestamp;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Active transactions by start time.
///
/// Shared between the transaction manager, which adds and removes entries,
/// and the concurrency manager, which looks transactions up for
/// transaction-lane tasks.
#[derive(Debug, Default)]
pub struct ActiveTransactions {
    txs: RwLock<HashMap<Timestamp, Arc<Tx>>>,
}

impl ActiveTransactions {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, tx: Arc<Tx>) {
        self.txs.write().insert(tx.start_time(), tx);
    }

    pub(crate) fn remove(&self, start_time: Timestamp) -> Option<Arc<Tx>> {
        self.txs.write().remove(&start_time)
    }

    /// Looks up an active transaction.
    #[must_use]
    pub fn get(&self, start_time: Timestamp) -> Option<Arc<Tx>> {
        self.txs.read().get(&start_time).cloned()
    }

    /// Number of active transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.txs.read().len()
    }

    /// True if no transaction is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.txs.read().is_empty()
    }
}

/// Begins, commits and aborts transactions.
///
/// Commit is single-phase: the validated write sets are merged and made
/// durable by one unisolated task that locks every dirty index and joins a
/// group commit.
pub struct TransactionManager {
    journal: Arc<Journal>,
    timestamps: Arc<dyn TimestampSource>,
    concurrency: Arc<ConcurrencyManager>,
    active: Arc<ActiveTransactions>,
    stats: Arc<EngineStats>,
}

impl TransactionManager {
    /// Creates a transaction manager.
    pub fn new(
        journal: Arc<Journal>,
        timestamps: Arc<dyn TimestampSource>,
        concurrency: Arc<ConcurrencyManager>,
        active: Arc<ActiveTransactions>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            journal,
            timestamps,
            concurrency,
            active,
            stats,
        }
    }

    /// Starts a transaction reading the latest committed state.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::JournalClosed`] once the journal is closed.
    pub fn begin(&self) -> CoreResult<Arc<Tx>> {
        if self.journal.is_closed() {
            return Err(CoreError::JournalClosed);
        }
        let start_time = self.timestamps.next_timestamp();
        let reads_on = self.journal.last_commit_time();
        let resources: Arc<dyn ResourceManager> = self.journal.clone();
        let tx = Arc::new(Tx::new(start_time, reads_on, resources));
        self.active.insert(Arc::clone(&tx));
        self.stats.record_transaction_start();
        debug!(tx = %start_time, reads_on = %reads_on, "transaction started");
        Ok(tx)
    }

    /// Looks up an active transaction.
    #[must_use]
    pub fn get(&self, start_time: Timestamp) -> Option<Arc<Tx>> {
        self.active.get(start_time)
    }

    /// Number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Commits `tx` and returns its commit time, or
    /// [`Timestamp::UNISOLATED`] if it wrote nothing.
    ///
    /// The write set is frozen first: tasks submitted for `tx` after this
    /// point fail with [`CoreError::NotActive`]. The transaction is
    /// deactivated whatever the outcome.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::ValidationFailed`] on a write-write conflict,
    /// [`CoreError::CommitFailed`] if the group commit failed, or
    /// [`CoreError::NotActive`] if the transaction already finished. In every
    /// case except the last the transaction ends Aborted.
    pub fn commit(&self, tx: &Arc<Tx>) -> CoreResult<Timestamp> {
        let start_time = tx.start_time();
        let dirty = tx.begin_commit()?;

        let outcome = if dirty.is_empty() {
            tx.set_run_state(RunState::Committed)
                .map(|()| Timestamp::UNISOLATED)
        } else {
            self.single_phase_commit(tx, dirty)
        };

        self.active.remove(start_time);
        tx.release_views();

        match &outcome {
            Ok(commit_time) => {
                self.stats.record_transaction_commit();
                debug!(tx = %start_time, %commit_time, "transaction committed");
            }
            Err(e) => {
                tx.abort_if_incomplete();
                self.stats.record_transaction_abort();
                if matches!(e, CoreError::ValidationFailed { .. }) {
                    self.stats.record_validation_failure();
                }
                warn!(tx = %start_time, error = %e, "transaction aborted during commit");
            }
        }
        outcome
    }

    fn single_phase_commit(&self, tx: &Arc<Tx>, dirty: Vec<String>) -> CoreResult<Timestamp> {
        let target = Arc::clone(tx);
        let task = Task::unisolated(dirty, move |ctx| {
            let _lock = target.lock();
            match target.prepare(ctx.revision_time(), ctx.resources())? {
                Validation::Valid => Ok(()),
                Validation::Conflict { index, .. } => Err(CoreError::ValidationFailed {
                    tx: target.start_time(),
                    index,
                }),
            }
        });

        let future = self.concurrency.submit(task)?;
        future.wait();
        let commit_time = future.commit_time();
        future.get()?;

        tx.set_run_state(RunState::Committed)?;
        Ok(commit_time.unwrap_or_else(|| self.journal.last_commit_time()))
    }

    /// Aborts `tx`, discarding its writes.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::IllegalState`] if it already finished.
    pub fn abort(&self, tx: &Tx) -> CoreResult<()> {
        let _lock = tx.lock();
        tx.set_run_state(RunState::Aborted)?;
        tx.release_views();
        self.active.remove(tx.start_time());
        self.stats.record_transaction_abort();
        debug!(tx = %tx.start_time(), "transaction aborted");
        Ok(())
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
