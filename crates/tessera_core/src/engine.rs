//! The engine facade.

use crate::concurrency::{ConcurrencyManager, Task, TaskFuture};
use crate::config::EngineConfig;
use crate::error::CoreResult;
use crate::journal::Journal;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::timestamp::{TimestampService, TimestampSource};
use crate::transaction::{ActiveTransactions, TransactionManager, Tx};
use crate::types::Timestamp;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tessera_storage::{ExtentBackend, RootBlock};
use tracing::{info, warn};

/// An open journal with its scheduler and transaction manager.
///
/// # Example
///
/// ```rust
/// use tessera_core::{Engine, EngineConfig, Task};
///
/// let engine = Engine::open(EngineConfig::transient()).unwrap();
/// engine.register_index("users").unwrap();
///
/// let tx = engine.begin_tx().unwrap();
/// tx.get_index("users").unwrap().unwrap().put("alice", "admin").unwrap();
/// let commit_time = engine.commit_tx(&tx).unwrap();
///
/// let role = engine
///     .submit(Task::historical(commit_time, ["users"], |ctx| ctx.get("users", b"alice")))
///     .unwrap()
///     .get()
///     .unwrap();
/// assert_eq!(role, Some(b"admin".to_vec()));
/// engine.close().unwrap();
/// ```
pub struct Engine {
    config: EngineConfig,
    journal: Arc<Journal>,
    concurrency: Arc<ConcurrencyManager>,
    transactions: TransactionManager,
    stats: Arc<EngineStats>,
}

impl Engine {
    /// Opens or creates the journal described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or recovered, or if
    /// the worker threads cannot be started.
    pub fn open(config: EngineConfig) -> CoreResult<Self> {
        let stats = Arc::new(EngineStats::new());
        let journal = Journal::open(&config, Arc::clone(&stats))?;
        Self::assemble(config, journal, stats)
    }

    /// Opens a journal over a caller-supplied backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or recovered, or if
    /// the worker threads cannot be started.
    pub fn open_with_backend(config: EngineConfig, backend: Box<dyn ExtentBackend>) -> CoreResult<Self> {
        let stats = Arc::new(EngineStats::new());
        let journal = Journal::open_with_backend(
            &config.store,
            backend,
            config.force_on_commit,
            Arc::clone(&stats),
        )?;
        Self::assemble(config, journal, stats)
    }

    fn assemble(config: EngineConfig, journal: Journal, stats: Arc<EngineStats>) -> CoreResult<Self> {
        let journal = Arc::new(journal);
        let timestamps: Arc<dyn TimestampSource> =
            Arc::new(TimestampService::starting_after(journal.last_commit_time()));
        let active = Arc::new(ActiveTransactions::new());
        let concurrency = Arc::new(ConcurrencyManager::new(
            config.concurrency.clone(),
            Arc::clone(&journal),
            Arc::clone(&timestamps),
            Arc::clone(&active),
            Arc::clone(&stats),
        )?);
        let transactions = TransactionManager::new(
            Arc::clone(&journal),
            timestamps,
            Arc::clone(&concurrency),
            active,
            Arc::clone(&stats),
        );
        info!(
            mode = %config.store.buffer_mode,
            last_commit = %journal.last_commit_time(),
            indices = journal.index_names().len(),
            "engine opened"
        );
        Ok(Self {
            config,
            journal,
            concurrency,
            transactions,
            stats,
        })
    }

    /// Registers an isolatable index and returns the commit time that made
    /// it durable.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::IndexExists`](crate::CoreError::IndexExists)
    /// if the name is taken, or with the commit error if the commit failed.
    pub fn register_index(&self, name: &str) -> CoreResult<Timestamp> {
        self.register_index_with(name, true)
    }

    /// Registers an index, choosing whether transactions may isolate it.
    ///
    /// # Errors
    ///
    /// See [`register_index`](Self::register_index).
    pub fn register_index_with(&self, name: &str, isolatable: bool) -> CoreResult<Timestamp> {
        let owned = name.to_string();
        let future = self.submit(Task::unisolated([name], move |ctx| {
            ctx.register_index(&owned, isolatable)
        }))?;
        future.wait();
        let commit_time = future.commit_time();
        future.get()?;
        Ok(commit_time.unwrap_or_else(|| self.journal.last_commit_time()))
    }

    /// Names of every live index.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.journal.index_names()
    }

    /// Submits a task.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyManager::submit`].
    pub fn submit<T: Send + 'static>(&self, task: Task<T>) -> CoreResult<TaskFuture<T>> {
        self.concurrency.submit(task)
    }

    /// Submits every task and waits for all of them.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyManager::invoke_all`].
    pub fn invoke_all<T: Send + 'static>(&self, tasks: Vec<Task<T>>) -> CoreResult<Vec<TaskFuture<T>>> {
        self.concurrency.invoke_all(tasks)
    }

    /// Submits every task and waits at most `timeout`.
    ///
    /// # Errors
    ///
    /// See [`ConcurrencyManager::invoke_all_timeout`].
    pub fn invoke_all_timeout<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        timeout: Duration,
    ) -> CoreResult<Vec<TaskFuture<T>>> {
        self.concurrency.invoke_all_timeout(tasks, timeout)
    }

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Fails once the engine is closed.
    pub fn begin_tx(&self) -> CoreResult<Arc<Tx>> {
        self.transactions.begin()
    }

    /// Commits a transaction. Returns its commit time, or
    /// [`Timestamp::UNISOLATED`] for a transaction that wrote nothing.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::commit`].
    pub fn commit_tx(&self, tx: &Arc<Tx>) -> CoreResult<Timestamp> {
        self.transactions.commit(tx)
    }

    /// Aborts a transaction.
    ///
    /// # Errors
    ///
    /// Fails if the transaction already finished.
    pub fn abort_tx(&self, tx: &Tx) -> CoreResult<()> {
        self.transactions.abort(tx)
    }

    /// Runs `f` in a new transaction, committing on `Ok` and aborting on
    /// `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or the commit error.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Tx) -> CoreResult<T>,
    {
        let tx = self.begin_tx()?;
        match f(&tx) {
            Ok(value) => {
                self.commit_tx(&tx)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = self.abort_tx(&tx) {
                    warn!(tx = %tx.start_time(), error = %abort_err, "abort after failed transaction body");
                }
                Err(e)
            }
        }
    }

    /// Commit time of the latest commit.
    #[must_use]
    pub fn last_commit_time(&self) -> Timestamp {
        self.journal.last_commit_time()
    }

    /// The current root block.
    #[must_use]
    pub fn root_block(&self) -> RootBlock {
        self.journal.root_block()
    }

    /// Number of commits since the store was created.
    #[must_use]
    pub fn commit_counter(&self) -> u64 {
        self.journal.commit_counter()
    }

    /// Live counters.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// A point-in-time copy of the counters.
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// The concurrency manager.
    #[must_use]
    pub fn concurrency(&self) -> &ConcurrencyManager {
        &self.concurrency
    }

    /// Number of active transactions.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.transactions.active_count()
    }

    /// The configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stops accepting work and waits for running tasks.
    pub fn shutdown(&self) {
        self.concurrency.shutdown();
    }

    /// Stops accepting work, cancels what has not started and returns.
    pub fn shutdown_now(&self) {
        self.concurrency.shutdown_now();
    }

    /// Shuts down and closes the journal. Uncommitted writes are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to close.
    pub fn close(self) -> CoreResult<()> {
        self.concurrency.shutdown();
        self.journal.close()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.journal.is_closed() {
            return;
        }
        self.concurrency.shutdown_now();
        if let Err(e) = self.journal.close() {
            warn!(error = %e, "failed to close journal on drop");
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("journal", &self.journal)
            .field("active_transactions", &self.transactions.active_count())
            .finish_non_exhaustive()
    }
}
