//! The concurrency manager.

use super::context::TaskContext;
use super::future::{pair, Promise, TaskFuture};
use super::group_commit::{BatchMember, GroupCommit};
use super::lock_manager::{LockManager, LockWaiter};
use super::pool::{Admission, AdmissionTicket, WorkerPool};
use super::task::{Lane, Task, Work};
use crate::config::ConcurrencyConfig;
use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::stats::EngineStats;
use crate::timestamp::TimestampSource;
use crate::transaction::ActiveTransactions;
use crate::types::Timestamp;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Everything an unisolated task needs once its locks are granted.
struct WriteLane {
    journal: Arc<Journal>,
    timestamps: Arc<dyn TimestampSource>,
    locks: Arc<LockManager>,
    group_commit: GroupCommit,
    pool: WorkerPool,
    admission: Arc<Admission>,
    cancelled: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
}

impl WriteLane {
    /// Waits until no unisolated task holds or waits for locks.
    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.locks.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
        true
    }
}

/// Admits and runs tasks on three lanes.
///
/// Historical reads and transaction tasks go straight to their pools.
/// Unisolated tasks first wait for resource locks, then run on the write
/// pool and complete when their group commit does.
pub struct ConcurrencyManager {
    config: ConcurrencyConfig,
    journal: Arc<Journal>,
    transactions: Arc<ActiveTransactions>,
    read_pool: WorkerPool,
    tx_pool: WorkerPool,
    write: Arc<WriteLane>,
    cancelled: Arc<AtomicBool>,
    accepting: AtomicBool,
    stats: Arc<EngineStats>,
}

impl ConcurrencyManager {
    /// Starts the worker pools and the lock watchdog.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(
        config: ConcurrencyConfig,
        journal: Arc<Journal>,
        timestamps: Arc<dyn TimestampSource>,
        transactions: Arc<ActiveTransactions>,
        stats: Arc<EngineStats>,
    ) -> CoreResult<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let write = Arc::new(WriteLane {
            journal: Arc::clone(&journal),
            timestamps: Arc::clone(&timestamps),
            locks: LockManager::start(config.lock_timeout, Arc::clone(&stats))?,
            group_commit: GroupCommit::new(
                Arc::clone(&journal),
                timestamps,
                config.group_commit_timeout,
                config.max_batch_size,
                Arc::clone(&stats),
            ),
            pool: WorkerPool::new(Lane::Unisolated.name(), config.write_pool_size)?,
            admission: Arc::new(Admission::new(
                Lane::Unisolated.name(),
                config.write_queue_capacity,
                config.backoff,
            )),
            cancelled: Arc::clone(&cancelled),
            stats: Arc::clone(&stats),
        });
        Ok(Self {
            read_pool: WorkerPool::new(Lane::Historical.name(), config.read_pool_size)?,
            tx_pool: WorkerPool::new(Lane::Transaction.name(), config.tx_pool_size)?,
            config,
            journal,
            transactions,
            write,
            cancelled,
            accepting: AtomicBool::new(true),
            stats,
        })
    }

    /// Submits a task to the lane it classifies into.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::Shutdown`] after shutdown, and with
    /// [`CoreError::Rejected`] when the write queue is full.
    pub fn submit<T: Send + 'static>(&self, task: Task<T>) -> CoreResult<TaskFuture<T>> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CoreError::Shutdown);
        }
        let Task {
            lane,
            timestamp,
            resources,
            work,
        } = task;
        let (future, promise) = pair();

        match lane {
            Lane::Historical => {
                if timestamp.is_unisolated() {
                    return Err(CoreError::invalid_operation(
                        "historical tasks need a commit time",
                    ));
                }
                debug!(%lane, %timestamp, ?resources, "task submitted");
                let journal = Arc::clone(&self.journal);
                let cancelled = Arc::clone(&self.cancelled);
                let stats = Arc::clone(&self.stats);
                self.read_pool.submit(Box::new(move || {
                    if !promise.start() {
                        return;
                    }
                    stats.record_historical_task();
                    let result = TaskContext::historical(journal, timestamp, resources, cancelled)
                        .and_then(|mut ctx| work(&mut ctx));
                    promise.complete(result, None);
                }))?;
            }
            Lane::Transaction => {
                debug!(%lane, %timestamp, ?resources, "task submitted");
                let journal = Arc::clone(&self.journal);
                let transactions = Arc::clone(&self.transactions);
                let cancelled = Arc::clone(&self.cancelled);
                let stats = Arc::clone(&self.stats);
                self.tx_pool.submit(Box::new(move || {
                    if !promise.start() {
                        return;
                    }
                    stats.record_tx_task();
                    let result =
                        run_tx_task(journal, &transactions, timestamp, resources, cancelled, work);
                    promise.complete(result, None);
                }))?;
            }
            Lane::Unisolated => {
                let ticket = self.write.admission.admit().inspect_err(|_| {
                    self.stats.record_rejected_task();
                })?;
                debug!(%lane, ?resources, "task submitted");
                self.write.locks.request(
                    resources.clone(),
                    Box::new(UnisolatedDispatch {
                        lane: Arc::clone(&self.write),
                        resources,
                        work,
                        promise,
                        ticket,
                    }),
                );
            }
        }
        Ok(future)
    }

    /// Submits every task and waits for each in order.
    ///
    /// A failed or cancelled task does not stop the waiting. The futures are
    /// returned so their results can be collected.
    ///
    /// # Errors
    ///
    /// Returns the first submission error, after cancelling the tasks already
    /// submitted.
    pub fn invoke_all<T: Send + 'static>(&self, tasks: Vec<Task<T>>) -> CoreResult<Vec<TaskFuture<T>>> {
        self.invoke_all_until(tasks, None)
    }

    /// Like [`invoke_all`](Self::invoke_all), but stops waiting after
    /// `timeout` and cancels every task that is not done.
    ///
    /// # Errors
    ///
    /// Returns the first submission error, after cancelling the tasks already
    /// submitted.
    pub fn invoke_all_timeout<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        timeout: Duration,
    ) -> CoreResult<Vec<TaskFuture<T>>> {
        self.invoke_all_until(tasks, Some(Instant::now() + timeout))
    }

    fn invoke_all_until<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        deadline: Option<Instant>,
    ) -> CoreResult<Vec<TaskFuture<T>>> {
        let mut futures = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.submit(task) {
                Ok(future) => futures.push(future),
                Err(e) => {
                    for future in &futures {
                        future.cancel();
                    }
                    return Err(e);
                }
            }
        }

        for future in &futures {
            let done = match deadline {
                Some(deadline) => future.wait_deadline(deadline),
                None => {
                    future.wait();
                    true
                }
            };
            if !done {
                break;
            }
        }

        for future in futures.iter().filter(|f| !f.is_done()) {
            future.cancel();
        }
        Ok(futures)
    }

    /// Stops admission and drains the lanes in order: transaction, read,
    /// write. Each lane gets what is left of the shutdown timeout.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        let started = Instant::now();
        let remaining = || self.config.shutdown_timeout.saturating_sub(started.elapsed());

        for pool in [&self.tx_pool, &self.read_pool] {
            pool.shutdown();
            if !pool.await_termination(remaining()) {
                warn!(lane = pool.lane(), "lane did not terminate before shutdown timeout");
            }
        }

        if !self.write.drain(remaining()) {
            warn!(
                lane = self.write.pool.lane(),
                pending_locks = self.write.locks.pending(),
                "unisolated tasks still waiting at shutdown timeout"
            );
        }
        self.write.pool.shutdown();
        if !self.write.pool.await_termination(remaining()) {
            warn!(lane = self.write.pool.lane(), "lane did not terminate before shutdown timeout");
        }
        let abandoned = self.write.locks.stop();

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            abandoned,
            "concurrency manager shut down"
        );
    }

    /// Cancels queued tasks and waiting lock requests, flags running tasks
    /// as cancelled and returns without waiting.
    pub fn shutdown_now(&self) {
        self.accepting.store(false, Ordering::Release);
        self.cancelled.store(true, Ordering::Release);
        let cancelled_locks = self.write.locks.stop();
        self.tx_pool.shutdown_now();
        self.read_pool.shutdown_now();
        self.write.pool.shutdown_now();
        warn!(cancelled_locks, "concurrency manager shut down immediately");
    }

    /// True once either shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    /// Unisolated tasks waiting for locks.
    #[must_use]
    pub fn pending_lock_requests(&self) -> usize {
        self.write.locks.pending()
    }

    /// Unisolated tasks admitted but not yet running.
    #[must_use]
    pub fn write_queue_len(&self) -> usize {
        self.write.admission.queued()
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }
}

impl Drop for ConcurrencyManager {
    fn drop(&mut self) {
        self.write.locks.stop();
        self.write.pool.shutdown();
    }
}

impl fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("config", &self.config)
            .field("shutdown", &self.is_shutdown())
            .field("pending_locks", &self.pending_lock_requests())
            .finish_non_exhaustive()
    }
}

fn run_tx_task<T>(
    journal: Arc<Journal>,
    transactions: &ActiveTransactions,
    start_time: Timestamp,
    resources: Vec<String>,
    cancelled: Arc<AtomicBool>,
    work: Work<T>,
) -> CoreResult<T> {
    let tx = transactions
        .get(start_time)
        .ok_or(CoreError::TransactionNotFound { tx: start_time })?;
    let _lock = tx.lock();
    if !tx.is_active() {
        return Err(CoreError::NotActive { tx: start_time });
    }
    let mut ctx = TaskContext::transactional(journal, Arc::clone(&tx), resources, cancelled);
    work(&mut ctx)
}

/// An unisolated task waiting for its locks.
struct UnisolatedDispatch<T> {
    lane: Arc<WriteLane>,
    resources: Vec<String>,
    work: Work<T>,
    promise: Promise<T>,
    ticket: AdmissionTicket,
}

impl<T: Send + 'static> LockWaiter for UnisolatedDispatch<T> {
    fn is_cancelled(&self) -> bool {
        self.promise.is_cancelled()
    }

    fn grant(self: Box<Self>) -> bool {
        if !self.promise.start() {
            return false;
        }
        let lane = Arc::clone(&self.lane);
        lane.pool.submit(Box::new(move || self.run())).is_ok()
    }

    fn reject(self: Box<Self>, error: CoreError) {
        let Self { promise, .. } = *self;
        promise.complete(Err(error), None);
    }
}

impl<T: Send + 'static> UnisolatedDispatch<T> {
    fn run(self: Box<Self>) {
        let Self {
            lane,
            resources,
            work,
            promise,
            ticket,
        } = *self;
        drop(ticket);
        lane.stats.record_unisolated_task();

        lane.group_commit.enter();
        let revision_time = lane.timestamps.next_timestamp();
        let mut ctx = TaskContext::unisolated(
            Arc::clone(&lane.journal),
            resources.clone(),
            revision_time,
            Arc::clone(&lane.cancelled),
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut ctx)))
            .unwrap_or_else(|_| Err(CoreError::invalid_operation("task panicked")))
            .and_then(|value| ctx.checkpoint().map(|()| value));
        if let Err(e) = &outcome {
            debug!(?resources, error = %e, "unisolated task failed, rolling back");
            ctx.rollback();
            lane.stats.record_failed_task();
        }
        drop(ctx);
        lane.locks.release(&resources);

        match outcome {
            Ok(value) => lane
                .group_commit
                .leave(Some(Box::new(Completion { promise, value }))),
            Err(e) => {
                promise.complete(Err(e), None);
                lane.group_commit.leave(None);
            }
        }
    }
}

/// A successful unisolated task waiting on its group commit.
struct Completion<T> {
    promise: Promise<T>,
    value: T,
}

impl<T: Send> BatchMember for Completion<T> {
    fn succeed(self: Box<Self>, commit_time: Timestamp) {
        let Self { promise, value } = *self;
        promise.complete(Ok(value), Some(commit_time));
    }

    fn fail(self: Box<Self>, error: CoreError) {
        self.promise.complete(Err(error), None);
    }
}
