//! Engine statistics.
//!
//! Counters are atomic and can be read while work is in flight.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine statistics and metrics.
#[derive(Debug, Default)]
pub struct EngineStats {
    historical_tasks: AtomicU64,
    tx_tasks: AtomicU64,
    unisolated_tasks: AtomicU64,
    rejected_tasks: AtomicU64,
    failed_tasks: AtomicU64,

    commits: AtomicU64,
    commit_failures: AtomicU64,
    journal_aborts: AtomicU64,

    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    validation_failures: AtomicU64,

    bytes_written: AtomicU64,
    lock_waits: AtomicU64,
    lock_wait_micros: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_historical_task(&self) {
        self.historical_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tx_task(&self) {
        self.tx_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unisolated_task(&self) {
        self.unisolated_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_task(&self) {
        self.rejected_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_task(&self) {
        self.failed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_journal_abort(&self) {
        self.journal_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_wait(&self, micros: u64) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
        self.lock_wait_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Tasks run on the historical-read lane.
    pub fn historical_tasks(&self) -> u64 {
        self.historical_tasks.load(Ordering::Relaxed)
    }

    /// Tasks run on the transaction lane.
    pub fn tx_tasks(&self) -> u64 {
        self.tx_tasks.load(Ordering::Relaxed)
    }

    /// Tasks run on the unisolated lane.
    pub fn unisolated_tasks(&self) -> u64 {
        self.unisolated_tasks.load(Ordering::Relaxed)
    }

    /// Submissions refused by a full queue.
    pub fn rejected_tasks(&self) -> u64 {
        self.rejected_tasks.load(Ordering::Relaxed)
    }

    /// Unisolated tasks whose work failed and was rolled back.
    pub fn failed_tasks(&self) -> u64 {
        self.failed_tasks.load(Ordering::Relaxed)
    }

    /// Root-block advances.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Group commits that failed.
    pub fn commit_failures(&self) -> u64 {
        self.commit_failures.load(Ordering::Relaxed)
    }

    /// Journal abort cycles.
    pub fn journal_aborts(&self) -> u64 {
        self.journal_aborts.load(Ordering::Relaxed)
    }

    /// Transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Transactions aborted, including validation failures.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Transactions that failed validation.
    pub fn validation_failures(&self) -> u64 {
        self.validation_failures.load(Ordering::Relaxed)
    }

    /// Bytes appended to the store by the journal.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Lock requests that were granted.
    pub fn lock_waits(&self) -> u64 {
        self.lock_waits.load(Ordering::Relaxed)
    }

    /// Total time granted lock requests spent waiting.
    pub fn lock_wait_micros(&self) -> u64 {
        self.lock_wait_micros.load(Ordering::Relaxed)
    }

    /// Lock requests that timed out.
    pub fn lock_timeouts(&self) -> u64 {
        self.lock_timeouts.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            historical_tasks: self.historical_tasks(),
            tx_tasks: self.tx_tasks(),
            unisolated_tasks: self.unisolated_tasks(),
            rejected_tasks: self.rejected_tasks(),
            failed_tasks: self.failed_tasks(),
            commits: self.commits(),
            commit_failures: self.commit_failures(),
            journal_aborts: self.journal_aborts(),
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            validation_failures: self.validation_failures(),
            bytes_written: self.bytes_written(),
            lock_waits: self.lock_waits(),
            lock_wait_micros: self.lock_wait_micros(),
            lock_timeouts: self.lock_timeouts(),
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Tasks run on the historical-read lane.
    pub historical_tasks: u64,
    /// Tasks run on the transaction lane.
    pub tx_tasks: u64,
    /// Tasks run on the unisolated lane.
    pub unisolated_tasks: u64,
    /// Submissions refused by a full queue.
    pub rejected_tasks: u64,
    /// Unisolated tasks rolled back.
    pub failed_tasks: u64,
    /// Root-block advances.
    pub commits: u64,
    /// Failed group commits.
    pub commit_failures: u64,
    /// Journal abort cycles.
    pub journal_aborts: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted.
    pub transactions_aborted: u64,
    /// Validation failures.
    pub validation_failures: u64,
    /// Bytes appended by the journal.
    pub bytes_written: u64,
    /// Granted lock requests.
    pub lock_waits: u64,
    /// Total lock wait time.
    pub lock_wait_micros: u64,
    /// Timed-out lock requests.
    pub lock_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = EngineStats::new();
        assert_eq!(stats.commits(), 0);
        assert_eq!(stats.unisolated_tasks(), 0);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn lock_waits_accumulate() {
        let stats = EngineStats::new();
        stats.record_lock_wait(100);
        stats.record_lock_wait(50);

        assert_eq!(stats.lock_waits(), 2);
        assert_eq!(stats.lock_wait_micros(), 150);
    }

    #[test]
    fn snapshot_copies_counters() {
        let stats = EngineStats::new();
        stats.record_transaction_start();
        stats.record_transaction_abort();
        stats.record_validation_failure();
        stats.record_bytes_written(64);

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 1);
        assert_eq!(snap.transactions_aborted, 1);
        assert_eq!(snap.validation_failures, 1);
        assert_eq!(snap.bytes_written, 64);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(EngineStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_unisolated_task();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.unisolated_tasks(), 800);
    }
}
