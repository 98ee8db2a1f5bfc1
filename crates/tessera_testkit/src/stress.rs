//! Stress helpers for Tessera.
//!
//! These drive an engine from many threads at once and report how the
//! operations fared.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tessera_core::{CoreError, Engine, Task};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations attempted.
    pub total_ops: usize,
    /// Operations that committed.
    pub successful_ops: usize,
    /// Operations that lost a write-write conflict.
    pub conflicts: usize,
    /// Operations that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, conflicts: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + conflicts + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            conflicts,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Committed: {}", self.successful_ops);
        println!("Conflicts: {}", self.conflicts);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of each value in bytes.
    pub value_size: usize,
    /// Number of distinct keys; smaller values mean more conflicts.
    pub key_space: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            value_size: 64,
            key_space: 1_000,
        }
    }
}

#[derive(Default)]
struct Tally {
    committed: AtomicUsize,
    conflicts: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn record<T>(&self, outcome: &Result<T, CoreError>) {
        let counter = match outcome {
            Ok(_) => &self.committed,
            Err(CoreError::ValidationFailed { .. }) => &self.conflicts,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(self, start: Instant) -> StressTestResult {
        StressTestResult::new(
            self.committed.into_inner(),
            self.conflicts.into_inner(),
            self.failed.into_inner(),
            start.elapsed(),
        )
    }
}

fn stress_key(thread: usize, op: usize, key_space: usize) -> Vec<u8> {
    let slot = (thread * 7_919 + op * 104_729) % key_space.max(1);
    format!("k{slot:08}").into_bytes()
}

/// Runs one-key transactions from every thread against `index`.
pub fn stress_concurrent_transactions(
    engine: &Engine,
    index: &str,
    config: &StressConfig,
) -> StressTestResult {
    let value = vec![0xABu8; config.value_size];
    let tally = Tally::default();
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads {
            let tally = &tally;
            let value = &value;
            scope.spawn(move || {
                for op in 0..config.operations {
                    let outcome = engine.transaction(|tx| {
                        let idx = tx
                            .get_index(index)?
                            .ok_or_else(|| CoreError::index_not_found(index))?;
                        idx.put(stress_key(t, op, config.key_space), value.clone())
                    });
                    tally.record(&outcome);
                }
            });
        }
    });

    tally.finish(start)
}

/// Submits unisolated writes from every thread against `index`.
pub fn stress_unisolated_writes(
    engine: &Engine,
    index: &str,
    config: &StressConfig,
) -> StressTestResult {
    let tally = Tally::default();
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads {
            let tally = &tally;
            scope.spawn(move || {
                for op in 0..config.operations {
                    let name = index.to_string();
                    let key = stress_key(t, op, config.key_space);
                    let value = vec![t as u8; config.value_size];
                    let outcome = engine
                        .submit(Task::unisolated([index], move |ctx| ctx.put(&name, key, value)))
                        .and_then(|future| future.get());
                    tally.record(&outcome);
                }
            });
        }
    });

    tally.finish(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEngine;

    fn small() -> StressConfig {
        StressConfig {
            operations: 20,
            threads: 3,
            value_size: 16,
            key_space: 50,
        }
    }

    #[test]
    fn transactions_account_for_every_operation() {
        let engine = TestEngine::transient();
        engine.register_index("s").unwrap();
        let result = stress_concurrent_transactions(&engine, "s", &small());
        assert_eq!(result.total_ops, 60);
        assert_eq!(result.failed_ops, 0);
        assert!(result.successful_ops > 0);
        assert_eq!(
            engine.stats().transactions_committed() as usize,
            result.successful_ops
        );
    }

    #[test]
    fn unisolated_writes_all_commit() {
        let engine = TestEngine::transient();
        engine.register_index("s").unwrap();
        let result = stress_unisolated_writes(&engine, "s", &small());
        assert_eq!(result.successful_ops, 60);
        assert_eq!(result.conflicts, 0);
    }
}
