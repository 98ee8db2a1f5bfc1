//! # Tessera Core
//!
//! Journal, scheduler and transactions for the Tessera storage engine.
//!
//! This crate provides:
//! - A journal that checkpoints named indices into an append-only store and
//!   commits them atomically through the dual root block
//! - A concurrency manager with three lanes: lock-free historical reads,
//!   per-transaction tasks, and unisolated writes under resource locks
//! - Group commit, so concurrent unisolated tasks share one root-block write
//! - Snapshot-isolated transactions validated against the live indices and
//!   committed in a single phase
//!
//! Most callers only need [`Engine`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod concurrency;
mod config;
mod engine;
mod error;
mod index;
mod journal;
mod stats;
mod timestamp;
mod transaction;
mod types;

pub use concurrency::{ConcurrencyManager, Lane, Task, TaskContext, TaskFuture};
pub use config::{ConcurrencyConfig, EngineConfig, ForceMode};
pub use engine::Engine;
pub use error::{CoreError, CoreResult};
pub use index::{IndexMetadata, IndexSnapshot, IsolatedView, LiveIndex, RecordStore, Savepoint, Tuple};
pub use journal::{
    CommitRecord, IndexSource, Journal, ResourceManager, COMMIT_RECORD_MAGIC, COMMIT_RECORD_VERSION,
};
pub use stats::{EngineStats, StatsSnapshot};
pub use timestamp::{TimestampService, TimestampSource};
pub use transaction::{
    ActiveTransactions, RunState, TransactionManager, Tx, TxIndex, TxLock, Validation,
};
pub use types::Timestamp;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
