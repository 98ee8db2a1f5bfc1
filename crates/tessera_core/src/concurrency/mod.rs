//! Task scheduling over three lanes.
//!
//! - historical reads run lock-free against committed snapshots
//! - transaction tasks write to a transaction's private buffer, serialized
//!   per transaction by its own lock
//! - unisolated tasks write live indices under resource locks and become
//!   durable through group commit

mod context;
mod future;
mod group_commit;
mod lock_manager;
mod manager;
mod pool;
mod task;

pub use context::TaskContext;
pub use future::TaskFuture;
pub use manager::ConcurrencyManager;
pub use task::{Lane, Task};
