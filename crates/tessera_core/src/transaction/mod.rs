//! Snapshot-isolated transactions.
//!
//! - **Isolation**: a transaction reads the state committed when it began
//!   and writes to private views
//! - **Validation**: at commit, write sets are checked against the live
//!   indices for write-write conflicts
//! - **Atomicity**: validated writes are merged and made durable by one
//!   unisolated task riding a group commit

mod manager;
mod state;
mod tx;

pub use manager::{ActiveTransactions, TransactionManager};
pub use state::RunState;
pub use tx::{Tx, TxIndex, TxLock, Validation};
