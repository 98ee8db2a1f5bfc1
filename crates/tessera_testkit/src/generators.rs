//! Property-based test generators using proptest.

use proptest::prelude::*;
use tessera_storage::{MAX_OFFSET_BITS, MIN_OFFSET_BITS};

/// Strategy for index names.
pub fn index_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for index keys.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..32)
}

/// Strategy for values, including empty ones.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Strategy for non-empty records to append to a store.
pub fn record_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..2048)
}

/// Strategy for a batch of key/value writes.
pub fn write_batch_strategy(max: usize) -> impl Strategy<Value = Vec<(Vec<u8>, Vec<u8>)>> {
    prop::collection::vec((key_strategy(), value_strategy()), 1..max.max(2))
}

/// Strategy for a valid offset-bits setting.
pub fn offset_bits_strategy() -> impl Strategy<Value = u8> {
    MIN_OFFSET_BITS..=MAX_OFFSET_BITS
}

/// A step in a store workload.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Append a record.
    Write(Vec<u8>),
    /// Make pending writes durable.
    Commit,
    /// Discard pending writes.
    Abort,
}

/// Strategy for store workloads mixing writes, commits and aborts.
pub fn store_ops_strategy(max: usize) -> impl Strategy<Value = Vec<StoreOp>> {
    let op = prop_oneof![
        6 => record_strategy().prop_map(StoreOp::Write),
        2 => Just(StoreOp::Commit),
        1 => Just(StoreOp::Abort),
    ];
    prop::collection::vec(op, 1..max.max(2))
}
