//! Benchmark utilities.

use rand::Rng;
use std::time::Duration;
use tessera_core::{ConcurrencyConfig, Engine, EngineConfig};

/// Generate random record data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct keys in random order.
pub fn shuffled_keys(count: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let mut keys: Vec<Vec<u8>> = (0..count).map(|i| format!("key-{i:08}").into_bytes()).collect();
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    keys
}

/// A transient engine with a short group-commit window and the named
/// indices registered.
pub fn bench_engine(indices: &[&str]) -> Engine {
    let config = EngineConfig::transient().concurrency(
        ConcurrencyConfig::new().group_commit_timeout(Duration::from_millis(1)),
    );
    let engine = Engine::open(config).expect("Failed to open engine");
    for name in indices {
        engine.register_index(name).expect("Failed to register index");
    }
    engine
}
