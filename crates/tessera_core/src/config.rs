//! Engine configuration.

use std::path::Path;
use std::time::Duration;
use tessera_storage::{BufferMode, StoreOptions};

/// How hard a commit pushes data to stable media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceMode {
    /// Leave data in OS buffers.
    No,
    /// Sync file data before and after writing the root block.
    #[default]
    Force,
    /// Sync data and file metadata.
    ForceMetadata,
}

/// Configuration for the concurrency manager.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Worker threads for historical reads.
    pub read_pool_size: usize,
    /// Worker threads for transaction tasks.
    pub tx_pool_size: usize,
    /// Worker threads for unisolated writes.
    pub write_pool_size: usize,
    /// Bound on queued unisolated tasks (0 = unbounded).
    pub write_queue_capacity: usize,
    /// How long a group commit waits for other tasks to join (zero commits
    /// as soon as the running tasks finish).
    pub group_commit_timeout: Duration,
    /// Members after which a group commit stops waiting for its window
    /// (0 = no cap).
    pub max_batch_size: usize,
    /// How long an unisolated task may wait for its resource locks.
    pub lock_timeout: Duration,
    /// Total time `shutdown` waits for the lanes to drain.
    pub shutdown_timeout: Duration,
    /// Pause applied to submitters when a bounded queue is nearly full.
    pub backoff: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            read_pool_size: 8,
            tx_pool_size: 8,
            write_pool_size: 10,
            write_queue_capacity: 0,
            group_commit_timeout: Duration::from_millis(100),
            max_batch_size: 64,
            lock_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(10),
            backoff: Duration::from_millis(50),
        }
    }
}

impl ConcurrencyConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read pool size.
    #[must_use]
    pub const fn read_pool_size(mut self, threads: usize) -> Self {
        self.read_pool_size = threads;
        self
    }

    /// Sets the transaction pool size.
    #[must_use]
    pub const fn tx_pool_size(mut self, threads: usize) -> Self {
        self.tx_pool_size = threads;
        self
    }

    /// Sets the unisolated write pool size.
    #[must_use]
    pub const fn write_pool_size(mut self, threads: usize) -> Self {
        self.write_pool_size = threads;
        self
    }

    /// Bounds the write queue (0 = unbounded).
    #[must_use]
    pub const fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    /// Sets the group commit join window.
    #[must_use]
    pub const fn group_commit_timeout(mut self, timeout: Duration) -> Self {
        self.group_commit_timeout = timeout;
        self
    }

    /// Caps the members of one group commit (0 = no cap).
    #[must_use]
    pub const fn max_batch_size(mut self, members: usize) -> Self {
        self.max_batch_size = members;
        self
    }

    /// Sets the lock acquisition timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the admission backoff.
    #[must_use]
    pub const fn backoff(mut self, delay: Duration) -> Self {
        self.backoff = delay;
        self
    }
}

/// Configuration for opening an engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Store layout and backing.
    pub store: StoreOptions,
    /// Worker pools and scheduling.
    pub concurrency: ConcurrencyConfig,
    /// Durability of each commit.
    pub force_on_commit: ForceMode,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A memory-only engine, handy for tests.
    #[must_use]
    pub fn transient() -> Self {
        Self {
            store: StoreOptions::transient().initial_extent(1024 * 1024),
            force_on_commit: ForceMode::No,
            ..Self::default()
        }
    }

    /// A file-backed engine at `path`.
    #[must_use]
    pub fn file(path: impl AsRef<Path>, mode: BufferMode) -> Self {
        Self {
            store: StoreOptions::file(path, mode),
            ..Self::default()
        }
    }

    /// Sets the store options.
    #[must_use]
    pub fn store(mut self, store: StoreOptions) -> Self {
        self.store = store;
        self
    }

    /// Sets the concurrency configuration.
    #[must_use]
    pub fn concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the commit durability.
    #[must_use]
    pub const fn force_on_commit(mut self, mode: ForceMode) -> Self {
        self.force_on_commit = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.force_on_commit, ForceMode::Force);
        assert_eq!(config.concurrency.write_pool_size, 10);
        assert_eq!(config.concurrency.write_queue_capacity, 0);
        assert_eq!(config.concurrency.max_batch_size, 64);
        assert_eq!(
            config.concurrency.group_commit_timeout,
            Duration::from_millis(100)
        );
        assert_eq!(config.concurrency.lock_timeout, Duration::from_secs(120));
    }

    #[test]
    fn builder_pattern() {
        let config = EngineConfig::transient()
            .force_on_commit(ForceMode::ForceMetadata)
            .concurrency(
                ConcurrencyConfig::new()
                    .write_queue_capacity(16)
                    .backoff(Duration::from_millis(5)),
            );

        assert_eq!(config.store.buffer_mode, BufferMode::Transient);
        assert_eq!(config.force_on_commit, ForceMode::ForceMetadata);
        assert_eq!(config.concurrency.write_queue_capacity, 16);
        assert_eq!(config.concurrency.backoff, Duration::from_millis(5));
    }
}
