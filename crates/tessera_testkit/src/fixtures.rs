//! Test fixtures and engine helpers.
//!
//! Provides engines over transient, file-backed and crash-injecting stores
//! with settings tuned for fast tests.

use crate::crash::{CrashControl, CrashableBackend};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tessera_core::{ConcurrencyConfig, CoreResult, Engine, EngineConfig, ForceMode};
use tessera_storage::{BufferMode, InMemoryBackend, StoreOptions};

/// Initial extent used by fixture stores.
pub const FIXTURE_EXTENT: u64 = 256 * 1024;

/// Concurrency settings with a short group-commit window and lock timeout.
pub fn fast_concurrency() -> ConcurrencyConfig {
    ConcurrencyConfig::new()
        .read_pool_size(4)
        .tx_pool_size(4)
        .write_pool_size(4)
        .group_commit_timeout(Duration::from_millis(10))
        .lock_timeout(Duration::from_secs(5))
        .shutdown_timeout(Duration::from_secs(5))
}

/// A transient engine configuration for tests.
pub fn transient_config() -> EngineConfig {
    EngineConfig::transient().concurrency(fast_concurrency())
}

/// A file engine configuration for tests.
pub fn file_config(path: impl AsRef<Path>, mode: BufferMode) -> EngineConfig {
    let config = EngineConfig::file(path, mode).concurrency(fast_concurrency());
    let store = config.store.clone().initial_extent(FIXTURE_EXTENT);
    config.store(store)
}

/// A test engine with automatic cleanup.
pub struct TestEngine {
    /// The engine instance.
    pub engine: Engine,
    config: EngineConfig,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates a new transient test engine.
    pub fn transient() -> Self {
        let config = transient_config();
        Self {
            engine: Engine::open(config.clone()).expect("Failed to open transient engine"),
            config,
            _temp_dir: None,
        }
    }

    /// Creates a new file-backed test engine in a temporary directory.
    pub fn file(mode: BufferMode) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = file_config(temp_dir.path().join("journal.tsr"), mode);
        Self {
            engine: Engine::open(config.clone()).expect("Failed to open file engine"),
            config,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the journal path if file-based, None if transient.
    pub fn path(&self) -> Option<&Path> {
        self.config.store.path.as_deref()
    }

    /// Closes the engine and opens it again over the same file.
    ///
    /// # Panics
    ///
    /// Panics for a transient engine, whose contents do not survive close.
    pub fn reopen(self) -> Self {
        assert!(self.path().is_some(), "transient engines cannot be reopened");
        let Self {
            engine,
            config,
            _temp_dir,
        } = self;
        engine.close().expect("Failed to close engine");
        Self {
            engine: Engine::open(config.clone()).expect("Failed to reopen engine"),
            config,
            _temp_dir,
        }
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Runs a test with a temporary transient engine.
///
/// # Example
///
/// ```rust
/// use tessera_testkit::with_temp_engine;
///
/// with_temp_engine(|engine| {
///     engine.register_index("test").unwrap();
/// });
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&Engine) -> R,
{
    let test_engine = TestEngine::transient();
    f(&test_engine.engine)
}

/// Runs a test with a temporary file-backed engine.
pub fn with_file_engine<F, R>(mode: BufferMode, f: F) -> R
where
    F: FnOnce(&Engine, &Path) -> R,
{
    let test_engine = TestEngine::file(mode);
    let path = test_engine
        .path()
        .expect("File engine should have a path")
        .to_path_buf();
    f(&test_engine.engine, &path)
}

/// An in-memory image that engines can be opened over repeatedly, with
/// crash injection on the writes of the engine under test.
pub struct CrashFixture {
    image: InMemoryBackend,
    control: Arc<CrashControl>,
    config: EngineConfig,
}

impl CrashFixture {
    /// Creates an empty image with forced commits.
    pub fn new() -> Self {
        Self {
            image: InMemoryBackend::new(),
            control: Arc::new(CrashControl::default()),
            config: transient_config()
                .store(StoreOptions::transient().initial_extent(FIXTURE_EXTENT))
                .force_on_commit(ForceMode::Force),
        }
    }

    /// The crash switchboard for engines opened with [`open`](Self::open).
    pub fn control(&self) -> &Arc<CrashControl> {
        &self.control
    }

    /// Opens an engine whose writes go through the crash switchboard.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be opened or recovered.
    pub fn open(&self) -> CoreResult<Engine> {
        let backend = CrashableBackend::with_control(
            Box::new(self.image.share()),
            Arc::clone(&self.control),
        );
        Engine::open_with_backend(self.config.clone(), Box::new(backend))
    }

    /// Opens an engine directly over the image, as a restarted process
    /// would after a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be recovered.
    pub fn recover(&self) -> CoreResult<Engine> {
        self.control.reset();
        Engine::open_with_backend(self.config.clone(), Box::new(self.image.share()))
    }

    /// A copy of the raw image.
    pub fn image(&self) -> Vec<u8> {
        self.image.data()
    }
}

impl Default for CrashFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use tessera_core::{CoreError, Timestamp};

    /// Registers `index` and commits `count` keys `key-0000..` with values
    /// `value-0000..`, one transaction each. Returns the commit times.
    pub fn populate(engine: &Engine, index: &str, count: usize) -> Vec<Timestamp> {
        if !engine.index_names().iter().any(|name| name == index) {
            engine.register_index(index).expect("Failed to register index");
        }
        (0..count)
            .map(|i| {
                let tx = engine.begin_tx().expect("Failed to begin transaction");
                tx.get_index(index)
                    .and_then(|idx| idx.ok_or_else(|| CoreError::index_not_found(index)))
                    .and_then(|idx| idx.put(key(i), value(i)))
                    .expect("Failed to write");
                engine.commit_tx(&tx).expect("Failed to commit")
            })
            .collect()
    }

    /// The `i`th key written by [`populate`].
    pub fn key(i: usize) -> Vec<u8> {
        format!("key-{i:04}").into_bytes()
    }

    /// The `i`th value written by [`populate`].
    pub fn value(i: usize) -> Vec<u8> {
        format!("value-{i:04}").into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_fixture_opens() {
        let engine = TestEngine::transient();
        assert!(engine.path().is_none());
        engine.register_index("a").unwrap();
    }

    #[test]
    fn file_fixture_survives_reopen() {
        let engine = TestEngine::file(BufferMode::DiskWorm);
        let times = scenarios::populate(&engine, "a", 3);
        let engine = engine.reopen();
        assert_eq!(engine.last_commit_time(), *times.last().unwrap());
        assert_eq!(engine.index_names(), vec!["a".to_string()]);
    }

    #[test]
    fn crash_fixture_recovers_committed_state() {
        let fixture = CrashFixture::new();
        let engine = fixture.open().unwrap();
        scenarios::populate(&engine, "a", 2);
        let counter = engine.commit_counter();
        engine.shutdown_now();
        drop(engine);

        let engine = fixture.recover().unwrap();
        assert_eq!(engine.commit_counter(), counter);
    }
}
