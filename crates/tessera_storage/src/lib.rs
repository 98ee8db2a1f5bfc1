//! # Tessera Storage
//!
//! Extent backends, record addressing and buffer strategies for the
//! Tessera journal.
//!
//! A store is a single extent laid out as a fixed header, two alternating
//! root-block slots and a user extent that records are appended to:
//!
//! ```text
//! | header (32) | root block 0 (128) | root block 1 (128) | user extent ... |
//! ```
//!
//! ## Layers
//!
//! - [`ExtentBackend`] - positional byte stores ([`InMemoryBackend`],
//!   [`FileBackend`], [`BufferedFileBackend`])
//! - [`AddressManager`] - packs (offset, length) into a 64-bit [`Address`]
//! - [`BufferStrategy`] - record write/read/grow/commit/abort over a backend,
//!   selected by [`BufferMode`] ([`WormStrategy`] or [`RwStrategy`])
//! - [`RootBlock`] - durable commit snapshots and slot selection on reopen
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{open_strategy, StoreOptions};
//!
//! let mut store = open_strategy(&StoreOptions::transient().initial_extent(4096)).unwrap();
//! let addr = store.write(b"hello world").unwrap();
//! assert_eq!(store.read(addr).unwrap(), b"hello world");
//! store.commit().unwrap();
//! assert!(!store.is_dirty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod address;
mod backend;
mod buffered;
mod crc;
mod error;
mod file;
mod header;
mod memory;
mod mode;
mod options;
mod root_block;
mod strategy;

pub use address::{
    Address, AddressManager, DEFAULT_OFFSET_BITS, MAX_OFFSET_BITS, MIN_OFFSET_BITS,
};
pub use backend::ExtentBackend;
pub use buffered::{BufferedFileBackend, WritePolicy};
pub use crc::compute_crc32;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use header::{
    FileHeader, FORMAT_VERSION, HEADER_MAGIC, HEADER_SIZE, ROOT_BLOCK0_OFFSET,
    ROOT_BLOCK1_OFFSET, ROOT_BLOCK_SIZE, USER_EXTENT_OFFSET,
};
pub use memory::InMemoryBackend;
pub use mode::{BufferMode, StoreType, MEM_MAX_EXTENT, OTHER_MAX_EXTENT};
pub use options::{StoreOptions, DEFAULT_INITIAL_EXTENT, DEFAULT_MINIMUM_EXTENSION};
pub use root_block::{
    choose_root_block, CommitPoint, RootBlock, RootBlockSlot, ROOT_BLOCK_MAGIC,
    ROOT_BLOCK_VERSION,
};
pub use strategy::{
    open_strategy, open_with_backend, BufferStrategy, RwStrategy, StrategyState, WormStrategy,
};
