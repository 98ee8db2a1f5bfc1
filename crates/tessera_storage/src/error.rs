//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Every fault raised by a buffer strategy is detected before the store is
/// mutated, so none of these errors leaves durable state inconsistent.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The null address was used where a record address is required.
    #[error("address is 0L")]
    NullAddress,

    /// The address encodes a zero-length record.
    #[error("record length is zero (address {addr:#x})")]
    ZeroLength {
        /// The offending address.
        addr: u64,
    },

    /// The address points past the last written byte.
    #[error("address never written: offset {offset}, len {len}, next offset {next_offset}")]
    NotWritten {
        /// Offset of the record.
        offset: u64,
        /// Length of the record.
        len: u64,
        /// The store's next offset.
        next_offset: u64,
    },

    /// A read or write would run past the end of the backing extent.
    #[error("would overrun buffer: offset {offset}, len {len}, extent {extent}")]
    BufferOverrun {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Current extent.
        extent: u64,
    },

    /// A write would exceed the maximum extent of the store.
    #[error("would exceed maximum extent: required {required}, maximum {maximum}")]
    MaxExtent {
        /// User extent the write needs.
        required: u64,
        /// Maximum user extent.
        maximum: u64,
    },

    /// A truncate would discard written data.
    #[error("would truncate written data: extent {extent}, next offset {next_offset}")]
    Truncate {
        /// Requested extent.
        extent: u64,
        /// The store's next offset.
        next_offset: u64,
    },

    /// The store is read-only.
    #[error("read only")]
    ReadOnly,

    /// The store is not open.
    #[error("not open")]
    NotOpen,

    /// The store must be closed before this operation.
    #[error("still open")]
    StillOpen,

    /// Zero bytes were supplied to a write.
    #[error("zero bytes remaining in buffer")]
    EmptyRecord,

    /// The record does not fit in the length bits of an address.
    #[error("record too large: {len} bytes, maximum {max}")]
    RecordTooLarge {
        /// Record length.
        len: u64,
        /// Largest encodable length.
        max: u64,
    },

    /// The configured offset width is outside the supported range.
    #[error("invalid offset bits: {0}")]
    InvalidOffsetBits(u8),

    /// The store options are inconsistent.
    #[error("invalid store options: {0}")]
    InvalidOptions(String),

    /// Persistent structures failed validation.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Another process holds the store's file lock.
    #[error("store locked: another process has exclusive access")]
    Locked,
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
