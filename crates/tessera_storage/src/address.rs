//! Address encoding.
//!
//! An address packs the offset and length of a record into a single `u64`:
//!
//! ```text
//! | offset (offset_bits) | length (64 - offset_bits) |
//! ```
//!
//! Offsets are relative to the start of the user extent. The value 0 is the
//! null address and a zero length is never a valid record.

use crate::error::{StorageError, StorageResult};
use std::fmt;

/// Smallest supported offset width.
pub const MIN_OFFSET_BITS: u8 = 32;

/// Largest supported offset width.
pub const MAX_OFFSET_BITS: u8 = 60;

/// Default offset width: 4 TiB of offsets, 4 MiB records.
pub const DEFAULT_OFFSET_BITS: u8 = 42;

/// A packed (offset, length) record address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u64);

impl Address {
    /// The reserved null address.
    pub const NULL: Self = Self(0);

    /// Creates an address from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr:{:#x}", self.0)
    }
}

/// Encodes and decodes addresses for a fixed offset width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressManager {
    offset_bits: u8,
    length_bits: u8,
    max_offset: u64,
    max_length: u64,
}

impl AddressManager {
    /// Creates an address manager.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidOffsetBits`] unless `offset_bits` is in
    /// `MIN_OFFSET_BITS..=MAX_OFFSET_BITS`.
    pub fn new(offset_bits: u8) -> StorageResult<Self> {
        if !(MIN_OFFSET_BITS..=MAX_OFFSET_BITS).contains(&offset_bits) {
            return Err(StorageError::InvalidOffsetBits(offset_bits));
        }
        let length_bits = 64 - offset_bits;
        Ok(Self {
            offset_bits,
            length_bits,
            max_offset: (1u64 << offset_bits) - 1,
            max_length: (1u64 << length_bits) - 1,
        })
    }

    /// Returns the offset width.
    #[must_use]
    pub const fn offset_bits(&self) -> u8 {
        self.offset_bits
    }

    /// Returns the length width.
    #[must_use]
    pub const fn length_bits(&self) -> u8 {
        self.length_bits
    }

    /// Largest encodable offset.
    #[must_use]
    pub const fn max_offset(&self) -> u64 {
        self.max_offset
    }

    /// Largest encodable record length.
    #[must_use]
    pub const fn max_length(&self) -> u64 {
        self.max_length
    }

    /// Packs an offset and length.
    ///
    /// # Errors
    ///
    /// Fails for a zero length, a length beyond the length bits, or an
    /// offset beyond the offset bits.
    pub fn encode(&self, offset: u64, len: u64) -> StorageResult<Address> {
        if len == 0 {
            return Err(StorageError::ZeroLength { addr: 0 });
        }
        if len > self.max_length {
            return Err(StorageError::RecordTooLarge {
                len,
                max: self.max_length,
            });
        }
        if offset > self.max_offset {
            return Err(StorageError::MaxExtent {
                required: offset.saturating_add(len),
                maximum: self.max_offset,
            });
        }
        Ok(Address((offset << self.length_bits) | len))
    }

    /// Returns the offset of an address.
    #[must_use]
    pub const fn offset(&self, addr: Address) -> u64 {
        addr.0 >> self.length_bits
    }

    /// Returns the record length of an address.
    #[must_use]
    pub const fn len(&self, addr: Address) -> u64 {
        addr.0 & self.max_length
    }

    /// Splits an address, rejecting the null address and zero lengths.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NullAddress`] or [`StorageError::ZeroLength`].
    pub fn decode(&self, addr: Address) -> StorageResult<(u64, u64)> {
        if addr.is_null() {
            return Err(StorageError::NullAddress);
        }
        let len = self.len(addr);
        if len == 0 {
            return Err(StorageError::ZeroLength { addr: addr.0 });
        }
        Ok((self.offset(addr), len))
    }
}
