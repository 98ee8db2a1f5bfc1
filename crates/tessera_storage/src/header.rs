//! Fixed file header and extent layout.
//!
//! ```text
//! 0      32           160          288
//! | hdr  | root blk 0 | root blk 1 | user extent ...
//! ```

use crate::crc::compute_crc32;
use crate::error::{StorageError, StorageResult};
use crate::mode::StoreType;

/// Magic bytes at the start of every journal file ("TSRJ").
pub const HEADER_MAGIC: u32 = 0x5453_524A;

/// Current file format version.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the file header.
pub const HEADER_SIZE: u64 = 32;

/// Size of one root-block slot.
pub const ROOT_BLOCK_SIZE: u64 = 128;

/// Offset of root-block slot 0.
pub const ROOT_BLOCK0_OFFSET: u64 = HEADER_SIZE;

/// Offset of root-block slot 1.
pub const ROOT_BLOCK1_OFFSET: u64 = HEADER_SIZE + ROOT_BLOCK_SIZE;

/// Offset of the first byte of the user extent.
pub const USER_EXTENT_OFFSET: u64 = HEADER_SIZE + 2 * ROOT_BLOCK_SIZE;

/// The fixed header written once when a store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version.
    pub version: u32,
    /// WORM or RW.
    pub store_type: StoreType,
    /// Address offset width.
    pub offset_bits: u8,
    /// Root-block slot size.
    pub root_block_size: u32,
}

impl FileHeader {
    /// Creates a header for a new store.
    #[must_use]
    pub fn new(store_type: StoreType, offset_bits: u8) -> Self {
        Self {
            version: FORMAT_VERSION,
            store_type,
            offset_bits,
            root_block_size: ROOT_BLOCK_SIZE as u32,
        }
    }

    /// Encodes the header to its fixed-size form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8] = self.store_type.code();
        buf[9] = self.offset_bits;
        buf[12..16].copy_from_slice(&self.root_block_size.to_le_bytes());
        let crc = compute_crc32(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Fails on a short buffer, wrong magic, unsupported version, bad
    /// checksum or a root-block size this build does not understand.
    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        if data.len() < HEADER_SIZE as usize {
            return Err(StorageError::corrupted("header too short"));
        }
        if le_u32(data, 0) != HEADER_MAGIC {
            return Err(StorageError::corrupted("invalid header magic"));
        }

        let expected = le_u32(data, 28);
        let actual = compute_crc32(&data[..28]);
        if expected != actual {
            return Err(StorageError::ChecksumMismatch { expected, actual });
        }

        let version = le_u32(data, 4);
        if version > FORMAT_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported format version: {version}"
            )));
        }

        let root_block_size = le_u32(data, 12);
        if u64::from(root_block_size) != ROOT_BLOCK_SIZE {
            return Err(StorageError::corrupted(format!(
                "unexpected root block size: {root_block_size}"
            )));
        }

        Ok(Self {
            version,
            store_type: StoreType::from_code(data[8])?,
            offset_bits: data[9],
            root_block_size,
        })
    }
}

pub(crate) fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub(crate) fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_offsets() {
        assert_eq!(ROOT_BLOCK0_OFFSET, 32);
        assert_eq!(ROOT_BLOCK1_OFFSET, 160);
        assert_eq!(USER_EXTENT_OFFSET, 288);
    }

    #[test]
    fn header_encodes_magic_first() {
        let buf = FileHeader::new(StoreType::Worm, 42).encode();
        assert_eq!(&buf[0..4], &HEADER_MAGIC.to_le_bytes());
        assert_eq!(buf[9], 42);
    }

    #[test]
    fn header_decode_validates() {
        let header = FileHeader::new(StoreType::Rw, 40);
        let decoded = FileHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_corruption_detected() {
        let mut buf = FileHeader::new(StoreType::Worm, 42).encode();
        buf[9] = 41;
        assert!(matches!(
            FileHeader::decode(&buf),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn header_bad_magic() {
        let buf = [0u8; 32];
        assert!(matches!(
            FileHeader::decode(&buf),
            Err(StorageError::Corrupted(_))
        ));
    }
}
