//! Root blocks and slot selection.
//!
//! Two root blocks live at fixed offsets after the header. Each commit
//! writes the slot that is *not* current, so the current slot always holds
//! the last consistent state while the other one is being overwritten.
//! On open, [`choose_root_block`] picks the valid slot with the higher
//! commit counter.

use crate::address::Address;
use crate::crc::compute_crc32;
use crate::error::{StorageError, StorageResult};
use crate::header::{le_u32, le_u64, ROOT_BLOCK0_OFFSET, ROOT_BLOCK1_OFFSET, ROOT_BLOCK_SIZE};
use crate::mode::StoreType;
use std::fmt;
use uuid::Uuid;

/// Magic bytes at the start of each root block ("RTBK").
pub const ROOT_BLOCK_MAGIC: u32 = 0x5254_424B;

/// Current root block version.
pub const ROOT_BLOCK_VERSION: u32 = 1;

const CRC_OFFSET: usize = ROOT_BLOCK_SIZE as usize - 4;

/// One of the two root-block slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootBlockSlot {
    /// The slot directly after the header.
    Zero,
    /// The second slot.
    One,
}

impl RootBlockSlot {
    /// Byte offset of the slot in the extent.
    #[must_use]
    pub const fn offset(self) -> u64 {
        match self {
            Self::Zero => ROOT_BLOCK0_OFFSET,
            Self::One => ROOT_BLOCK1_OFFSET,
        }
    }

    /// The alternate slot.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }

    /// Slot number as stored on disk.
    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }
}

impl fmt::Display for RootBlockSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.index())
    }
}

/// What a commit contributes to the next root block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPoint {
    /// Next offset after the commit.
    pub next_offset: u64,
    /// Address of the commit record.
    pub commit_record_addr: Address,
    /// Address of the allocation metadata (RW stores).
    pub meta_bits_addr: Address,
    /// Start of the allocation region (RW stores).
    pub meta_start_addr: u64,
    /// Commit timestamp.
    pub commit_time: u64,
}

/// A durable snapshot of the store's commit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootBlock {
    /// The slot this block is written to.
    pub slot: RootBlockSlot,
    /// WORM or RW.
    pub store_type: StoreType,
    /// Address offset width.
    pub offset_bits: u8,
    /// Number of commits so far.
    pub commit_counter: u64,
    /// First unwritten offset of the user extent as of this commit.
    pub next_offset: u64,
    /// Address of the latest commit record (null before the first commit).
    pub commit_record_addr: Address,
    /// Address of the allocation metadata.
    pub meta_bits_addr: Address,
    /// Start of the allocation region.
    pub meta_start_addr: u64,
    /// Time of the first commit, 0 if none.
    pub first_commit_time: u64,
    /// Time of the last commit, 0 if none.
    pub last_commit_time: u64,
    /// When the store was created.
    pub create_time: u64,
    /// Identity of the store.
    pub uuid: Uuid,
}

impl RootBlock {
    /// The block written to slot 0 when a store is created.
    #[must_use]
    pub fn initial(store_type: StoreType, offset_bits: u8, uuid: Uuid, create_time: u64) -> Self {
        Self {
            slot: RootBlockSlot::Zero,
            store_type,
            offset_bits,
            commit_counter: 0,
            next_offset: 0,
            commit_record_addr: Address::NULL,
            meta_bits_addr: Address::NULL,
            meta_start_addr: 0,
            first_commit_time: 0,
            last_commit_time: 0,
            create_time,
            uuid,
        }
    }

    /// Builds the successor block, targeting the other slot.
    #[must_use]
    pub fn advance(&self, point: CommitPoint) -> Self {
        Self {
            slot: self.slot.other(),
            commit_counter: self.commit_counter + 1,
            next_offset: point.next_offset,
            commit_record_addr: point.commit_record_addr,
            meta_bits_addr: point.meta_bits_addr,
            meta_start_addr: point.meta_start_addr,
            first_commit_time: if self.first_commit_time == 0 {
                point.commit_time
            } else {
                self.first_commit_time
            },
            last_commit_time: point.commit_time,
            ..*self
        }
    }

    /// Encodes the block to its fixed-size form.
    #[must_use]
    pub fn encode(&self) -> [u8; ROOT_BLOCK_SIZE as usize] {
        let mut buf = [0u8; ROOT_BLOCK_SIZE as usize];
        buf[0..4].copy_from_slice(&ROOT_BLOCK_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&ROOT_BLOCK_VERSION.to_le_bytes());
        buf[8] = self.slot.index();
        buf[9] = self.store_type.code();
        buf[10] = self.offset_bits;
        buf[16..24].copy_from_slice(&self.commit_counter.to_le_bytes());
        buf[24..32].copy_from_slice(&self.next_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.commit_record_addr.as_u64().to_le_bytes());
        buf[40..48].copy_from_slice(&self.meta_bits_addr.as_u64().to_le_bytes());
        buf[48..56].copy_from_slice(&self.meta_start_addr.to_le_bytes());
        buf[56..64].copy_from_slice(&self.first_commit_time.to_le_bytes());
        buf[64..72].copy_from_slice(&self.last_commit_time.to_le_bytes());
        buf[72..80].copy_from_slice(&self.create_time.to_le_bytes());
        buf[80..96].copy_from_slice(self.uuid.as_bytes());
        let crc = compute_crc32(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a block read from `slot`.
    ///
    /// # Errors
    ///
    /// Fails on a short buffer, wrong magic or version, bad checksum, or a
    /// slot byte that does not match where the block was read from.
    pub fn decode(data: &[u8], slot: RootBlockSlot) -> StorageResult<Self> {
        if data.len() < ROOT_BLOCK_SIZE as usize {
            return Err(StorageError::corrupted("root block too short"));
        }
        if le_u32(data, 0) != ROOT_BLOCK_MAGIC {
            return Err(StorageError::corrupted(format!(
                "invalid root block magic in {slot}"
            )));
        }

        let expected = le_u32(data, CRC_OFFSET);
        let actual = compute_crc32(&data[..CRC_OFFSET]);
        if expected != actual {
            return Err(StorageError::ChecksumMismatch { expected, actual });
        }

        let version = le_u32(data, 4);
        if version != ROOT_BLOCK_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported root block version {version} in {slot}"
            )));
        }
        if data[8] != slot.index() {
            return Err(StorageError::corrupted(format!(
                "root block in {slot} claims slot{}",
                data[8]
            )));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[80..96]);

        Ok(Self {
            slot,
            store_type: StoreType::from_code(data[9])?,
            offset_bits: data[10],
            commit_counter: le_u64(data, 16),
            next_offset: le_u64(data, 24),
            commit_record_addr: Address::new(le_u64(data, 32)),
            meta_bits_addr: Address::new(le_u64(data, 40)),
            meta_start_addr: le_u64(data, 48),
            first_commit_time: le_u64(data, 56),
            last_commit_time: le_u64(data, 64),
            create_time: le_u64(data, 72),
            uuid: Uuid::from_bytes(uuid),
        })
    }
}

/// Picks the current root block from the two decoded slots.
///
/// The valid block with the higher commit counter wins; slot 0 wins a tie.
/// An invalid partner is logged and ignored.
///
/// # Errors
///
/// Fails if neither slot is valid, or if the two valid slots disagree on
/// store identity.
pub fn choose_root_block(
    slot0: StorageResult<RootBlock>,
    slot1: StorageResult<RootBlock>,
) -> StorageResult<RootBlock> {
    match (slot0, slot1) {
        (Ok(rb0), Ok(rb1)) => {
            if rb0.uuid != rb1.uuid {
                return Err(StorageError::corrupted(format!(
                    "root blocks belong to different stores: {} vs {}",
                    rb0.uuid, rb1.uuid
                )));
            }
            Ok(if rb1.commit_counter > rb0.commit_counter {
                rb1
            } else {
                rb0
            })
        }
        (Ok(rb0), Err(e)) => {
            tracing::warn!(error = %e, "root block slot1 invalid, using slot0");
            Ok(rb0)
        }
        (Err(e), Ok(rb1)) => {
            tracing::warn!(error = %e, "root block slot0 invalid, using slot1");
            Ok(rb1)
        }
        (Err(e0), Err(e1)) => Err(StorageError::corrupted(format!(
            "both root blocks invalid: slot0: {e0}; slot1: {e1}"
        ))),
    }
}
