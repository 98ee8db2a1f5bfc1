//! Commit records.
//!
//! Every journal commit appends one record naming the checkpoint of each
//! live index. The records form a chain through `prev_addr`, which recovery
//! walks backwards from the root block to rebuild commit-time history.
//!
//! ```text
//! | magic (4) | version (2) | commit_time (8) | commit_counter (8) |
//! | prev_addr (8) | count (4) | { name_len (2) | name | addr (8) }* | crc32 (4) |
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::Timestamp;
use std::collections::BTreeMap;
use tessera_storage::{compute_crc32, Address};

/// Magic bytes for commit records.
pub const COMMIT_RECORD_MAGIC: [u8; 4] = *b"TCMR";

/// Current commit record version.
pub const COMMIT_RECORD_VERSION: u16 = 1;

/// The durable description of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Timestamp assigned to the commit.
    pub commit_time: Timestamp,
    /// Root-block commit counter this record belongs to.
    pub commit_counter: u64,
    /// Previous commit record, null for the first commit.
    pub prev_addr: Address,
    /// Checkpoint address of every index as of this commit.
    pub indices: BTreeMap<String, Address>,
}

impl CommitRecord {
    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(38 + self.indices.len() * 24);
        buf.extend_from_slice(&COMMIT_RECORD_MAGIC);
        buf.extend_from_slice(&COMMIT_RECORD_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.commit_time.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.commit_counter.to_le_bytes());
        buf.extend_from_slice(&self.prev_addr.as_u64().to_le_bytes());

        let count = u32::try_from(self.indices.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&count.to_le_bytes());
        for (name, addr) in &self.indices {
            let name_bytes = name.as_bytes();
            let name_len = u16::try_from(name_bytes.len()).unwrap_or(u16::MAX);
            buf.extend_from_slice(&name_len.to_le_bytes());
            buf.extend_from_slice(&name_bytes[..name_len as usize]);
            buf.extend_from_slice(&addr.as_u64().to_le_bytes());
        }

        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] for a bad magic, version or checksum, or
    /// a truncated record.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[0..4] != COMMIT_RECORD_MAGIC {
            return Err(CoreError::codec("invalid commit record magic"));
        }
        if data.len() < 4 + 2 + 8 + 8 + 8 + 4 + 4 {
            return Err(CoreError::codec("commit record too short"));
        }

        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = compute_crc32(body);
        if stored != actual {
            return Err(CoreError::codec(format!(
                "commit record checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"
            )));
        }

        let mut reader = Reader { data: body, pos: 4 };
        let version = reader.u16()?;
        if version != COMMIT_RECORD_VERSION {
            return Err(CoreError::codec(format!(
                "unsupported commit record version: {version}"
            )));
        }
        let commit_time = Timestamp::new(reader.u64()?);
        let commit_counter = reader.u64()?;
        let prev_addr = Address::new(reader.u64()?);

        let count = reader.u32()?;
        let mut indices = BTreeMap::new();
        for _ in 0..count {
            let name_len = reader.u16()? as usize;
            let name = std::str::from_utf8(reader.bytes(name_len)?)
                .map_err(|_| CoreError::codec("invalid index name"))?
                .to_string();
            let addr = Address::new(reader.u64()?);
            indices.insert(name, addr);
        }

        if reader.pos != body.len() {
            return Err(CoreError::codec("trailing bytes in commit record"));
        }

        Ok(Self {
            commit_time,
            commit_counter,
            prev_addr,
            indices,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| CoreError::codec("commit record too short"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
}
