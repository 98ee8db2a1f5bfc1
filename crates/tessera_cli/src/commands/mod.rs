//! CLI command implementations.

pub mod inspect;
pub mod verify;

use std::path::Path;
use tessera_storage::{
    choose_root_block, ExtentBackend, FileBackend, FileHeader, RootBlock, RootBlockSlot,
    StorageError, StorageResult, HEADER_SIZE, ROOT_BLOCK_SIZE,
};

/// The fixed-position structures of a journal file, decoded without
/// opening a store.
pub struct RawJournal {
    /// File length in bytes.
    pub file_size: u64,
    /// The header, or why it failed to decode.
    pub header: Result<FileHeader, String>,
    /// Slot 0, or why it failed to decode.
    pub slot0: Result<RootBlock, String>,
    /// Slot 1, or why it failed to decode.
    pub slot1: Result<RootBlock, String>,
}

impl RawJournal {
    /// Reads the header and both root-block slots of the file at `path`.
    pub fn read(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Err(format!("No journal found at {:?}", path).into());
        }
        let backend = FileBackend::open(path, false)?;
        let read = |offset: u64, len: u64| -> StorageResult<Vec<u8>> {
            backend.read_at(offset, len as usize)
        };
        let slot = |slot: RootBlockSlot| {
            read(slot.offset(), ROOT_BLOCK_SIZE)
                .and_then(|data| RootBlock::decode(&data, slot))
                .map_err(|e| e.to_string())
        };

        Ok(Self {
            file_size: backend.len(),
            header: read(0, HEADER_SIZE)
                .and_then(|data| FileHeader::decode(&data))
                .map_err(|e| e.to_string()),
            slot0: slot(RootBlockSlot::Zero),
            slot1: slot(RootBlockSlot::One),
        })
    }

    /// The root block recovery would use.
    pub fn current(&self) -> StorageResult<RootBlock> {
        choose_root_block(
            self.slot0.clone().map_err(StorageError::corrupted),
            self.slot1.clone().map_err(StorageError::corrupted),
        )
    }
}
