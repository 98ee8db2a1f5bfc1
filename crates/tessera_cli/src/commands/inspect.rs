//! Inspect command implementation.

use super::RawJournal;
use serde::Serialize;
use std::path::Path;
use tessera_storage::{FileHeader, RootBlock};

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Decoded header.
    pub header: HeaderInfo,
    /// Both root-block slots.
    pub root_blocks: Vec<SlotInfo>,
    /// Slot recovery would use, if any is valid.
    pub current_slot: Option<u8>,
}

/// Header fields.
#[derive(Debug, Serialize)]
pub struct HeaderInfo {
    /// Whether the header decoded.
    pub valid: bool,
    /// Format version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// WORM or RW.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_type: Option<String>,
    /// Address offset width.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_bits: Option<u8>,
    /// Decode failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One root-block slot.
#[derive(Debug, Serialize)]
pub struct SlotInfo {
    /// Slot number.
    pub slot: u8,
    /// Whether the block decoded and its checksum matched.
    pub valid: bool,
    /// Decoded fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockInfo>,
    /// Decode failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Root-block fields.
#[derive(Debug, Serialize)]
pub struct BlockInfo {
    /// Store identity.
    pub uuid: String,
    /// Commits so far.
    pub commit_counter: u64,
    /// First unwritten user-extent offset.
    pub next_offset: u64,
    /// Latest commit record address.
    pub commit_record_addr: u64,
    /// Allocation metadata address.
    pub meta_bits_addr: u64,
    /// Time of the first commit.
    pub first_commit_time: u64,
    /// Time of the last commit.
    pub last_commit_time: u64,
    /// Creation time.
    pub create_time: u64,
}

impl From<&RootBlock> for BlockInfo {
    fn from(rb: &RootBlock) -> Self {
        Self {
            uuid: rb.uuid.to_string(),
            commit_counter: rb.commit_counter,
            next_offset: rb.next_offset,
            commit_record_addr: rb.commit_record_addr.as_u64(),
            meta_bits_addr: rb.meta_bits_addr.as_u64(),
            first_commit_time: rb.first_commit_time,
            last_commit_time: rb.last_commit_time,
            create_time: rb.create_time,
        }
    }
}

fn header_info(header: &Result<FileHeader, String>) -> HeaderInfo {
    match header {
        Ok(h) => HeaderInfo {
            valid: true,
            version: Some(h.version),
            store_type: Some(h.store_type.to_string()),
            offset_bits: Some(h.offset_bits),
            error: None,
        },
        Err(e) => HeaderInfo {
            valid: false,
            version: None,
            store_type: None,
            offset_bits: None,
            error: Some(e.clone()),
        },
    }
}

fn slot_info(slot: u8, block: &Result<RootBlock, String>) -> SlotInfo {
    match block {
        Ok(rb) => SlotInfo {
            slot,
            valid: true,
            block: Some(BlockInfo::from(rb)),
            error: None,
        },
        Err(e) => SlotInfo {
            slot,
            valid: false,
            block: None,
            error: Some(e.clone()),
        },
    }
}

/// Builds the inspection result for the journal at `path`.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let raw = RawJournal::read(path)?;
    Ok(InspectResult {
        path: path.display().to_string(),
        file_size: raw.file_size,
        header: header_info(&raw.header),
        root_blocks: vec![slot_info(0, &raw.slot0), slot_info(1, &raw.slot1)],
        current_slot: raw.current().ok().map(|rb| rb.slot.index()),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Tessera Journal Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    println!("File size: {}", format_bytes(result.file_size));
    println!();

    println!("Header:");
    match &result.header.error {
        None => {
            println!("  Version:     {}", result.header.version.unwrap_or_default());
            println!(
                "  Store type:  {}",
                result.header.store_type.as_deref().unwrap_or("?")
            );
            println!(
                "  Offset bits: {}",
                result.header.offset_bits.unwrap_or_default()
            );
        }
        Some(e) => println!("  INVALID: {e}"),
    }
    println!();

    for slot in &result.root_blocks {
        let marker = if result.current_slot == Some(slot.slot) {
            " (current)"
        } else {
            ""
        };
        println!("Root block {}{}:", slot.slot, marker);
        match (&slot.block, &slot.error) {
            (Some(block), _) => {
                println!("  UUID:               {}", block.uuid);
                println!("  Commit counter:     {}", block.commit_counter);
                println!("  Last commit time:   {}", block.last_commit_time);
                println!("  First commit time:  {}", block.first_commit_time);
                println!("  Next offset:        {}", block.next_offset);
                println!("  Commit record addr: {:#x}", block.commit_record_addr);
                println!("  Meta bits addr:     {:#x}", block.meta_bits_addr);
            }
            (None, Some(e)) => println!("  INVALID: {e}"),
            (None, None) => println!("  INVALID"),
        }
        println!();
    }

    if result.current_slot.is_none() {
        println!("No valid root block: the journal cannot be recovered");
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
