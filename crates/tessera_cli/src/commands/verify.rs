//! Verify command implementation.

use super::RawJournal;
use serde::Serialize;
use std::path::Path;
use tessera_core::CommitRecord;
use tessera_storage::{open_strategy, BufferMode, BufferStrategy, RootBlock, StoreOptions, StoreType};
use tracing::debug;

/// Verification result.
#[derive(Debug, Default, Serialize)]
pub struct VerifyResult {
    /// Whether the header decoded.
    pub header_valid: bool,
    /// Number of root-block slots that decoded.
    pub valid_root_blocks: usize,
    /// Slot recovery would use.
    pub current_slot: Option<u8>,
    /// Commit records walked.
    pub commits_checked: usize,
    /// Index checkpoints read back.
    pub checkpoints_checked: usize,
    /// Problems recovery works around.
    pub warnings: Vec<String>,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// True when nothing is wrong.
    pub fn is_ok(&self) -> bool {
        self.header_valid && self.current_slot.is_some() && self.errors.is_empty()
    }
}

/// Checks the journal at `path`.
pub fn verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let raw = RawJournal::read(path)?;
    let mut result = VerifyResult {
        header_valid: raw.header.is_ok(),
        valid_root_blocks: usize::from(raw.slot0.is_ok()) + usize::from(raw.slot1.is_ok()),
        ..VerifyResult::default()
    };

    let header = match &raw.header {
        Ok(header) => *header,
        Err(e) => {
            result.errors.push(format!("header: {e}"));
            return Ok(result);
        }
    };
    for (slot, block) in [(0, &raw.slot0), (1, &raw.slot1)] {
        if let Err(e) = block {
            result.warnings.push(format!("root block {slot}: {e}"));
        }
    }
    let current = match raw.current() {
        Ok(rb) => rb,
        Err(e) => {
            result.errors.push(e.to_string());
            return Ok(result);
        }
    };
    result.current_slot = Some(current.slot.index());
    if current.store_type != header.store_type || current.offset_bits != header.offset_bits {
        result
            .errors
            .push("root block disagrees with header on store layout".to_string());
        return Ok(result);
    }

    let mode = match header.store_type {
        StoreType::Worm => BufferMode::DiskWorm,
        StoreType::Rw => BufferMode::DiskRw,
    };
    debug!(%mode, commit_counter = current.commit_counter, "walking commit chain");
    let store = open_strategy(&StoreOptions::file(path, mode).create(false))?;
    walk_commit_chain(store.as_ref(), &current, &mut result);
    Ok(result)
}

fn walk_commit_chain(store: &dyn BufferStrategy, root: &RootBlock, result: &mut VerifyResult) {
    let mut addr = root.commit_record_addr;
    let mut expected_counter = root.commit_counter;
    let mut newer_time: Option<u64> = None;

    while !addr.is_null() {
        let record = match store
            .read(addr)
            .map_err(|e| e.to_string())
            .and_then(|bytes| CommitRecord::decode(&bytes).map_err(|e| e.to_string()))
        {
            Ok(record) => record,
            Err(e) => {
                result
                    .errors
                    .push(format!("commit record {expected_counter} at {addr}: {e}"));
                return;
            }
        };
        result.commits_checked += 1;

        if record.commit_counter != expected_counter {
            result.errors.push(format!(
                "commit record at {addr} has counter {}, expected {expected_counter}",
                record.commit_counter
            ));
        }
        let time = record.commit_time.as_u64();
        if newer_time.is_none() && time != root.last_commit_time {
            result.errors.push(format!(
                "latest commit record time {time} differs from root block {}",
                root.last_commit_time
            ));
        }
        if let Some(newer) = newer_time.filter(|newer| time >= *newer) {
            result
                .errors
                .push(format!("commit time {time} does not precede {newer}"));
        }
        newer_time = Some(time);

        for (name, checkpoint) in &record.indices {
            if checkpoint.is_null() {
                continue;
            }
            match store.read(*checkpoint) {
                Ok(_) => result.checkpoints_checked += 1,
                Err(e) => result.errors.push(format!(
                    "checkpoint of {name} in commit {}: {e}",
                    record.commit_counter
                )),
            }
        }

        expected_counter = expected_counter.saturating_sub(1);
        addr = record.prev_addr;
    }

    if expected_counter != 0 {
        result.errors.push(format!(
            "commit chain ends early: {expected_counter} commits unaccounted for"
        ));
    }
}

/// Runs the verify command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = verify(path)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(path, &result),
    }

    if result.is_ok() {
        Ok(())
    } else {
        Err("Verification failed".into())
    }
}

fn print_text_output(path: &Path, result: &VerifyResult) {
    println!("Verifying journal at {:?}", path);
    println!();
    println!("Header:          {}", if result.header_valid { "ok" } else { "INVALID" });
    println!("Root blocks:     {}/2 valid", result.valid_root_blocks);
    match result.current_slot {
        Some(slot) => println!("Current slot:    {slot}"),
        None => println!("Current slot:    none"),
    }
    println!("Commits checked: {}", result.commits_checked);
    println!("Checkpoints:     {}", result.checkpoints_checked);

    if !result.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &result.warnings {
            println!("  - {warning}");
        }
    }

    if !result.errors.is_empty() {
        println!();
        println!("Errors:");
        for error in &result.errors {
            println!("  - {error}");
        }
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
    } else {
        println!("✗ Journal verification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;
    use tessera_core::Engine;
    use tessera_storage::{HEADER_SIZE, ROOT_BLOCK0_OFFSET, ROOT_BLOCK1_OFFSET};
    use tessera_testkit::{file_config, scenarios};

    fn journal(dir: &TempDir, mode: BufferMode, commits: usize) -> std::path::PathBuf {
        let path = dir.path().join("journal.tsr");
        let engine = Engine::open(file_config(&path, mode)).unwrap();
        scenarios::populate(&engine, "a", commits);
        engine.close().unwrap();
        path
    }

    fn scribble(path: &Path, offset: u64, bytes: &[u8]) {
        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn healthy_journal_passes() {
        let dir = TempDir::new().unwrap();
        let path = journal(&dir, BufferMode::DiskWorm, 3);
        let result = verify(&path).unwrap();
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.commits_checked, 4);
        assert!(result.checkpoints_checked >= 4);
    }

    #[test]
    fn rw_journal_passes() {
        let dir = TempDir::new().unwrap();
        let path = journal(&dir, BufferMode::DiskRw, 2);
        assert!(verify(&path).unwrap().is_ok());
    }

    #[test]
    fn one_torn_slot_still_passes() {
        let dir = TempDir::new().unwrap();
        let path = journal(&dir, BufferMode::DiskWorm, 2);
        let current = verify(&path).unwrap().current_slot.unwrap();
        let other = if current == 0 { ROOT_BLOCK1_OFFSET } else { ROOT_BLOCK0_OFFSET };
        scribble(&path, other + 20, &[0xFF; 8]);

        let result = verify(&path).unwrap();
        assert_eq!(result.valid_root_blocks, 1);
        assert_eq!(result.current_slot, Some(current));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.is_ok());
    }

    #[test]
    fn corrupt_header_fails() {
        let dir = TempDir::new().unwrap();
        let path = journal(&dir, BufferMode::DiskWorm, 1);
        scribble(&path, 0, &[0u8; HEADER_SIZE as usize]);
        let result = verify(&path).unwrap();
        assert!(!result.header_valid);
        assert!(!result.is_ok());
    }
}
