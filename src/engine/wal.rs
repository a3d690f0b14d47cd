//! Write-ahead log and checkpoint files for the storage engine
//!
//! Both files use the same line format: `{json} {crc32_hex}`. A record whose
//! checksum does not match fails the load: a half-written tail is data loss
//! we must detect, not silently skip.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{BatchOp, EngineError};

fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Encode one record as a checksummed line.
fn encode_line<T: Serialize>(record: &T) -> Result<String, EngineError> {
    let json = serde_json::to_string(record)
        .map_err(|e| EngineError::Corruption(format!("record serialization failed: {}", e)))?;
    Ok(format!("{} {:08x}\n", json, checksum(json.as_bytes())))
}

/// Decode one checksummed line back into a record.
fn decode_line<T: DeserializeOwned>(line: &str, context: &str) -> Result<T, EngineError> {
    let parts: Vec<&str> = line.trim_end().rsplitn(2, ' ').collect();
    if parts.len() != 2 {
        return Err(EngineError::Corruption(format!(
            "{}: missing checksum",
            context
        )));
    }

    let stored = u32::from_str_radix(parts[0], 16)
        .map_err(|_| EngineError::Corruption(format!("{}: invalid checksum format", context)))?;
    let json = parts[1];

    let computed = checksum(json.as_bytes());
    if stored != computed {
        return Err(EngineError::Corruption(format!(
            "{}: checksum mismatch (stored {:08x}, computed {:08x})",
            context, stored, computed
        )));
    }

    serde_json::from_str(json)
        .map_err(|e| EngineError::Corruption(format!("{}: invalid record: {}", context, e)))
}

/// Append-only WAL. One record per committed write batch.
pub(crate) struct WalWriter {
    path: PathBuf,
    file: File,
    bytes: u64,
}

impl WalWriter {
    /// Open the WAL in append mode, creating it if absent.
    pub(crate) fn open(path: &Path) -> Result<Self, EngineError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let bytes = file.metadata()?.len();
        Ok(WalWriter {
            path: path.to_path_buf(),
            file,
            bytes,
        })
    }

    /// Append one batch record. Durable before returning.
    pub(crate) fn append(&mut self, ops: &[BatchOp]) -> Result<(), EngineError> {
        let line = encode_line(&ops.to_vec())?;
        self.file.write_all(line.as_bytes())?;
        self.file.sync_all()?;
        self.bytes += line.len() as u64;
        Ok(())
    }

    /// Bytes accumulated since the last reset (drives checkpointing).
    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Discard all records. Called after a checkpoint made them redundant.
    pub(crate) fn reset(&mut self) -> Result<(), EngineError> {
        self.file = File::create(&self.path)?;
        self.file.sync_all()?;
        self.bytes = 0;
        Ok(())
    }
}

/// Read back every batch recorded in the WAL, in write order.
pub(crate) fn replay(path: &Path) -> Result<Vec<Vec<BatchOp>>, EngineError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut batches = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let context = format!("wal line {}", line_num + 1);
        batches.push(decode_line(&line, &context)?);
    }
    Ok(batches)
}

/// Atomically write a checkpoint: temp file, fsync, rename.
pub(crate) fn save_checkpoint<T: Serialize>(path: &Path, image: &T) -> Result<(), EngineError> {
    let line = encode_line(image)?;
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)?;
    file.write_all(line.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Load the checkpoint, if one has been written.
pub(crate) fn load_checkpoint<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, EngineError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(decode_line(&content, "checkpoint")?))
}
