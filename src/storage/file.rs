//! File-based storage for Raft persistent state
//!
//! Layout, one directory per node:
//! - `hard_state`: term + vote as one checksummed JSON record
//! - `log`:        log entries, one checksummed JSON line each
//! - `snapshot`:   most recent snapshot, checksummed JSON
//!
//! Every record carries a CRC32 so a torn write is detected at load time
//! rather than silently rejoining the cluster with a bad term or log.
//! Truncation and compaction rewrite the log through a temp file + rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{HardState, Storage, StorageError};
use crate::core::raft_core::LogEntry;
use crate::core::snapshot::Snapshot;

fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

/// File-based implementation of [`Storage`].
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open storage rooted at `dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err)?;
        Ok(FileStorage { dir })
    }

    fn hard_state_path(&self) -> PathBuf {
        self.dir.join("hard_state")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    /// Write one record as `{json} {crc32_hex}\n`, fsynced before returning.
    fn write_record(&self, path: &Path, json: &str) -> Result<(), StorageError> {
        let content = format!("{} {:08x}\n", json, checksum(json.as_bytes()));
        let mut file = File::create(path).map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    /// Verify checksum on one line and return the JSON payload.
    fn verify_line<'a>(line: &'a str, context: &str) -> Result<&'a str, StorageError> {
        let parts: Vec<&str> = line.trim_end().rsplitn(2, ' ').collect();
        if parts.len() != 2 {
            return Err(StorageError::Corruption(format!(
                "{}: missing checksum",
                context
            )));
        }
        let stored = u32::from_str_radix(parts[0], 16).map_err(|_| {
            StorageError::Corruption(format!("{}: invalid checksum format", context))
        })?;
        let json = parts[1];
        let computed = checksum(json.as_bytes());
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "{}: checksum mismatch (stored {:08x}, computed {:08x})",
                context, stored, computed
            )));
        }
        Ok(json)
    }

    fn read_record(&self, path: &Path) -> Result<Option<String>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(io_err)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let json = Self::verify_line(&content, &format!("{:?}", path))?;
        Ok(Some(json.to_string()))
    }

    /// Rewrite the log file atomically with the given entries.
    fn rewrite_log(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut content = String::new();
        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            content.push_str(&format!("{} {:08x}\n", json, checksum(json.as_bytes())));
        }

        let path = self.log_path();
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&temp_path, &path).map_err(io_err)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        match self.read_record(&self.hard_state_path())? {
            None => Ok(HardState::default()),
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| StorageError::Corruption(format!("invalid hard state: {}", e))),
        }
    }

    fn save_hard_state(&mut self, state: HardState) -> Result<(), StorageError> {
        let json = serde_json::to_string(&state)
            .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
        self.write_record(&self.hard_state_path(), &json)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path).map_err(io_err)?);
        let mut entries = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let context = format!("log line {}", line_num + 1);
            let json = Self::verify_line(&line, &context)?;
            let entry: LogEntry = serde_json::from_str(json)
                .map_err(|e| StorageError::Corruption(format!("{}: {}", context, e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map_err(io_err)?;

        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            writeln!(file, "{} {:08x}", json, checksum(json.as_bytes())).map_err(io_err)?;
        }
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError> {
        let entries = self.load_log()?;
        let keep: Vec<_> = entries.into_iter().filter(|e| e.index < from_index).collect();
        self.rewrite_log(&keep)
    }

    fn compact_log(&mut self, before_index: u64) -> Result<(), StorageError> {
        let entries = self.load_log()?;
        let keep: Vec<_> = entries
            .into_iter()
            .filter(|e| e.index >= before_index)
            .collect();
        self.rewrite_log(&keep)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.read_record(&self.snapshot_path())? {
            None => Ok(None),
            Some(json) => {
                let snapshot: Snapshot = serde_json::from_str(&json)
                    .map_err(|e| StorageError::Corruption(format!("invalid snapshot: {}", e)))?;
                Ok(Some(snapshot))
            }
        }
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
        self.write_record(&self.snapshot_path(), &json)
    }
}
