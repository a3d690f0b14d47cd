//! Durable, ordered, byte-keyed storage engine
//!
//! `KvEngine` is the keyspace the replicated state machine applies committed
//! commands to. It knows nothing about consensus: it offers point reads,
//! single-key writes, and atomic write batches over opaque byte keys and
//! values.
//!
//! Durability model: every write batch is appended to a checksummed WAL and
//! fsynced before it becomes visible in memory. Once the WAL grows past the
//! configured budget the full keyspace is rewritten as a checkpoint (atomic
//! temp+rename) and the WAL is truncated. Opening the engine loads the
//! checkpoint and replays the WAL on top of it.
//!
//! Concurrency model: single writer, multiple readers. Reads take a shared
//! lock and may run concurrently; a write (single or batch) holds the
//! exclusive lock for its whole duration, so readers never observe a
//! partially applied batch.

mod wal;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use wal::WalWriter;

/// Errors from storage engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("no engine data at {0} (create_if_missing is false)")]
    NotFound(PathBuf),

    #[error("engine is closed")]
    Closed,
}

/// One operation inside an atomic write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A key-value pair as exported from the engine. Exports are ordered by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Options for opening a [`KvEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// WAL byte budget: once exceeded, the keyspace is checkpointed and the
    /// WAL truncated. Bounds both recovery time and the extra disk held by
    /// the log.
    pub cache_size_bytes: u64,
    /// Create the data directory if it does not exist. When false, opening a
    /// missing directory fails with [`EngineError::NotFound`].
    pub create_if_missing: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            cache_size_bytes: 4 * 1024 * 1024,
            create_if_missing: true,
        }
    }
}

struct EngineInner {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    wal: WalWriter,
    closed: bool,
}

impl EngineInner {
    fn apply_ops(&mut self, ops: &[BatchOp]) {
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    self.map.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    self.map.remove(key);
                }
            }
        }
    }
}

/// The storage engine.
pub struct KvEngine {
    checkpoint_path: PathBuf,
    options: EngineOptions,
    inner: RwLock<EngineInner>,
}

impl KvEngine {
    const WAL_FILENAME: &'static str = "wal";
    const CHECKPOINT_FILENAME: &'static str = "checkpoint";

    /// Open (or create) an engine rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, options: EngineOptions) -> Result<Self, EngineError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            if !options.create_if_missing {
                return Err(EngineError::NotFound(dir.to_path_buf()));
            }
            fs::create_dir_all(dir)?;
        }

        let checkpoint_path = dir.join(Self::CHECKPOINT_FILENAME);
        let wal_path = dir.join(Self::WAL_FILENAME);

        let mut map: BTreeMap<Vec<u8>, Vec<u8>> = match wal::load_checkpoint(&checkpoint_path)? {
            Some(records) => {
                let records: Vec<KvRecord> = records;
                records.into_iter().map(|r| (r.key, r.value)).collect()
            }
            None => BTreeMap::new(),
        };

        let batches = wal::replay(&wal_path)?;
        let replayed = batches.len();
        for ops in &batches {
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => {
                        map.insert(key.clone(), value.clone());
                    }
                    BatchOp::Delete { key } => {
                        map.remove(key);
                    }
                }
            }
        }
        if replayed > 0 {
            info!(replayed, keys = map.len(), "engine recovered from WAL");
        }

        let wal = WalWriter::open(&wal_path)?;

        Ok(KvEngine {
            checkpoint_path,
            options,
            inner: RwLock::new(EngineInner {
                map,
                wal,
                closed: false,
            }),
        })
    }

    /// Set `key` to `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.batch_write(&[BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    /// Read the latest value for `key`, or `None` if absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        Ok(inner.map.get(key).cloned())
    }

    /// Remove `key`. Removing an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        self.batch_write(&[BatchOp::Delete { key: key.to_vec() }])
    }

    /// Apply an ordered list of operations atomically: the batch is durable
    /// in the WAL before any of it becomes visible, and readers see either
    /// all of it or none of it.
    pub fn batch_write(&self, ops: &[BatchOp]) -> Result<(), EngineError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(EngineError::Closed);
        }

        inner.wal.append(ops)?;
        inner.apply_ops(ops);

        if inner.wal.bytes() >= self.options.cache_size_bytes {
            self.write_checkpoint(&mut inner)?;
        }
        Ok(())
    }

    /// Export the full keyspace, ordered by key. Snapshot source.
    pub fn export(&self) -> Result<Vec<KvRecord>, EngineError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        Ok(inner
            .map
            .iter()
            .map(|(k, v)| KvRecord {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    /// Replace the entire keyspace with `image`, atomically and durably.
    /// Used when installing a snapshot: the new image is checkpointed to disk
    /// before the in-memory keyspace switches over.
    pub fn restore(&self, image: &[KvRecord]) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(EngineError::Closed);
        }

        wal::save_checkpoint(&self.checkpoint_path, &image.to_vec())?;
        inner.wal.reset()?;
        inner.map = image
            .iter()
            .map(|r| (r.key.clone(), r.value.clone()))
            .collect();
        info!(keys = inner.map.len(), "engine keyspace restored from image");
        Ok(())
    }

    /// Flush a final checkpoint and release the engine. All later operations
    /// fail with [`EngineError::Closed`].
    pub fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        self.write_checkpoint(&mut inner)?;
        inner.closed = true;
        Ok(())
    }

    fn write_checkpoint(&self, inner: &mut EngineInner) -> Result<(), EngineError> {
        let image: Vec<KvRecord> = inner
            .map
            .iter()
            .map(|(k, v)| KvRecord {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        wal::save_checkpoint(&self.checkpoint_path, &image)?;
        inner.wal.reset()?;
        debug!(keys = image.len(), "engine checkpoint written");
        Ok(())
    }
}
