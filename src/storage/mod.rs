//! Persistent node state for the consensus core
//!
//! Raft must persist three things before responding to RPCs: the current
//! term, the vote cast in that term, and the log. Term and vote change
//! together on most paths, so they are persisted as one `HardState` record.
//!
//! Implementations:
//! - `MemoryStorage`: in-memory, for tests
//! - `FileStorage`: checksummed files, durable across restarts

pub mod file;
pub mod memory;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::raft_core::LogEntry;
use crate::core::snapshot::Snapshot;

/// Errors from persistent-state operations.
///
/// Any of these at node startup is fatal: a node whose term/vote/log cannot
/// be trusted must not rejoin the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Term and vote, persisted as a single record (one fsync covers both).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term this node has seen.
    pub term: u64,
    /// Candidate voted for in `term`, if any.
    pub voted_for: Option<u64>,
}

/// Storage for Raft persistent state.
///
/// Implementations must make every save durable before returning; the core
/// replies to RPCs only after the corresponding state is on stable storage.
/// Operations are synchronous; the core holds its own lock while persisting.
pub trait Storage: Send {
    /// Load term and vote. Returns the default (term 0, no vote) on first boot.
    fn load_hard_state(&self) -> Result<HardState, StorageError>;

    /// Persist term and vote.
    fn save_hard_state(&mut self, state: HardState) -> Result<(), StorageError>;

    /// Load all log entries not covered by a snapshot.
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries after any existing entries.
    fn append_log_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove all entries with index >= `from_index`. Conflict resolution.
    fn truncate_log(&mut self, from_index: u64) -> Result<(), StorageError>;

    /// Remove all entries with index < `before_index`. Snapshot compaction.
    fn compact_log(&mut self, before_index: u64) -> Result<(), StorageError>;

    /// Load the most recent snapshot, if any.
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Persist a snapshot, replacing any previous one.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}
