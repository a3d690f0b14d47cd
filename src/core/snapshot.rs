//! Snapshot types for log compaction

use serde::{Deserialize, Serialize};

/// Metadata identifying the log prefix a snapshot replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Index of the last log entry captured in the snapshot.
    pub last_included_index: u64,
    /// Term of that entry.
    pub last_included_term: u64,
}

/// A point-in-time capture of the state machine.
///
/// Once a snapshot is durably stored, all log entries with index
/// <= `last_included_index` may be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    /// Serialized keyspace image, produced and consumed by the state machine.
    pub data: Vec<u8>,
}
