//! Typed commands carried by the replicated log
//!
//! Every log entry holds exactly one `Command`. The variants are the whole
//! write surface of the store: appliers match on the variant instead of
//! parsing strings, so a committed entry can never fail to decode.

use serde::{Deserialize, Serialize};

pub use crate::engine::BatchOp;

/// A state machine command, replicated through the log before being applied.
///
/// Keys and values are opaque byte strings; the store imposes no encoding
/// on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Barrier entry appended by a new leader to commit entries from
    /// earlier terms. Leaves the keyspace untouched.
    Noop,
    /// Set `key` to `value`, overwriting any previous value.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key`. Deleting an absent key is not an error.
    Delete { key: Vec<u8> },
    /// Apply several writes as one atomic keyspace transition.
    Batch { ops: Vec<BatchOp> },
}

impl Command {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Command::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Command::Delete { key: key.into() }
    }
}
