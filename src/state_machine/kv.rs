//! Key-value state machine over the storage engine
//!
//! Translates committed commands into engine operations. Every command maps
//! to exactly one atomic write batch, so a committed log entry is one atomic
//! storage transition.
//!
//! Reads do not go through the log: use [`KvStateMachine::get`] for a local
//! point read and [`KvStateMachine::current`] for the last applied value.
//! Both may lag in-flight uncommitted writes.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{ApplyError, ApplyResult, Snapshotable, StateMachine};
use crate::command::Command;
use crate::engine::{BatchOp, KvEngine, KvRecord};

/// State machine that applies commands to a [`KvEngine`].
pub struct KvStateMachine {
    engine: Arc<KvEngine>,
    /// Value produced by the most recently applied non-noop command.
    current: Option<Vec<u8>>,
}

impl KvStateMachine {
    pub fn new(engine: Arc<KvEngine>) -> Self {
        KvStateMachine {
            engine,
            current: None,
        }
    }

    /// Local point read against the engine. May be stale relative to
    /// commands still in flight through the log.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ApplyError> {
        Ok(self.engine.get(key)?)
    }

    /// The value produced by the last applied command, if any.
    pub fn current(&self) -> Option<Vec<u8>> {
        self.current.clone()
    }

    pub fn engine(&self) -> &Arc<KvEngine> {
        &self.engine
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, command: &Command) -> ApplyResult {
        match command {
            Command::Noop => Ok(None),
            Command::Put { key, value } => {
                self.engine.batch_write(&[BatchOp::Put {
                    key: key.clone(),
                    value: value.clone(),
                }])?;
                self.current = Some(value.clone());
                Ok(Some(value.clone()))
            }
            Command::Delete { key } => {
                self.engine
                    .batch_write(&[BatchOp::Delete { key: key.clone() }])?;
                self.current = None;
                Ok(None)
            }
            Command::Batch { ops } => {
                self.engine.batch_write(ops)?;
                self.current = None;
                Ok(None)
            }
        }
    }
}

impl Snapshotable for KvStateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, ApplyError> {
        let records = self.engine.export()?;
        serde_json::to_vec(&records)
            .map_err(|e| ApplyError::Snapshot(format!("keyspace serialization failed: {}", e)))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError> {
        let records: Vec<KvRecord> = serde_json::from_slice(data)
            .map_err(|e| ApplyError::Snapshot(format!("keyspace deserialization failed: {}", e)))?;
        self.engine.restore(&records)?;
        // The last applied value is not part of the keyspace image
        self.current = None;
        Ok(())
    }
}

/// Shared state machine, usable both by the consensus core and for direct
/// local reads.
pub type SharedKvStateMachine = Arc<Mutex<KvStateMachine>>;

impl StateMachine for SharedKvStateMachine {
    fn apply(&mut self, command: &Command) -> ApplyResult {
        self.lock().apply(command)
    }
}

impl Snapshotable for SharedKvStateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, ApplyError> {
        self.lock().snapshot()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError> {
        self.lock().restore(data)
    }
}
