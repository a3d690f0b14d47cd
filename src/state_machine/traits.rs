//! State machine abstraction for the consensus core
//!
//! The state machine is the application logic that the replicated log
//! coordinates. When entries are committed, they are applied to it in
//! log-index order on every node.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::command::Command;

/// Errors from applying a command or serializing state.
///
/// Commands are a closed typed set, so a malformed command cannot reach
/// `apply`. Remaining failures are storage I/O or snapshot encoding, and
/// both break the identical-replay guarantee if skipped. The consensus
/// core treats them as fatal to the node.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("storage engine failure: {0}")]
    Engine(#[from] crate::engine::EngineError),
    #[error("snapshot encoding failure: {0}")]
    Snapshot(String),
}

/// Result of applying one command: the value produced by the command, if any.
pub type ApplyResult = Result<Option<Vec<u8>>, ApplyError>;

/// State machine trait - the application logic coordinated by the log.
///
/// Implementations must be deterministic: applying the same commands in the
/// same order must produce the same state on all nodes.
pub trait StateMachine: Send {
    /// Apply a committed command.
    fn apply(&mut self, command: &Command) -> ApplyResult;
}

/// Snapshotable state machine - supports log compaction.
pub trait Snapshotable: StateMachine {
    /// Serialize the full state to bytes.
    fn snapshot(&self) -> Result<Vec<u8>, ApplyError>;

    /// Replace the current state with the deserialized snapshot data.
    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError>;
}

/// Shared record of applied commands for testing.
pub type AppliedCommands = Arc<Mutex<Vec<Command>>>;

/// Test state machine that records all applied commands to a shared vec.
pub struct TestStateMachine {
    applied: AppliedCommands,
}

impl TestStateMachine {
    pub fn new() -> Self {
        TestStateMachine {
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create with a shared vec to inspect applied commands from outside.
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestStateMachine { applied }
    }
}

impl Default for TestStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, command: &Command) -> ApplyResult {
        let result = match command {
            Command::Put { value, .. } => Some(value.clone()),
            _ => None,
        };
        self.applied.lock().push(command.clone());
        Ok(result)
    }
}

impl Snapshotable for TestStateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, ApplyError> {
        let applied = self.applied.lock().clone();
        serde_json::to_vec(&applied)
            .map_err(|e| ApplyError::Snapshot(format!("test state machine snapshot failed: {}", e)))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError> {
        let applied: Vec<Command> = serde_json::from_slice(data)
            .map_err(|e| ApplyError::Snapshot(format!("test state machine restore failed: {}", e)))?;
        *self.applied.lock() = applied;
        Ok(())
    }
}
