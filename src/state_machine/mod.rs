//! State machine layer
//!
//! - `KvStateMachine`: applies commands to the storage engine
//! - `TestStateMachine`: records commands for testing

pub mod kv;
pub mod traits;

pub use kv::{KvStateMachine, SharedKvStateMachine};
pub use traits::{AppliedCommands, ApplyError, ApplyResult, Snapshotable, StateMachine, TestStateMachine};
