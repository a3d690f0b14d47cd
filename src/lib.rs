//! Replicated key-value store
//!
//! A leader-based consensus core replicates a log of typed commands across
//! cluster members and applies committed entries, in order, to a durable
//! ordered key-value engine. Every member converges to the same keyspace.

pub mod client;
pub mod command;
pub mod core;
pub mod engine;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;

pub use client::ClientProxy;
pub use command::{BatchOp, Command};
pub use core::{RaftConfig, RaftError, RaftHandle, RaftServer, RaftState, RoleInfo};
pub use engine::{EngineOptions, KvEngine};
pub use state_machine::{KvStateMachine, SharedKvStateMachine};
