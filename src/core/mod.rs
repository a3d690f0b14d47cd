//! Consensus core: replicated log, leader election and the server loop
//! driving them.

pub mod config;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
pub mod snapshot;

pub use config::RaftConfig;
pub use raft_core::{RaftCore, RaftState};
pub use raft_node::{RaftNode, SharedCore};
pub use raft_server::{RaftError, RaftHandle, RaftServer, RoleInfo};
pub use snapshot::{Snapshot, SnapshotMetadata};
