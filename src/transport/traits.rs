//! Transport abstraction for consensus RPC communication

use async_trait::async_trait;
use thiserror::Error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};

/// Point-to-point RPC delivery between cluster members.
///
/// Members are addressed by stable identifier, independent of network
/// address. Each call delivers at most once and reports failure to the
/// caller; retrying is the caller's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    /// Send an InstallSnapshot RPC to a peer node
    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection to target node failed")]
    ConnectionFailed,
    #[error("request timed out")]
    Timeout,
    #[error("target node not found")]
    NodeNotFound,
}
