//! Client-facing proxy over a single cluster member
//!
//! Writes go through the replicated log; reads are served locally from the
//! member's own state machine and may lag entries still in flight.

use tracing::debug;

use crate::command::Command;
use crate::core::raft_server::{RaftError, RaftHandle};
use crate::core::RaftState;
use crate::state_machine::{ApplyError, SharedKvStateMachine};

/// Proxy binding a consensus handle to the local key-value state machine.
///
/// One proxy per cluster member. Commands submitted on a non-leader fail
/// immediately with [`RaftError::NotLeader`] and a hint naming the member
/// believed to be the leader, so callers can redirect instead of blocking.
#[derive(Clone)]
pub struct ClientProxy {
    handle: RaftHandle,
    state_machine: SharedKvStateMachine,
}

impl ClientProxy {
    pub fn new(handle: RaftHandle, state_machine: SharedKvStateMachine) -> Self {
        ClientProxy {
            handle,
            state_machine,
        }
    }

    /// Submit a command and wait until it is committed and applied locally.
    /// Returns the value the command produced (the written value for a put,
    /// `None` for deletes and batches).
    ///
    /// Fails fast with [`RaftError::NotLeader`] when this member is not the
    /// leader, without a replication round trip.
    pub async fn commit_state(&self, command: Command) -> Result<Option<Vec<u8>>, RaftError> {
        let role = self.handle.current_role();
        if role.state != RaftState::Leader {
            debug!(leader_hint = ?role.leader_id, "rejecting command on non-leader");
            return Err(RaftError::NotLeader {
                leader_hint: role.leader_id,
            });
        }
        self.handle.submit(command).await
    }

    /// Value produced by the most recently applied command on this member.
    pub fn get_current_state(&self) -> Option<Vec<u8>> {
        self.state_machine.lock().current()
    }

    /// Local point read. Serves from this member's applied state without
    /// consulting the leader, so it can return stale data. Callers that need
    /// a leader-verified read can run `raft().confirm_leadership()` first.
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ApplyError> {
        self.state_machine.lock().get(key)
    }

    /// Handle to the underlying consensus server
    pub fn raft(&self) -> &RaftHandle {
        &self.handle
    }
}
