//! RaftNode - High-level Raft node with consensus logic

use std::sync::Arc;
use tokio::sync::Mutex;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use super::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, RaftCore,
    RaftState, RequestVoteArgs,
};
use crate::transport::{Transport, TransportError};

/// Shared reference to RaftCore
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// High-level Raft node that handles consensus operations
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
}

impl<T: Transport> RaftNode<T> {
    /// Create a new RaftNode
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
        }
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Start an election
    pub async fn start_election(&self) {
        let mut core = self.core.lock().await;
        core.start_election();
    }

    /// Request votes from all peers (sends requests concurrently).
    /// Returns true if became leader.
    pub async fn request_votes(&self) -> bool {
        let (args, peers) = {
            let core = self.core.lock().await;
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.id,
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (args, core.peers.clone())
        };

        // Send all vote requests concurrently, process as they arrive
        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                if core.handle_request_vote_result(peer_id, &result) {
                    return true; // Became leader, don't wait for remaining
                }
            }
        }

        false
    }

    /// Replicate the log up to entry_index to all peers concurrently.
    /// Returns the state machine result for entry_index if it was committed
    /// and applied during this call.
    pub async fn replicate_to_peers(&self, entry_index: u64) -> Option<Option<Vec<u8>>> {
        let requests_to_send = {
            let core = self.core.lock().await;

            let mut requests_to_send = Vec::new();
            for &peer_id in &core.peers {
                let next_idx = core.next_index.get(&peer_id).copied().unwrap_or(1);
                let prev_log_index = next_idx - 1;
                let prev_log_term = Self::prev_log_term(&core, prev_log_index);

                let entries: Vec<_> = core
                    .log
                    .iter()
                    .filter(|e| e.index >= next_idx && e.index <= entry_index)
                    .cloned()
                    .collect();

                let args = AppendEntriesArgs {
                    term: core.current_term,
                    leader_id: core.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: core.commit_index,
                };
                requests_to_send.push((peer_id, args));
            }
            requests_to_send
        };

        // Send to all peers concurrently, process as they arrive (lock released)
        let mut futures: FuturesUnordered<_> = requests_to_send
            .into_iter()
            .map(|(peer_id, args)| {
                let transport = &self.transport;
                async move { (peer_id, transport.append_entries(peer_id, args).await) }
            })
            .collect();

        // Process results as they arrive - return as soon as the entry commits
        let mut entry_result = None;
        while let Some((peer_id, result)) = futures.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                let (_committed, apply_results) =
                    core.handle_append_entries_result(peer_id, entry_index, &result);
                for (idx, res) in apply_results {
                    if idx == entry_index {
                        entry_result = Some(res);
                    }
                }
            }
            if entry_result.is_some() {
                break; // Entry committed, don't wait for remaining peers
            }
        }
        entry_result
    }

    /// Get current state
    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Get commit index
    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }

    /// Term of the entry preceding next_idx, accounting for the snapshot boundary
    fn prev_log_term(core: &RaftCore, prev_log_index: u64) -> u64 {
        if prev_log_index == core.snapshot_last_index {
            core.snapshot_last_term
        } else if prev_log_index == 0 {
            0
        } else if prev_log_index > core.snapshot_last_index {
            core.get_log_entry(prev_log_index).map(|e| e.term).unwrap_or(0)
        } else {
            // Before the snapshot - shouldn't happen, the peer gets InstallSnapshot instead
            0
        }
    }

    /// Send heartbeat to all peers.
    ///
    /// Heartbeats are AppendEntries RPCs that also carry any entries the
    /// follower is missing (catch-up). A follower that needs entries already
    /// compacted into the snapshot gets an InstallSnapshot instead.
    /// Returns (still_leader, success_count).
    pub async fn send_heartbeat(&self) -> (bool, usize) {
        enum Request {
            AppendEntries(AppendEntriesArgs, u64), // args, last_entry_index
            InstallSnapshot(InstallSnapshotArgs),
        }

        let requests_to_send = {
            let core = self.core.lock().await;

            // Only leaders send heartbeats
            if core.state != RaftState::Leader {
                return (false, 0);
            }

            let mut requests_to_send = Vec::new();
            for &peer_id in &core.peers {
                let next_idx = core.next_index.get(&peer_id).copied().unwrap_or(1);

                // Peer needs entries that were compacted away - send the snapshot
                if next_idx <= core.snapshot_last_index {
                    if let Ok(Some(snapshot)) = core.load_snapshot() {
                        let args = InstallSnapshotArgs {
                            term: core.current_term,
                            leader_id: core.id,
                            last_included_index: snapshot.metadata.last_included_index,
                            last_included_term: snapshot.metadata.last_included_term,
                            data: snapshot.data,
                        };
                        requests_to_send.push((peer_id, Request::InstallSnapshot(args)));
                    }
                    // If snapshot load fails, skip this peer for now
                    continue;
                }

                let prev_log_index = next_idx - 1;
                let prev_log_term = Self::prev_log_term(&core, prev_log_index);

                // Include entries from next_idx onwards for catch-up
                let entries: Vec<_> = core
                    .log
                    .iter()
                    .filter(|e| e.index >= next_idx)
                    .cloned()
                    .collect();

                let last_entry_index = entries.last().map(|e| e.index).unwrap_or(0);

                let args = AppendEntriesArgs {
                    term: core.current_term,
                    leader_id: core.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: core.commit_index,
                };
                requests_to_send.push((peer_id, Request::AppendEntries(args, last_entry_index)));
            }
            requests_to_send
        };

        enum ResultType {
            AppendEntries(Result<AppendEntriesResult, TransportError>, u64),
            InstallSnapshot(Result<InstallSnapshotResult, TransportError>, u64), // last_included_index
        }

        // Send to all peers concurrently (lock released)
        let mut futures: FuturesUnordered<_> = requests_to_send
            .into_iter()
            .map(|(peer_id, request)| {
                let transport = &self.transport;
                async move {
                    match request {
                        Request::AppendEntries(args, last_entry_index) => {
                            let result = transport.append_entries(peer_id, args).await;
                            (peer_id, ResultType::AppendEntries(result, last_entry_index))
                        }
                        Request::InstallSnapshot(args) => {
                            let last_included_index = args.last_included_index;
                            let result = transport.install_snapshot(peer_id, args).await;
                            (peer_id, ResultType::InstallSnapshot(result, last_included_index))
                        }
                    }
                }
            })
            .collect();

        // Wait for every peer so we catch higher terms and replicate fully
        let mut success_count = 0;
        while let Some((peer_id, result_type)) = futures.next().await {
            match result_type {
                ResultType::AppendEntries(result, last_entry_index) => {
                    if let Ok(append_result) = result {
                        let mut core = self.core.lock().await;
                        let _ =
                            core.handle_append_entries_result(peer_id, last_entry_index, &append_result);
                        success_count += 1;
                    }
                }
                ResultType::InstallSnapshot(result, last_included_index) => {
                    if let Ok(snapshot_result) = result {
                        match snapshot_result {
                            InstallSnapshotResult::Success { term: _ } => {
                                let mut core = self.core.lock().await;
                                core.next_index.insert(peer_id, last_included_index + 1);
                                core.match_index.insert(peer_id, last_included_index);
                                success_count += 1;
                            }
                            InstallSnapshotResult::Failed { term, reason: _ } => {
                                let mut core = self.core.lock().await;
                                let stale = AppendEntriesResult {
                                    term,
                                    success: false,
                                };
                                core.process_append_entries_response(&stale);
                            }
                        }
                    }
                }
            }
        }

        let still_leader = self.core.lock().await.state == RaftState::Leader;
        (still_leader, success_count)
    }

    /// Confirm leadership by sending empty heartbeats to peers.
    /// Returns (still_leader, success_count) as soon as a majority responds,
    /// without waiting for slow/dead peers.
    pub async fn confirm_leadership(&self) -> (bool, usize) {
        let requests = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return (false, 0);
            }
            let mut requests = Vec::new();
            for &peer_id in &core.peers {
                let next_idx = core.next_index.get(&peer_id).copied().unwrap_or(1);
                let prev_log_index = next_idx - 1;
                let prev_log_term = Self::prev_log_term(&core, prev_log_index);
                let args = AppendEntriesArgs {
                    term: core.current_term,
                    leader_id: core.id,
                    prev_log_index,
                    prev_log_term,
                    entries: vec![],
                    leader_commit: core.commit_index,
                };
                requests.push((peer_id, args));
            }
            requests
        };

        let num_peers = requests.len();
        let majority_needed = (num_peers + 1) / 2;

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args)| {
                let transport = &self.transport;
                async move { (peer_id, transport.append_entries(peer_id, args).await) }
            })
            .collect();

        let mut success_count = 0;
        while let Some((_peer_id, result)) = futures.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                if result.term > core.current_term {
                    core.process_append_entries_response(&result);
                    return (false, success_count);
                }
                if result.success {
                    success_count += 1;
                }
            }
            if success_count >= majority_needed {
                break;
            }
        }

        let still_leader = self.core.lock().await.state == RaftState::Leader;
        (still_leader, success_count)
    }
}
