//! Raft Consensus Algorithm Implementation
//!
//! This module implements the Raft consensus protocol as described in:
//! "In Search of an Understandable Consensus Algorithm" by Diego Ongaro and John Ousterhout

use std::collections::HashMap;
use tokio::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::core::snapshot::{Snapshot, SnapshotMetadata};
use crate::state_machine::Snapshotable;
use crate::storage::{HardState, Storage, StorageError};

/// Raft node states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    /// Follower: Passive state, receives updates from leader
    Follower,
    /// Candidate: Actively seeking votes to become leader
    Candidate,
    /// Leader: Handles all client requests and replicates log
    Leader,
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when entry was received by leader
    pub term: u64,
    /// Index in the log (1-indexed)
    pub index: u64,
    /// Command for the state machine
    pub command: Command,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting vote
    pub candidate_id: u64,
    /// Index of candidate's last log entry
    pub last_log_index: u64,
    /// Term of candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Current term, for candidate to update itself
    pub term: u64,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: u64,
    /// Term of prev_log_index entry
    pub prev_log_term: u64,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit_index
    pub leader_commit: u64,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Current term, for leader to update itself
    pub term: u64,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
}

/// Result of handling an AppendEntries RPC
#[derive(Debug, Clone)]
pub struct HandleAppendEntriesOutput {
    /// The response to send back to the leader
    pub result: AppendEntriesResult,
    /// Leader ID if we recognized a valid leader
    pub leader_id: Option<u64>,
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Last log index included in snapshot
    pub last_included_index: u64,
    /// Term of last included entry
    pub last_included_term: u64,
    /// Snapshot data
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstallSnapshotResult {
    /// Snapshot was successfully installed
    Success { term: u64 },
    /// Snapshot installation failed
    Failed { term: u64, reason: String },
}

/// Errors from taking a local snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no entries applied yet, nothing to snapshot")]
    NothingApplied,
    #[error("snapshot already covers index {snapshot_index}, last applied is {last_applied}")]
    AlreadyCovered {
        snapshot_index: u64,
        last_applied: u64,
    },
    #[error("state machine serialization failed: {0}")]
    StateMachine(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-entry outcome of applying committed entries: (index, produced value).
pub type AppliedEntry = (u64, Option<Vec<u8>>);

/// Core Raft state machine (sync, transport-agnostic)
pub struct RaftCore {
    // Storage backend for persistent state
    storage: Box<dyn Storage>,
    // State machine to apply committed entries to (must support snapshots)
    state_machine: Box<dyn Snapshotable>,

    // Persistent state on all servers (updated on stable storage before responding to RPCs)
    // These are cached in memory for fast access, but always persisted via storage
    /// Latest term server has seen (initialized to 0 on first boot, increases monotonically)
    pub current_term: u64,
    /// Candidate ID that received vote in current term (or None if none)
    pub voted_for: Option<u64>,
    /// Log entries; first index is 1
    pub log: Vec<LogEntry>,
    /// Last log index included in snapshot (0 if no snapshot)
    pub snapshot_last_index: u64,
    /// Term of the last log entry included in snapshot (0 if no snapshot)
    pub snapshot_last_term: u64,

    // Volatile state on all servers
    /// Index of highest log entry known to be committed (initialized to 0, increases monotonically)
    pub commit_index: u64,
    /// Index of highest log entry applied to state machine (initialized to 0, increases monotonically)
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    /// For each server, index of next log entry to send to that server
    pub next_index: HashMap<u64, u64>,
    /// For each server, index of highest log entry known to be replicated on that server
    pub match_index: HashMap<u64, u64>,

    // Node-specific state
    /// Unique identifier for this node
    pub id: u64,
    /// Current state of this node
    pub state: RaftState,
    /// IDs of other nodes in the cluster
    pub peers: Vec<u64>,
    /// Peers that have granted votes in the current election (used by candidates)
    votes_received: Vec<u64>,
    /// Current known leader (updated when receiving valid AppendEntries)
    pub current_leader: Option<u64>,
    /// Last time we received a valid heartbeat from leader (for election timeout)
    pub last_heartbeat: Instant,
    /// Number of applied log entries before triggering automatic snapshot (0 = disabled)
    snapshot_threshold: u64,
}

impl RaftCore {
    /// Create a new Raft core with the given storage backend and state machine.
    /// Loads persistent state (term, vote, log, snapshot) from storage and
    /// restores the state machine from the snapshot if one exists.
    pub fn new(
        id: u64,
        peers: Vec<u64>,
        storage: Box<dyn Storage>,
        mut state_machine: Box<dyn Snapshotable>,
    ) -> Self {
        // Corrupted or unreadable persistent state is fatal: a node that
        // cannot trust its term/vote/log must not rejoin the cluster.
        let hard_state = storage
            .load_hard_state()
            .expect("failed to load hard state from storage");
        let log = storage.load_log().expect("failed to load log from storage");

        // Load snapshot and restore state machine (if exists)
        let (snapshot_last_index, snapshot_last_term) = match storage.load_snapshot() {
            Ok(Some(snapshot)) => {
                let last_index = snapshot.metadata.last_included_index;
                let last_term = snapshot.metadata.last_included_term;

                state_machine
                    .restore(&snapshot.data)
                    .expect("failed to restore state machine from snapshot");

                (last_index, last_term)
            }
            Ok(None) => (0, 0),
            Err(e) => panic!("failed to load snapshot from storage: {}", e),
        };

        // Everything in the snapshot is committed and applied
        let commit_index = snapshot_last_index;
        let last_applied = snapshot_last_index;

        RaftCore {
            storage,
            state_machine,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            snapshot_last_index,
            snapshot_last_term,
            commit_index,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            state: RaftState::Follower,
            peers,
            votes_received: Vec::new(),
            current_leader: None,
            last_heartbeat: Instant::now(),
            snapshot_threshold: 1000,
        }
    }

    /// Set the snapshot threshold (number of applied entries before auto-snapshot).
    /// Set to 0 to disable automatic snapshots.
    pub fn set_snapshot_threshold(&mut self, threshold: u64) {
        self.snapshot_threshold = threshold;
    }

    // === Persistence helpers ===

    /// Persist term and vote together, then update the in-memory cache.
    fn persist_hard_state(&mut self, term: u64, voted_for: Option<u64>) {
        self.storage
            .save_hard_state(HardState { term, voted_for })
            .expect("failed to persist hard state");
        self.current_term = term;
        self.voted_for = voted_for;
    }

    /// Record a vote in the current term.
    fn set_voted_for(&mut self, voted_for: Option<u64>) {
        self.persist_hard_state(self.current_term, voted_for);
    }

    /// Move to a higher term, clearing the vote.
    fn update_term(&mut self, new_term: u64) {
        self.persist_hard_state(new_term, None);
    }

    /// Append a single entry to log and persist
    fn persist_log_entry(&mut self, entry: LogEntry) {
        self.storage
            .append_log_entries(&[entry.clone()])
            .expect("failed to persist log entry");
        self.log.push(entry);
    }

    /// Truncate log from index and persist
    fn persist_truncate_log(&mut self, from_index: u64) {
        let truncate_pos = (from_index - self.snapshot_last_index - 1) as usize;
        if truncate_pos < self.log.len() {
            self.storage
                .truncate_log(from_index)
                .expect("failed to truncate log");
            self.log.truncate(truncate_pos);
        }
    }

    /// Get the last log index (returns snapshot_last_index if log is empty)
    pub fn last_log_index(&self) -> u64 {
        match self.log.last() {
            Some(entry) => entry.index,
            None => self.snapshot_last_index,
        }
    }

    /// Get the term of the last log entry (returns snapshot_last_term if log is empty)
    pub fn last_log_term(&self) -> u64 {
        match self.log.last() {
            Some(entry) => entry.term,
            None => self.snapshot_last_term,
        }
    }

    /// Get a log entry by its index, accounting for snapshot offset.
    /// Returns None if the entry is in the snapshot or beyond the log.
    pub fn get_log_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_last_index {
            None
        } else {
            // log[0] is entry at index (snapshot_last_index + 1)
            let offset = (index - self.snapshot_last_index - 1) as usize;
            self.log.get(offset)
        }
    }

    /// Check if candidate's log is at least as up-to-date as receiver's log.
    /// True if the candidate's last entry has a higher term, or the same term
    /// and at least as high an index.
    pub fn is_log_up_to_date(
        &self,
        candidate_last_log_term: u64,
        candidate_last_log_index: u64,
    ) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        candidate_last_log_term > my_last_term
            || (candidate_last_log_term == my_last_term
                && candidate_last_log_index >= my_last_index)
    }

    /// Handle RequestVote RPC
    pub fn handle_request_vote(&mut self, vote_req: &RequestVoteArgs) -> RequestVoteResult {
        // Decline requests with stale term immediately
        if vote_req.term < self.current_term {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        // If RPC request or response contains term T > currentTerm: set currentTerm = T, convert to follower
        if vote_req.term > self.current_term {
            let old_state = self.state;
            self.update_term(vote_req.term);
            self.state = RaftState::Follower;
            if old_state != RaftState::Follower {
                info!(
                    node = self.id,
                    ?old_state,
                    term = vote_req.term,
                    "stepped down to follower"
                );
            }
        }

        // If already voted for another candidate, decline vote
        if self.voted_for.is_some() && self.voted_for != Some(vote_req.candidate_id) {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        if !self.is_log_up_to_date(vote_req.last_log_term, vote_req.last_log_index) {
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        // Grant vote
        self.set_voted_for(Some(vote_req.candidate_id));

        RequestVoteResult {
            term: self.current_term,
            vote_granted: true,
        }
    }

    /// Handle AppendEntries RPC (heartbeat or log replication).
    /// Returns the result to send back and the leader ID if recognized.
    pub fn handle_append_entries(
        &mut self,
        append_req: &AppendEntriesArgs,
    ) -> HandleAppendEntriesOutput {
        // If RPC request or response contains term T > currentTerm: set currentTerm = T, convert to follower
        if append_req.term > self.current_term {
            let old_state = self.state;
            self.update_term(append_req.term);
            self.state = RaftState::Follower;
            if old_state != RaftState::Follower {
                info!(
                    node = self.id,
                    ?old_state,
                    term = append_req.term,
                    leader = append_req.leader_id,
                    "stepped down to follower"
                );
            }
        }

        let mut leader_id = None;

        let success = if append_req.term < self.current_term {
            // Reply false if term < currentTerm
            false
        } else {
            // Valid AppendEntries from current leader - reset election timeout
            self.state = RaftState::Follower;
            self.current_leader = Some(append_req.leader_id);
            self.last_heartbeat = Instant::now();
            leader_id = Some(append_req.leader_id);

            // Log-matching check: the local log must contain an entry at
            // prev_log_index whose term matches prev_log_term
            let log_matches = if append_req.prev_log_index == 0 {
                true
            } else if append_req.prev_log_index > self.last_log_index() {
                false
            } else if append_req.prev_log_index == self.snapshot_last_index {
                // prev_log_index is exactly at snapshot boundary
                append_req.prev_log_term == self.snapshot_last_term
            } else if append_req.prev_log_index < self.snapshot_last_index {
                // Covered by snapshot, so it was committed with the leader's term
                true
            } else {
                match self.get_log_entry(append_req.prev_log_index) {
                    Some(entry) => entry.term == append_req.prev_log_term,
                    None => false,
                }
            };

            if log_matches {
                self.store_entries(&append_req.entries);

                // If leaderCommit > commitIndex, set commitIndex =
                // min(leaderCommit, index of last new entry). The bound is the
                // last index this request vouches for, not the local log end:
                // an uncommitted local suffix past it must stay uncommitted
                // even when leader_commit reaches further.
                let last_new_index = append_req.prev_log_index + append_req.entries.len() as u64;
                if append_req.leader_commit > self.commit_index {
                    let new_commit =
                        std::cmp::min(append_req.leader_commit, last_new_index);
                    if new_commit > self.commit_index {
                        self.commit_index = new_commit;
                        self.apply_committed_entries();
                    }
                }

                true
            } else {
                false
            }
        };

        HandleAppendEntriesOutput {
            result: AppendEntriesResult {
                term: self.current_term,
                success,
            },
            leader_id,
        }
    }

    /// Store entries from AppendEntries RPC, handling conflicts and persistence
    fn store_entries(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            // Skip entries already in snapshot
            if entry.index <= self.snapshot_last_index {
                continue;
            }

            // Position in the in-memory log accounting for snapshot offset
            let entry_idx = (entry.index - self.snapshot_last_index - 1) as usize;

            if entry_idx < self.log.len() {
                if self.log[entry_idx].term != entry.term {
                    // Conflict: same index but different terms.
                    // Delete this entry and all that follow, then append the new one
                    self.persist_truncate_log(entry.index);
                    self.persist_log_entry(entry.clone());
                    debug!(
                        node = self.id,
                        index = entry.index,
                        term = entry.term,
                        "replaced conflicting entry"
                    );
                }
                // If terms match, entry already exists - skip (idempotent)
            } else {
                self.persist_log_entry(entry.clone());
                debug!(
                    node = self.id,
                    index = entry.index,
                    term = entry.term,
                    "replicated entry"
                );
            }
        }
    }

    /// Handle InstallSnapshot RPC
    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs) -> InstallSnapshotResult {
        // Reply immediately if term < currentTerm
        if args.term < self.current_term {
            return InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: "stale term".to_string(),
            };
        }

        if args.term > self.current_term {
            self.update_term(args.term);
            self.state = RaftState::Follower;
        }

        // Reset election timeout - we heard from a valid leader
        self.last_heartbeat = Instant::now();
        self.current_leader = Some(args.leader_id);

        // If snapshot is older than what we have, ignore it
        if args.last_included_index <= self.snapshot_last_index {
            return InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: format!(
                    "snapshot too old: {} <= {}",
                    args.last_included_index, self.snapshot_last_index
                ),
            };
        }

        // Save snapshot to storage FIRST, so disk and memory stay consistent
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: args.last_included_index,
                last_included_term: args.last_included_term,
            },
            data: args.data.clone(),
        };

        if let Err(e) = self.storage.save_snapshot(&snapshot) {
            return InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: format!("failed to save snapshot: {}", e),
            };
        }

        // Restore the state machine. The snapshot is safely on disk; failing
        // here leaves the node inconsistent, so it must stop.
        self.state_machine
            .restore(&args.data)
            .expect("failed to restore state machine from snapshot");

        self.snapshot_last_index = args.last_included_index;
        self.snapshot_last_term = args.last_included_term;

        // Discard log entries covered by the snapshot
        self.log.retain(|entry| entry.index > args.last_included_index);
        if let Err(e) = self.storage.compact_log(args.last_included_index + 1) {
            warn!(node = self.id, error = %e, "log compaction after snapshot install failed");
        }

        if args.last_included_index > self.commit_index {
            self.commit_index = args.last_included_index;
        }
        if args.last_included_index > self.last_applied {
            self.last_applied = args.last_included_index;
        }

        info!(
            node = self.id,
            index = args.last_included_index,
            term = args.last_included_term,
            "installed snapshot from leader"
        );

        InstallSnapshotResult::Success {
            term: self.current_term,
        }
    }

    /// Start a new election (called when election timeout elapses)
    pub fn start_election(&mut self) {
        // Increment term, vote for self, persist both in one record
        self.persist_hard_state(self.current_term + 1, Some(self.id));

        self.state = RaftState::Candidate;
        info!(node = self.id, term = self.current_term, "became candidate");

        // Clear current leader (we're challenging)
        self.current_leader = None;

        // Reset votes received (we've already voted for ourselves)
        self.votes_received.clear();
        self.votes_received.push(self.id);

        // Reset election timer so we don't immediately timeout again
        self.last_heartbeat = Instant::now();
    }

    /// Become leader (called after receiving majority of votes)
    pub fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        // Reset heartbeat timer to prevent election timeout from firing on leader
        self.last_heartbeat = Instant::now();
        info!(node = self.id, term = self.current_term, "became leader");

        // Reinitialize next_index and match_index BEFORE appending the no-op,
        // so next_index points AT the no-op and it goes out with the first heartbeat
        let last_index = self.last_log_index();
        for peer_id in &self.peers {
            self.next_index.insert(*peer_id, last_index + 1);
            self.match_index.insert(*peer_id, 0);
        }

        // Append a no-op entry so entries from previous terms can commit
        // indirectly (Raft paper Section 5.4.2)
        let noop_entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            command: Command::Noop,
        };
        debug!(node = self.id, index = noop_entry.index, "appending no-op entry");
        self.persist_log_entry(noop_entry);
    }

    /// Add a new log entry (called by leader when receiving client request).
    /// Returns None if called on a non-leader node.
    pub fn append_log_entry(&mut self, command: Command) -> Option<LogEntry> {
        if self.state != RaftState::Leader {
            return None;
        }

        let index = self.last_log_index() + 1;
        let entry = LogEntry {
            term: self.current_term,
            index,
            command,
        };
        debug!(node = self.id, index, term = self.current_term, "appended entry");
        self.persist_log_entry(entry.clone());
        Some(entry)
    }

    /// Apply committed entries to the state machine, advancing last_applied
    /// up to commit_index. Returns (index, result) for each entry applied.
    ///
    /// Automatically takes a snapshot once the number of entries applied
    /// since the last snapshot reaches the configured threshold.
    pub fn apply_committed_entries(&mut self) -> Vec<AppliedEntry> {
        let mut results = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;

            match self.get_log_entry(self.last_applied) {
                Some(entry) => {
                    let command = entry.command.clone();
                    // A failed apply (storage I/O) would diverge this node
                    // from the rest of the cluster if skipped - stop instead
                    let result = self
                        .state_machine
                        .apply(&command)
                        .expect("failed to apply committed entry to state machine");
                    results.push((self.last_applied, result));
                }
                None => {
                    panic!(
                        "entry {} to apply is already covered by snapshot at {}",
                        self.last_applied, self.snapshot_last_index
                    );
                }
            }
        }

        // All nodes snapshot independently to bound log growth. Leaders
        // additionally ship snapshots to followers that fall too far behind.
        if self.snapshot_threshold > 0 {
            let entries_since_snapshot = self.last_applied - self.snapshot_last_index;
            if entries_since_snapshot >= self.snapshot_threshold {
                info!(
                    node = self.id,
                    entries = entries_since_snapshot,
                    "automatic snapshot triggered"
                );
                if let Err(e) = self.take_snapshot() {
                    warn!(node = self.id, error = %e, "automatic snapshot failed");
                }
            }
        }

        results
    }

    /// Take a snapshot of the state machine up to last_applied and discard
    /// the log entries it covers.
    pub fn take_snapshot(&mut self) -> Result<(), SnapshotError> {
        if self.last_applied == 0 {
            return Err(SnapshotError::NothingApplied);
        }

        if self.last_applied <= self.snapshot_last_index {
            return Err(SnapshotError::AlreadyCovered {
                snapshot_index: self.snapshot_last_index,
                last_applied: self.last_applied,
            });
        }

        // last_applied > snapshot_last_index, so the entry must be in the log
        let last_applied_term = self
            .get_log_entry(self.last_applied)
            .map(|e| e.term)
            .ok_or_else(|| {
                SnapshotError::StateMachine("last applied entry missing from log".to_string())
            })?;

        let snapshot_data = self
            .state_machine
            .snapshot()
            .map_err(|e| SnapshotError::StateMachine(e.to_string()))?;

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: self.last_applied,
                last_included_term: last_applied_term,
            },
            data: snapshot_data,
        };

        self.storage.save_snapshot(&snapshot)?;

        self.snapshot_last_index = snapshot.metadata.last_included_index;
        self.snapshot_last_term = snapshot.metadata.last_included_term;

        // Discard log entries covered by the snapshot
        let keep_from = self.snapshot_last_index + 1;
        self.storage.compact_log(keep_from)?;
        self.log.retain(|entry| entry.index >= keep_from);

        info!(
            node = self.id,
            index = self.snapshot_last_index,
            term = self.snapshot_last_term,
            "snapshot taken"
        );
        Ok(())
    }

    /// Load the current snapshot from storage (None if no snapshot exists)
    pub fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.storage.load_snapshot()
    }

    /// Process a RequestVote response (called by candidate).
    /// Steps down if the response carries a higher term.
    pub fn process_request_vote_response(&mut self, result: &RequestVoteResult) {
        if result.term > self.current_term {
            let old_state = self.state;
            self.update_term(result.term);
            self.state = RaftState::Follower;
            if old_state != RaftState::Follower {
                info!(
                    node = self.id,
                    ?old_state,
                    term = result.term,
                    "stepped down to follower on vote response"
                );
            }
        }
    }

    /// Process an AppendEntries response (called by leader).
    /// Steps down if the response carries a higher term.
    pub fn process_append_entries_response(&mut self, result: &AppendEntriesResult) {
        if result.term > self.current_term {
            let old_state = self.state;
            self.update_term(result.term);
            self.state = RaftState::Follower;
            if old_state != RaftState::Follower {
                info!(
                    node = self.id,
                    ?old_state,
                    term = result.term,
                    "stepped down to follower on append response"
                );
            }
        }
    }

    /// Handle a RequestVote result (called by candidate after receiving a vote
    /// response). Tracks votes and becomes leader on majority.
    /// Returns true if this node became leader as a result.
    pub fn handle_request_vote_result(&mut self, peer_id: u64, result: &RequestVoteResult) -> bool {
        self.process_request_vote_response(result);

        // If we're no longer a candidate (e.g., term was updated), we can't become leader
        if self.state != RaftState::Candidate {
            return false;
        }

        // Track the vote if granted
        if result.vote_granted && !self.votes_received.contains(&peer_id) {
            self.votes_received.push(peer_id);
        }

        // Check if we have majority (including our own vote)
        let total_nodes = 1 + self.peers.len();
        let majority = (total_nodes / 2) + 1;

        if self.votes_received.len() >= majority {
            self.become_leader();
            return true;
        }

        false
    }

    /// Handle an AppendEntries result (called by leader after receiving a
    /// replication response). Tracks replication progress and commits entries
    /// once a majority holds them.
    /// Returns (committed_index, apply results).
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: u64,
        entry_index: u64,
        result: &AppendEntriesResult,
    ) -> (Option<u64>, Vec<AppliedEntry>) {
        self.process_append_entries_response(result);

        // If we're no longer a leader (e.g., term was updated), we can't commit
        if self.state != RaftState::Leader {
            return (None, Vec::new());
        }

        if result.success {
            // Successfully replicated up to entry_index
            if entry_index > 0 {
                let current_match = self.match_index.get(&peer_id).copied().unwrap_or(0);
                if entry_index > current_match {
                    self.match_index.insert(peer_id, entry_index);
                }
                self.next_index.insert(peer_id, entry_index + 1);
            }
        } else {
            // Replication failed, decrement next_index for retry
            let current_next = self.next_index.get(&peer_id).copied().unwrap_or(1);
            if current_next > 1 {
                self.next_index.insert(peer_id, current_next - 1);
            }
        }

        if entry_index == 0 {
            return (None, Vec::new()); // No entry to commit
        }

        // Raft safety: only commit entries from the current term directly
        // (Section 5.4.2). Previous-term entries commit indirectly once a
        // current-term entry commits.
        let entry_term = self.get_log_entry(entry_index).map(|e| e.term);
        if entry_term != Some(self.current_term) {
            return (None, Vec::new());
        }

        // Count how many nodes have replicated this entry (including leader)
        let mut replicated_count = 1;
        for &match_idx in self.match_index.values() {
            if match_idx >= entry_index {
                replicated_count += 1;
            }
        }

        let total_nodes = 1 + self.peers.len();
        let majority = (total_nodes / 2) + 1;

        if replicated_count >= majority && entry_index > self.commit_index {
            self.commit_index = entry_index;
            debug!(
                node = self.id,
                index = entry_index,
                replicated = replicated_count,
                total = total_nodes,
                "committed entry"
            );
            let apply_results = self.apply_committed_entries();
            return (Some(entry_index), apply_results);
        }

        (None, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::TestStateMachine;
    use crate::storage::memory::MemoryStorage;

    /// Helper to create RaftCore with MemoryStorage for tests
    fn new_test_core(id: u64, peers: Vec<u64>) -> RaftCore {
        RaftCore::new(
            id,
            peers,
            Box::new(MemoryStorage::new()),
            Box::new(TestStateMachine::new()),
        )
    }

    fn put_entry(term: u64, index: u64, key: &str, value: &str) -> LogEntry {
        LogEntry {
            term,
            index,
            command: Command::put(key, value),
        }
    }

    #[test]
    fn test_new_node() {
        let node = new_test_core(1, vec![2, 3]);
        assert_eq!(node.id, 1);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.log.len(), 0);
    }

    #[test]
    fn test_election() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election();
        assert_eq!(node.state, RaftState::Candidate);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for, Some(1));
    }

    #[test]
    fn test_request_vote() {
        let mut node = new_test_core(1, vec![2, 3]);
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = node.handle_request_vote(&args);
        assert!(result.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn test_append_entries() {
        let mut node = new_test_core(1, vec![2, 3]);
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![put_entry(1, 1, "x", "1")],
            leader_commit: 0,
        };
        let before = node.last_heartbeat;
        let output = node.handle_append_entries(&args);
        assert!(output.result.success);
        assert_eq!(output.leader_id, Some(2));
        assert_eq!(node.log.len(), 1);
        assert_eq!(node.state, RaftState::Follower);
        assert!(node.last_heartbeat >= before, "last_heartbeat should be updated");
    }

    #[test]
    fn test_append_entries_stale_term_no_reset() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 2;
        let before = node.last_heartbeat;

        // Receive AppendEntries from stale term 1
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        // Should reject and NOT reset election timeout
        assert!(!output.result.success);
        assert_eq!(output.leader_id, None);
        assert_eq!(
            node.last_heartbeat, before,
            "last_heartbeat should NOT be updated for stale term"
        );
    }

    #[test]
    fn test_heartbeat_resets_election_timeout() {
        let mut node = new_test_core(1, vec![2, 3]);
        let before = node.last_heartbeat;

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![], // Empty = heartbeat
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(output.leader_id, Some(2));
        assert!(node.last_heartbeat >= before, "last_heartbeat should be updated");
    }

    // === Vote Rejection Tests ===

    #[test]
    fn test_vote_denied_candidate_has_lower_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 5;

        let args = RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = node.handle_request_vote(&args);

        assert!(!result.vote_granted);
        assert_eq!(result.term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn test_vote_denied_already_voted_for_another() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.voted_for = Some(2);

        // Node 3 requests vote in same term
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 3,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = node.handle_request_vote(&args);

        assert!(!result.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn test_vote_granted_to_same_candidate_again() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.voted_for = Some(2);

        // Node 2 requests vote again (e.g., retransmission)
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = node.handle_request_vote(&args);

        assert!(result.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn test_vote_denied_candidate_log_has_older_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(put_entry(3, 1, "x", "1"));

        // Candidate's last log entry is at term 2 (older)
        let args = RequestVoteArgs {
            term: 4,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 2,
        };
        let result = node.handle_request_vote(&args);

        assert!(!result.vote_granted);
        // Node should update term but not grant vote
        assert_eq!(node.current_term, 4);
    }

    #[test]
    fn test_vote_denied_candidate_log_is_shorter() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(put_entry(2, 1, "x", "1"));
        node.log.push(put_entry(2, 2, "y", "2"));

        // Candidate has same term but shorter log
        let args = RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 2,
        };
        let result = node.handle_request_vote(&args);

        assert!(!result.vote_granted);
    }

    #[test]
    fn test_vote_granted_candidate_log_has_higher_term() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(put_entry(2, 1, "x", "1"));

        let args = RequestVoteArgs {
            term: 4,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 3,
        };
        let result = node.handle_request_vote(&args);

        assert!(result.vote_granted);
        assert_eq!(node.voted_for, Some(2));
    }

    // === Term/State Transition Tests ===

    #[test]
    fn test_leader_steps_down_on_higher_term_in_vote_response() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.state = RaftState::Leader;

        let result = RequestVoteResult {
            term: 5,
            vote_granted: false,
        };
        node.process_request_vote_response(&result);

        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn test_leader_steps_down_on_higher_term_in_append_response() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;
        node.state = RaftState::Leader;

        let result = AppendEntriesResult {
            term: 5,
            success: false,
        };
        node.process_append_entries_response(&result);

        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn test_candidate_steps_down_on_append_entries_from_new_leader() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election(); // Now candidate at term 1
        assert_eq!(node.state, RaftState::Candidate);

        // Receive AppendEntries from leader at same term
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(node.state, RaftState::Follower);
    }

    #[test]
    fn test_candidate_steps_down_on_higher_term_request_vote() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election(); // Now candidate at term 1
        assert_eq!(node.state, RaftState::Candidate);
        assert_eq!(node.voted_for, Some(1)); // Voted for self

        let args = RequestVoteArgs {
            term: 5,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = node.handle_request_vote(&args);

        // Should step down, update term, and grant vote
        assert!(result.vote_granted);
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn test_follower_updates_term_on_higher_term_append_entries() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 1;

        let args = AppendEntriesArgs {
            term: 5,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None); // Reset on term change
    }

    // === Split Vote / Election Tests ===

    #[test]
    fn test_election_needs_majority_in_5_node_cluster() {
        // In a 5-node cluster, candidate needs 3 votes to win
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.start_election();
        assert_eq!(node.state, RaftState::Candidate);

        let result_granted = RequestVoteResult {
            term: 1,
            vote_granted: true,
        };
        let result_denied = RequestVoteResult {
            term: 1,
            vote_granted: false,
        };

        // One vote - self + 1 = 2, not majority
        let became_leader = node.handle_request_vote_result(2, &result_granted);
        assert!(!became_leader);
        assert_eq!(node.state, RaftState::Candidate);

        let became_leader = node.handle_request_vote_result(3, &result_denied);
        assert!(!became_leader);
        assert_eq!(node.state, RaftState::Candidate);

        // Second yes - self + 2 = 3 = majority
        let became_leader = node.handle_request_vote_result(4, &result_granted);
        assert!(became_leader);
        assert_eq!(node.state, RaftState::Leader);
    }

    #[test]
    fn test_election_lost_all_denied() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election();

        let result_denied = RequestVoteResult {
            term: 1,
            vote_granted: false,
        };

        let became_leader = node.handle_request_vote_result(2, &result_denied);
        assert!(!became_leader);
        let became_leader = node.handle_request_vote_result(3, &result_denied);
        assert!(!became_leader);

        // Still candidate, waiting for timeout to retry
        assert_eq!(node.state, RaftState::Candidate);
    }

    #[test]
    fn test_duplicate_vote_not_double_counted() {
        let mut node = new_test_core(1, vec![2, 3, 4, 5]);
        node.start_election();

        let result_granted = RequestVoteResult {
            term: 1,
            vote_granted: true,
        };

        // Same peer responds twice (retransmission)
        assert!(!node.handle_request_vote_result(2, &result_granted));
        assert!(!node.handle_request_vote_result(2, &result_granted));
        assert_eq!(node.state, RaftState::Candidate);
    }

    // === Log Consistency Tests ===

    #[test]
    fn test_append_entries_fails_prev_log_index_too_high() {
        let mut node = new_test_core(1, vec![2, 3]);
        // Node has empty log

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 1, // We don't have index 1
            prev_log_term: 1,
            entries: vec![put_entry(1, 2, "x", "1")],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(!output.result.success);
        assert_eq!(node.log.len(), 0);
    }

    #[test]
    fn test_append_entries_fails_prev_log_term_mismatch() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(put_entry(1, 1, "x", "1"));

        // Leader claims prev_log_index=1 has term 2 (wrong)
        let args = AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 2,
            entries: vec![put_entry(2, 2, "y", "2")],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(!output.result.success);
        assert_eq!(node.log.len(), 1);
    }

    #[test]
    fn test_append_entries_truncates_conflicting_entries() {
        let mut node = new_test_core(1, vec![2, 3]);
        // Node has entries from an old leader at term 1
        node.log.push(put_entry(1, 1, "x", "1"));
        node.log.push(put_entry(1, 2, "y", "OLD"));

        // New leader at term 2 sends a different entry at index 2
        let args = AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![put_entry(2, 2, "y", "NEW")],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(node.log.len(), 2);
        assert_eq!(node.log[1].command, Command::put("y", "NEW"));
        assert_eq!(node.log[1].term, 2);
    }

    #[test]
    fn test_append_entries_idempotent() {
        let mut node = new_test_core(1, vec![2, 3]);

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![put_entry(1, 1, "x", "1")],
            leader_commit: 0,
        };
        let output = node.handle_append_entries(&args);
        assert!(output.result.success);
        assert_eq!(node.log.len(), 1);

        // Same append again (retransmission)
        let output = node.handle_append_entries(&args);
        assert!(output.result.success);
        assert_eq!(node.log.len(), 1);
        assert_eq!(node.log[0].command, Command::put("x", "1"));
    }

    #[test]
    fn test_commit_index_advances_on_append_entries() {
        let mut node = new_test_core(1, vec![2, 3]);

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![put_entry(1, 1, "x", "1")],
            leader_commit: 1,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
    }

    #[test]
    fn test_commit_index_limited_by_log_length() {
        let mut node = new_test_core(1, vec![2, 3]);

        // Leader says commit_index=5 but we only have 1 entry
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![put_entry(1, 1, "x", "1")],
            leader_commit: 5,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn test_empty_append_does_not_commit_unverified_suffix() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.log.push(put_entry(1, 1, "a", "1"));
        // Stale uncommitted entry from a deposed leader; the cluster
        // committed something else at index 2
        node.log.push(put_entry(1, 2, "x", "stale"));

        // Empty-entries append that only vouches for the log up to index 1
        let args = AppendEntriesArgs {
            term: 2,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 2,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        // Index 2 must stay uncommitted until the leader replicates its own
        // entry there
        assert_eq!(node.commit_index, 1);
        assert_eq!(node.last_applied, 1);
    }

    // === Leader Replication Logic Tests ===

    #[test]
    fn test_next_index_decrements_on_failed_append() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.next_index.insert(2, 5);

        let result = AppendEntriesResult {
            term: 1,
            success: false,
        };
        leader.handle_append_entries_result(2, 5, &result);

        assert_eq!(leader.next_index.get(&2), Some(&4));
    }

    #[test]
    fn test_next_index_does_not_go_below_1() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.next_index.insert(2, 1);

        let result = AppendEntriesResult {
            term: 1,
            success: false,
        };
        leader.handle_append_entries_result(2, 1, &result);

        assert_eq!(leader.next_index.get(&2), Some(&1));
    }

    #[test]
    fn test_match_index_updates_on_successful_append() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.log.push(put_entry(1, 1, "x", "1"));
        leader.next_index.insert(2, 1);
        leader.match_index.insert(2, 0);

        let result = AppendEntriesResult {
            term: 1,
            success: true,
        };
        leader.handle_append_entries_result(2, 1, &result);

        assert_eq!(leader.match_index.get(&2), Some(&1));
        assert_eq!(leader.next_index.get(&2), Some(&2));
    }

    #[test]
    fn test_match_index_does_not_decrease() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.match_index.insert(2, 5);

        // Receive success for index 3 (stale/duplicate response)
        let result = AppendEntriesResult {
            term: 1,
            success: true,
        };
        leader.handle_append_entries_result(2, 3, &result);

        assert_eq!(leader.match_index.get(&2), Some(&5));
    }

    #[test]
    fn test_entry_not_committed_without_majority() {
        let mut leader = new_test_core(1, vec![2, 3, 4, 5]); // 5-node cluster
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.log.push(put_entry(1, 1, "x", "1"));

        // Only peer 2 replicates (leader + 1 peer = 2, need 3 for majority)
        let result = AppendEntriesResult {
            term: 1,
            success: true,
        };
        let (committed, _) = leader.handle_append_entries_result(2, 1, &result);

        assert!(committed.is_none());
        assert_eq!(leader.commit_index, 0);
    }

    #[test]
    fn test_entry_committed_with_majority() {
        let mut leader = new_test_core(1, vec![2, 3, 4, 5]); // 5-node cluster
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.log.push(put_entry(1, 1, "x", "1"));

        let result = AppendEntriesResult {
            term: 1,
            success: true,
        };

        // Peer 2 replicates (2 total)
        let (committed, _) = leader.handle_append_entries_result(2, 1, &result);
        assert!(committed.is_none());

        // Peer 3 replicates (3 total = majority in 5-node cluster)
        let (committed, _) = leader.handle_append_entries_result(3, 1, &result);
        assert_eq!(committed, Some(1));
        assert_eq!(leader.commit_index, 1);
    }

    #[test]
    fn test_commit_multiple_entries_at_once() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;

        for i in 1..=3 {
            leader.log.push(put_entry(1, i, "k", &format!("v{}", i)));
        }

        let result = AppendEntriesResult {
            term: 1,
            success: true,
        };

        // Peer 2 replicates up to index 3; leader + peer2 = majority of 3
        let (committed, applied) = leader.handle_append_entries_result(2, 3, &result);

        assert_eq!(committed, Some(3));
        assert_eq!(leader.commit_index, 3);
        assert_eq!(leader.last_applied, 3);
        assert_eq!(applied.len(), 3);
        assert_eq!(applied[2], (3, Some(b"v3".to_vec())));
    }

    #[test]
    fn test_leader_loses_leadership_on_higher_term_response() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.current_term = 1;
        leader.state = RaftState::Leader;
        leader.log.push(put_entry(1, 1, "x", "1"));

        // Peer responds with higher term
        let result = AppendEntriesResult {
            term: 5,
            success: false,
        };
        let (committed, _) = leader.handle_append_entries_result(2, 1, &result);

        assert!(committed.is_none());
        assert_eq!(leader.state, RaftState::Follower);
        assert_eq!(leader.current_term, 5);
        assert_eq!(leader.commit_index, 0);
    }

    #[test]
    fn test_previous_term_entry_not_committed_directly() {
        let mut leader = new_test_core(1, vec![2, 3]);
        // Entry from term 1, but leader is now at term 2
        leader.log.push(put_entry(1, 1, "x", "1"));
        leader.current_term = 2;
        leader.state = RaftState::Leader;

        let result = AppendEntriesResult {
            term: 2,
            success: true,
        };
        let (committed, _) = leader.handle_append_entries_result(2, 1, &result);

        // Section 5.4.2: the term-1 entry must not commit until a term-2
        // entry on top of it reaches a majority
        assert!(committed.is_none());
        assert_eq!(leader.commit_index, 0);
    }

    #[test]
    fn test_previous_term_entry_committed_indirectly() {
        let mut leader = new_test_core(1, vec![2, 3]);
        leader.log.push(put_entry(1, 1, "x", "1"));
        leader.current_term = 2;
        leader.state = RaftState::Leader;
        // Current-term entry on top of the old one
        leader.log.push(put_entry(2, 2, "y", "2"));

        let result = AppendEntriesResult {
            term: 2,
            success: true,
        };
        let (committed, applied) = leader.handle_append_entries_result(2, 2, &result);

        // Committing index 2 drags index 1 along with it
        assert_eq!(committed, Some(2));
        assert_eq!(leader.commit_index, 2);
        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn test_become_leader_appends_noop() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election();
        node.become_leader();

        assert_eq!(node.state, RaftState::Leader);
        assert_eq!(node.log.len(), 1);
        assert_eq!(node.log[0].command, Command::Noop);
        assert_eq!(node.next_index.get(&2), Some(&1));
        assert_eq!(node.match_index.get(&2), Some(&0));
    }

    #[test]
    fn test_append_log_entry_rejected_on_follower() {
        let mut node = new_test_core(1, vec![2, 3]);
        assert!(node.append_log_entry(Command::put("k", "v")).is_none());
        assert_eq!(node.log.len(), 0);
    }

    // === Snapshot Tests ===

    fn make_leader_with_applied(entries: u64) -> RaftCore {
        let mut node = new_test_core(1, vec![2, 3]);
        node.start_election();
        node.become_leader();
        for i in 0..entries {
            node.append_log_entry(Command::put(format!("k{}", i), format!("v{}", i)));
        }
        // Commit and apply everything
        node.commit_index = node.last_log_index();
        node.apply_committed_entries();
        node
    }

    #[test]
    fn test_take_snapshot_compacts_log() {
        let mut node = make_leader_with_applied(5);
        let last_index = node.last_log_index();

        node.take_snapshot().unwrap();

        assert_eq!(node.snapshot_last_index, last_index);
        assert!(node.log.is_empty());
        assert_eq!(node.last_log_index(), last_index);
        assert!(node.load_snapshot().unwrap().is_some());
    }

    #[test]
    fn test_take_snapshot_with_nothing_applied() {
        let mut node = new_test_core(1, vec![2, 3]);
        assert!(matches!(
            node.take_snapshot(),
            Err(SnapshotError::NothingApplied)
        ));
    }

    #[test]
    fn test_take_snapshot_twice_without_new_entries() {
        let mut node = make_leader_with_applied(3);
        node.take_snapshot().unwrap();
        assert!(matches!(
            node.take_snapshot(),
            Err(SnapshotError::AlreadyCovered { .. })
        ));
    }

    #[test]
    fn test_auto_snapshot_on_threshold() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.set_snapshot_threshold(3);
        node.start_election();
        node.become_leader();
        for i in 0..5 {
            node.append_log_entry(Command::put(format!("k{}", i), "v"));
        }

        node.commit_index = node.last_log_index();
        node.apply_committed_entries();

        // 6 entries applied (noop + 5), threshold 3 - snapshot must have fired
        assert!(node.snapshot_last_index > 0);
        assert!(node.load_snapshot().unwrap().is_some());
    }

    #[test]
    fn test_install_snapshot() {
        let mut source = make_leader_with_applied(4);
        source.take_snapshot().unwrap();
        let snapshot = source.load_snapshot().unwrap().unwrap();

        let mut target = new_test_core(2, vec![1, 3]);
        let result = target.handle_install_snapshot(&InstallSnapshotArgs {
            term: source.current_term,
            leader_id: 1,
            last_included_index: snapshot.metadata.last_included_index,
            last_included_term: snapshot.metadata.last_included_term,
            data: snapshot.data.clone(),
        });

        assert!(matches!(result, InstallSnapshotResult::Success { .. }));
        assert_eq!(target.snapshot_last_index, snapshot.metadata.last_included_index);
        assert_eq!(target.commit_index, snapshot.metadata.last_included_index);
        assert_eq!(target.last_applied, snapshot.metadata.last_included_index);
        assert!(target.log.is_empty());
        assert_eq!(target.current_leader, Some(1));
    }

    #[test]
    fn test_install_snapshot_stale_term_rejected() {
        let mut node = new_test_core(1, vec![2, 3]);
        node.current_term = 5;

        let result = node.handle_install_snapshot(&InstallSnapshotArgs {
            term: 2,
            leader_id: 2,
            last_included_index: 10,
            last_included_term: 2,
            data: vec![],
        });

        assert!(matches!(result, InstallSnapshotResult::Failed { .. }));
        assert_eq!(node.snapshot_last_index, 0);
    }

    #[test]
    fn test_install_snapshot_older_than_current_rejected() {
        let mut node = make_leader_with_applied(4);
        node.take_snapshot().unwrap();
        let current_index = node.snapshot_last_index;

        let result = node.handle_install_snapshot(&InstallSnapshotArgs {
            term: node.current_term,
            leader_id: 2,
            last_included_index: current_index - 1,
            last_included_term: 1,
            data: vec![],
        });

        assert!(matches!(result, InstallSnapshotResult::Failed { .. }));
        assert_eq!(node.snapshot_last_index, current_index);
    }

    #[test]
    fn test_append_entries_after_snapshot_boundary() {
        let mut node = make_leader_with_applied(3);
        node.take_snapshot().unwrap();
        let boundary = node.snapshot_last_index;
        let boundary_term = node.snapshot_last_term;
        let term = node.current_term;

        // Step down so a new leader can replicate to us
        node.state = RaftState::Follower;

        let args = AppendEntriesArgs {
            term: term + 1,
            leader_id: 2,
            prev_log_index: boundary,
            prev_log_term: boundary_term,
            entries: vec![put_entry(term + 1, boundary + 1, "post", "snap")],
            leader_commit: boundary,
        };
        let output = node.handle_append_entries(&args);

        assert!(output.result.success);
        assert_eq!(node.last_log_index(), boundary + 1);
        assert_eq!(
            node.get_log_entry(boundary + 1).unwrap().command,
            Command::put("post", "snap")
        );
    }

    #[test]
    fn test_restart_recovers_persistent_state() {
        let storage = MemoryStorage::new();
        let mut storage_for_restart = storage.clone();

        {
            let mut node = RaftCore::new(
                1,
                vec![2, 3],
                Box::new(storage),
                Box::new(TestStateMachine::new()),
            );
            node.start_election();
            node.become_leader();
            node.append_log_entry(Command::put("k", "v"));

            // MemoryStorage is cloned per instance, so copy the final state
            // over to simulate durable storage surviving a restart
            storage_for_restart
                .save_hard_state(HardState {
                    term: node.current_term,
                    voted_for: node.voted_for,
                })
                .unwrap();
            storage_for_restart.append_log_entries(&node.log).unwrap();
        }

        let node = RaftCore::new(
            1,
            vec![2, 3],
            Box::new(storage_for_restart),
            Box::new(TestStateMachine::new()),
        );
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for, Some(1));
        assert_eq!(node.log.len(), 2); // noop + put
        assert_eq!(node.state, RaftState::Follower);
        assert_eq!(node.commit_index, 0);
    }
}
