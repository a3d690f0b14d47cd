//! RaftServer - server loop driving elections, heartbeats and client commands

use std::pin::pin;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::config::RaftConfig;
use super::raft_core::{RaftCore, RaftState};
use super::raft_node::{RaftNode, SharedCore};
use crate::command::Command;
use crate::transport::Transport;

/// Errors surfaced to clients submitting commands
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RaftError {
    /// This node is not the leader (includes leader hint if known)
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },
    /// Entry was not committed (couldn't reach majority)
    #[error("entry was not committed")]
    NotCommitted,
    /// The server loop has stopped
    #[error("server is shut down")]
    Shutdown,
}

/// Role of a node as observed through the role channel
#[derive(Debug, Clone, PartialEq)]
pub struct RoleInfo {
    pub state: RaftState,
    pub term: u64,
    pub leader_id: Option<u64>,
}

/// Request sent to the RaftServer from clients
enum ServerRequest {
    /// Submit a client command to be replicated
    Submit {
        command: Command,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, RaftError>>,
    },
    /// Verify leadership with a majority heartbeat round
    ConfirmLeadership {
        reply: oneshot::Sender<Result<bool, RaftError>>,
    },
}

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<ServerRequest>,
    shutdown_tx: mpsc::Sender<()>,
    role_rx: watch::Receiver<RoleInfo>,
}

impl RaftHandle {
    /// Submit a command to the cluster.
    /// Returns the state machine result once the command is committed and
    /// applied on this node.
    pub async fn submit(&self, command: Command) -> Result<Option<Vec<u8>>, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ServerRequest::Submit {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;

        reply_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Confirm this node still leads by collecting a majority of heartbeat
    /// acknowledgements. `Ok(true)` means no newer leader existed at the time
    /// of the round, so a local read afterwards observes every committed
    /// write. Fails with [`RaftError::NotLeader`] on non-leaders.
    pub async fn confirm_leadership(&self) -> Result<bool, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ServerRequest::ConfirmLeadership { reply: reply_tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;

        reply_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Subscribe to role changes. The receiver holds the latest role and
    /// wakes on every transition, so callers can await leadership changes
    /// instead of polling.
    pub fn subscribe_role(&self) -> watch::Receiver<RoleInfo> {
        self.role_rx.clone()
    }

    /// Latest published role of this node
    pub fn current_role(&self) -> RoleInfo {
        self.role_rx.borrow().clone()
    }

    /// Shutdown the RaftServer gracefully
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Server loop that owns a RaftNode and coordinates client commands,
/// heartbeats and election timeouts.
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    command_rx: mpsc::Receiver<ServerRequest>,
    command_tx: mpsc::Sender<ServerRequest>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    role_tx: watch::Sender<RoleInfo>,
    role_rx: watch::Receiver<RoleInfo>,
    config: RaftConfig,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a new RaftServer with default config
    /// Returns the server and shared core for RPC handling
    pub fn new(core: RaftCore, transport: T) -> (Self, SharedCore) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a new RaftServer with custom config
    /// Returns the server and shared core for RPC handling
    pub fn with_config(mut core: RaftCore, transport: T, config: RaftConfig) -> (Self, SharedCore) {
        core.set_snapshot_threshold(config.snapshot_threshold);

        let initial_role = RoleInfo {
            state: core.state,
            term: core.current_term,
            leader_id: core.current_leader,
        };
        let (role_tx, role_rx) = watch::channel(initial_role);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = RaftNode::new(core, transport);
        let shared_core = node.shared_core();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            role_tx,
            role_rx,
            config,
        };
        (server, shared_core)
    }

    /// Start the server and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            role_rx: self.role_rx.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main server loop
    async fn run(mut self) {
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        // Delay behavior prevents accumulated missed ticks from starving
        // the election timeout branch
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Fresh jitter per deadline so repeated elections in one process
            // don't keep colliding on the same timeout
            let election_timeout = self.config.random_election_timeout();
            // Election deadline tracks last_heartbeat in the core, which
            // advances whenever a valid AppendEntries arrives
            let election_deadline = self.get_election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("server loop shutting down");
                    break;
                }
                Some(request) = self.command_rx.recv() => {
                    match request {
                        ServerRequest::Submit { command, reply } => {
                            let result = self.handle_submit(command).await;
                            let _ = reply.send(result);
                        }
                        ServerRequest::ConfirmLeadership { reply } => {
                            let result = self.handle_confirm_leadership().await;
                            let _ = reply.send(result);
                        }
                    }
                    self.publish_role().await;
                }
                _ = heartbeat_interval.tick() => {
                    // Ticks fire on every node. Followers learn the leader
                    // from AppendEntries handled outside this loop, so the
                    // role channel is refreshed here on each tick
                    self.publish_role().await;
                    if self.node.state().await == RaftState::Leader {
                        // Leaders don't time themselves out
                        self.node.shared_core().lock().await.last_heartbeat = Instant::now();
                        self.node.send_heartbeat().await;
                        self.publish_role().await;
                    }
                }
                _ = election_sleep => {
                    self.publish_role().await;
                    let state = self.node.state().await;
                    if state != RaftState::Leader
                        && self.has_election_timed_out(election_timeout).await
                    {
                        debug!("election timeout expired, starting election");
                        self.node.start_election().await;
                        self.publish_role().await;

                        let became_leader = self.node.request_votes().await;
                        if became_leader {
                            // Establish leadership immediately
                            self.node.send_heartbeat().await;
                        }
                        self.publish_role().await;
                    }
                }
                else => break, // All channels closed
            }
        }
    }

    /// Publish the current role if it changed since the last publication
    async fn publish_role(&self) {
        let role = {
            let core = self.node.shared_core();
            let core = core.lock().await;
            RoleInfo {
                state: core.state,
                term: core.current_term,
                leader_id: core.current_leader,
            }
        };
        self.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
    }

    /// Election deadline based on last_heartbeat in the core
    async fn get_election_deadline(&self, timeout: Duration) -> Instant {
        let core = self.node.shared_core();
        let last_heartbeat = core.lock().await.last_heartbeat;
        last_heartbeat + timeout
    }

    /// Re-check the deadline against the core; last_heartbeat may have
    /// advanced while the sleep was pending
    async fn has_election_timed_out(&self, timeout: Duration) -> bool {
        let core = self.node.shared_core();
        let last_heartbeat = core.lock().await.last_heartbeat;
        Instant::now() >= last_heartbeat + timeout
    }

    /// Handle a client submit: append locally, replicate, return the
    /// state machine result once committed and applied.
    async fn handle_submit(&self, command: Command) -> Result<Option<Vec<u8>>, RaftError> {
        let shared_core = self.node.shared_core();
        let entry_index = {
            let mut core = shared_core.lock().await;

            // Only leaders accept commands; point the client at the last
            // known leader if we have one
            if core.state != RaftState::Leader {
                return Err(RaftError::NotLeader {
                    leader_hint: core.current_leader,
                });
            }

            let entry = core
                .append_log_entry(command)
                .ok_or(RaftError::NotLeader { leader_hint: None })?;
            entry.index
        };

        match self.node.replicate_to_peers(entry_index).await {
            Some(result) => Ok(result),
            None => Err(RaftError::NotCommitted),
        }
    }

    /// Leadership check backing verified reads: an empty majority round
    /// proves no newer leader has been elected.
    async fn handle_confirm_leadership(&self) -> Result<bool, RaftError> {
        {
            let shared_core = self.node.shared_core();
            let core = shared_core.lock().await;
            if core.state != RaftState::Leader {
                return Err(RaftError::NotLeader {
                    leader_hint: core.current_leader,
                });
            }
        }

        let (still_leader, _acks) = self.node.confirm_leadership().await;
        Ok(still_leader)
    }

    /// Start an election (delegates to RaftNode)
    pub async fn start_election(&self) {
        self.node.start_election().await;
    }

    /// Request votes from all peers (delegates to RaftNode)
    pub async fn request_votes(&self) -> bool {
        self.node.request_votes().await
    }

    /// Get current state
    pub async fn state(&self) -> RaftState {
        self.node.state().await
    }

    /// Get commit index
    pub async fn commit_index(&self) -> u64 {
        self.node.commit_index().await
    }
}
