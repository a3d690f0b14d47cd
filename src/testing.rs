//! Testing utilities for cluster integration tests
//!
//! Provides `TestCluster` for spinning up full in-process clusters: every
//! member runs a real server loop, a durable engine in a temp directory and
//! a served channel transport endpoint.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as PlMutex;
use tempfile::TempDir;
use tokio::sync::oneshot;

use crate::client::ClientProxy;
use crate::core::config::RaftConfig;
use crate::core::raft_core::{RaftCore, RaftState};
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::engine::{EngineOptions, KvEngine};
use crate::state_machine::{KvStateMachine, SharedKvStateMachine};
use crate::storage::memory::MemoryStorage;
use crate::transport::inmemory::create_cluster_with_timeout;

/// A single member of a test cluster
pub struct TestNode {
    pub id: u64,
    /// Handle to the running server loop
    pub raft_handle: RaftHandle,
    /// This member's state machine, for direct reads and assertions
    pub state_machine: SharedKvStateMachine,
    /// Shared consensus state, for assertions on log/commit progress
    pub shared_core: SharedCore,
    rpc_shutdown_tx: Option<oneshot::Sender<()>>,
    /// Keeps the engine directory alive for the node's lifetime
    _dir: TempDir,
}

impl TestNode {
    /// Whether this member still answers RPCs
    pub fn is_running(&self) -> bool {
        self.rpc_shutdown_tx.is_some()
    }

    /// Client proxy bound to this member
    pub fn proxy(&self) -> ClientProxy {
        ClientProxy::new(self.raft_handle.clone(), self.state_machine.clone())
    }
}

/// An in-process cluster of full nodes
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create and start a new 3-node cluster
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// Create and start a cluster with the specified number of nodes
    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_config(count, None).await
    }

    /// Create and start a cluster with the specified number of nodes and config
    pub async fn with_nodes_and_config(count: usize, config: Option<RaftConfig>) -> Self {
        let node_ids: Vec<u64> = (1..=count as u64).collect();

        // Short RPC timeout so requests to killed members fail instead of
        // queueing forever
        let (mut transports, mut handles) =
            create_cluster_with_timeout(&node_ids, Some(Duration::from_millis(500)));

        let config = config.unwrap_or_else(|| {
            RaftConfig::with_timeouts(
                Duration::from_millis(50),
                Duration::from_millis(150),
                Duration::from_millis(300),
            )
        });

        let mut nodes = Vec::new();
        for &id in &node_ids {
            let peer_ids: Vec<u64> = node_ids.iter().copied().filter(|&p| p != id).collect();

            let dir = TempDir::new().expect("failed to create engine directory");
            let engine =
                KvEngine::open(dir.path(), EngineOptions::default()).expect("failed to open engine");
            let state_machine: SharedKvStateMachine =
                Arc::new(PlMutex::new(KvStateMachine::new(Arc::new(engine))));

            let core = RaftCore::new(
                id,
                peer_ids,
                Box::new(MemoryStorage::new()),
                Box::new(state_machine.clone()),
            );

            let transport = transports.remove(&id).expect("transport missing");
            let (server, shared_core) = RaftServer::with_config(core, transport, config.clone());
            let raft_handle = server.start();

            // Serve incoming RPCs in the background
            let rpc_handle = handles.remove(&id).expect("rpc handle missing");
            let (rpc_shutdown_tx, rpc_shutdown_rx) = oneshot::channel();
            tokio::spawn(rpc_handle.serve(shared_core.clone(), rpc_shutdown_rx));

            nodes.push(TestNode {
                id,
                raft_handle,
                state_machine,
                shared_core,
                rpc_shutdown_tx: Some(rpc_shutdown_tx),
                _dir: dir,
            });
        }

        TestCluster { nodes }
    }

    /// Wait until some member reports itself leader, returning its index
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if let Some(idx) = self.find_leader().await {
                return Some(idx);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Index of the current leader, if any member claims leadership
    pub async fn find_leader(&self) -> Option<usize> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.is_running() {
                continue;
            }
            if node.shared_core.lock().await.state == RaftState::Leader {
                return Some(idx);
            }
        }
        None
    }

    /// Index of some running follower
    pub async fn find_follower(&self) -> Option<usize> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.is_running() {
                continue;
            }
            if node.shared_core.lock().await.state == RaftState::Follower {
                return Some(idx);
            }
        }
        None
    }

    /// Stop a member: its server loop exits and its RPC endpoint goes dark,
    /// so peers see timeouts. Persistent state is left intact.
    pub async fn shutdown_node(&mut self, index: usize) {
        if let Some(tx) = self.nodes[index].rpc_shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.nodes[index].raft_handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Shutdown all members gracefully
    pub async fn shutdown(mut self) {
        for idx in 0..self.nodes.len() {
            if let Some(tx) = self.nodes[idx].rpc_shutdown_tx.take() {
                let _ = tx.send(());
            }
            self.nodes[idx].raft_handle.shutdown().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
