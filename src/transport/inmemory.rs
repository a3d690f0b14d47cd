//! In-memory transport implementation for testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, RaftCore,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

/// Request types that can be sent to a node
pub(crate) enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
    InstallSnapshot {
        args: InstallSnapshotArgs,
        reply: oneshot::Sender<InstallSnapshotResult>,
    },
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Senders to each node's request channel
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Optional timeout for RPC calls
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport with senders to all nodes (no timeout)
    pub(crate) fn new(senders: HashMap<u64, mpsc::Sender<Request>>) -> Self {
        Self {
            senders,
            timeout: None,
        }
    }

    /// Create a new in-memory transport with a timeout
    pub(crate) fn with_timeout(senders: HashMap<u64, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self {
            senders,
            timeout: Some(timeout),
        }
    }

    async fn send<R>(
        &self,
        target: u64,
        make_request: impl FnOnce(oneshot::Sender<R>) -> Request,
    ) -> Result<R, TransportError> {
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make_request(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.send(target, |reply| Request::RequestVote { args, reply })
            .await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.send(target, |reply| Request::AppendEntries { args, reply })
            .await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.send(target, |reply| Request::InstallSnapshot { args, reply })
            .await
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request using the given RaftCore
    pub async fn process_one(&mut self, node: &mut RaftCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, node);
                true
            }
            None => false,
        }
    }

    /// Process one request using a shared node (for use with RaftServer).
    /// Receives the request first, then briefly locks to process.
    pub async fn process_one_shared(&mut self, node: &Arc<Mutex<RaftCore>>) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let mut n = node.lock().await;
                Self::handle_request(request, &mut n);
                true
            }
            None => false,
        }
    }

    /// Serve incoming requests until the channel closes or the shutdown
    /// signal fires. Used to run a whole node in the background.
    pub async fn serve(mut self, node: Arc<Mutex<RaftCore>>, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                request = self.receiver.recv() => {
                    match request {
                        Some(request) => {
                            let mut n = node.lock().await;
                            Self::handle_request(request, &mut n);
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Discard queued requests without answering them (their senders see a
    /// dropped reply channel, i.e. a timeout). Used to simulate lost messages.
    pub fn drain_pending(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }

    fn handle_request(request: Request, node: &mut RaftCore) {
        match request {
            Request::RequestVote { args, reply } => {
                let result = node.handle_request_vote(&args);
                let _ = reply.send(result);
            }
            Request::AppendEntries { args, reply } => {
                let output = node.handle_append_entries(&args);
                // Transport only returns the result; events are handled locally
                let _ = reply.send(output.result);
            }
            Request::InstallSnapshot { args, reply } => {
                let result = node.handle_install_snapshot(&args);
                let _ = reply.send(result);
            }
        }
    }
}

/// Create transports and handles for a cluster of nodes
pub fn create_cluster(
    node_ids: &[u64],
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and handles for a cluster of nodes with optional timeout
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let mut senders: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<u64, NodeHandle> = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    // Each node's transport carries senders to all other nodes
    let mut transports: HashMap<u64, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(other_senders, t),
            None => InMemoryTransport::new(other_senders),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}
