//! Per-node server: the TCP listener, inbound dispatch, and the outbound
//! peer connection registry, wrapped around one [`RaftNode`].
//!
//! Inbound requests are decoded off each connection and dispatched on their
//! own task so the artificial latency sleep never stalls the connection.
//! Responses are funneled through a writer task and matched back to callers
//! by correlation id.

use crate::config::ClusterConfig;
use crate::consensus::RaftNode;
use crate::error::Result;
use crate::rpc::{RpcCall, RpcReply, RpcRequest, RpcResponse};
use crate::sink::CommandSink;
use crate::transport::{read_frame, write_frame, PeerRouter};
use crate::types::{Command, NodeId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// One cluster member: consensus node plus its transport endpoints.
pub struct NodeServer<C: Command> {
    id: NodeId,
    addr: SocketAddr,
    node: Arc<RaftNode<C>>,
    router: Arc<PeerRouter<C>>,
    config: ClusterConfig,
    shutdown: Arc<Notify>,
}

impl<C: Command> NodeServer<C> {
    /// Bind a listener on an ephemeral loopback port and start serving.
    /// The consensus node stays passive until [`NodeServer::activate`].
    pub async fn start(
        id: NodeId,
        peers: Vec<NodeId>,
        config: ClusterConfig,
        sink: Arc<dyn CommandSink<C>>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let router = Arc::new(PeerRouter::new(config.clone()));
        let node = RaftNode::new(
            id,
            peers,
            config.clone(),
            Arc::clone(&router) as Arc<dyn crate::transport::Transport<C>>,
            sink,
        );

        let server = Arc::new(Self {
            id,
            addr,
            node,
            router,
            config,
            shutdown: Arc::new(Notify::new()),
        });

        info!("[{}] listening on {}", id, addr);
        tokio::spawn(Arc::clone(&server).run_accept_loop(listener));
        Ok(server)
    }

    /// Address peers should connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The consensus node itself, for submissions and state queries.
    pub fn node(&self) -> &Arc<RaftNode<C>> {
        &self.node
    }

    /// Arm the node's election timer. Call after the cluster mesh is wired.
    pub fn activate(&self) {
        self.node.activate();
    }

    pub async fn connect_to_peer(&self, peer: NodeId, addr: SocketAddr) -> Result<()> {
        self.router.connect_to_peer(peer, addr).await
    }

    pub fn disconnect_peer(&self, peer: NodeId) {
        self.router.disconnect_peer(peer);
    }

    pub fn disconnect_all(&self) {
        self.router.disconnect_all();
    }

    pub fn is_connected_to(&self, peer: NodeId) -> bool {
        self.router.is_connected(peer)
    }

    /// Stop everything: the node first (so no new work starts and the apply
    /// pipeline drains), then the accept loop, then the peer connections.
    pub fn shutdown(&self) {
        self.node.kill();
        self.shutdown.notify_one();
        self.router.disconnect_all();
    }

    async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            debug!("[{}] accepted connection from {}", self.id, remote);
                            tokio::spawn(Arc::clone(&self).serve_connection(stream));
                        }
                        Err(e) => {
                            warn!("[{}] accept failed: {}", self.id, e);
                            return;
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    debug!("[{}] accept loop stopped", self.id);
                    return;
                }
            }
        }
    }

    /// Serve one inbound connection until the peer closes it.
    async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] set_nodelay failed: {}", self.id, e);
        }
        let (mut reader, mut writer) = stream.into_split();

        // Responses complete out of order (each carries its own latency),
        // so they are serialized onto the socket by this writer task.
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<RpcResponse>();
        let writer_id = self.id;
        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let payload = match bincode::serialize(&response) {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!("[{}] dropping unserializable response: {}", writer_id, e);
                        continue;
                    }
                };
                if write_frame(&mut writer, &payload).await.is_err() {
                    return;
                }
            }
        });

        loop {
            let payload = match read_frame(&mut reader, self.config.max_frame_bytes).await {
                Ok(payload) => payload,
                Err(_) => return,
            };
            let request: RpcRequest<C> = match bincode::deserialize(&payload) {
                Ok(request) => request,
                Err(e) => {
                    debug!("[{}] undecodable request frame: {}", self.id, e);
                    return;
                }
            };
            let server = Arc::clone(&self);
            let response_tx = response_tx.clone();
            tokio::spawn(async move {
                let response = server.dispatch(request).await;
                let _ = response_tx.send(response);
            });
        }
    }

    /// Sleep the injected latency, then hand the call to the node.
    async fn dispatch(&self, request: RpcRequest<C>) -> RpcResponse {
        let latency = self.config.min_rpc_latency() + Duration::from_millis(request.latency_ms);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let reply = match request.call {
            RpcCall::RequestVote(args) => {
                RpcReply::RequestVote(self.node.handle_request_vote(args))
            }
            RpcCall::AppendEntries(args) => {
                RpcReply::AppendEntries(self.node.handle_append_entries(args))
            }
        };
        RpcResponse {
            id: request.id,
            reply,
        }
    }
}
