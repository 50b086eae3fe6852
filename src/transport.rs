//! TCP transport between peers.
//!
//! Outbound calls go through a [`PeerRouter`], one persistent connection per
//! peer. Requests are length-prefixed bincode frames correlated by id, so
//! several calls to the same peer can be in flight at once. Disconnecting a
//! peer atomically drops its client; later sends fail with a benign
//! [`Error::Transport`] that callers treat as "no reply received".

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, RpcCall, RpcReply,
    RpcRequest, RpcResponse,
};
use crate::types::{Command, NodeId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

/// Outbound interface the consensus core depends on. An `Err` from either
/// call means no reply was received; the core makes no state change and the
/// next heartbeat or election tick is the retry.
#[async_trait]
pub trait Transport<C: Command>: Send + Sync {
    async fn request_vote(&self, peer: NodeId, args: RequestVoteArgs) -> Result<RequestVoteReply>;

    async fn append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs<C>,
    ) -> Result<AppendEntriesReply>;
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, rejecting anything above `max_bytes`.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > max_bytes {
        return Err(Error::Codec(format!("frame of {} bytes exceeds limit", len)));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcReply>>>>;
type Outbound<C> = (RpcCall<C>, u64, oneshot::Sender<RpcReply>);

/// Handle to one peer connection. Cloning shares the connection.
struct PeerClient<C: Command> {
    tx: mpsc::UnboundedSender<Outbound<C>>,
}

impl<C: Command> Clone for PeerClient<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C: Command> PeerClient<C> {
    async fn connect(addr: SocketAddr, config: &ClusterConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Transport(format!("connect to {} timed out", addr)))??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(Self::run_writer(write_half, rx, Arc::clone(&pending)));
        tokio::spawn(Self::run_reader(read_half, Arc::clone(&pending), config.max_frame_bytes));

        Ok(Self { tx })
    }

    /// Serialize requests onto the socket. Exits when every client handle is
    /// dropped or the socket rejects a write.
    async fn run_writer(
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Outbound<C>>,
        pending: Pending,
    ) {
        let mut next_id: u64 = 0;
        while let Some((call, latency_ms, reply_tx)) = rx.recv().await {
            next_id += 1;
            let request = RpcRequest { id: next_id, latency_ms, call };
            let payload = match bincode::serialize(&request) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!("dropping unserializable request: {}", e);
                    continue;
                }
            };
            pending.lock().insert(next_id, reply_tx);
            if let Err(e) = write_frame(&mut writer, &payload).await {
                debug!("peer connection write failed: {}", e);
                break;
            }
        }
        // Dropping the sender that is still parked in `pending` (the reader
        // clears it) is how in-flight callers learn the connection died.
    }

    /// Match responses back to their waiting callers.
    async fn run_reader(mut reader: OwnedReadHalf, pending: Pending, max_bytes: usize) {
        loop {
            let payload = match read_frame(&mut reader, max_bytes).await {
                Ok(payload) => payload,
                Err(_) => break,
            };
            let response: RpcResponse = match bincode::deserialize(&payload) {
                Ok(response) => response,
                Err(e) => {
                    debug!("undecodable response frame: {}", e);
                    break;
                }
            };
            let waiter = pending.lock().remove(&response.id);
            if let Some(tx) = waiter {
                let _ = tx.send(response.reply);
            }
        }
        // Connection gone. Cancel whatever is still waiting.
        pending.lock().clear();
    }

    async fn call(&self, call: RpcCall<C>, latency_ms: u64) -> Result<RpcReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((call, latency_ms, reply_tx))
            .map_err(|_| Error::Transport("peer connection closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Transport("peer dropped without replying".to_string()))
    }
}

/// Per-node registry of outbound peer connections.
///
/// The consensus core holds this behind the [`Transport`] trait. The server
/// layer drives connect and disconnect as the harness wires and partitions
/// the cluster.
pub struct PeerRouter<C: Command> {
    config: ClusterConfig,
    clients: Mutex<HashMap<NodeId, PeerClient<C>>>,
}

impl<C: Command> PeerRouter<C> {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Establish a connection to `peer` unless one already exists.
    pub async fn connect_to_peer(&self, peer: NodeId, addr: SocketAddr) -> Result<()> {
        if self.clients.lock().contains_key(&peer) {
            return Ok(());
        }
        let client = PeerClient::connect(addr, &self.config).await?;
        self.clients.lock().insert(peer, client);
        Ok(())
    }

    /// Drop the connection to `peer`. Subsequent sends fail until the peer
    /// is connected again.
    pub fn disconnect_peer(&self, peer: NodeId) {
        self.clients.lock().remove(&peer);
    }

    pub fn disconnect_all(&self) {
        self.clients.lock().clear();
    }

    pub fn is_connected(&self, peer: NodeId) -> bool {
        self.clients.lock().contains_key(&peer)
    }

    fn client_for(&self, peer: NodeId) -> Result<PeerClient<C>> {
        self.clients
            .lock()
            .get(&peer)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("not connected to {}", peer)))
    }

    async fn dispatch(&self, peer: NodeId, call: RpcCall<C>) -> Result<RpcReply> {
        let client = self.client_for(peer)?;
        let latency_ms = self.config.random_extra_latency_ms();
        client.call(call, latency_ms).await
    }
}

#[async_trait]
impl<C: Command> Transport<C> for PeerRouter<C> {
    async fn request_vote(&self, peer: NodeId, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        match self.dispatch(peer, RpcCall::RequestVote(args)).await? {
            RpcReply::RequestVote(reply) => Ok(reply),
            RpcReply::AppendEntries(_) => {
                Err(Error::Codec("mismatched reply for RequestVote".to_string()))
            }
        }
    }

    async fn append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs<C>,
    ) -> Result<AppendEntriesReply> {
        match self.dispatch(peer, RpcCall::AppendEntries(args)).await? {
            RpcReply::AppendEntries(reply) => Ok(reply),
            RpcReply::RequestVote(_) => {
                Err(Error::Codec("mismatched reply for AppendEntries".to_string()))
            }
        }
    }
}
