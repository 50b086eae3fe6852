//! Wire-level RPC records.
//!
//! Two protocol calls exist, RequestVote and AppendEntries. Requests travel
//! inside an envelope carrying a correlation id (several calls to the same
//! peer may be in flight at once) and the extra latency the sender asks the
//! receiver to simulate before dispatching.

use crate::types::{LogEntry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Vote solicitation sent by a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replication call sent by a leader. With no entries it is a pure
/// heartbeat that still transmits `leader_commit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs<C> {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: LogIndex,
}

impl<C> AppendEntriesArgs<C> {
    /// Heartbeats and entry-carrying calls log at different levels.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

/// A protocol call, tagged for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcCall<C> {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs<C>),
}

/// A protocol reply, tagged to match [`RpcCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

/// Request envelope as framed onto the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest<C> {
    /// Correlation id, unique per connection.
    pub id: u64,
    /// Extra artificial latency the receiver sleeps before dispatch.
    pub latency_ms: u64,
    pub call: RpcCall<C>,
}

/// Response envelope. `id` echoes the request it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub reply: RpcReply,
}
