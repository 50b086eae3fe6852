//! Consensus core.
//!
//! One [`RaftNode`] per process participates in leader election and log
//! replication with its peers. All node state lives behind a single mutex;
//! every background task (election timer, heartbeat broadcaster, apply
//! pipeline, RPC reply handling) locks it, mutates, and releases before any
//! network await. RPC arguments are snapshotted under the lock and sent
//! after release.

mod election;
mod handlers;
mod leader;

use crate::config::ClusterConfig;
use crate::log::RaftLog;
use crate::sink::CommandSink;
use crate::transport::Transport;
use crate::types::{Command, LogEntry, LogIndex, NodeId, Term};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Role of a node in the cluster. `Dead` is terminal; a dead node drops all
/// RPCs and never rejoins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Dead,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "Follower",
            Role::Candidate => "Candidate",
            Role::Leader => "Leader",
            Role::Dead => "Dead",
        };
        f.write_str(name)
    }
}

/// Mutable node state guarded by the node mutex.
pub(crate) struct NodeState<C: Command> {
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: RaftLog<C>,

    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,

    pub(crate) role: Role,

    /// Per-peer replication progress. Meaningful only while Leader.
    pub(crate) next_index: HashMap<NodeId, LogIndex>,
    pub(crate) match_index: HashMap<NodeId, LogIndex>,

    /// Instant the election timer last restarted counting from.
    pub(crate) election_reset_at: Instant,

    /// Gates this node's diagnostic output. The harness quiets partitioned
    /// nodes so their doomed retries do not drown the logs.
    pub(crate) diagnostics: bool,

    /// Wake-up side of the apply pipeline. `None` once the node is killed,
    /// which is what drains and stops the apply task.
    pub(crate) apply_tx: Option<mpsc::Sender<()>>,
}

/// A single consensus participant.
pub struct RaftNode<C: Command> {
    id: NodeId,
    peers: Vec<NodeId>,
    config: ClusterConfig,
    transport: Arc<dyn Transport<C>>,
    sink: Arc<dyn CommandSink<C>>,
    state: Mutex<NodeState<C>>,
}

impl<C: Command> RaftNode<C> {
    /// Create a node in the Follower role with an empty log and spawn its
    /// apply pipeline. The election timer stays unarmed until
    /// [`RaftNode::activate`] so a cluster can finish wiring first.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: ClusterConfig,
        transport: Arc<dyn Transport<C>>,
        sink: Arc<dyn CommandSink<C>>,
    ) -> Arc<Self> {
        let (apply_tx, apply_rx) = mpsc::channel(config.apply_channel_capacity.max(1));
        let node = Arc::new(Self {
            id,
            peers,
            config,
            transport,
            sink,
            state: Mutex::new(NodeState {
                current_term: 0,
                voted_for: None,
                log: RaftLog::new(),
                commit_index: -1,
                last_applied: -1,
                role: Role::Follower,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                election_reset_at: Instant::now(),
                diagnostics: true,
                apply_tx: Some(apply_tx),
            }),
        });
        tokio::spawn(Arc::clone(&node).run_apply_loop(apply_rx));
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Arm the first election timer. Called once the whole cluster is up and
    /// reachable, mirroring a real deployment's start barrier.
    pub fn activate(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.election_reset_at = Instant::now();
        }
        self.spawn_election_timer();
    }

    /// Offer a client command. Accepted only while this node is Leader; the
    /// command is appended to the local log in the current term and will
    /// reach peers on the next heartbeat. Rejected submissions return false
    /// and the caller may retry against another node.
    pub fn submit(&self, command: C) -> bool {
        let mut st = self.state.lock();
        if st.diagnostics {
            debug!("[{}] command offered while {}: {}", self.id, st.role, command);
        }
        if st.role != Role::Leader {
            return false;
        }
        let term = st.current_term;
        st.log.append(LogEntry::new(term, command));
        if st.diagnostics {
            info!(
                "[{}] accepted command at index {} in term {}",
                self.id,
                st.log.last_index(),
                term
            );
        }
        true
    }

    /// (id, current term, is leader) snapshot for harness leader scans.
    pub fn node_state(&self) -> (NodeId, Term, bool) {
        let st = self.state.lock();
        (self.id, st.current_term, st.role == Role::Leader)
    }

    /// Clone of the full log, for inspection by tests and the harness.
    pub fn log_snapshot(&self) -> Vec<LogEntry<C>> {
        self.state.lock().log.snapshot()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.lock().commit_index
    }

    /// Toggle this node's diagnostic output.
    pub fn set_diagnostics(&self, enabled: bool) {
        self.state.lock().diagnostics = enabled;
    }

    /// Shut the node down: mark it Dead so no new work starts, then close
    /// the apply channel so the apply task drains and exits. Tasks still in
    /// flight observe Dead on their next lock and do nothing.
    pub fn kill(&self) {
        let mut st = self.state.lock();
        if st.role == Role::Dead {
            return;
        }
        st.role = Role::Dead;
        if st.diagnostics {
            info!("[{}] killed", self.id);
        }
        st.apply_tx = None;
    }

    /// Total voting members, this node included.
    pub(crate) fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Wake the apply pipeline. Wake-ups coalesce: the channel is bounded
    /// and a full buffer is fine because the apply loop always reads up to
    /// the latest commit index.
    pub(crate) fn signal_apply(st: &NodeState<C>) {
        if let Some(tx) = &st.apply_tx {
            let _ = tx.try_send(());
        }
    }

    async fn run_apply_loop(self: Arc<Self>, mut wakeups: mpsc::Receiver<()>) {
        while wakeups.recv().await.is_some() {
            self.apply_committed();
        }
        debug!("[{}] apply pipeline stopped", self.id);
    }

    /// Deliver every committed-but-unapplied entry to the sink, in index
    /// order, then advance `last_applied`.
    fn apply_committed(&self) {
        let mut st = self.state.lock();
        if st.commit_index <= st.last_applied {
            return;
        }
        let first = st.last_applied + 1;
        let entries = st.log.slice(first, st.commit_index + 1);
        for (offset, entry) in entries.iter().enumerate() {
            self.sink.emit(&entry.command, st.current_term, first + offset as LogIndex);
        }
        st.last_applied = st.commit_index;
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut NodeState<C>) -> R) -> R {
        f(&mut self.state.lock())
    }
}
