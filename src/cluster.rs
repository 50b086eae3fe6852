//! In-process cluster harness.
//!
//! Boots n nodes on loopback, wires the full mesh, and exposes the
//! partition/heal/submit/inspect operations the scenario tests drive.
//! Commands are plain strings and applied output lands in per-node memory
//! sinks so tests can diff the applied sequences across nodes.

use crate::config::ClusterConfig;
use crate::consensus::RaftNode;
use crate::error::{Error, Result};
use crate::server::NodeServer;
use crate::sink::{AppliedEntry, CommandSink, MemorySink};
use crate::types::{LogEntry, NodeId, Term};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::info;

/// A running cluster of string-command nodes.
pub struct Cluster {
    servers: Vec<Arc<NodeServer<String>>>,
    sinks: Vec<Arc<MemorySink<String>>>,
    connected: Vec<bool>,
    config: ClusterConfig,
}

impl Cluster {
    /// Start `n` nodes, connect every pair, then arm all election timers.
    pub async fn new(n: usize, config: ClusterConfig) -> Result<Self> {
        let mut servers = Vec::with_capacity(n);
        let mut sinks = Vec::with_capacity(n);
        for i in 0..n {
            let peers: Vec<NodeId> = (0..n)
                .filter(|&p| p != i)
                .map(|p| NodeId(p as u64))
                .collect();
            let sink = Arc::new(MemorySink::new());
            let server = NodeServer::start(
                NodeId(i as u64),
                peers,
                config.clone(),
                Arc::clone(&sink) as Arc<dyn CommandSink<String>>,
            )
            .await?;
            sinks.push(sink);
            servers.push(server);
        }

        let mut wiring = Vec::new();
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    wiring.push(servers[i].connect_to_peer(NodeId(j as u64), servers[j].addr()));
                }
            }
        }
        futures::future::try_join_all(wiring).await?;

        // Timers arm only once the whole mesh is reachable.
        for server in &servers {
            server.activate();
        }

        Ok(Self {
            servers,
            sinks,
            connected: vec![true; n],
            config,
        })
    }

    pub fn size(&self) -> usize {
        self.servers.len()
    }

    pub fn node(&self, i: usize) -> &Arc<RaftNode<String>> {
        self.servers[i].node()
    }

    /// Cut node `i` off from every other node, both directions. The node
    /// keeps running; its diagnostics are quieted so its doomed retries do
    /// not flood the logs.
    pub fn disconnect(&mut self, i: usize) {
        info!("[harness] disconnecting node {}", i);
        self.servers[i].disconnect_all();
        for j in 0..self.servers.len() {
            if j != i {
                self.servers[j].disconnect_peer(NodeId(i as u64));
            }
        }
        self.connected[i] = false;
        self.servers[i].node().set_diagnostics(false);
    }

    /// Reconnect node `i` to every node that is itself connected.
    pub async fn reconnect(&mut self, i: usize) -> Result<()> {
        info!("[harness] reconnecting node {}", i);
        for j in 0..self.servers.len() {
            if j != i && self.connected[j] {
                self.servers[i]
                    .connect_to_peer(NodeId(j as u64), self.servers[j].addr())
                    .await?;
                self.servers[j]
                    .connect_to_peer(NodeId(i as u64), self.servers[i].addr())
                    .await?;
            }
        }
        self.connected[i] = true;
        self.servers[i].node().set_diagnostics(true);
        Ok(())
    }

    /// Scan the connected nodes for a leader, retrying for a while. Fails
    /// fast if two connected nodes claim leadership in the same scan, and
    /// with [`Error::NoLeader`] once the retries are exhausted.
    pub async fn leader(&self) -> Result<(usize, Term)> {
        for _ in 0..20 {
            let mut found: Option<(usize, Term)> = None;
            for (i, server) in self.servers.iter().enumerate() {
                if !self.connected[i] {
                    continue;
                }
                let (_, term, is_leader) = server.node().node_state();
                if is_leader {
                    if let Some((other, _)) = found {
                        return Err(Error::Cluster(format!(
                            "nodes {} and {} both claim leadership",
                            other, i
                        )));
                    }
                    found = Some((i, term));
                }
            }
            if let Some(leader) = found {
                return Ok(leader);
            }
            sleep(self.config.leader_scan_interval()).await;
        }
        Err(Error::NoLeader)
    }

    /// Submit a command to node `i`. True iff that node accepted it as
    /// leader.
    pub fn submit(&self, i: usize, command: &str) -> bool {
        self.servers[i].node().submit(command.to_string())
    }

    /// Applied output of node `i`, in apply order.
    pub fn applied(&self, i: usize) -> Vec<AppliedEntry<String>> {
        self.sinks[i].applied()
    }

    /// Applied command payloads of node `i`, in apply order.
    pub fn applied_commands(&self, i: usize) -> Vec<String> {
        self.sinks[i].commands()
    }

    /// Snapshot of node `i`'s log.
    pub fn log_of(&self, i: usize) -> Vec<LogEntry<String>> {
        self.servers[i].node().log_snapshot()
    }

    /// Tear the whole cluster down: sever every link, then kill every node.
    pub fn shutdown(&mut self) {
        info!("[harness] shutting the cluster down");
        for i in 0..self.servers.len() {
            self.servers[i].disconnect_all();
            self.connected[i] = false;
        }
        for server in &self.servers {
            server.shutdown();
        }
    }
}
