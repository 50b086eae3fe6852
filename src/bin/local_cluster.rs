//! Boot a local cluster, replicate a handful of commands through it, and
//! leave each node's applied output under `node-logs/` for inspection.
//!
//! Usage: `local-cluster [config.toml]`

use anyhow::Context;
use raft_coordinator::{ClusterConfig, CommandSink, FileSink, NodeId, NodeServer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CLUSTER_SIZE: usize = 5;
const OUTPUT_DIR: &str = "node-logs";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path))?;
            ClusterConfig::from_toml_str(&text).context("parsing config")?
        }
        None => ClusterConfig::default(),
    };

    let output_dir = Path::new(OUTPUT_DIR);
    let mut servers = Vec::with_capacity(CLUSTER_SIZE);
    for i in 0..CLUSTER_SIZE {
        let peers: Vec<NodeId> = (0..CLUSTER_SIZE)
            .filter(|&p| p != i)
            .map(|p| NodeId(p as u64))
            .collect();
        let sink = Arc::new(FileSink::create(output_dir, i as u64)?)
            as Arc<dyn CommandSink<String>>;
        let server = NodeServer::start(NodeId(i as u64), peers, config.clone(), sink).await?;
        servers.push(server);
    }

    for i in 0..CLUSTER_SIZE {
        for j in 0..CLUSTER_SIZE {
            if i != j {
                servers[i]
                    .connect_to_peer(NodeId(j as u64), servers[j].addr())
                    .await?;
            }
        }
    }
    for server in &servers {
        server.activate();
    }

    // Give the cluster one election timeout to settle on a leader.
    tokio::time::sleep(Duration::from_millis(2 * config.election_timeout_min_ms)).await;

    let leader = servers
        .iter()
        .find(|s| s.node().node_state().2)
        .context("no leader elected")?;
    println!("leader is {}", leader.id());

    for command in ["Set X = 5", "Set X = 1000", "Set Y = X", "Set Z = -1"] {
        if !leader.node().submit(command.to_string()) {
            println!("leadership moved, rerun to retry");
            break;
        }
    }

    // Let the commands commit and reach every follower's applied output.
    tokio::time::sleep(Duration::from_millis(3 * config.heartbeat_interval_ms)).await;

    for server in &servers {
        let (id, term, is_leader) = server.node().node_state();
        println!(
            "{}: term={} leader={} commit_index={}",
            id,
            term,
            is_leader,
            server.node().commit_index()
        );
        server.shutdown();
    }
    println!("applied output written under {}/", OUTPUT_DIR);
    Ok(())
}
