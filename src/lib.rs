//! # raft-coordinator
//!
//! A replicated state machine built on the Raft consensus protocol. A fixed
//! set of nodes elects a single leader that linearizes client commands into
//! a totally ordered log; followers replicate the leader's log and apply
//! committed entries locally, so every non-faulty node observes the same
//! command sequence as long as a majority stays mutually reachable.
//!
//! The crate splits into the consensus core ([`consensus::RaftNode`]), the
//! TCP transport with injected latency ([`transport`], [`server`]), the
//! applied-output sinks ([`sink`]), and an in-process cluster harness
//! ([`cluster::Cluster`]) used by the scenario tests.
//!
//! ## Quick start
//!
//! ```no_run
//! use raft_coordinator::{Cluster, ClusterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cluster = Cluster::new(5, ClusterConfig::default()).await?;
//!     let (leader, _term) = cluster.leader().await?;
//!     cluster.submit(leader, "Set X = 5");
//!     cluster.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod consensus;
pub mod error;
pub mod log;
pub mod rpc;
pub mod server;
pub mod sink;
pub mod transport;
pub mod types;

pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use consensus::{RaftNode, Role};
pub use error::{Error, Result};
pub use server::NodeServer;
pub use sink::{CommandSink, FileSink, MemorySink};
pub use transport::Transport;
pub use types::{Command, LogEntry, LogIndex, NodeId, Term};
