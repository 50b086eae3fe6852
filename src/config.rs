//! Cluster configuration.
//!
//! All timing knobs are plain millisecond fields so a config can be written
//! as TOML without custom duration syntax. Defaults follow the reference
//! deployment: election timeouts an order of magnitude above the expected
//! RPC round trip, heartbeats strictly inside the minimum election timeout.

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and transport knobs shared by every node in a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Lower bound of the randomized election timeout. The actual timeout is
    /// drawn uniformly from [min, 2*min) each time a timer is armed.
    pub election_timeout_min_ms: u64,

    /// How often an armed election timer re-checks its deadline.
    pub timer_granularity_ms: u64,

    /// Leader broadcast period. Must stay well below the election timeout or
    /// followers will start spurious elections.
    pub heartbeat_interval_ms: u64,

    /// Fixed latency injected in front of every RPC dispatch.
    pub min_rpc_latency_ms: u64,

    /// Upper bound of the per-request random extra latency. 0 disables it.
    pub max_extra_rpc_latency_ms: u64,

    /// Capacity of the apply wake-up channel. Signals beyond capacity are
    /// dropped; the apply loop always catches up to the latest commit index.
    pub apply_channel_capacity: usize,

    /// Largest accepted RPC frame, in bytes.
    pub max_frame_bytes: usize,

    /// Timeout for establishing an outbound peer connection.
    pub connect_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 3000,
            timer_granularity_ms: 200,
            heartbeat_interval_ms: 1000,
            min_rpc_latency_ms: 20,
            max_extra_rpc_latency_ms: 500,
            apply_channel_capacity: 16,
            max_frame_bytes: 1024 * 1024,
            connect_timeout_ms: 1000,
        }
    }
}

impl ClusterConfig {
    /// Parse a configuration from TOML text. Missing fields take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Draw a fresh randomized election timeout from [min, 2*min).
    pub fn random_election_timeout(&self) -> Duration {
        let extra = rand::thread_rng().gen_range(0..self.election_timeout_min_ms);
        Duration::from_millis(self.election_timeout_min_ms + extra)
    }

    /// Draw the random extra latency attached to one outbound request.
    pub fn random_extra_latency_ms(&self) -> u64 {
        if self.max_extra_rpc_latency_ms == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..self.max_extra_rpc_latency_ms)
    }

    pub fn timer_granularity(&self) -> Duration {
        Duration::from_millis(self.timer_granularity_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn min_rpc_latency(&self) -> Duration {
        Duration::from_millis(self.min_rpc_latency_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Interval between leader scans in the harness, derived so that a scan
    /// window comfortably covers one election round.
    pub fn leader_scan_interval(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms / 4)
    }
}
