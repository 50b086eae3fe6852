//! Error types for the coordinator.

use thiserror::Error;

/// Main error type for the crate.
///
/// Transport failures are deliberately non-fatal: a send that returns
/// [`Error::Transport`] means "no reply received" and the caller's next
/// heartbeat or election tick is the retry point.
#[derive(Error, Debug)]
pub enum Error {
    /// Peer unreachable, connection dropped, or call made after disconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// No node reported itself leader within the scan window.
    #[error("no leader elected")]
    NoLeader,

    /// Cluster harness invariant violation, e.g. two leaders in one scan.
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;
