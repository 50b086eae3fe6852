//! Common types shared across the consensus core, transport, and harness.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Election epoch number. Monotonically non-decreasing per node, starts at 0.
/// The value -1 is used only as the "no term" sentinel for an empty log.
pub type Term = i64;

/// Position in the replicated log. 0-based; -1 means "before the log".
pub type LogIndex = i64;

/// Commands carried through the log are opaque to the consensus core. They
/// must serialize for the wire, print for the applied-output sink, and move
/// freely between tasks.
pub trait Command:
    Clone + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Command for T where
    T: Clone + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// A single replicated log entry: the term it was accepted in by a leader,
/// and the client command it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub term: Term,
    pub command: C,
}

impl<C> LogEntry<C> {
    pub fn new(term: Term, command: C) -> Self {
        Self { term, command }
    }
}
