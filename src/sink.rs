//! Applied-output sinks.
//!
//! Committed entries leave the consensus core through a [`CommandSink`].
//! The file sink writes one line per applied command so an operator (or a
//! test) can diff the applied sequence across nodes.

use crate::error::Result;
use crate::types::{Command, LogIndex, Term};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Destination for applied commands. Calls arrive in strictly increasing
/// index order with no gaps.
pub trait CommandSink<C: Command>: Send + Sync {
    fn emit(&self, command: &C, term: Term, index: LogIndex);
}

/// Append-only per-node output file.
///
/// Line format: `<command>; T:[<term>]; I:[<index>]`. The file is created
/// empty when the node is constructed so a node that never applies anything
/// still leaves a trace.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn create(dir: &Path, node: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(node.to_string());
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<C: Command> CommandSink<C> for FileSink {
    fn emit(&self, command: &C, term: Term, index: LogIndex) {
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}; T:[{}]; I:[{}]", command, term, index) {
            warn!("applied-output write to {:?} failed: {}", self.path, e);
        }
    }
}

/// One applied command as recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEntry<C> {
    pub command: C,
    pub term: Term,
    pub index: LogIndex,
}

/// In-memory sink for assertions in tests.
#[derive(Default)]
pub struct MemorySink<C> {
    entries: Mutex<Vec<AppliedEntry<C>>>,
}

impl<C: Command> MemorySink<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything applied so far, in apply order.
    pub fn applied(&self) -> Vec<AppliedEntry<C>> {
        self.entries.lock().clone()
    }

    /// Just the command payloads, in apply order.
    pub fn commands(&self) -> Vec<C> {
        self.entries.lock().iter().map(|e| e.command.clone()).collect()
    }
}

impl<C: Command> CommandSink<C> for MemorySink<C> {
    fn emit(&self, command: &C, term: Term, index: LogIndex) {
        self.entries.lock().push(AppliedEntry {
            command: command.clone(),
            term,
            index,
        });
    }
}
