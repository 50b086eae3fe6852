//! Leader replication and commit advance.
//!
//! A freshly elected leader starts one broadcast task that fires every
//! heartbeat interval for as long as the node stays leader. Each fire sends
//! an AppendEntries to every peer concurrently, carrying whatever suffix of
//! the log that peer still needs (possibly nothing, a bare heartbeat).
//! Replies come back on their own tasks and are validated against the
//! current role and term before they touch any state.

use super::{NodeState, RaftNode, Role};
use crate::rpc::{AppendEntriesArgs, AppendEntriesReply};
use crate::types::{Command, LogIndex, NodeId, Term};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info};

impl<C: Command> RaftNode<C> {
    /// Step up as leader of the current term. Replication progress starts
    /// optimistic: every peer is assumed to hold our whole log, and the
    /// consistency check walks `next_index` back for peers that do not.
    /// No entry is appended on step-up, so a new leader cannot commit
    /// anything until it accepts a fresh client command.
    pub(crate) fn become_leader(self: &Arc<Self>, st: &mut NodeState<C>) {
        st.role = Role::Leader;
        let next = st.log.len() as LogIndex;
        for &peer in &self.peers {
            st.next_index.insert(peer, next);
            st.match_index.insert(peer, -1);
        }
        if st.diagnostics {
            info!(
                "[{}] became leader in term {} with {} log entries",
                self.id(),
                st.current_term,
                st.log.len()
            );
        }

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run_heartbeat_loop().await;
        });
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        loop {
            self.broadcast_append_entries();
            sleep(self.config.heartbeat_interval()).await;
            let still_leader = self.state.lock().role == Role::Leader;
            if !still_leader {
                return;
            }
        }
    }

    /// One broadcast round: dispatch an AppendEntries to every peer on its
    /// own task.
    fn broadcast_append_entries(self: &Arc<Self>) {
        let term = {
            let st = self.state.lock();
            if st.role != Role::Leader {
                return;
            }
            st.current_term
        };
        for &peer in &self.peers {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.replicate_to_peer(peer, term).await;
            });
        }
    }

    async fn replicate_to_peer(self: Arc<Self>, peer: NodeId, term: Term) {
        // Snapshot the arguments under the lock, send after release.
        let (args, diagnostics) = {
            let st = self.state.lock();
            if st.role != Role::Leader || st.current_term != term {
                return;
            }
            let next_index = st
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(st.log.len() as LogIndex);
            let prev_log_index = next_index - 1;
            let args = AppendEntriesArgs {
                term,
                leader_id: self.id(),
                prev_log_index,
                prev_log_term: st.log.term_at(prev_log_index),
                entries: st.log.entries_from(next_index),
                leader_commit: st.commit_index,
            };
            (args, st.diagnostics)
        };

        let prev_log_index = args.prev_log_index;
        let sent_entries = args.entries.len();
        if diagnostics && !args.is_heartbeat() {
            debug!(
                "[{}] sending {} entries to {} after index {}",
                self.id(),
                sent_entries,
                peer,
                prev_log_index
            );
        }

        match self.transport.append_entries(peer, args).await {
            Ok(reply) => self.process_append_reply(peer, term, prev_log_index, sent_entries, reply),
            Err(e) => debug!("[{}] replication to {} failed: {}", self.id(), peer, e),
        }
    }

    /// Fold one peer's reply back into replication progress.
    pub(crate) fn process_append_reply(
        self: &Arc<Self>,
        peer: NodeId,
        sent_term: Term,
        prev_log_index: LogIndex,
        sent_entries: usize,
        reply: AppendEntriesReply,
    ) {
        let mut st = self.state.lock();
        if st.role == Role::Dead {
            return;
        }
        if reply.term > st.current_term {
            self.become_follower(&mut st, reply.term);
            return;
        }
        if st.role != Role::Leader || reply.term != st.current_term || sent_term != st.current_term
        {
            return;
        }

        if reply.success {
            let matched = prev_log_index + sent_entries as LogIndex;
            st.match_index.insert(peer, matched);
            st.next_index.insert(peer, matched + 1);
            self.advance_commit_index(&mut st);
        } else {
            // The peer is missing our previous entry. Back off one index and
            // let the next heartbeat probe an earlier prefix.
            let next = st.next_index.get(&peer).copied().unwrap_or(0);
            let backed_off = (next - 1).max(0);
            st.next_index.insert(peer, backed_off);
            if st.diagnostics {
                debug!(
                    "[{}] {} rejected entries, next index backs off to {}",
                    self.id(),
                    peer,
                    backed_off
                );
            }
        }
    }

    /// Commit every index a majority has replicated, restricted to entries
    /// of the current term. Earlier-term entries commit only transitively,
    /// carried by a later current-term commit.
    fn advance_commit_index(self: &Arc<Self>, st: &mut NodeState<C>) {
        let before = st.commit_index;
        for i in (st.commit_index + 1)..(st.log.len() as LogIndex) {
            if st.log.term_at(i) != st.current_term {
                continue;
            }
            let mut replicas = 1;
            for peer in &self.peers {
                if st.match_index.get(peer).copied().unwrap_or(-1) >= i {
                    replicas += 1;
                }
            }
            if replicas * 2 > self.cluster_size() {
                st.commit_index = i;
            }
        }
        if st.commit_index != before {
            if st.diagnostics {
                info!(
                    "[{}] commit index advanced from {} to {}",
                    self.id(),
                    before,
                    st.commit_index
                );
            }
            Self::signal_apply(st);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::isolated_node;
    use super::*;
    use crate::types::LogEntry;

    fn entry(term: Term, cmd: &str) -> LogEntry<String> {
        LogEntry::new(term, cmd.to_string())
    }

    /// Put the node in a leader state with the given log.
    fn make_leader(node: &Arc<RaftNode<String>>, term: Term, entries: Vec<LogEntry<String>>) {
        node.with_state(|st| {
            st.current_term = term;
            for e in entries {
                st.log.append(e);
            }
        });
        node.with_state(|st| node.become_leader(st));
    }

    fn ok_reply(term: Term) -> AppendEntriesReply {
        AppendEntriesReply { term, success: true }
    }

    #[tokio::test]
    async fn step_up_resets_replication_progress() {
        let (node, _) = isolated_node();
        make_leader(&node, 2, vec![entry(1, "a"), entry(2, "b")]);
        node.with_state(|st| {
            for peer in 1..=4u64 {
                assert_eq!(st.next_index[&NodeId(peer)], 2);
                assert_eq!(st.match_index[&NodeId(peer)], -1);
            }
        });
        node.kill();
    }

    #[tokio::test]
    async fn successful_reply_advances_match_and_next() {
        let (node, _) = isolated_node();
        make_leader(&node, 1, vec![entry(1, "a"), entry(1, "b")]);

        node.process_append_reply(NodeId(1), 1, -1, 2, ok_reply(1));
        node.with_state(|st| {
            assert_eq!(st.match_index[&NodeId(1)], 1);
            assert_eq!(st.next_index[&NodeId(1)], 2);
        });
        node.kill();
    }

    #[tokio::test]
    async fn rejection_backs_next_index_off_with_a_floor_at_zero() {
        let (node, _) = isolated_node();
        make_leader(&node, 1, vec![entry(1, "a")]);

        let reject = AppendEntriesReply { term: 1, success: false };
        node.process_append_reply(NodeId(1), 1, 0, 0, reject.clone());
        node.with_state(|st| assert_eq!(st.next_index[&NodeId(1)], 0));

        // Already at zero: stays there.
        node.process_append_reply(NodeId(1), 1, -1, 0, reject);
        node.with_state(|st| assert_eq!(st.next_index[&NodeId(1)], 0));
        node.kill();
    }

    #[tokio::test]
    async fn majority_replication_commits_current_term_entries() {
        let (node, sink) = isolated_node();
        make_leader(&node, 1, vec![entry(1, "a"), entry(1, "b")]);

        // One of four peers confirms: 2 of 5 replicas, no commit.
        node.process_append_reply(NodeId(1), 1, -1, 2, ok_reply(1));
        assert_eq!(node.commit_index(), -1);

        // A second confirms: 3 of 5, both entries commit.
        node.process_append_reply(NodeId(2), 1, -1, 2, ok_reply(1));
        assert_eq!(node.commit_index(), 1);

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        assert_eq!(
            sink.commands(),
            vec!["a".to_string(), "b".to_string()]
        );
        node.kill();
    }

    #[tokio::test]
    async fn prior_term_entries_never_commit_on_replication_alone() {
        let (node, _) = isolated_node();
        // Leader of term 2 still carrying only a term-1 entry.
        make_leader(&node, 2, vec![entry(1, "old")]);

        for peer in 1..=4u64 {
            node.process_append_reply(NodeId(peer), 2, -1, 1, ok_reply(2));
        }
        // Fully replicated, yet not committed: wrong term.
        assert_eq!(node.commit_index(), -1);
        node.kill();
    }

    #[tokio::test]
    async fn current_term_commit_carries_prior_term_entries() {
        let (node, sink) = isolated_node();
        make_leader(&node, 2, vec![entry(1, "old"), entry(2, "new")]);

        node.process_append_reply(NodeId(1), 2, -1, 2, ok_reply(2));
        node.process_append_reply(NodeId(2), 2, -1, 2, ok_reply(2));
        // The term-2 commit at index 1 carries the term-1 entry at index 0.
        assert_eq!(node.commit_index(), 1);

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        let indices: Vec<_> = sink.applied().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1]);
        node.kill();
    }

    #[tokio::test]
    async fn higher_term_reply_demotes_the_leader() {
        let (node, _) = isolated_node();
        make_leader(&node, 1, vec![]);

        let reply = AppendEntriesReply { term: 3, success: false };
        node.process_append_reply(NodeId(1), 1, -1, 0, reply);
        node.with_state(|st| {
            assert_eq!(st.role, Role::Follower);
            assert_eq!(st.current_term, 3);
            assert_eq!(st.voted_for, None);
        });
        node.kill();
    }

    #[tokio::test]
    async fn stale_term_replies_are_ignored() {
        let (node, _) = isolated_node();
        make_leader(&node, 3, vec![entry(3, "a")]);

        // Reply from an earlier broadcast round, sent in term 2.
        node.process_append_reply(NodeId(1), 2, -1, 1, ok_reply(2));
        node.with_state(|st| {
            assert_eq!(st.match_index[&NodeId(1)], -1);
            assert_eq!(st.next_index[&NodeId(1)], 1);
        });
        assert_eq!(node.commit_index(), -1);
        node.kill();
    }
}
