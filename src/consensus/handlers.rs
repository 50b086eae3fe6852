//! Inbound RPC handlers.
//!
//! Both handlers hold the node mutex for their whole duration, drop the
//! request if the node is Dead, and step down to Follower before evaluating
//! anything else whenever the request carries a higher term.

use super::{RaftNode, Role};
use crate::rpc::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::types::{Command, LogIndex};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

impl<C: Command> RaftNode<C> {
    /// Decide whether to grant a vote to the candidate.
    ///
    /// A vote is granted only when the request's term matches ours after any
    /// step-down, this node has not voted for someone else this term, and
    /// the candidate's log is at least as up-to-date as ours (higher last
    /// term, or equal last term and at least as long).
    pub fn handle_request_vote(self: &Arc<Self>, args: RequestVoteArgs) -> RequestVoteReply {
        let mut st = self.state.lock();
        if st.role == Role::Dead {
            return RequestVoteReply::default();
        }

        let (my_last_index, my_last_term) = st.log.last_index_and_term();
        if st.diagnostics {
            debug!(
                "[{}] RequestVote from {} in term {} (candidate log ({}, {}), mine ({}, {}), voted_for {:?})",
                self.id(),
                args.candidate_id,
                args.term,
                args.last_log_index,
                args.last_log_term,
                my_last_index,
                my_last_term,
                st.voted_for,
            );
        }

        if args.term > st.current_term {
            self.become_follower(&mut st, args.term);
        }

        let up_to_date = args.last_log_term > my_last_term
            || (args.last_log_term == my_last_term && args.last_log_index >= my_last_index);
        let vote_available =
            st.voted_for.is_none() || st.voted_for == Some(args.candidate_id);
        let granted = args.term == st.current_term && vote_available && up_to_date;

        if granted {
            st.voted_for = Some(args.candidate_id);
            st.election_reset_at = Instant::now();
        }
        if st.diagnostics {
            debug!(
                "[{}] vote for {} in term {}: {}",
                self.id(),
                args.candidate_id,
                st.current_term,
                granted
            );
        }
        RequestVoteReply {
            term: st.current_term,
            vote_granted: granted,
        }
    }

    /// Accept replicated entries (or a bare heartbeat) from a leader.
    ///
    /// The call succeeds when our log contains the leader's previous entry.
    /// On success the new entries are reconciled in from the first point of
    /// term disagreement, which makes redelivery of any prefix a no-op, and
    /// the follower commit index follows `leader_commit` capped at our own
    /// last index.
    pub fn handle_append_entries(
        self: &Arc<Self>,
        args: AppendEntriesArgs<C>,
    ) -> AppendEntriesReply {
        let mut st = self.state.lock();
        if st.role == Role::Dead {
            return AppendEntriesReply::default();
        }

        if st.diagnostics && !args.is_heartbeat() {
            debug!(
                "[{}] AppendEntries from {} in term {}: {} entries after ({}, {})",
                self.id(),
                args.leader_id,
                args.term,
                args.entries.len(),
                args.prev_log_index,
                args.prev_log_term,
            );
        }

        if args.term > st.current_term {
            self.become_follower(&mut st, args.term);
        }

        let mut success = false;
        if args.term == st.current_term {
            // A current-term AppendEntries can only come from the one leader
            // of this term, so a candidate yields to it.
            if st.role != Role::Follower {
                self.become_follower(&mut st, args.term);
            }
            st.election_reset_at = Instant::now();

            let prev_ok = args.prev_log_index == -1
                || (args.prev_log_index < st.log.len() as LogIndex
                    && args.prev_log_term == st.log.term_at(args.prev_log_index));
            if prev_ok {
                success = true;

                // Walk both sides while terms agree; the first mismatch (or
                // the end of either side) is the insertion point.
                let mut insert_at = args.prev_log_index + 1;
                let mut new_from = 0usize;
                while (insert_at as usize) < st.log.len()
                    && new_from < args.entries.len()
                    && st.log.term_at(insert_at) == args.entries[new_from].term
                {
                    insert_at += 1;
                    new_from += 1;
                }
                if new_from < args.entries.len() {
                    st.log.truncate_and_extend(insert_at, &args.entries[new_from..]);
                    if st.diagnostics {
                        debug!(
                            "[{}] log reconciled at index {}, now {} entries",
                            self.id(),
                            insert_at,
                            st.log.len()
                        );
                    }
                }

                if args.leader_commit > st.commit_index {
                    st.commit_index = args.leader_commit.min(st.log.last_index());
                    if st.diagnostics {
                        debug!(
                            "[{}] follower commit index set to {}",
                            self.id(),
                            st.commit_index
                        );
                    }
                    Self::signal_apply(&st);
                }
            }
        }

        AppendEntriesReply {
            term: st.current_term,
            success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::isolated_node;
    use super::*;
    use crate::types::{LogEntry, NodeId, Term};

    fn vote_args(term: Term, candidate: u64, last_index: LogIndex, last_term: Term) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id: NodeId(candidate),
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    fn append_args(
        term: Term,
        leader: u64,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<LogEntry<String>>,
        leader_commit: LogIndex,
    ) -> AppendEntriesArgs<String> {
        AppendEntriesArgs {
            term,
            leader_id: NodeId(leader),
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            leader_commit,
        }
    }

    fn entry(term: Term, cmd: &str) -> LogEntry<String> {
        LogEntry::new(term, cmd.to_string())
    }

    #[tokio::test]
    async fn vote_granted_once_per_term() {
        let (node, _) = isolated_node();
        let first = node.handle_request_vote(vote_args(1, 1, -1, -1));
        assert!(first.vote_granted);
        assert_eq!(first.term, 1);

        // Same candidate again: still granted (idempotent).
        assert!(node.handle_request_vote(vote_args(1, 1, -1, -1)).vote_granted);

        // Different candidate, same term: refused.
        let other = node.handle_request_vote(vote_args(1, 2, -1, -1));
        assert!(!other.vote_granted);
        assert_eq!(other.term, 1);
    }

    #[tokio::test]
    async fn higher_term_request_forces_step_down_and_vote_reset() {
        let (node, _) = isolated_node();
        assert!(node.handle_request_vote(vote_args(1, 1, -1, -1)).vote_granted);

        // New term arrives; the old vote no longer binds.
        let reply = node.handle_request_vote(vote_args(2, 2, -1, -1));
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 2);
        node.with_state(|st| {
            assert_eq!(st.role, Role::Follower);
            assert_eq!(st.voted_for, Some(NodeId(2)));
        });
    }

    #[tokio::test]
    async fn stale_term_vote_request_is_refused_with_current_term() {
        let (node, _) = isolated_node();
        node.with_state(|st| st.current_term = 5);
        let reply = node.handle_request_vote(vote_args(3, 1, 10, 3));
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn vote_refused_when_candidate_log_is_behind() {
        let (node, _) = isolated_node();
        node.with_state(|st| {
            st.current_term = 2;
            st.log.append(entry(1, "a"));
            st.log.append(entry(2, "b"));
        });

        // Lower last term.
        assert!(!node.handle_request_vote(vote_args(2, 1, 5, 1)).vote_granted);
        // Equal last term but shorter log.
        assert!(!node.handle_request_vote(vote_args(2, 1, 0, 2)).vote_granted);
        // Equal last term, equal length: granted.
        assert!(node.handle_request_vote(vote_args(2, 1, 1, 2)).vote_granted);
    }

    #[tokio::test]
    async fn append_entries_rejected_on_stale_term() {
        let (node, _) = isolated_node();
        node.with_state(|st| st.current_term = 4);
        let reply = node.handle_append_entries(append_args(3, 1, -1, -1, vec![], -1));
        assert!(!reply.success);
        assert_eq!(reply.term, 4);
    }

    #[tokio::test]
    async fn append_entries_rejected_on_missing_prev_entry() {
        let (node, _) = isolated_node();
        node.with_state(|st| st.current_term = 1);

        // prev_log_index beyond our (empty) log.
        let reply = node.handle_append_entries(append_args(1, 1, 0, 1, vec![entry(1, "b")], -1));
        assert!(!reply.success);

        // prev term mismatch.
        node.with_state(|st| st.log.append(entry(1, "a")));
        let reply = node.handle_append_entries(append_args(1, 1, 0, 9, vec![entry(1, "b")], -1));
        assert!(!reply.success);
    }

    #[tokio::test]
    async fn append_entries_appends_and_is_idempotent() {
        let (node, _) = isolated_node();
        let args = append_args(1, 1, -1, -1, vec![entry(1, "a"), entry(1, "b")], -1);

        assert!(node.handle_append_entries(args.clone()).success);
        let after_first = node.log_snapshot();

        // Redelivery of the same accepted call changes nothing.
        assert!(node.handle_append_entries(args).success);
        assert_eq!(node.log_snapshot(), after_first);
        assert_eq!(after_first.len(), 2);
    }

    #[tokio::test]
    async fn conflicting_tail_is_truncated_at_first_term_mismatch() {
        let (node, _) = isolated_node();
        node.with_state(|st| {
            st.current_term = 2;
            st.log.append(entry(1, "a"));
            st.log.append(entry(1, "stale-b"));
            st.log.append(entry(1, "stale-c"));
        });

        let reply = node.handle_append_entries(append_args(
            2,
            1,
            0,
            1,
            vec![entry(2, "b"), entry(2, "c")],
            -1,
        ));
        assert!(reply.success);
        let log = node.log_snapshot();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].command, "a");
        assert_eq!(log[1].command, "b");
        assert_eq!(log[1].term, 2);
        assert_eq!(log[2].command, "c");
    }

    #[tokio::test]
    async fn follower_commit_is_capped_at_its_own_last_index() {
        let (node, sink) = isolated_node();
        let reply = node.handle_append_entries(append_args(
            1,
            1,
            -1,
            -1,
            vec![entry(1, "a"), entry(1, "b")],
            10,
        ));
        assert!(reply.success);
        assert_eq!(node.commit_index(), 1);

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        let indices: Vec<_> = sink.applied().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn current_term_append_entries_demotes_a_candidate() {
        let (node, _) = isolated_node();
        node.with_state(|st| {
            st.role = Role::Candidate;
            st.current_term = 2;
            st.voted_for = Some(NodeId(0));
        });
        let reply = node.handle_append_entries(append_args(2, 1, -1, -1, vec![], -1));
        assert!(reply.success);
        node.with_state(|st| assert_eq!(st.role, Role::Follower));
    }

    #[tokio::test]
    async fn dead_node_returns_benign_empty_replies() {
        let (node, _) = isolated_node();
        node.kill();
        let vote = node.handle_request_vote(vote_args(7, 1, -1, -1));
        assert!(!vote.vote_granted);
        assert_eq!(vote.term, 0);
        let append = node.handle_append_entries(append_args(7, 1, -1, -1, vec![], -1));
        assert!(!append.success);
        node.with_state(|st| assert_eq!(st.current_term, 0));
    }
}
