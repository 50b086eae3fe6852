//! Election timer and candidacy.
//!
//! Every follower keeps a timer armed with a randomized timeout. A timer
//! belongs to the term it was armed in: the moment the node's term moves or
//! the node stops being a follower or candidate, the timer quietly exits.
//! Expiry opens a new term with this node as candidate. A parallel timer is
//! armed alongside every election so a split vote resolves itself at the
//! next expiry.

use super::{NodeState, RaftNode, Role};
use crate::rpc::RequestVoteArgs;
use crate::types::{Command, LogIndex, NodeId, Term};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, info};

impl<C: Command> RaftNode<C> {
    pub(crate) fn spawn_election_timer(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run_election_timer().await;
        });
    }

    async fn run_election_timer(self: Arc<Self>) {
        let timeout = self.config.random_election_timeout();
        let term_started = {
            let st = self.state.lock();
            if st.diagnostics {
                debug!(
                    "[{}] election timer armed for {:?} in term {}",
                    self.id(),
                    timeout,
                    st.current_term
                );
            }
            st.current_term
        };

        loop {
            sleep(self.config.timer_granularity()).await;

            // The guard must not live past this block: the next loop turn
            // suspends on the timer again.
            let done = {
                let mut st = self.state.lock();
                if st.role != Role::Follower && st.role != Role::Candidate {
                    true
                } else if st.current_term != term_started {
                    // A newer timer owns the current term.
                    true
                } else if st.election_reset_at.elapsed() >= timeout {
                    self.start_election(&mut st);
                    true
                } else {
                    false
                }
            };
            if done {
                return;
            }
        }
    }

    /// Open a new term as candidate and solicit votes from every peer.
    /// Called with the node mutex held; the vote requests themselves go out
    /// on separate tasks after the lock is released.
    fn start_election(self: &Arc<Self>, st: &mut NodeState<C>) {
        st.role = Role::Candidate;
        st.current_term += 1;
        let term = st.current_term;
        st.election_reset_at = Instant::now();
        st.voted_for = Some(self.id());
        let (last_log_index, last_log_term) = st.log.last_index_and_term();
        if st.diagnostics {
            info!("[{}] became candidate in term {}", self.id(), term);
        }

        // Self-vote is counted up front.
        let votes = Arc::new(AtomicUsize::new(1));
        for &peer in &self.peers {
            let node = Arc::clone(self);
            let votes = Arc::clone(&votes);
            tokio::spawn(async move {
                node.solicit_vote(peer, term, last_log_index, last_log_term, votes)
                    .await;
            });
        }

        // If this election stalls, the next expiry opens the term after it.
        self.spawn_election_timer();
    }

    async fn solicit_vote(
        self: Arc<Self>,
        peer: NodeId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
        votes: Arc<AtomicUsize>,
    ) {
        let args = RequestVoteArgs {
            term,
            candidate_id: self.id(),
            last_log_index,
            last_log_term,
        };
        {
            let st = self.state.lock();
            if st.diagnostics {
                debug!("[{}] requesting vote from {} in term {}", self.id(), peer, term);
            }
        }

        let reply = match self.transport.request_vote(peer, args).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("[{}] no vote reply from {}: {}", self.id(), peer, e);
                return;
            }
        };

        let mut st = self.state.lock();
        if st.role != Role::Candidate || st.current_term != term {
            if st.diagnostics {
                debug!(
                    "[{}] vote reply from {} arrived too late (now {} in term {})",
                    self.id(),
                    peer,
                    st.role,
                    st.current_term
                );
            }
            return;
        }

        if reply.term > term {
            self.become_follower(&mut st, reply.term);
            return;
        }
        if reply.term == term && reply.vote_granted {
            let granted = votes.fetch_add(1, Ordering::SeqCst) + 1;
            if granted * 2 > self.cluster_size() {
                if st.diagnostics {
                    info!(
                        "[{}] won the election for term {} with {} votes",
                        self.id(),
                        term,
                        granted
                    );
                }
                self.become_leader(&mut st);
            }
        }
    }

    /// Step down to follower at `term`, reset the vote, and arm a fresh
    /// election timer.
    pub(crate) fn become_follower(self: &Arc<Self>, st: &mut NodeState<C>, term: Term) {
        if st.diagnostics {
            info!("[{}] became follower in term {}", self.id(), term);
        }
        st.role = Role::Follower;
        st.current_term = term;
        st.voted_for = None;
        st.election_reset_at = Instant::now();
        self.spawn_election_timer();
    }
}
