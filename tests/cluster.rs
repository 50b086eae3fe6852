//! Multi-node scenario tests.
//!
//! These run real clusters over loopback TCP with scaled-down timings and
//! injected RPC latency. Waits are generous multiples of the configured
//! timeouts so the assertions hold across slow machines and schedulers.

use raft_coordinator::{Cluster, ClusterConfig, Error, Term};
use std::time::Duration;
use tokio::time::sleep;

fn scaled() -> ClusterConfig {
    ClusterConfig {
        election_timeout_min_ms: 400,
        timer_granularity_ms: 20,
        heartbeat_interval_ms: 120,
        min_rpc_latency_ms: 2,
        max_extra_rpc_latency_ms: 30,
        ..ClusterConfig::default()
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// One settle period: long enough for submissions to commit and reach every
/// follower's applied output.
async fn settle() {
    sleep(Duration::from_millis(1500)).await;
}

/// Find a leader, allowing a few full scan windows for contested elections.
async fn wait_leader(cluster: &Cluster) -> (usize, Term) {
    for _ in 0..3 {
        if let Ok(leader) = cluster.leader().await {
            return leader;
        }
    }
    panic!("no leader emerged");
}

/// Assert a node applied exactly `expected`, in order, at indices 0..len.
fn assert_applied(cluster: &Cluster, node: usize, expected: &[&str]) {
    let applied = cluster.applied(node);
    let commands: Vec<&str> = applied.iter().map(|e| e.command.as_str()).collect();
    assert_eq!(commands, expected, "node {} applied sequence", node);
    let indices: Vec<i64> = applied.iter().map(|e| e.index).collect();
    let expected_indices: Vec<i64> = (0..expected.len() as i64).collect();
    assert_eq!(indices, expected_indices, "node {} applied indices", node);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn elects_a_single_leader_and_survives_repeated_leader_loss() {
    init_tracing();
    let mut cluster = Cluster::new(5, scaled()).await.unwrap();

    let (first, first_term) = wait_leader(&cluster).await;

    cluster.disconnect(first);
    let (second, second_term) = wait_leader(&cluster).await;
    assert_ne!(second, first);
    assert!(second_term > first_term, "new leader must hold a higher term");

    cluster.disconnect(second);
    let (third, third_term) = wait_leader(&cluster).await;
    assert!(third != first && third != second);
    assert!(third_term > second_term);

    // Three of five gone: the remaining pair cannot reach a majority.
    cluster.disconnect(third);
    match cluster.leader().await {
        Err(Error::NoLeader) => {}
        other => panic!("expected no leader without a majority, got {:?}", other.map(|l| l.0)),
    }

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicates_commands_to_every_node() {
    init_tracing();
    let mut cluster = Cluster::new(5, scaled()).await.unwrap();

    let (leader, _) = wait_leader(&cluster).await;
    assert!(cluster.submit(leader, "Set X = 5"));
    assert!(cluster.submit(leader, "Set X = 1000"));
    settle().await;

    for node in 0..cluster.size() {
        assert_applied(&cluster, node, &["Set X = 5", "Set X = 1000"]);
    }

    // Logs agree entry by entry, terms included.
    let reference = cluster.log_of(0);
    for node in 1..cluster.size() {
        let log = cluster.log_of(node);
        assert_eq!(log.len(), reference.len());
        for (a, b) in log.iter().zip(reference.iter()) {
            assert_eq!(a.term, b.term);
            assert_eq!(a.command, b.command);
        }
    }

    // Followers refuse client commands.
    let follower = (0..cluster.size()).find(|&i| i != leader).unwrap();
    assert!(!cluster.submit(follower, "Set Y = 1"));

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replication_survives_leader_change_and_truncates_the_stale_tail() {
    init_tracing();
    let mut cluster = Cluster::new(5, scaled()).await.unwrap();

    let (old_leader, _) = wait_leader(&cluster).await;
    assert!(cluster.submit(old_leader, "Set X = 5"));
    assert!(cluster.submit(old_leader, "Set X = 1000"));
    settle().await;
    for node in 0..cluster.size() {
        assert_applied(&cluster, node, &["Set X = 5", "Set X = 1000"]);
    }

    // Partition the leader. It has not noticed yet, so it still accepts a
    // command that must never commit.
    cluster.disconnect(old_leader);
    assert!(cluster.submit(old_leader, "Set X = X-5"));

    let (new_leader, _) = wait_leader(&cluster).await;
    assert_ne!(new_leader, old_leader);

    let follow_up = [
        "Set X = X+10",
        "Set X = X+1",
        "Set Y = 5",
        "Set Y = X+Y",
        "Set Y = Y+3",
        "Set Z = -1",
        "Set Z = 3",
    ];
    for command in follow_up {
        assert!(cluster.submit(new_leader, command));
    }
    settle().await;

    let mut expected = vec!["Set X = 5", "Set X = 1000"];
    expected.extend_from_slice(&follow_up);
    for node in 0..cluster.size() {
        if node == old_leader {
            continue;
        }
        assert_applied(&cluster, node, &expected);
    }

    // The stale entry sits only in the partitioned leader's log.
    assert!(cluster
        .log_of(old_leader)
        .iter()
        .any(|e| e.command == "Set X = X-5"));

    // Heal the partition: the old leader steps down, truncates its stale
    // tail, and catches up to the majority log.
    cluster.reconnect(old_leader).await.unwrap();
    sleep(Duration::from_millis(2500)).await;

    let healed = cluster.log_of(old_leader);
    assert_eq!(healed.len(), expected.len());
    assert!(healed.iter().all(|e| e.command != "Set X = X-5"));
    assert_applied(&cluster, old_leader, &expected);

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_healthy_leader_suppresses_elections() {
    init_tracing();
    let mut cluster = Cluster::new(3, scaled()).await.unwrap();

    let (leader, term) = wait_leader(&cluster).await;

    // Many election timeouts pass; heartbeats keep every follower quiet.
    sleep(Duration::from_millis(3000)).await;

    let (leader_after, term_after) = cluster.leader().await.unwrap();
    assert_eq!(leader_after, leader);
    assert_eq!(term_after, term);

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terms_never_move_backwards() {
    init_tracing();
    let mut cluster = Cluster::new(3, scaled()).await.unwrap();

    let mut last_terms = vec![0i64; cluster.size()];
    let (leader, _) = wait_leader(&cluster).await;
    cluster.disconnect(leader);
    let _ = wait_leader(&cluster).await;
    cluster.reconnect(leader).await.unwrap();

    for _ in 0..10 {
        sleep(Duration::from_millis(200)).await;
        for node in 0..cluster.size() {
            let (_, term, _) = cluster.node(node).node_state();
            assert!(
                term >= last_terms[node],
                "node {} term went from {} to {}",
                node,
                last_terms[node],
                term
            );
            last_terms[node] = term;
        }
    }

    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cluster_rejects_everything() {
    init_tracing();
    let mut cluster = Cluster::new(3, scaled()).await.unwrap();
    let (leader, _) = wait_leader(&cluster).await;
    cluster.shutdown();

    assert!(!cluster.submit(leader, "Set X = 5"));
    assert!(matches!(cluster.leader().await, Err(Error::NoLeader)));
}
