use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use multiraft::State;

mod fixtures;
use fixtures::RaftRouter;

/// §8 scenario 2: a 3-node cluster, starting at term 0 with every node a
/// follower, elects exactly one leader and every node learns the new
/// `leaderId`. It then checks that the leader's replication metrics track
/// every follower's matched index once an entry has been replicated.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_election_and_replication() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::build_test_config("leader_metrics");
    let router = Arc::new(RaftRouter::new(config));

    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    let members = btreeset! {0, 1, 2};
    router.initialize_from(0, members.clone()).await?;

    // Exactly one of the three should become leader, and the other two should learn its id.
    let timeout = Duration::from_secs(10);
    let leader_metrics = router
        .wait_for_metrics(&0, |m| m.state == State::Leader || m.current_leader.is_some(), timeout, "cluster to elect a leader")
        .await?;
    let leader_id = leader_metrics.current_leader.expect("a leader must be known");

    for id in &members {
        router.wait_for_metrics(id, |m| m.current_leader == Some(leader_id), timeout, "every node to learn the leader id").await?;
    }

    router.client_write(leader_id, "k", "v").await?;

    for id in &members {
        router.wait_for_metrics(id, |m| m.last_applied >= 1, timeout, "every node to apply the write").await?;
        let sm = router.get_state_machine(id).await;
        assert_eq!(sm.get("k").await, Some("v".to_string()));
    }

    let leader_metrics = router.metrics(&leader_id).await;
    let replication = leader_metrics.leader_metrics.expect("leader must report replication metrics").replication;
    for id in members.iter().filter(|id| **id != leader_id) {
        let rm = replication.get(id).expect("replication entry for every peer");
        assert!(rm.matched.index >= 1, "peer {} should have matched index >= 1, got {:?}", id, rm);
    }

    router.shutdown_all().await;
    Ok(())
}
