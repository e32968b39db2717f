use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use multiraft::State;

mod fixtures;
use fixtures::RaftRouter;

/// §8 scenario 5: growing a cluster from a single voter to five members goes
/// through joint consensus (`Cold,new` committed before `Cnew`), and the new
/// voters catch up and start replicating without ever being allowed to vote
/// before they are safely part of the committed configuration.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_change_grows_cluster_through_joint_consensus() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::build_test_config("members_leader_fix_partial");
    let router = Arc::new(RaftRouter::new(config));

    router.new_raft_node(0).await;
    router.initialize_from(0, btreeset! {0}).await?;

    let timeout = Duration::from_secs(10);
    router.wait_for_metrics(&0, |m| m.state == State::Leader, timeout, "node 0 to become leader").await?;

    // Write one entry before the membership change so later reads can prove it survived.
    router.client_write(0, "seed", "1").await?;

    for id in [1, 2, 3, 4] {
        router.new_raft_node(id).await;
        router.add_non_voter(0, id).await?;
    }

    // Non-voters must catch up to the leader's log before the leader will let them vote.
    let leader_metrics = router.metrics(&0).await;
    let target_index = leader_metrics.last_log_index;
    for id in [1, 2, 3, 4] {
        router.wait_for_metrics(&id, |m| m.last_log_index >= target_index, timeout, "non-voter to catch up").await?;
    }

    let all_five = btreeset! {0, 1, 2, 3, 4};
    router.change_membership(0, all_five.clone()).await?;

    // Joint consensus commits two config-change entries: Cold,new then Cnew.
    router
        .wait_for_metrics(&0, |m| m.membership_config.members == all_five && m.membership_config.members_after_consensus.is_none(), timeout, "joint consensus to finish committing Cnew")
        .await?;

    for id in &all_five {
        router
            .wait_for_metrics(id, |m| m.membership_config.members == all_five, timeout, "every node to observe the final membership")
            .await?;
    }

    // The cluster still agrees on the write made before the reconfiguration.
    for id in &all_five {
        let sm = router.get_state_machine(id).await;
        assert_eq!(sm.get("seed").await, Some("1".to_string()));
    }

    // Remove a voter; this is again a two-phase joint-consensus change.
    let four_members = btreeset! {0, 1, 2, 3};
    router.change_membership(0, four_members.clone()).await?;
    router
        .wait_for_metrics(&0, |m| m.membership_config.members == four_members && m.membership_config.members_after_consensus.is_none(), timeout, "removal to finish committing Cnew")
        .await?;

    let leader_metrics = router.metrics(&0).await;
    let replication = leader_metrics.leader_metrics.expect("leader must report replication metrics").replication;
    assert!(!replication.contains_key(&4), "removed member should no longer be replicated to");

    router.shutdown_all().await;
    Ok(())
}
