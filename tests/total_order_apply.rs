use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use multiraft::State;

mod fixtures;
use fixtures::RaftRouter;

/// §8 scenario 1: a single-node leader applies submitted entries in strict
/// index order with no gaps.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_applies_entries_in_order() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::build_test_config("total_order_apply");
    let router = Arc::new(RaftRouter::new(config));

    router.new_raft_node(0).await;
    router.initialize_from(0, btreeset! {0}).await?;
    let before = router
        .wait_for_metrics(&0, |m| m.state == State::Leader, Duration::from_secs(5), "node 0 to become leader")
        .await?
        .last_applied;

    router.client_write(0, "a", "1").await?;
    router.client_write(0, "b", "2").await?;
    router.client_write(0, "c", "3").await?;

    let target = before + 3;
    router.wait_for_metrics(&0, |m| m.last_applied >= target, Duration::from_secs(5), "last_applied to advance by 3").await?;

    let sm = router.get_state_machine(&0).await;
    assert_eq!(sm.last_applied_log().await, target);
    assert_eq!(sm.get("a").await, Some("1".to_string()));
    assert_eq!(sm.get("b").await, Some("2".to_string()));
    assert_eq!(sm.get("c").await, Some("3".to_string()));

    router.shutdown_all().await;
    Ok(())
}
