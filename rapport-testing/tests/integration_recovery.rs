//! Snapshot-based recovery of a node that fell behind.

use rapport_engine::EngineMode;
use rapport_testing::TestCluster;
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn wait_for_mode(node: &rapport_testing::ClusterNode, mode: EngineMode) {
    for _ in 0..500 {
        if let Ok(status) = node.handle.status().await {
            if status.mode == mode {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("node {} never reached mode {mode:?}", node.id);
}

/// A stopped node restarts from its persisted snapshot, notices it is
/// behind once new phases flow, and catches up through a sync response.
#[tokio::test]
async fn restarted_node_catches_up_from_a_snapshot() {
    init_logging();
    let mut cluster = TestCluster::start(3).await;

    cluster.apply_at(0, vec!["SET a 1"]).await.unwrap();
    cluster.apply_at(1, vec!["SET b 2"]).await.unwrap();
    cluster
        .await_key_everywhere("b", "2", Duration::from_secs(10))
        .await;

    // Stop n3; its persistence keeps the snapshot written on shutdown.
    let persistence = cluster.stop_node(2).await;

    // The surviving majority keeps deciding phases n3 never sees.
    cluster.apply_at(0, vec!["SET c 3"]).await.unwrap();
    cluster.apply_at(1, vec!["SET d 4"]).await.unwrap();

    cluster.restart_node(2, persistence).await;
    wait_for_mode(cluster.node(2), EngineMode::Active).await;

    // The restarted node restored its pre-shutdown state.
    assert_eq!(cluster.node(2).kv.get("a"), Some("1".to_string()));

    // New traffic exposes the gap; the node syncs and converges.
    cluster.apply_at(0, vec!["SET e 5"]).await.unwrap();
    cluster
        .await_key_everywhere("e", "5", Duration::from_secs(15))
        .await;
    cluster
        .await_state_match(0, 2, Duration::from_secs(15))
        .await;
    assert_eq!(cluster.node(2).kv.get("c"), Some("3".to_string()));
    assert_eq!(cluster.node(2).kv.get("d"), Some("4".to_string()));

    cluster.shutdown().await;
}

/// Stopping a node flushes a final snapshot, so a restart with no
/// intervening cluster progress needs no sync at all.
#[tokio::test]
async fn clean_restart_restores_local_state() {
    init_logging();
    let mut cluster = TestCluster::start(3).await;

    cluster.apply_at(0, vec!["SET keep me"]).await.unwrap();
    cluster
        .await_key_everywhere("keep", "me", Duration::from_secs(10))
        .await;

    let persistence = cluster.stop_node(2).await;
    cluster.restart_node(2, persistence).await;
    wait_for_mode(cluster.node(2), EngineMode::Active).await;

    assert_eq!(cluster.node(2).kv.get("keep"), Some("me".to_string()));
    cluster.shutdown().await;
}
