//! End-to-end consensus scenarios over the in-memory cluster.

use rapport_core::messages::WiredMessage;
use rapport_core::{NodeId, Phase, TopologyInfo, Vote};
use rapport_engine::shared_coin;
use rapport_testing::TestCluster;
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Three nodes, one client submission: the command commits everywhere and
/// the submitter gets its results back.
#[tokio::test]
async fn three_node_happy_path() {
    init_logging();
    let cluster = TestCluster::start(3).await;

    let results = cluster
        .apply_at(0, vec!["SET a 1"])
        .await
        .expect("apply must succeed with a healthy quorum");
    assert_eq!(results, vec![bytes::Bytes::from("OK")]);

    cluster
        .await_key_everywhere("a", "1", Duration::from_secs(10))
        .await;
    cluster.shutdown().await;
}

/// With unanimous round-1 votes every node takes the super-majority fast
/// path: decisions appear on the wire but no round-2 vote ever does.
#[tokio::test]
async fn unanimous_votes_skip_round_two() {
    init_logging();
    let cluster = TestCluster::start(3).await;

    cluster.apply_at(0, vec!["SET color green"]).await.unwrap();
    cluster
        .await_key_everywhere("color", "green", Duration::from_secs(10))
        .await;

    let traffic = cluster.hub.traffic();
    let decisions = traffic
        .iter()
        .filter(|record| matches!(record.message, WiredMessage::Decision { .. }))
        .count();
    assert!(decisions > 0, "decisions must be broadcast");

    let round2 = traffic
        .iter()
        .any(|record| matches!(record.message, WiredMessage::VoteRound2 { .. }));
    assert!(!round2, "fast path must never send a round-2 vote");

    cluster.shutdown().await;
}

/// Batches submitted at different nodes are applied in the same order on
/// every node, and each node's applied sequence is a prefix of the full
/// decided sequence.
#[tokio::test]
async fn application_order_is_identical_across_nodes() {
    init_logging();
    let cluster = TestCluster::start(3).await;

    for (node, key) in [(0, "a"), (1, "b"), (2, "c"), (0, "d"), (1, "e"), (2, "f")] {
        let command = format!("SET {key} {node}");
        cluster
            .apply_at(node, vec![command.as_str()])
            .await
            .unwrap();
    }

    // Wait for all six commands to land on all three nodes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let lengths: Vec<usize> = cluster
            .nodes()
            .iter()
            .map(|node| node.applied_log.lock().len())
            .collect();
        if lengths.iter().all(|len| *len == 6) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "nodes never applied all commands: {lengths:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let reference: Vec<(Phase, String)> = cluster.node(0).applied_log.lock().clone();
    for node in cluster.nodes() {
        assert_eq!(
            *node.applied_log.lock(),
            reference,
            "node {} diverged from the applied order",
            node.id
        );
    }

    cluster.shutdown().await;
}

/// A split round-1 tally at quorum drives the engine through round 2 into
/// the deterministic shared coin; the decision it broadcasts must equal
/// the coin value every other node would compute for the same phase.
#[tokio::test]
async fn split_votes_fall_back_to_the_shared_coin() {
    init_logging();
    let members: Vec<NodeId> = (1..=5).map(|i| NodeId::from(format!("n{i}"))).collect();
    let hub = rapport_testing::NetworkHub::new();
    let node = rapport_testing::build_node(
        &hub,
        members[0].clone(),
        &members,
        rapport_persistence::InMemoryStateStore::new(),
        rapport_testing::test_engine_config(),
    );

    // Scripted peers: transports that only inject messages.
    let (n3, _rx3) = hub.register(NodeId::from("n3"));
    let (n4, _rx4) = hub.register(NodeId::from("n4"));
    let (n5, _rx5) = hub.register(NodeId::from("n5"));
    for peer in &members[1..] {
        node.topology.peer_up(peer.clone());
    }

    use rapport_core::network::ClusterNetwork;
    use rapport_core::{Batch, Command, CorrelationId, StateValue};

    let phase = Phase::new(12);
    let batch = Batch::new(
        NodeId::from("n3"),
        1,
        vec![Command::new("SET coin flip")],
        CorrelationId::new(),
    );
    let n1 = members[0].clone();

    // Phase 12 belongs to n3 (12 mod 5 = 2). It propagates and proposes.
    n3.send(
        &n1,
        WiredMessage::NewBatch {
            sender: NodeId::from("n3"),
            batch: batch.clone(),
        },
    )
    .await
    .unwrap();
    n3.send(
        &n1,
        WiredMessage::Propose {
            sender: NodeId::from("n3"),
            phase,
            batch_id: batch.id.clone(),
        },
    )
    .await
    .unwrap();

    // Round 1 splits: with n1's own V1, the quorum sample holds V1:2 V0:1,
    // reaching neither the fast path nor f+1. Round-2 input is VQuestion.
    n3.send(
        &n1,
        WiredMessage::VoteRound1 {
            sender: NodeId::from("n3"),
            phase,
            value: Vote::V1,
        },
    )
    .await
    .unwrap();
    n4.send(
        &n1,
        WiredMessage::VoteRound1 {
            sender: NodeId::from("n4"),
            phase,
            value: Vote::V0,
        },
    )
    .await
    .unwrap();

    // Round 2 splits the same way: V1:1, V0:1, plus n1's own VQuestion.
    n4.send(
        &n1,
        WiredMessage::VoteRound2 {
            sender: NodeId::from("n4"),
            phase,
            value: StateValue::V1,
        },
    )
    .await
    .unwrap();
    n5.send(
        &n1,
        WiredMessage::VoteRound2 {
            sender: NodeId::from("n5"),
            phase,
            value: StateValue::V0,
        },
    )
    .await
    .unwrap();

    let topo = TopologyInfo::new(members[0].clone(), members.clone()).unwrap();
    let expected = shared_coin(topo.cluster_seed(), phase);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let decided = hub.traffic().iter().any(|record| {
            record.from == n1
                && matches!(record.message, WiredMessage::Decision { phase: p, value, .. }
                    if p == phase && value == expected)
        });
        if decided {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "engine never decided phase 12 with the shared coin"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    node.handle.stop().await.unwrap();
}
