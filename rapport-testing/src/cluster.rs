//! Multi-node cluster harness.
//!
//! Wires N full nodes (router, engine, topology manager, leader witness,
//! kv state machine, in-memory persistence) over the [`NetworkHub`] and
//! exposes the controls the integration scenarios need: submitting
//! commands, partitioning, stopping and restarting nodes, and inspecting
//! applied state.

use crate::net::{NetworkHub, NodeTransport};
use bytes::Bytes;
use parking_lot::Mutex;
use rapport_core::batch_store::BatchStore;
use rapport_core::messages::{LocalMessage, Message, MessageKind};
use rapport_core::{Command, NodeId, Phase, Result, RouteHandler, Router, RouterBuilder, TopologyInfo};
use rapport_engine::{
    engine_channel, register_probe_routes, register_witness_routes, EngineConfig, EngineHandle,
    LeaderWitness, RabiaEngine, TopologyConfig, TopologyManager,
};
use rapport_kvstore::KvStateMachine;
use rapport_persistence::InMemoryStateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Engine tuning for fast, deterministic tests.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig::default()
        .with_vote_timeout(Duration::from_secs(2))
        .with_sync_retry_interval(Duration::from_millis(300))
        .with_cleanup_interval(Duration::from_secs(5))
}

/// Topology tuning that keeps the liveness probes out of the way; the
/// harness drives connectivity explicitly.
fn test_topology_config() -> TopologyConfig {
    TopologyConfig::default()
        .with_ping_interval(Duration::from_secs(3600))
        .with_peer_timeout(Duration::from_secs(3600))
}

pub struct ClusterNode {
    pub id: NodeId,
    pub handle: EngineHandle,
    pub kv: KvStateMachine,
    pub topology: Arc<TopologyManager<NodeTransport>>,
    pub witness: Arc<LeaderWitness>,
    pub router: Arc<Router>,
    pub persistence: InMemoryStateStore,
    /// Every `CommandApplied` notification this node published, in order.
    pub applied_log: Arc<Mutex<Vec<(Phase, String)>>>,
    engine_task: JoinHandle<Result<()>>,
    pump_task: JoinHandle<()>,
    topology_task: JoinHandle<()>,
}

pub struct TestCluster {
    pub hub: Arc<NetworkHub>,
    members: Vec<NodeId>,
    nodes: Vec<ClusterNode>,
}

impl TestCluster {
    /// Starts an n-node cluster with a full mesh.
    pub async fn start(n: usize) -> Self {
        Self::start_with_config(n, test_engine_config()).await
    }

    pub async fn start_with_config(n: usize, config: EngineConfig) -> Self {
        let hub = NetworkHub::new();
        let members: Vec<NodeId> = (1..=n).map(|i| NodeId::from(format!("n{i}"))).collect();

        let mut nodes = Vec::with_capacity(n);
        for id in &members {
            let node = build_node(
                &hub,
                id.clone(),
                &members,
                InMemoryStateStore::new(),
                config.clone(),
            );
            nodes.push(node);
        }

        let cluster = Self {
            hub,
            members,
            nodes,
        };
        cluster.connect_mesh();
        cluster
    }

    fn connect_mesh(&self) {
        for node in &self.nodes {
            for peer in &self.members {
                if *peer != node.id {
                    node.topology.peer_up(peer.clone());
                }
            }
        }
    }

    pub fn node(&self, index: usize) -> &ClusterNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Submits a command list at one node and waits for the results.
    pub async fn apply_at(&self, index: usize, commands: Vec<&str>) -> Result<Vec<Bytes>> {
        let commands = commands
            .into_iter()
            .map(|command| Command::new(command.to_string()))
            .collect();
        self.nodes[index].handle.apply(commands).await
    }

    /// Polls until every running node's kv store holds `key == value`.
    pub async fn await_key_everywhere(&self, key: &str, value: &str, deadline: Duration) {
        let check = async {
            loop {
                let all_match = self
                    .nodes
                    .iter()
                    .all(|node| node.kv.get(key).as_deref() == Some(value));
                if all_match {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        };
        timeout(deadline, check)
            .await
            .unwrap_or_else(|_| panic!("key {key}={value} never converged on all nodes"));
    }

    /// Polls until two nodes hold identical kv contents.
    pub async fn await_state_match(&self, a: usize, b: usize, deadline: Duration) {
        let check = async {
            loop {
                if !self.nodes[a].kv.is_empty()
                    && self.nodes[a].kv.dump() == self.nodes[b].kv.dump()
                {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        };
        timeout(deadline, check)
            .await
            .unwrap_or_else(|_| panic!("nodes {a} and {b} never converged"));
    }

    /// Cuts one node off from every peer, at both the link layer and the
    /// topology layer.
    pub fn isolate(&self, index: usize) {
        let id = self.nodes[index].id.clone();
        self.hub.isolate(&id);
        for (i, node) in self.nodes.iter().enumerate() {
            if i == index {
                for peer in &self.members {
                    if *peer != id {
                        node.topology.peer_down(peer);
                    }
                }
            } else {
                node.topology.peer_down(&id);
            }
        }
    }

    /// Reverses an `isolate`.
    pub fn rejoin(&self, index: usize) {
        let id = self.nodes[index].id.clone();
        for (i, node) in self.nodes.iter().enumerate() {
            if i == index {
                for peer in &self.members {
                    if *peer != id {
                        self.hub.reconnect(&id, peer);
                        node.topology.peer_up(peer.clone());
                    }
                }
            } else {
                node.topology.peer_up(id.clone());
            }
        }
    }

    /// Gracefully stops one node, keeping its persistence for a restart.
    pub async fn stop_node(&mut self, index: usize) -> InMemoryStateStore {
        let id = self.nodes[index].id.clone();
        self.nodes[index].handle.stop().await.ok();
        self.nodes[index].topology.stop();
        self.nodes[index].pump_task.abort();
        self.hub.isolate(&id);
        for (i, node) in self.nodes.iter().enumerate() {
            if i != index {
                node.topology.peer_down(&id);
            }
        }
        self.nodes[index].persistence.clone()
    }

    /// Brings a stopped node back with its persisted state and reconnects
    /// it to the mesh.
    pub async fn restart_node(&mut self, index: usize, persistence: InMemoryStateStore) {
        let id = self.members[index].clone();
        let node = build_node(&self.hub, id.clone(), &self.members, persistence, {
            // Same tuning the rest of the cluster runs with.
            test_engine_config()
        });
        self.nodes[index] = node;

        for (i, node) in self.nodes.iter().enumerate() {
            if i == index {
                for peer in &self.members {
                    if *peer != id {
                        self.hub.reconnect(&id, peer);
                        node.topology.peer_up(peer.clone());
                    }
                }
            } else {
                node.topology.peer_up(id.clone());
            }
        }
    }

    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            node.handle.stop().await.ok();
            node.topology.stop();
            node.pump_task.abort();
        }
        for node in self.nodes {
            let _ = node.engine_task.await;
            node.topology_task.abort();
        }
    }
}

/// Builds one full node against the hub. Public so scenario tests can run
/// a single real node surrounded by scripted peers.
pub fn build_node(
    hub: &Arc<NetworkHub>,
    id: NodeId,
    members: &[NodeId],
    persistence: InMemoryStateStore,
    config: EngineConfig,
) -> ClusterNode {
    let topo = TopologyInfo::new(id.clone(), members.iter().cloned())
        .expect("valid cluster member list");
    let kv = KvStateMachine::new();
    let applied_log: Arc<Mutex<Vec<(Phase, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let (handle, events) = engine_channel(id.clone());
    let (probe_tx, probe_rx) = mpsc::unbounded_channel();
    let (witness_tx, witness_rx) = mpsc::unbounded_channel();

    let mut builder = RouterBuilder::new();
    handle.register_routes(&mut builder);
    register_probe_routes(&mut builder, probe_tx);
    register_witness_routes(&mut builder, witness_tx);
    {
        let applied_log = applied_log.clone();
        let handler: RouteHandler = Arc::new(move |message: &Message| {
            if let Message::Local(LocalMessage::CommandApplied { phase, command, .. }) = message {
                applied_log
                    .lock()
                    .push((*phase, String::from_utf8_lossy(&command.data).to_string()));
            }
        });
        builder.add_route(MessageKind::CommandApplied, handler);
    }
    {
        // The host surface for fatal faults and leadership events; tests
        // read the witness directly, so these only need a sink.
        let sink: RouteHandler = Arc::new(|_| {});
        builder.add_routes(&[MessageKind::LeaderChanged, MessageKind::EngineFault], sink);
    }
    let router = builder.build();

    let (transport, inbox) = hub.register(id.clone());
    let pump_router = router.clone();
    let pump_task = tokio::spawn(async move {
        let mut inbox = inbox;
        while let Some(message) = inbox.recv().await {
            pump_router.route(Message::Wired(message));
        }
    });

    let topology = TopologyManager::new(
        topo.clone(),
        test_topology_config(),
        router.clone(),
        transport.clone(),
    );
    let topology_task = topology.start(probe_rx);

    let witness = LeaderWitness::new(id.clone(), router.clone());
    let _ = witness.start(witness_rx);

    let engine = RabiaEngine::new(
        topo,
        config,
        router.clone(),
        kv.clone(),
        transport,
        Arc::new(persistence.clone()),
        Arc::new(BatchStore::new()),
        events,
    );
    let engine_task = tokio::spawn(engine.run());

    ClusterNode {
        id,
        handle,
        kv,
        topology,
        witness,
        router,
        persistence,
        applied_log,
        engine_task,
        pump_task,
        topology_task,
    }
}
