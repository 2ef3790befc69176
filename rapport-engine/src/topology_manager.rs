//! Connected-set tracking and quorum notifications.
//!
//! The manager owns the set of peers this node can currently reach and
//! publishes edge-triggered notifications through the router. Ordering is
//! part of the contract: a `Disappeared` is published before the
//! `NodeRemoved` that takes the count below quorum, and an `Established`
//! after the `NodeAdded` that crosses it.
//!
//! Transport integrations report connectivity through `peer_up` and
//! `peer_down`; on top of that the manager runs its own liveness probes
//! (`Ping`/`Pong`), fed in through the route handler built by
//! [`probe_route`].

use crate::TopologyConfig;
use parking_lot::Mutex;
use rapport_core::messages::{LocalMessage, Message, MessageKind, QuorumState, WiredMessage};
use rapport_core::network::ClusterNetwork;
use rapport_core::{NodeId, RouteHandler, Router, RouterBuilder, TopologyInfo};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Builds the route handler that feeds `Ping`/`Pong` traffic into the
/// manager's probe channel. Register it for [`MessageKind::Ping`] and
/// [`MessageKind::Pong`] before the router is frozen.
pub fn probe_route(tx: mpsc::UnboundedSender<WiredMessage>) -> RouteHandler {
    Arc::new(move |message: &Message| {
        if let Message::Wired(
            wired @ (WiredMessage::Ping { .. } | WiredMessage::Pong { .. }),
        ) = message
        {
            let _ = tx.send(wired.clone());
        }
    })
}

/// Convenience: registers [`probe_route`] under both probe kinds.
pub fn register_probe_routes(
    builder: &mut RouterBuilder,
    tx: mpsc::UnboundedSender<WiredMessage>,
) {
    builder.add_routes(&[MessageKind::Ping, MessageKind::Pong], probe_route(tx));
}

struct TopologyState {
    connected: BTreeSet<NodeId>,
    last_seen: HashMap<NodeId, Instant>,
    quorum_up: bool,
}

pub struct TopologyManager<NT> {
    topo: TopologyInfo,
    config: TopologyConfig,
    router: Arc<Router>,
    network: Arc<NT>,
    state: Mutex<TopologyState>,
    shutdown_tx: watch::Sender<bool>,
}

impl<NT> TopologyManager<NT>
where
    NT: ClusterNetwork + 'static,
{
    pub fn new(
        topo: TopologyInfo,
        config: TopologyConfig,
        router: Arc<Router>,
        network: Arc<NT>,
    ) -> Arc<Self> {
        let mut connected = BTreeSet::new();
        connected.insert(topo.self_id().clone());
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            topo,
            config,
            router,
            network,
            state: Mutex::new(TopologyState {
                connected,
                last_seen: HashMap::new(),
                quorum_up: false,
            }),
            shutdown_tx,
        })
    }

    /// Publishes `Established` if the initial connected set already reaches
    /// quorum. Only relevant for single-node clusters, where no `peer_up`
    /// will ever cross the threshold.
    pub fn bootstrap(&self) {
        let crossed = {
            let mut state = self.state.lock();
            if !state.quorum_up && state.connected.len() >= self.topo.quorum() {
                state.quorum_up = true;
                true
            } else {
                false
            }
        };
        if crossed {
            self.router.route(Message::Local(LocalMessage::QuorumState(
                QuorumState::Established,
            )));
        }
    }

    /// Adds a peer to the connected set. Called by the transport
    /// integration on connection establishment and by the liveness probes.
    pub fn peer_up(&self, node: NodeId) {
        if !self.topo.contains(&node) {
            warn!("ignoring unknown peer {}", node);
            return;
        }
        if node == *self.topo.self_id() {
            return;
        }

        let notifications = {
            let mut state = self.state.lock();
            if !state.connected.insert(node.clone()) {
                return;
            }
            state.last_seen.insert(node.clone(), Instant::now());
            let topology: Vec<NodeId> = state.connected.iter().cloned().collect();
            let mut out = vec![Message::Local(LocalMessage::NodeAdded {
                node: node.clone(),
                topology,
            })];
            if !state.quorum_up && state.connected.len() >= self.topo.quorum() {
                state.quorum_up = true;
                out.push(Message::Local(LocalMessage::QuorumState(
                    QuorumState::Established,
                )));
            }
            out
        };

        info!("peer {} connected", node);
        for message in notifications {
            self.router.route(message);
        }
    }

    /// Removes a peer from the connected set.
    pub fn peer_down(&self, node: &NodeId) {
        let notifications = {
            let mut state = self.state.lock();
            if !state.connected.remove(node) {
                return;
            }
            state.last_seen.remove(node);
            let topology: Vec<NodeId> = state.connected.iter().cloned().collect();
            let mut out = Vec::with_capacity(2);
            // Quorum loss is announced before the removal that causes it.
            if state.quorum_up && state.connected.len() < self.topo.quorum() {
                state.quorum_up = false;
                out.push(Message::Local(LocalMessage::QuorumState(
                    QuorumState::Disappeared,
                )));
            }
            out.push(Message::Local(LocalMessage::NodeRemoved {
                node: node.clone(),
                topology,
            }));
            out
        };

        info!("peer {} disconnected", node);
        for message in notifications {
            self.router.route(message);
        }
    }

    pub fn connected(&self) -> Vec<NodeId> {
        self.state.lock().connected.iter().cloned().collect()
    }

    pub fn has_quorum(&self) -> bool {
        self.state.lock().quorum_up
    }

    /// Runs the liveness probes until `stop` is called, consuming
    /// `Ping`/`Pong` traffic from the probe channel.
    pub fn start(
        self: &Arc<Self>,
        mut probes: mpsc::UnboundedReceiver<WiredMessage>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            manager.bootstrap();
            let mut ping_tick = interval(manager.config.ping_interval);
            let mut reconcile_tick = interval(manager.config.reconciliation_interval);
            loop {
                tokio::select! {
                    probe = probes.recv() => match probe {
                        Some(message) => manager.handle_probe(message).await,
                        None => break,
                    },
                    _ = ping_tick.tick() => {
                        let ping = WiredMessage::Ping {
                            sender: manager.topo.self_id().clone(),
                        };
                        if let Err(e) = manager.network.broadcast(ping).await {
                            debug!("ping broadcast failed: {}", e);
                        }
                    }
                    _ = reconcile_tick.tick() => {
                        manager.reconcile();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn handle_probe(&self, message: WiredMessage) {
        match message {
            WiredMessage::Ping { sender } => {
                self.observe(sender.clone());
                let pong = WiredMessage::Pong {
                    sender: self.topo.self_id().clone(),
                };
                if let Err(e) = self.network.send(&sender, pong).await {
                    debug!("pong to {} failed: {}", sender, e);
                }
            }
            WiredMessage::Pong { sender } => {
                self.observe(sender);
            }
            _ => {}
        }
    }

    /// Marks a peer as reachable, connecting it if it was not already.
    fn observe(&self, node: NodeId) {
        {
            let mut state = self.state.lock();
            state.last_seen.insert(node.clone(), Instant::now());
        }
        self.peer_up(node);
    }

    /// Expires peers that have been silent past the peer timeout.
    fn reconcile(&self) {
        let timeout = self.config.peer_timeout;
        let stale: Vec<NodeId> = {
            let state = self.state.lock();
            state
                .connected
                .iter()
                .filter(|node| **node != *self.topo.self_id())
                .filter(|node| match state.last_seen.get(*node) {
                    Some(seen) => seen.elapsed() > timeout,
                    None => false,
                })
                .cloned()
                .collect()
        };
        for node in stale {
            debug!("peer {} timed out", node);
            self.peer_down(&node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rapport_core::Result;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct NullNetwork;

    #[async_trait]
    impl ClusterNetwork for NullNetwork {
        async fn send(&self, _target: &NodeId, _message: WiredMessage) -> Result<()> {
            Ok(())
        }
        async fn broadcast(&self, _message: WiredMessage) -> Result<()> {
            Ok(())
        }
        async fn connected(&self) -> HashSet<NodeId> {
            HashSet::new()
        }
    }

    #[derive(Debug, PartialEq)]
    enum Observed {
        Added(NodeId),
        Removed(NodeId),
        Quorum(QuorumState),
    }

    fn observing_router(log: Arc<StdMutex<Vec<Observed>>>) -> Arc<Router> {
        let mut builder = RouterBuilder::new();
        let handler: RouteHandler = Arc::new(move |message: &Message| {
            if let Message::Local(local) = message {
                let observed = match local {
                    LocalMessage::NodeAdded { node, .. } => Observed::Added(node.clone()),
                    LocalMessage::NodeRemoved { node, .. } => Observed::Removed(node.clone()),
                    LocalMessage::QuorumState(state) => Observed::Quorum(*state),
                    _ => return,
                };
                log.lock().unwrap().push(observed);
            }
        });
        builder.add_routes(
            &[
                MessageKind::NodeAdded,
                MessageKind::NodeRemoved,
                MessageKind::QuorumState,
            ],
            handler,
        );
        builder.build()
    }

    fn manager(log: Arc<StdMutex<Vec<Observed>>>) -> Arc<TopologyManager<NullNetwork>> {
        let topo =
            TopologyInfo::new(NodeId::from("n1"), ["n1", "n2", "n3"].map(NodeId::from)).unwrap();
        TopologyManager::new(
            topo,
            TopologyConfig::default(),
            observing_router(log),
            Arc::new(NullNetwork),
        )
    }

    #[tokio::test]
    async fn established_is_published_after_the_crossing_node_added() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = manager(log.clone());

        manager.peer_up(NodeId::from("n2"));
        let events = log.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                Observed::Added(NodeId::from("n2")),
                Observed::Quorum(QuorumState::Established),
            ]
        );
    }

    #[tokio::test]
    async fn disappeared_is_published_before_the_crossing_node_removed() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = manager(log.clone());
        manager.peer_up(NodeId::from("n2"));
        manager.peer_up(NodeId::from("n3"));
        log.lock().unwrap().clear();

        // Still at quorum after the first removal; the second crosses.
        manager.peer_down(&NodeId::from("n2"));
        manager.peer_down(&NodeId::from("n3"));
        let events = log.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                Observed::Removed(NodeId::from("n2")),
                Observed::Quorum(QuorumState::Disappeared),
                Observed::Removed(NodeId::from("n3")),
            ]
        );
    }

    #[tokio::test]
    async fn notifications_are_edge_triggered() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = manager(log.clone());
        manager.peer_up(NodeId::from("n2"));
        manager.peer_up(NodeId::from("n2"));
        manager.peer_up(NodeId::from("n3"));

        let quorum_events = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Observed::Quorum(_)))
            .count();
        assert_eq!(quorum_events, 1);
        assert_eq!(manager.connected().len(), 3);
        assert!(manager.has_quorum());
    }

    #[tokio::test]
    async fn unknown_peers_are_ignored() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = manager(log.clone());
        manager.peer_up(NodeId::from("stranger"));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(manager.connected(), vec![NodeId::from("n1")]);
    }

    #[tokio::test]
    async fn single_node_clusters_bootstrap_their_own_quorum() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let topo = TopologyInfo::new(NodeId::from("n1"), [NodeId::from("n1")]).unwrap();
        let manager = TopologyManager::new(
            topo,
            TopologyConfig::default(),
            observing_router(log.clone()),
            Arc::new(NullNetwork),
        );

        manager.bootstrap();
        manager.bootstrap();
        let events = log.lock().unwrap();
        assert_eq!(*events, vec![Observed::Quorum(QuorumState::Established)]);
        assert!(manager.has_quorum());
    }

    #[tokio::test]
    async fn pings_mark_peers_alive_and_answer_with_pong() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = manager(log.clone());
        manager
            .handle_probe(WiredMessage::Ping {
                sender: NodeId::from("n3"),
            })
            .await;
        assert!(manager.connected().contains(&NodeId::from("n3")));

        manager
            .handle_probe(WiredMessage::Pong {
                sender: NodeId::from("n2"),
            })
            .await;
        assert!(manager.connected().contains(&NodeId::from("n2")));
        assert!(manager.has_quorum());
    }
}
