//! Leadership witness.
//!
//! The engine itself is leaderless; some administrative decisions still
//! need a singleton, so the witness derives one deterministically from the
//! shared topology: the lexicographically smallest connected node id.
//! Nothing is elected and no term exists; when the connected set changes,
//! the leader changes with it.

use parking_lot::Mutex;
use rapport_core::messages::{LocalMessage, Message, MessageKind, QuorumState};
use rapport_core::{NodeId, RouteHandler, Router, RouterBuilder};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Builds the route handler that feeds topology notifications into the
/// witness's channel. Register it for `NodeAdded`, `NodeRemoved`, and
/// `QuorumState` before the router is frozen.
pub fn topology_route(tx: mpsc::UnboundedSender<LocalMessage>) -> RouteHandler {
    Arc::new(move |message: &Message| {
        if let Message::Local(
            local @ (LocalMessage::NodeAdded { .. }
            | LocalMessage::NodeRemoved { .. }
            | LocalMessage::QuorumState(_)),
        ) = message
        {
            let _ = tx.send(local.clone());
        }
    })
}

/// Convenience: registers [`topology_route`] under the three kinds the
/// witness observes.
pub fn register_witness_routes(
    builder: &mut RouterBuilder,
    tx: mpsc::UnboundedSender<LocalMessage>,
) {
    builder.add_routes(
        &[
            MessageKind::NodeAdded,
            MessageKind::NodeRemoved,
            MessageKind::QuorumState,
        ],
        topology_route(tx),
    );
}

struct WitnessState {
    connected: Vec<NodeId>,
    quorum_up: bool,
    /// Last published leader, to keep `LeaderChanged` edge-triggered.
    published: Option<NodeId>,
}

pub struct LeaderWitness {
    self_id: NodeId,
    router: Arc<Router>,
    state: Mutex<WitnessState>,
}

impl LeaderWitness {
    pub fn new(self_id: NodeId, router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            router,
            state: Mutex::new(WitnessState {
                connected: Vec::new(),
                quorum_up: false,
                published: None,
            }),
        })
    }

    /// Consumes topology notifications until the channel closes.
    pub fn start(
        self: &Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<LocalMessage>,
    ) -> JoinHandle<()> {
        let witness = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = notifications.recv().await {
                witness.handle_notification(&message);
            }
        })
    }

    /// Recomputes the leader from one topology notification and publishes
    /// `LeaderChanged` when it moved.
    pub fn handle_notification(&self, message: &LocalMessage) {
        let change = {
            let mut state = self.state.lock();
            match message {
                LocalMessage::NodeAdded { topology, .. }
                | LocalMessage::NodeRemoved { topology, .. } => {
                    state.connected = topology.clone();
                }
                LocalMessage::QuorumState(quorum) => {
                    state.quorum_up = *quorum == QuorumState::Established;
                }
                _ => return,
            }

            let leader = if state.quorum_up {
                state.connected.iter().min().cloned()
            } else {
                None
            };

            if state.published == leader {
                None
            } else {
                state.published = leader.clone();
                Some(leader)
            }
        };

        if let Some(leader) = change {
            let is_self = leader.as_ref() == Some(&self.self_id);
            info!("leader changed to {:?} (self: {})", leader, is_self);
            self.router
                .route(Message::Local(LocalMessage::LeaderChanged { leader, is_self }));
        }
    }

    /// The current leader, if quorum holds.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.state.lock().published.clone()
    }

    pub fn is_self_leader(&self) -> bool {
        self.current_leader().as_ref() == Some(&self.self_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    type Published = Arc<StdMutex<Vec<(Option<NodeId>, bool)>>>;

    fn build(self_id: &str) -> (Arc<LeaderWitness>, Published) {
        let published: Published = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = RouterBuilder::new();
        {
            let published = published.clone();
            let handler: RouteHandler = Arc::new(move |message: &Message| {
                if let Message::Local(LocalMessage::LeaderChanged { leader, is_self }) = message {
                    published.lock().unwrap().push((leader.clone(), *is_self));
                }
            });
            builder.add_route(MessageKind::LeaderChanged, handler);
        }
        let router = builder.build();
        let witness = LeaderWitness::new(NodeId::from(self_id), router);
        (witness, published)
    }

    fn added(node: &str, topology: &[&str]) -> LocalMessage {
        LocalMessage::NodeAdded {
            node: NodeId::from(node),
            topology: topology.iter().map(|n| NodeId::from(*n)).collect(),
        }
    }

    fn removed(node: &str, topology: &[&str]) -> LocalMessage {
        LocalMessage::NodeRemoved {
            node: NodeId::from(node),
            topology: topology.iter().map(|n| NodeId::from(*n)).collect(),
        }
    }

    #[test]
    fn smallest_connected_node_leads() {
        let (witness, published) = build("n2");
        witness.handle_notification(&added("n2", &["n2"]));
        witness.handle_notification(&added("n1", &["n1", "n2"]));
        witness.handle_notification(&LocalMessage::QuorumState(QuorumState::Established));

        assert_eq!(witness.current_leader(), Some(NodeId::from("n1")));
        assert!(!witness.is_self_leader());
        let events = published.lock().unwrap();
        assert_eq!(events.last(), Some(&(Some(NodeId::from("n1")), false)));
    }

    #[test]
    fn witness_goes_silent_without_quorum() {
        let (witness, published) = build("n1");
        witness.handle_notification(&added("n2", &["n1", "n2"]));
        witness.handle_notification(&LocalMessage::QuorumState(QuorumState::Established));
        assert!(witness.is_self_leader());

        witness.handle_notification(&LocalMessage::QuorumState(QuorumState::Disappeared));
        witness.handle_notification(&removed("n2", &["n1"]));

        assert_eq!(witness.current_leader(), None);
        let events = published.lock().unwrap();
        // Exactly one None publication for the outage; the NodeRemoved that
        // followed must not repeat it.
        let nones = events.iter().filter(|(leader, _)| leader.is_none()).count();
        assert_eq!(nones, 1);
        assert_eq!(events.last(), Some(&(None, false)));
    }

    #[test]
    fn leader_failover_follows_the_sorted_order() {
        let (witness, _) = build("n3");
        witness.handle_notification(&added("n1", &["n1", "n3"]));
        witness.handle_notification(&LocalMessage::QuorumState(QuorumState::Established));
        witness.handle_notification(&added("n2", &["n1", "n2", "n3"]));
        assert_eq!(witness.current_leader(), Some(NodeId::from("n1")));

        witness.handle_notification(&removed("n1", &["n2", "n3"]));
        assert_eq!(witness.current_leader(), Some(NodeId::from("n2")));

        witness.handle_notification(&removed("n2", &["n3"]));
        // Two of three still connected is quorum; with n3 alone it is not,
        // but the witness only tracks what the topology manager published.
        assert_eq!(witness.current_leader(), Some(NodeId::from("n3")));
        assert!(witness.is_self_leader());
    }

    #[tokio::test]
    async fn start_consumes_the_notification_channel() {
        let (witness, published) = build("n1");
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = witness.start(rx);

        tx.send(added("n2", &["n1", "n2"])).unwrap();
        tx.send(LocalMessage::QuorumState(QuorumState::Established))
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(witness.current_leader(), Some(NodeId::from("n1")));
        assert_eq!(
            published.lock().unwrap().last(),
            Some(&(Some(NodeId::from("n1")), true))
        );
    }
}
