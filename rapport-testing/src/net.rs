//! In-memory cluster network.
//!
//! A hub connects per-node transports through unbounded channels: delivery
//! is instant, FIFO per sender-receiver pair, and silently dropped across
//! severed links, matching the guarantees the engine expects from a real
//! transport. The hub records delivered traffic so tests can assert on the
//! protocol conversation.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rapport_core::messages::WiredMessage;
use rapport_core::network::ClusterNetwork;
use rapport_core::{NodeId, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One delivered message, as seen on the wire.
#[derive(Debug, Clone)]
pub struct TrafficRecord {
    pub from: NodeId,
    pub to: NodeId,
    pub message: WiredMessage,
}

#[derive(Default)]
pub struct NetworkHub {
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<WiredMessage>>,
    links: DashMap<NodeId, HashSet<NodeId>>,
    traffic: Mutex<Vec<TrafficRecord>>,
}

impl NetworkHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a node to the hub with links to every already-registered node,
    /// returning its transport and inbox. Re-registering replaces the
    /// inbox, which is how restarts discard stale queued traffic.
    pub fn register(
        self: &Arc<Self>,
        node: NodeId,
    ) -> (Arc<NodeTransport>, mpsc::UnboundedReceiver<WiredMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(node.clone(), tx);

        let mut peers = HashSet::new();
        for entry in self.links.iter() {
            if *entry.key() != node {
                peers.insert(entry.key().clone());
            }
        }
        for peer in &peers {
            self.links
                .entry(peer.clone())
                .or_default()
                .insert(node.clone());
        }
        self.links.insert(node.clone(), peers);

        let transport = Arc::new(NodeTransport {
            node,
            hub: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Severs the link between two nodes in both directions.
    pub fn disconnect(&self, a: &NodeId, b: &NodeId) {
        if let Some(mut links) = self.links.get_mut(a) {
            links.remove(b);
        }
        if let Some(mut links) = self.links.get_mut(b) {
            links.remove(a);
        }
    }

    /// Restores the link between two nodes in both directions.
    pub fn reconnect(&self, a: &NodeId, b: &NodeId) {
        if let Some(mut links) = self.links.get_mut(a) {
            links.insert(b.clone());
        }
        if let Some(mut links) = self.links.get_mut(b) {
            links.insert(a.clone());
        }
    }

    /// Severs every link of one node.
    pub fn isolate(&self, node: &NodeId) {
        let peers: Vec<NodeId> = self
            .links
            .get(node)
            .map(|links| links.iter().cloned().collect())
            .unwrap_or_default();
        for peer in peers {
            self.disconnect(node, &peer);
        }
    }

    /// The protocol conversation so far.
    pub fn traffic(&self) -> Vec<TrafficRecord> {
        self.traffic.lock().clone()
    }

    pub fn clear_traffic(&self) {
        self.traffic.lock().clear();
    }

    fn linked(&self, from: &NodeId, to: &NodeId) -> bool {
        self.links
            .get(from)
            .map(|links| links.contains(to))
            .unwrap_or(false)
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, message: WiredMessage) {
        if !self.linked(from, to) {
            return;
        }
        if let Some(inbox) = self.inboxes.get(to) {
            if inbox.send(message.clone()).is_ok() {
                self.traffic.lock().push(TrafficRecord {
                    from: from.clone(),
                    to: to.clone(),
                    message,
                });
            }
        }
    }
}

/// A node's view of the hub.
pub struct NodeTransport {
    node: NodeId,
    hub: Arc<NetworkHub>,
}

impl NodeTransport {
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

#[async_trait]
impl ClusterNetwork for NodeTransport {
    async fn send(&self, target: &NodeId, message: WiredMessage) -> Result<()> {
        self.hub.deliver(&self.node, target, message);
        Ok(())
    }

    async fn broadcast(&self, message: WiredMessage) -> Result<()> {
        let peers: Vec<NodeId> = self
            .hub
            .links
            .get(&self.node)
            .map(|links| links.iter().cloned().collect())
            .unwrap_or_default();
        for peer in peers {
            self.hub.deliver(&self.node, &peer, message.clone());
        }
        Ok(())
    }

    async fn connected(&self) -> HashSet<NodeId> {
        self.hub
            .links
            .get(&self.node)
            .map(|links| links.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_core::Phase;
    use rapport_core::Vote;

    fn vote(from: &str) -> WiredMessage {
        WiredMessage::VoteRound1 {
            sender: NodeId::from(from),
            phase: Phase::new(1),
            value: Vote::V1,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_linked_peers() {
        let hub = NetworkHub::new();
        let (n1, _rx1) = hub.register(NodeId::from("n1"));
        let (_n2, mut rx2) = hub.register(NodeId::from("n2"));
        let (_n3, mut rx3) = hub.register(NodeId::from("n3"));

        n1.broadcast(vote("n1")).await.unwrap();
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());
        assert_eq!(hub.traffic().len(), 2);
    }

    #[tokio::test]
    async fn severed_links_drop_silently() {
        let hub = NetworkHub::new();
        let (n1, _rx1) = hub.register(NodeId::from("n1"));
        let (_n2, mut rx2) = hub.register(NodeId::from("n2"));

        hub.disconnect(&NodeId::from("n1"), &NodeId::from("n2"));
        n1.send(&NodeId::from("n2"), vote("n1")).await.unwrap();
        assert!(rx2.try_recv().is_err());

        hub.reconnect(&NodeId::from("n1"), &NodeId::from("n2"));
        n1.send(&NodeId::from("n2"), vote("n1")).await.unwrap();
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn reregistration_replaces_the_inbox() {
        let hub = NetworkHub::new();
        let (n1, _rx1) = hub.register(NodeId::from("n1"));
        let (_n2, mut stale_rx) = hub.register(NodeId::from("n2"));
        let (_n2again, mut fresh_rx) = hub.register(NodeId::from("n2"));

        n1.send(&NodeId::from("n2"), vote("n1")).await.unwrap();
        assert!(stale_rx.try_recv().is_err());
        assert!(fresh_rx.try_recv().is_ok());
    }
}
