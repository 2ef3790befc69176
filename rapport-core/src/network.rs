//! Cluster network contract.
//!
//! The engine only needs best-effort, non-blocking delivery: at-most-once
//! per invocation, FIFO per peer on one connection, silent drop on
//! disconnection. Transports live outside this crate.

use crate::messages::WiredMessage;
use crate::{NodeId, Result};
use async_trait::async_trait;
use std::collections::HashSet;

#[async_trait]
pub trait ClusterNetwork: Send + Sync {
    /// Enqueues one message to a specific peer.
    async fn send(&self, target: &NodeId, message: WiredMessage) -> Result<()>;

    /// Sends to every currently connected peer, excluding self.
    async fn broadcast(&self, message: WiredMessage) -> Result<()>;

    /// The peers this node currently holds a connection to.
    async fn connected(&self) -> HashSet<NodeId>;
}
