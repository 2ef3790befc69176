//! Message families routed through the engine.
//!
//! `WiredMessage` variants cross the network; `LocalMessage` variants are
//! in-process notifications. Both are closed sum types so dispatch stays
//! exhaustive: adding a variant fails compilation everywhere a match must be
//! extended.

use crate::state_machine::Snapshot;
use crate::{Batch, BatchId, Command, NodeId, Phase, StateValue, Vote};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages that can be serialized and sent across the network.
///
/// Every variant carries the sender's node id. Fields are limited to
/// unsigned integers, byte strings, and enumerations so the messages stay
/// routable without knowledge of the underlying transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WiredMessage {
    /// Proposal of a batch for a phase by that phase's proposer.
    Propose {
        sender: NodeId,
        phase: Phase,
        batch_id: BatchId,
    },
    /// Round-1 vote. Only binary values are representable.
    VoteRound1 {
        sender: NodeId,
        phase: Phase,
        value: Vote,
    },
    /// Round-2 vote, possibly `VQuestion` when round 1 was inconclusive.
    VoteRound2 {
        sender: NodeId,
        phase: Phase,
        value: StateValue,
    },
    /// Final decision for a phase. `batch_id` is the skip sentinel when the
    /// phase decided `V0`.
    Decision {
        sender: NodeId,
        phase: Phase,
        value: Vote,
        batch_id: BatchId,
    },
    /// Request to be caught up from `from_phase` onward.
    SyncRequest { sender: NodeId, from_phase: Phase },
    /// Snapshot plus any decisions the responder holds past its applied
    /// phase.
    SyncResponse {
        sender: NodeId,
        applied_phase: Phase,
        snapshot: Snapshot,
        trailing_decisions: Vec<(Phase, Vote, BatchId)>,
    },
    /// Batch propagation from the origin to every peer.
    NewBatch { sender: NodeId, batch: Batch },
    /// Topology-layer liveness probe.
    Ping { sender: NodeId },
    /// Liveness probe response.
    Pong { sender: NodeId },
}

impl WiredMessage {
    pub fn sender(&self) -> &NodeId {
        match self {
            WiredMessage::Propose { sender, .. }
            | WiredMessage::VoteRound1 { sender, .. }
            | WiredMessage::VoteRound2 { sender, .. }
            | WiredMessage::Decision { sender, .. }
            | WiredMessage::SyncRequest { sender, .. }
            | WiredMessage::SyncResponse { sender, .. }
            | WiredMessage::NewBatch { sender, .. }
            | WiredMessage::Ping { sender }
            | WiredMessage::Pong { sender } => sender,
        }
    }
}

/// Quorum availability, published edge-triggered by the topology manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumState {
    Established,
    Disappeared,
}

/// In-process notifications.
#[derive(Debug, Clone)]
pub enum LocalMessage {
    /// A peer joined the connected set. `topology` is the full connected
    /// set, sorted, self included.
    NodeAdded {
        node: NodeId,
        topology: Vec<NodeId>,
    },
    /// A peer left the connected set.
    NodeRemoved {
        node: NodeId,
        topology: Vec<NodeId>,
    },
    QuorumState(QuorumState),
    /// Published by the leader witness whenever the singleton leader
    /// changes.
    LeaderChanged {
        leader: Option<NodeId>,
        is_self: bool,
    },
    /// One command went through the state machine.
    CommandApplied {
        phase: Phase,
        command: Command,
        result: Bytes,
    },
    /// Fatal protocol inconsistency surfaced to the host.
    EngineFault { reason: String },
}

/// Anything the router can carry.
#[derive(Debug, Clone)]
pub enum Message {
    Wired(WiredMessage),
    Local(LocalMessage),
}

/// The dispatch key: one entry per concrete message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Propose,
    VoteRound1,
    VoteRound2,
    Decision,
    SyncRequest,
    SyncResponse,
    NewBatch,
    Ping,
    Pong,
    NodeAdded,
    NodeRemoved,
    QuorumState,
    LeaderChanged,
    CommandApplied,
    EngineFault,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Wired(wired) => match wired {
                WiredMessage::Propose { .. } => MessageKind::Propose,
                WiredMessage::VoteRound1 { .. } => MessageKind::VoteRound1,
                WiredMessage::VoteRound2 { .. } => MessageKind::VoteRound2,
                WiredMessage::Decision { .. } => MessageKind::Decision,
                WiredMessage::SyncRequest { .. } => MessageKind::SyncRequest,
                WiredMessage::SyncResponse { .. } => MessageKind::SyncResponse,
                WiredMessage::NewBatch { .. } => MessageKind::NewBatch,
                WiredMessage::Ping { .. } => MessageKind::Ping,
                WiredMessage::Pong { .. } => MessageKind::Pong,
            },
            Message::Local(local) => match local {
                LocalMessage::NodeAdded { .. } => MessageKind::NodeAdded,
                LocalMessage::NodeRemoved { .. } => MessageKind::NodeRemoved,
                LocalMessage::QuorumState(_) => MessageKind::QuorumState,
                LocalMessage::LeaderChanged { .. } => MessageKind::LeaderChanged,
                LocalMessage::CommandApplied { .. } => MessageKind::CommandApplied,
                LocalMessage::EngineFault { .. } => MessageKind::EngineFault,
            },
        }
    }
}
