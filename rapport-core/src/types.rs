//! # Core Types
//!
//! Identifiers and value types shared by every Rapport component.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier for a node in the cluster.
///
/// Node ids are plain strings with lexicographic ordering. The ordering is
/// load-bearing: proposer rotation and leader selection both walk the sorted
/// member list.
///
/// # Examples
///
/// ```rust
/// use rapport_core::NodeId;
///
/// let a = NodeId::from("n1");
/// let b = NodeId::from("n2");
/// assert!(a < b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consensus slot. Each phase decides at most one batch.
///
/// Phases increase monotonically; batches are applied to the state machine
/// strictly in phase order with no gaps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Phase(pub u64);

impl Phase {
    pub const ZERO: Phase = Phase(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The phase `window` slots back, saturating at zero. Used for the
    /// retention cutoff `applied - phases_to_keep`.
    pub fn back(&self, window: u64) -> Self {
        Self(self.0.saturating_sub(window))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Binary vote value used in round-1 votes and decisions.
///
/// `V1` commits the proposed batch, `V0` skips the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    V0,
    V1,
}

impl Vote {
    pub fn opposite(&self) -> Vote {
        match self {
            Vote::V0 => Vote::V1,
            Vote::V1 => Vote::V0,
        }
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::V0 => write!(f, "V0"),
            Vote::V1 => write!(f, "V1"),
        }
    }
}

/// Round-2 vote value. `VQuestion` means round 1 was inconclusive at the
/// sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateValue {
    V0,
    V1,
    VQuestion,
}

impl StateValue {
    /// The binary value this state carries, if it is not `VQuestion`.
    pub fn as_vote(&self) -> Option<Vote> {
        match self {
            StateValue::V0 => Some(Vote::V0),
            StateValue::V1 => Some(Vote::V1),
            StateValue::VQuestion => None,
        }
    }
}

impl From<Vote> for StateValue {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::V0 => StateValue::V0,
            Vote::V1 => StateValue::V1,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::V0 => write!(f, "V0"),
            StateValue::V1 => write!(f, "V1"),
            StateValue::VQuestion => write!(f, "V?"),
        }
    }
}

/// Token that routes a decision result back to the submitting client's
/// promise. Only meaningful on the origin node; other nodes carry it opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single command destined for the replicated state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub data: Bytes,
}

impl Command {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// Identifier for a command batch.
///
/// Minted only by the batch's origin: a content digest over the serialized
/// commands, the origin node id, and an ever-increasing per-node sequence
/// number. Other nodes receive the id and treat it as opaque; they never
/// recompute it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId {
    pub origin: NodeId,
    pub seq: u64,
    pub digest: u32,
}

impl BatchId {
    /// The reserved sentinel proposed for a phase with no pending work.
    /// A phase decided with this id applies nothing.
    pub fn skip() -> Self {
        Self {
            origin: NodeId::new(""),
            seq: 0,
            digest: 0,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.origin.as_str().is_empty() && self.seq == 0 && self.digest == 0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_skip() {
            write!(f, "skip")
        } else {
            write!(f, "{}:{}:{:08x}", self.origin, self.seq, self.digest)
        }
    }
}

/// An ordered list of commands shipped as one consensus unit.
///
/// Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub origin: NodeId,
    pub commands: Vec<Command>,
    pub correlation: CorrelationId,
}

impl Batch {
    /// Builds a batch at its origin, deriving the content-addressed id.
    pub fn new(
        origin: NodeId,
        seq: u64,
        commands: Vec<Command>,
        correlation: CorrelationId,
    ) -> Self {
        let digest = Self::digest(&origin, seq, &commands);
        Self {
            id: BatchId {
                origin: origin.clone(),
                seq,
                digest,
            },
            origin,
            commands,
            correlation,
        }
    }

    /// Checks that the id matches the batch content. Receivers drop
    /// batches whose id does not verify.
    pub fn verify_id(&self) -> bool {
        self.id.origin == self.origin
            && self.id.digest == Self::digest(&self.origin, self.id.seq, &self.commands)
    }

    fn digest(origin: &NodeId, seq: u64, commands: &[Command]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(origin.as_str().as_bytes());
        hasher.update(&seq.to_be_bytes());
        for command in commands {
            hasher.update(&command.data);
        }
        hasher.finalize()
    }
}
