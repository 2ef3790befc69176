//! Per-phase working state and the round tally rules.
//!
//! The tallies are pure functions of the recorded votes and the cluster
//! view, kept separate from the engine loop so the threshold logic is
//! testable in isolation.

use rapport_core::{BatchId, NodeId, Phase, StateValue, TopologyInfo, Vote};
use std::collections::HashMap;
use std::time::Instant;

/// Outcome of tallying round-1 votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round1Outcome {
    /// Fewer than quorum distinct senders so far.
    Pending,
    /// A super-majority voted the same value: decide immediately, skipping
    /// round 2.
    FastPath(Vote),
    /// Quorum reached without a super-majority; proceed to round 2 with
    /// this input.
    Advance(StateValue),
}

/// Outcome of tallying round-2 votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round2Outcome {
    Pending,
    /// At least f+1 round-2 votes agreed on a binary value.
    Decide(Vote),
    /// Quorum reached with no f+1 winner: fall back to the shared coin.
    CoinFlip,
}

/// The decided value and batch for a phase.
///
/// `batch_id` is `None` when the value is known but the proposal never
/// reached this node; applying such a phase requires a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    pub value: Vote,
    pub batch_id: Option<BatchId>,
}

/// In-memory working set for one consensus slot.
#[derive(Debug, Default)]
pub struct PhaseState {
    /// First recognized proposal for this phase.
    pub proposal: Option<BatchId>,
    /// The batch this node itself proposed, for carry-over on skip.
    pub our_batch: Option<BatchId>,
    pub round1_votes: HashMap<NodeId, Vote>,
    pub round2_votes: HashMap<NodeId, StateValue>,
    pub round1_sent: bool,
    pub round2_sent: bool,
    /// Set once the round-1 tally has been acted on.
    pub round1_resolved: bool,
    pub decision: Option<DecisionRecord>,
    pub decided_at: Option<Instant>,
    /// Armed when this phase is expected to make progress; expiry triggers
    /// the timeout vote.
    pub deadline: Option<Instant>,
}

impl PhaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    /// Records a round-1 vote. Returns `false` for a duplicate sender,
    /// which must leave the tally unchanged.
    pub fn record_round1(&mut self, voter: NodeId, vote: Vote) -> bool {
        if self.round1_votes.contains_key(&voter) {
            return false;
        }
        self.round1_votes.insert(voter, vote);
        true
    }

    /// Records a round-2 vote; duplicates are ignored.
    pub fn record_round2(&mut self, voter: NodeId, value: StateValue) -> bool {
        if self.round2_votes.contains_key(&voter) {
            return false;
        }
        self.round2_votes.insert(voter, value);
        true
    }

    pub fn round1_outcome(&self, topo: &TopologyInfo) -> Round1Outcome {
        if self.round1_votes.len() < topo.quorum() {
            return Round1Outcome::Pending;
        }
        let ones = self
            .round1_votes
            .values()
            .filter(|v| **v == Vote::V1)
            .count();
        let zeros = self.round1_votes.len() - ones;

        if ones >= topo.super_majority() {
            Round1Outcome::FastPath(Vote::V1)
        } else if zeros >= topo.super_majority() {
            Round1Outcome::FastPath(Vote::V0)
        } else if ones >= topo.f_plus_one() {
            Round1Outcome::Advance(StateValue::V1)
        } else if zeros >= topo.f_plus_one() {
            Round1Outcome::Advance(StateValue::V0)
        } else {
            Round1Outcome::Advance(StateValue::VQuestion)
        }
    }

    pub fn round2_outcome(&self, topo: &TopologyInfo) -> Round2Outcome {
        if self.round2_votes.len() < topo.quorum() {
            return Round2Outcome::Pending;
        }
        let ones = self
            .round2_votes
            .values()
            .filter(|v| **v == StateValue::V1)
            .count();
        let zeros = self
            .round2_votes
            .values()
            .filter(|v| **v == StateValue::V0)
            .count();

        if ones >= topo.f_plus_one() {
            Round2Outcome::Decide(Vote::V1)
        } else if zeros >= topo.f_plus_one() {
            Round2Outcome::Decide(Vote::V0)
        } else {
            Round2Outcome::CoinFlip
        }
    }
}

/// The deterministic shared coin for a phase.
///
/// A pure function of the phase number and the cluster seed, so any two
/// nodes flipping the coin for the same phase get the same answer.
pub fn shared_coin(cluster_seed: u32, phase: Phase) -> Vote {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&cluster_seed.to_be_bytes());
    hasher.update(&phase.value().to_be_bytes());
    if hasher.finalize() & 1 == 1 {
        Vote::V1
    } else {
        Vote::V0
    }
}
