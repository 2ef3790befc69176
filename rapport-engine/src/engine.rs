//! The Rabia phase/round consensus engine.
//!
//! The engine is a single owning task: router handlers and the public
//! [`EngineHandle`] are thin producers into the engine's event queue, and
//! the task owns every piece of mutable consensus state. That serializes
//! the per-phase critical regions without any per-phase locking.

use crate::phase::{shared_coin, DecisionRecord, PhaseState, Round1Outcome, Round2Outcome};
use crate::EngineConfig;
use bytes::Bytes;
use rapport_core::batch_store::BatchStore;
use rapport_core::messages::{LocalMessage, Message, MessageKind, QuorumState, WiredMessage};
use rapport_core::network::ClusterNetwork;
use rapport_core::persistence::{SavedState, SavedStateStore};
use rapport_core::state_machine::StateMachine;
use rapport_core::{
    Batch, BatchId, Command, CorrelationId, NodeId, Phase, RapportError, Result, RouteHandler,
    Router, RouterBuilder, Vote,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// What the engine is currently willing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Initial state, or quorum lost: no voting, proposing, or deciding.
    Dormant,
    /// Quorum holds; phases advance.
    Active,
    /// Behind the cluster; normal voting suspended until a sync response
    /// catches us up.
    Syncing,
}

/// Everything that can reach the engine task.
#[derive(Debug)]
pub enum EngineEvent {
    Protocol(WiredMessage),
    Quorum(QuorumState),
    PeerSetChanged {
        topology: Vec<NodeId>,
    },
    Submit {
        commands: Vec<Command>,
        reply: oneshot::Sender<Result<Vec<Bytes>>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub mode: EngineMode,
    pub applied_phase: Phase,
    pub tracked_phases: usize,
    pub proposable_batches: usize,
    pub pending_submissions: usize,
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    self_id: NodeId,
    events: mpsc::UnboundedSender<EngineEvent>,
}

/// Creates the engine's event channel ahead of construction so routes can
/// be registered before the router is frozen.
pub fn engine_channel(self_id: NodeId) -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EngineHandle {
            self_id,
            events: tx,
        },
        rx,
    )
}

impl EngineHandle {
    /// Submits a command list for replication. Resolves once the batch has
    /// been decided and applied locally, with the per-command results.
    pub async fn apply(&self, commands: Vec<Command>) -> Result<Vec<Bytes>> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(EngineEvent::Submit { commands, reply })
            .map_err(|_| RapportError::EngineStopped)?;
        response.await.map_err(|_| RapportError::EngineStopped)?
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(EngineEvent::Status { reply })
            .map_err(|_| RapportError::EngineStopped)?;
        response.await.map_err(|_| RapportError::EngineStopped)
    }

    /// Stops the engine: outstanding submissions fail with a shutdown
    /// error and a final snapshot is written.
    pub async fn stop(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        if self.events.send(EngineEvent::Stop { reply }).is_err() {
            return Ok(());
        }
        let _ = response.await;
        Ok(())
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Injects an event directly; used by transport integrations and
    /// tests.
    pub fn send_event(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Subscribes the engine to every message kind it consumes.
    pub fn register_routes(&self, builder: &mut RouterBuilder) {
        let tx = self.events.clone();
        let handler: RouteHandler = Arc::new(move |message: &Message| {
            if let Some(event) = engine_event(message) {
                let _ = tx.send(event);
            }
        });
        builder.add_routes(
            &[
                MessageKind::Propose,
                MessageKind::VoteRound1,
                MessageKind::VoteRound2,
                MessageKind::Decision,
                MessageKind::SyncRequest,
                MessageKind::SyncResponse,
                MessageKind::NewBatch,
                MessageKind::QuorumState,
                MessageKind::NodeAdded,
                MessageKind::NodeRemoved,
            ],
            handler,
        );
    }
}

fn engine_event(message: &Message) -> Option<EngineEvent> {
    match message {
        Message::Wired(wired) => match wired {
            WiredMessage::Ping { .. } | WiredMessage::Pong { .. } => None,
            _ => Some(EngineEvent::Protocol(wired.clone())),
        },
        Message::Local(LocalMessage::QuorumState(quorum)) => Some(EngineEvent::Quorum(*quorum)),
        Message::Local(
            LocalMessage::NodeAdded { topology, .. } | LocalMessage::NodeRemoved { topology, .. },
        ) => Some(EngineEvent::PeerSetChanged {
            topology: topology.clone(),
        }),
        Message::Local(_) => None,
    }
}

struct SyncAttempt {
    last_sent: Instant,
    target: Option<NodeId>,
    attempts: u32,
}

pub struct RabiaEngine<SM, NT, PS> {
    topo: rapport_core::TopologyInfo,
    config: EngineConfig,
    router: Arc<Router>,
    state_machine: SM,
    network: Arc<NT>,
    persistence: Arc<PS>,
    batch_store: Arc<BatchStore>,
    events: mpsc::UnboundedReceiver<EngineEvent>,

    mode: EngineMode,
    connected: BTreeSet<NodeId>,
    applied_phase: Phase,
    phases: HashMap<Phase, PhaseState>,
    decisions: BTreeMap<Phase, DecisionRecord>,
    proposable: VecDeque<BatchId>,
    pending_replies: HashMap<BatchId, oneshot::Sender<Result<Vec<Bytes>>>>,
    batch_seq: u64,
    dormant_buffer: VecDeque<WiredMessage>,
    sync: Option<SyncAttempt>,
    applied_since_snapshot: u64,
}

impl<SM, NT, PS> RabiaEngine<SM, NT, PS>
where
    SM: StateMachine + 'static,
    NT: ClusterNetwork + 'static,
    PS: SavedStateStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topo: rapport_core::TopologyInfo,
        config: EngineConfig,
        router: Arc<Router>,
        state_machine: SM,
        network: Arc<NT>,
        persistence: Arc<PS>,
        batch_store: Arc<BatchStore>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Self {
        let mut connected = BTreeSet::new();
        connected.insert(topo.self_id().clone());
        Self {
            topo,
            config,
            router,
            state_machine,
            network,
            persistence,
            batch_store,
            events,
            mode: EngineMode::Dormant,
            connected,
            applied_phase: Phase::ZERO,
            phases: HashMap::new(),
            decisions: BTreeMap::new(),
            proposable: VecDeque::new(),
            pending_replies: HashMap::new(),
            // Seeded past any ids minted before a restart; the counter
            // only needs to be ever-increasing per origin.
            batch_seq: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            dormant_buffer: VecDeque::new(),
            sync: None,
            applied_since_snapshot: 0,
        }
    }

    /// Runs the engine until stopped or a fatal protocol inconsistency.
    pub async fn run(mut self) -> Result<()> {
        info!("starting consensus engine for node {}", self.topo.self_id());
        self.restore_saved_state().await?;

        let mut cleanup_tick = interval(self.config.cleanup_interval);
        let mut tick = interval(self.config.tick_interval);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(EngineEvent::Stop { reply }) => {
                        self.finalize().await;
                        let _ = reply.send(());
                        return Ok(());
                    }
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            if matches!(e, RapportError::ConflictingDecision { .. }) {
                                error!("fatal protocol inconsistency: {}", e);
                                self.router.route(Message::Local(LocalMessage::EngineFault {
                                    reason: e.to_string(),
                                }));
                                self.finalize().await;
                                return Err(e);
                            }
                            warn!("error handling engine event: {}", e);
                        }
                    }
                    None => {
                        self.finalize().await;
                        return Ok(());
                    }
                },
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick().await {
                        warn!("error on engine tick: {}", e);
                    }
                }
                _ = cleanup_tick.tick() => {
                    self.cleanup();
                }
            }
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Protocol(message) => {
                self.handle_protocol(message).await?;
                self.make_progress().await
            }
            EngineEvent::Quorum(quorum) => {
                self.handle_quorum(quorum).await?;
                self.make_progress().await
            }
            EngineEvent::PeerSetChanged { topology } => {
                self.connected = topology.into_iter().collect();
                self.connected.insert(self.topo.self_id().clone());
                self.make_progress().await
            }
            EngineEvent::Submit { commands, reply } => {
                self.handle_submit(commands, reply).await?;
                self.make_progress().await
            }
            EngineEvent::Status { reply } => {
                let _ = reply.send(self.status());
                Ok(())
            }
            EngineEvent::Stop { .. } => unreachable!("handled in run loop"),
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            mode: self.mode,
            applied_phase: self.applied_phase,
            tracked_phases: self.phases.len(),
            proposable_batches: self.proposable.len(),
            pending_submissions: self.pending_replies.len(),
        }
    }

    // ---- mode transitions -------------------------------------------------

    async fn handle_quorum(&mut self, quorum: QuorumState) -> Result<()> {
        match quorum {
            QuorumState::Established => {
                if self.mode == EngineMode::Dormant {
                    info!("quorum established, engine active");
                    self.mode = EngineMode::Active;
                    let buffered: Vec<WiredMessage> = self.dormant_buffer.drain(..).collect();
                    for message in buffered {
                        self.handle_protocol(message).await?;
                    }
                }
            }
            QuorumState::Disappeared => {
                if self.mode != EngineMode::Dormant {
                    warn!("quorum disappeared, engine dormant");
                    self.mode = EngineMode::Dormant;
                    self.sync = None;
                }
            }
        }
        Ok(())
    }

    // ---- client submissions ----------------------------------------------

    async fn handle_submit(
        &mut self,
        commands: Vec<Command>,
        reply: oneshot::Sender<Result<Vec<Bytes>>>,
    ) -> Result<()> {
        if self.mode == EngineMode::Dormant {
            let _ = reply.send(Err(RapportError::EngineDormant {
                node_id: self.topo.self_id().clone(),
            }));
            return Ok(());
        }

        self.batch_seq += 1;
        let batch = Batch::new(
            self.topo.self_id().clone(),
            self.batch_seq,
            commands,
            CorrelationId::new(),
        );
        let id = batch.id.clone();
        debug!("accepted batch {} with {} commands", id, batch.commands.len());

        self.batch_store.insert(batch.clone());
        self.pending_replies.insert(id.clone(), reply);
        self.proposable.push_back(id);
        self.broadcast(WiredMessage::NewBatch {
            sender: self.topo.self_id().clone(),
            batch,
        })
        .await;
        Ok(())
    }

    // ---- protocol message handling ---------------------------------------

    async fn handle_protocol(&mut self, message: WiredMessage) -> Result<()> {
        if self.mode == EngineMode::Dormant {
            if self.dormant_buffer.len() >= self.config.dormant_queue_limit {
                warn!(
                    "dormant buffer full, dropping message from {}",
                    message.sender()
                );
            } else {
                self.dormant_buffer.push_back(message);
            }
            return Ok(());
        }

        match message {
            WiredMessage::Propose {
                sender,
                phase,
                batch_id,
            } => self.handle_propose(sender, phase, batch_id).await,
            WiredMessage::VoteRound1 {
                sender,
                phase,
                value,
            } => self.handle_vote_round1(sender, phase, value).await,
            WiredMessage::VoteRound2 {
                sender,
                phase,
                value,
            } => self.handle_vote_round2(sender, phase, value).await,
            WiredMessage::Decision {
                sender,
                phase,
                value,
                batch_id,
            } => self.handle_decision(sender, phase, value, batch_id).await,
            WiredMessage::SyncRequest { sender, from_phase } => {
                self.handle_sync_request(sender, from_phase).await
            }
            WiredMessage::SyncResponse {
                sender,
                applied_phase,
                snapshot,
                trailing_decisions,
            } => {
                self.handle_sync_response(sender, applied_phase, snapshot, trailing_decisions)
                    .await
            }
            WiredMessage::NewBatch { sender, batch } => self.handle_new_batch(sender, batch).await,
            WiredMessage::Ping { .. } | WiredMessage::Pong { .. } => Ok(()),
        }
    }

    /// Classifies a phase against the retention window. Votes outside it
    /// are either from a node far behind (serve it a catch-up) or evidence
    /// that we are far behind ourselves.
    fn too_old(&self, phase: Phase) -> bool {
        phase.value() + self.config.phases_to_keep < self.applied_phase.value()
    }

    fn too_new(&self, phase: Phase) -> bool {
        phase.value() > self.applied_phase.value() + self.config.phases_to_keep
    }

    async fn handle_propose(
        &mut self,
        sender: NodeId,
        phase: Phase,
        batch_id: BatchId,
    ) -> Result<()> {
        if self.too_old(phase) {
            self.send_catchup(&sender).await?;
            return Ok(());
        }
        if self.too_new(phase) {
            return self.enter_syncing(Some(sender)).await;
        }
        if self.mode == EngineMode::Syncing || phase <= self.applied_phase {
            return Ok(());
        }

        let vote = {
            let store = &self.batch_store;
            let ps = self.phases.entry(phase).or_default();
            if ps.is_decided() {
                None
            } else {
                if ps.proposal.is_none() {
                    ps.proposal = Some(batch_id.clone());
                } else if ps.proposal.as_ref() != Some(&batch_id) {
                    debug!(
                        "ignoring competing proposal {} from {} for phase {}",
                        batch_id, sender, phase
                    );
                }
                if ps.round1_sent {
                    None
                } else {
                    let effective = ps.proposal.clone().unwrap_or_else(|| batch_id.clone());
                    let value = if effective.is_skip() || store.contains(&effective) {
                        Vote::V1
                    } else {
                        Vote::V0
                    };
                    ps.round1_sent = true;
                    ps.deadline = None;
                    ps.record_round1(self.topo.self_id().clone(), value);
                    Some(value)
                }
            }
        };

        if let Some(value) = vote {
            self.broadcast(WiredMessage::VoteRound1 {
                sender: self.topo.self_id().clone(),
                phase,
                value,
            })
            .await;
        }
        self.evaluate_round1(phase).await
    }

    async fn handle_vote_round1(
        &mut self,
        sender: NodeId,
        phase: Phase,
        value: Vote,
    ) -> Result<()> {
        if self.too_old(phase) {
            self.send_catchup(&sender).await?;
            return Ok(());
        }
        if self.too_new(phase) {
            return self.enter_syncing(Some(sender)).await;
        }
        if self.mode == EngineMode::Syncing || phase <= self.applied_phase {
            return Ok(());
        }

        {
            let vote_timeout = self.config.vote_timeout;
            let ps = self.phases.entry(phase).or_default();
            if ps.is_decided() {
                return Ok(());
            }
            if !ps.record_round1(sender, value) {
                debug!("duplicate round-1 vote for phase {}", phase);
                return Ok(());
            }
            // Foreign activity: expect this phase to conclude.
            if !ps.round1_sent && ps.deadline.is_none() {
                ps.deadline = Some(Instant::now() + vote_timeout);
            }
        }
        self.evaluate_round1(phase).await
    }

    async fn handle_vote_round2(
        &mut self,
        sender: NodeId,
        phase: Phase,
        value: rapport_core::StateValue,
    ) -> Result<()> {
        if self.too_old(phase) {
            self.send_catchup(&sender).await?;
            return Ok(());
        }
        if self.too_new(phase) {
            return self.enter_syncing(Some(sender)).await;
        }
        if self.mode == EngineMode::Syncing || phase <= self.applied_phase {
            return Ok(());
        }

        {
            let ps = self.phases.entry(phase).or_default();
            if ps.is_decided() {
                return Ok(());
            }
            if !ps.record_round2(sender, value) {
                debug!("duplicate round-2 vote for phase {}", phase);
                return Ok(());
            }
        }
        self.evaluate_round2(phase).await
    }

    async fn evaluate_round1(&mut self, phase: Phase) -> Result<()> {
        enum Next {
            Fast(Vote),
            Round2(rapport_core::StateValue, bool),
        }

        let next = {
            let Some(ps) = self.phases.get_mut(&phase) else {
                return Ok(());
            };
            if ps.is_decided() || ps.round1_resolved {
                None
            } else {
                match ps.round1_outcome(&self.topo) {
                    Round1Outcome::Pending => None,
                    Round1Outcome::FastPath(value) => {
                        ps.round1_resolved = true;
                        Some(Next::Fast(value))
                    }
                    Round1Outcome::Advance(value) => {
                        ps.round1_resolved = true;
                        let send = if ps.round2_sent {
                            false
                        } else {
                            ps.round2_sent = true;
                            ps.record_round2(self.topo.self_id().clone(), value);
                            true
                        };
                        Some(Next::Round2(value, send))
                    }
                }
            }
        };

        match next {
            None => Ok(()),
            Some(Next::Fast(value)) => {
                debug!("phase {} fast path decided {}", phase, value);
                self.decide_locally(phase, value).await
            }
            Some(Next::Round2(value, send)) => {
                if send {
                    self.broadcast(WiredMessage::VoteRound2 {
                        sender: self.topo.self_id().clone(),
                        phase,
                        value,
                    })
                    .await;
                }
                self.evaluate_round2(phase).await
            }
        }
    }

    async fn evaluate_round2(&mut self, phase: Phase) -> Result<()> {
        let decided = {
            let Some(ps) = self.phases.get(&phase) else {
                return Ok(());
            };
            if ps.is_decided() {
                None
            } else {
                match ps.round2_outcome(&self.topo) {
                    Round2Outcome::Pending => None,
                    Round2Outcome::Decide(value) => Some(value),
                    Round2Outcome::CoinFlip => {
                        let value = shared_coin(self.topo.cluster_seed(), phase);
                        debug!("phase {} tied, shared coin decided {}", phase, value);
                        Some(value)
                    }
                }
            }
        };

        match decided {
            Some(value) => self.decide_locally(phase, value).await,
            None => Ok(()),
        }
    }

    /// Finalizes a phase from our own tallies and announces it.
    async fn decide_locally(&mut self, phase: Phase, value: Vote) -> Result<()> {
        let batch_id = match value {
            Vote::V0 => Some(BatchId::skip()),
            Vote::V1 => self.phases.get(&phase).and_then(|ps| ps.proposal.clone()),
        };
        if value == Vote::V1 && batch_id.is_none() {
            // Decided a commit without ever seeing the proposal; the batch
            // id must come from a peer's Decision or a sync.
            self.record_decision(phase, value, None, false).await?;
            return self.enter_syncing(None).await;
        }
        self.record_decision(phase, value, batch_id, true).await
    }

    async fn record_decision(
        &mut self,
        phase: Phase,
        value: Vote,
        batch_id: Option<BatchId>,
        announce: bool,
    ) -> Result<()> {
        if let Some(existing) = self.decisions.get(&phase) {
            let conflicting_value = existing.value != value;
            let conflicting_batch = existing.batch_id.is_some()
                && batch_id.is_some()
                && existing.batch_id != batch_id;
            if conflicting_value || conflicting_batch {
                error!(
                    "conflicting decision for phase {}: have ({}, {:?}), got ({}, {:?})",
                    phase, existing.value, existing.batch_id, value, batch_id
                );
                return Err(RapportError::ConflictingDecision { phase });
            }
            if existing.batch_id.is_some() || batch_id.is_none() {
                return Ok(());
            }
        } else {
            info!("phase {} decided {} ({:?})", phase, value, batch_id);
        }

        self.decisions.insert(
            phase,
            DecisionRecord {
                value,
                batch_id: batch_id.clone(),
            },
        );

        let our_batch = {
            let ps = self.phases.entry(phase).or_default();
            ps.decision = Some(DecisionRecord {
                value,
                batch_id: batch_id.clone(),
            });
            ps.decided_at = Some(Instant::now());
            ps.deadline = None;
            ps.our_batch.clone()
        };

        match value {
            // Carry-over: our skipped proposal goes back to the queue head
            // for our next proposing slot.
            Vote::V0 => {
                if let Some(our) = our_batch {
                    self.proposable.retain(|id| *id != our);
                    self.proposable.push_front(our);
                }
            }
            // A committed batch must not be proposed again by anyone.
            Vote::V1 => {
                if let Some(id) = &batch_id {
                    self.proposable.retain(|queued| queued != id);
                }
            }
        }

        if announce {
            if let Some(id) = batch_id {
                self.broadcast(WiredMessage::Decision {
                    sender: self.topo.self_id().clone(),
                    phase,
                    value,
                    batch_id: id,
                })
                .await;
            }
        }
        Ok(())
    }

    async fn handle_decision(
        &mut self,
        _sender: NodeId,
        phase: Phase,
        value: Vote,
        batch_id: BatchId,
    ) -> Result<()> {
        if self.too_old(phase) {
            return Ok(());
        }
        if phase <= self.applied_phase && !self.decisions.contains_key(&phase) {
            // Already applied and pruned locally; nothing left to check.
            return Ok(());
        }
        self.record_decision(phase, value, Some(batch_id), false)
            .await
    }

    // ---- batch propagation -----------------------------------------------

    async fn handle_new_batch(&mut self, sender: NodeId, batch: Batch) -> Result<()> {
        if !batch.verify_id() {
            warn!("dropping batch with mismatched id from {}", sender);
            return Ok(());
        }
        let id = batch.id.clone();
        self.batch_store.insert(batch);

        let already_decided = self
            .decisions
            .values()
            .any(|decision| decision.batch_id.as_ref() == Some(&id));
        if !already_decided && !self.proposable.contains(&id) {
            self.proposable.push_back(id);
        }
        Ok(())
    }

    // ---- synchronization --------------------------------------------------

    async fn handle_sync_request(&mut self, sender: NodeId, from_phase: Phase) -> Result<()> {
        debug!("sync request from {} starting at phase {}", sender, from_phase);
        self.send_catchup(&sender).await
    }

    async fn send_catchup(&mut self, target: &NodeId) -> Result<()> {
        let snapshot = self.state_machine.snapshot().await?;
        let trailing_decisions: Vec<(Phase, Vote, BatchId)> = self
            .decisions
            .range(self.applied_phase.next()..)
            .filter_map(|(phase, decision)| {
                decision
                    .batch_id
                    .clone()
                    .map(|id| (*phase, decision.value, id))
            })
            .collect();
        self.send_to(
            target,
            WiredMessage::SyncResponse {
                sender: self.topo.self_id().clone(),
                applied_phase: self.applied_phase,
                snapshot,
                trailing_decisions,
            },
        )
        .await;
        Ok(())
    }

    async fn handle_sync_response(
        &mut self,
        sender: NodeId,
        applied_phase: Phase,
        snapshot: rapport_core::state_machine::Snapshot,
        trailing_decisions: Vec<(Phase, Vote, BatchId)>,
    ) -> Result<()> {
        if self.mode != EngineMode::Syncing {
            debug!("ignoring unsolicited sync response from {}", sender);
            return Ok(());
        }
        if applied_phase < self.applied_phase {
            debug!(
                "sync response from {} is older than local state ({} < {})",
                sender, applied_phase, self.applied_phase
            );
            return Ok(());
        }

        if applied_phase > self.applied_phase {
            self.state_machine.restore(&snapshot).await?;
            self.applied_phase = applied_phase;
            self.applied_since_snapshot = 0;
            self.phases.retain(|phase, _| *phase > applied_phase);
            self.decisions = self.decisions.split_off(&applied_phase.next());

            // Anything we had in flight may have been decided under the
            // snapshot; the results are unrecoverable, so the clients must
            // retry with their own duplicate suppression.
            for (id, reply) in self.pending_replies.drain() {
                let _ = reply.send(Err(RapportError::BatchEvicted { batch_id: id }));
            }
            self.proposable.clear();

            if let Err(e) = self.persist_saved_state().await {
                warn!("failed to persist synced state: {}", e);
            }
        }

        for (phase, value, batch_id) in trailing_decisions {
            if phase > self.applied_phase {
                self.record_decision(phase, value, Some(batch_id), false)
                    .await?;
            }
        }

        info!(
            "synchronized from {} up to phase {}",
            sender, self.applied_phase
        );
        self.mode = EngineMode::Active;
        self.sync = None;
        Ok(())
    }

    async fn enter_syncing(&mut self, hint: Option<NodeId>) -> Result<()> {
        if self.mode != EngineMode::Active {
            return Ok(());
        }
        warn!(
            "falling behind at applied phase {}, requesting sync",
            self.applied_phase
        );
        self.mode = EngineMode::Syncing;
        self.sync = Some(SyncAttempt {
            last_sent: Instant::now(),
            target: hint,
            attempts: 0,
        });
        self.send_sync_request().await;
        Ok(())
    }

    async fn send_sync_request(&mut self) {
        let target = {
            let (previous, attempts) = match self.sync.as_ref() {
                Some(sync) => (sync.target.clone(), sync.attempts),
                None => (None, 0),
            };
            if attempts == 0 {
                // First attempt goes to the hinted peer when it is still
                // reachable.
                previous
                    .filter(|hint| hint != self.topo.self_id() && self.connected.contains(hint))
                    .or_else(|| self.next_sync_target(None))
            } else {
                self.next_sync_target(previous)
            }
        };
        let Some(target) = target else {
            return;
        };
        if let Some(sync) = self.sync.as_mut() {
            sync.last_sent = Instant::now();
            sync.target = Some(target.clone());
            sync.attempts += 1;
        }
        self.send_to(
            &target,
            WiredMessage::SyncRequest {
                sender: self.topo.self_id().clone(),
                from_phase: self.applied_phase.next(),
            },
        )
        .await;
    }

    /// Rotates through connected peers so a stuck responder does not stall
    /// recovery.
    fn next_sync_target(&self, previous: Option<NodeId>) -> Option<NodeId> {
        let peers: Vec<&NodeId> = self
            .connected
            .iter()
            .filter(|node| *node != self.topo.self_id())
            .collect();
        if peers.is_empty() {
            return None;
        }
        match previous {
            Some(prev) => peers
                .iter()
                .find(|node| ***node > prev)
                .or_else(|| peers.first())
                .map(|node| (**node).clone()),
            None => peers.first().map(|node| (**node).clone()),
        }
    }

    // ---- proposing and applying ------------------------------------------

    /// Applies decided phases in order, then proposes if it is our slot.
    /// Proposing can decide immediately in small clusters, which unlocks
    /// more applying; loop until quiescent.
    async fn make_progress(&mut self) -> Result<()> {
        loop {
            let decisions_before = self.decisions.len();
            let applied_before = self.applied_phase;
            self.try_apply().await?;
            self.maybe_propose().await?;
            if self.decisions.len() == decisions_before && self.applied_phase == applied_before {
                return Ok(());
            }
        }
    }

    async fn try_apply(&mut self) -> Result<()> {
        loop {
            let next = self.applied_phase.next();
            let Some(record) = self.decisions.get(&next).cloned() else {
                // A later decision with this gap unfilled means the cluster
                // moved on without us.
                if self.mode == EngineMode::Active
                    && self.decisions.range(next..).next().is_some()
                {
                    self.enter_syncing(None).await?;
                }
                return Ok(());
            };

            match record.value {
                Vote::V0 => {
                    self.applied_phase = next;
                    self.note_applied().await;
                }
                Vote::V1 => {
                    let Some(id) = record.batch_id else {
                        return self.enter_syncing(None).await;
                    };
                    if id.is_skip() {
                        self.applied_phase = next;
                        self.note_applied().await;
                        continue;
                    }
                    let Some(batch) = self.batch_store.get(&id) else {
                        debug!("batch {} for phase {} not in store", id, next);
                        return self.enter_syncing(None).await;
                    };

                    let mut results = Vec::with_capacity(batch.commands.len());
                    for command in &batch.commands {
                        let result = self.state_machine.apply(command).await?;
                        self.router
                            .route(Message::Local(LocalMessage::CommandApplied {
                                phase: next,
                                command: command.clone(),
                                result: result.clone(),
                            }));
                        results.push(result);
                    }
                    self.applied_phase = next;
                    debug!(
                        "applied batch {} in phase {} ({} commands)",
                        id,
                        next,
                        results.len()
                    );
                    if let Some(reply) = self.pending_replies.remove(&id) {
                        let _ = reply.send(Ok(results));
                    }
                    self.note_applied().await;
                }
            }
        }
    }

    async fn note_applied(&mut self) {
        self.applied_since_snapshot += 1;
        if self.applied_since_snapshot >= self.config.snapshot_every {
            self.applied_since_snapshot = 0;
            if let Err(e) = self.persist_saved_state().await {
                warn!("periodic snapshot failed: {}", e);
            }
        }
    }

    /// The lowest phase with no decision yet: where consensus is happening.
    fn working_phase(&self) -> Phase {
        let mut phase = self.applied_phase.next();
        while self.decisions.contains_key(&phase) {
            phase = phase.next();
        }
        phase
    }

    /// Round-robin proposer over the sorted fixed member list, skipping
    /// nodes not currently connected.
    fn proposer_for(&self, phase: Phase) -> Option<NodeId> {
        let members = self.topo.nodes();
        let n = members.len();
        let start = (phase.value() % n as u64) as usize;
        (0..n)
            .map(|i| &members[(start + i) % n])
            .find(|member| self.connected.contains(*member))
            .cloned()
    }

    async fn maybe_propose(&mut self) -> Result<()> {
        if self.mode != EngineMode::Active {
            return Ok(());
        }
        let phase = self.working_phase();
        let Some(proposer) = self.proposer_for(phase) else {
            return Ok(());
        };

        // Batches decided from other phases may still sit at the head.
        while let Some(head) = self.proposable.front().cloned() {
            let decided = self
                .decisions
                .values()
                .any(|decision| decision.batch_id.as_ref() == Some(&head));
            if decided {
                self.proposable.pop_front();
            } else {
                break;
            }
        }

        let our_turn = proposer == *self.topo.self_id();
        let proposal = {
            let vote_timeout = self.config.vote_timeout;
            let queue_empty = self.proposable.is_empty();
            let head = self.proposable.front().cloned();
            let ps = self.phases.entry(phase).or_default();
            if ps.is_decided() || ps.proposal.is_some() {
                None
            } else if !our_turn {
                // Not our slot: arm the timeout when progress is expected.
                if ps.deadline.is_none() && (!queue_empty || !ps.round1_votes.is_empty()) {
                    ps.deadline = Some(Instant::now() + vote_timeout);
                }
                None
            } else if let Some(id) = head {
                Some(id)
            } else if !ps.round1_votes.is_empty() {
                // Peers are waiting on our slot and we have nothing: close
                // the phase with the skip sentinel.
                Some(BatchId::skip())
            } else {
                None
            }
        };

        let Some(batch_id) = proposal else {
            return Ok(());
        };
        if !batch_id.is_skip() {
            self.proposable.pop_front();
        }
        {
            let ps = self.phases.entry(phase).or_default();
            ps.proposal = Some(batch_id.clone());
            ps.our_batch = (!batch_id.is_skip()).then(|| batch_id.clone());
            ps.round1_sent = true;
            ps.round1_votes
                .insert(self.topo.self_id().clone(), Vote::V1);
            ps.deadline = None;
        }

        debug!("proposing {} in phase {}", batch_id, phase);
        self.broadcast(WiredMessage::Propose {
            sender: self.topo.self_id().clone(),
            phase,
            batch_id,
        })
        .await;
        self.broadcast(WiredMessage::VoteRound1 {
            sender: self.topo.self_id().clone(),
            phase,
            value: Vote::V1,
        })
        .await;
        self.evaluate_round1(phase).await
    }

    // ---- timers -----------------------------------------------------------

    async fn on_tick(&mut self) -> Result<()> {
        match self.mode {
            EngineMode::Syncing => {
                let due = self
                    .sync
                    .as_ref()
                    .map_or(true, |s| s.last_sent.elapsed() >= self.config.sync_retry_interval);
                if due {
                    self.send_sync_request().await;
                }
            }
            EngineMode::Active => {
                let now = Instant::now();
                let expired: Vec<Phase> = self
                    .phases
                    .iter()
                    .filter(|(_, ps)| {
                        !ps.is_decided()
                            && !ps.round1_sent
                            && ps.deadline.is_some_and(|deadline| deadline <= now)
                    })
                    .map(|(phase, _)| *phase)
                    .collect();

                for phase in expired {
                    let vote = {
                        let Some(ps) = self.phases.get_mut(&phase) else {
                            continue;
                        };
                        if ps.is_decided() || ps.round1_sent {
                            false
                        } else {
                            // No proposal arrived in time: vote to skip.
                            ps.round1_sent = true;
                            ps.deadline = None;
                            ps.record_round1(self.topo.self_id().clone(), Vote::V0);
                            true
                        }
                    };
                    if vote {
                        warn!("phase {} timed out waiting for a proposal, voting V0", phase);
                        self.broadcast(WiredMessage::VoteRound1 {
                            sender: self.topo.self_id().clone(),
                            phase,
                            value: Vote::V0,
                        })
                        .await;
                        self.evaluate_round1(phase).await?;
                    }
                }
                self.make_progress().await?;
            }
            EngineMode::Dormant => {}
        }
        Ok(())
    }

    // ---- cleanup and persistence ------------------------------------------

    fn cleanup(&mut self) {
        let cutoff = self.applied_phase.back(self.config.phases_to_keep);
        if cutoff == Phase::ZERO {
            return;
        }

        let stale_batches: Vec<BatchId> = self
            .decisions
            .range(..=cutoff)
            .filter_map(|(_, decision)| decision.batch_id.clone())
            .filter(|id| !id.is_skip())
            .collect();

        let phases_before = self.phases.len();
        self.phases.retain(|phase, _| *phase > cutoff);
        self.decisions = self.decisions.split_off(&cutoff.next());
        for id in &stale_batches {
            self.batch_store.remove(id);
        }

        let removed = phases_before - self.phases.len();
        if removed > 0 || !stale_batches.is_empty() {
            debug!(
                "cleaned up {} phases and {} batches older than phase {}",
                removed,
                stale_batches.len(),
                cutoff
            );
        }
    }

    async fn restore_saved_state(&mut self) -> Result<()> {
        match self.persistence.load().await {
            Ok(Some(bytes)) => match SavedState::decode(&bytes) {
                Ok(saved) => {
                    self.state_machine.restore(&saved.snapshot).await?;
                    self.applied_phase = saved.applied_phase;
                    info!("restored snapshot at phase {}", self.applied_phase);
                }
                Err(e) => {
                    warn!("persisted state unreadable ({}), starting fresh", e);
                    self.state_machine.reset().await?;
                }
            },
            Ok(None) => {
                self.state_machine.reset().await?;
            }
            Err(e) => {
                warn!("failed to load persisted state ({}), starting fresh", e);
                self.state_machine.reset().await?;
            }
        }
        Ok(())
    }

    async fn persist_saved_state(&mut self) -> Result<()> {
        let snapshot = self.state_machine.snapshot().await?;
        let saved = SavedState::new(self.applied_phase, snapshot);
        let bytes = saved.encode()?;
        self.persistence.save(&bytes).await?;
        debug!("persisted state at phase {}", self.applied_phase);
        Ok(())
    }

    async fn finalize(&mut self) {
        for (_, reply) in self.pending_replies.drain() {
            let _ = reply.send(Err(RapportError::EngineStopped));
        }
        if let Err(e) = self.persist_saved_state().await {
            warn!("final snapshot failed: {}", e);
        }
        info!("engine stopped at phase {}", self.applied_phase);
    }

    // ---- transport helpers ------------------------------------------------

    async fn broadcast(&self, message: WiredMessage) {
        if let Err(e) = self.network.broadcast(message).await {
            debug!("broadcast failed: {}", e);
        }
    }

    async fn send_to(&self, target: &NodeId, message: WiredMessage) {
        if let Err(e) = self.network.send(target, message).await {
            debug!("send to {} failed: {}", target, e);
        }
    }
}
