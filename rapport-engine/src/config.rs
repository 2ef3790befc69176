use rapport_core::NodeId;
use std::net::SocketAddr;
use std::time::Duration;

/// Tuning knobs for the consensus engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Age-out of old per-phase state.
    pub cleanup_interval: Duration,
    /// Re-issue of an unanswered `SyncRequest`.
    pub sync_retry_interval: Duration,
    /// Retention window for phase state past the applied phase.
    pub phases_to_keep: u64,
    /// Per-phase wait for a proposal before voting V0.
    pub vote_timeout: Duration,
    /// A `SavedState` is captured every this many applied phases.
    pub snapshot_every: u64,
    /// Protocol messages buffered while dormant before dropping.
    pub dormant_queue_limit: usize,
    /// Granularity of the engine's internal deadline checks.
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(30),
            sync_retry_interval: Duration::from_secs(2),
            phases_to_keep: 100,
            vote_timeout: Duration::from_secs(5),
            snapshot_every: 50,
            dormant_queue_limit: 1024,
            tick_interval: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_sync_retry_interval(mut self, interval: Duration) -> Self {
        self.sync_retry_interval = interval;
        self
    }

    /// Also re-derives `snapshot_every` as half the window, matching the
    /// default relationship.
    pub fn with_phases_to_keep(mut self, phases: u64) -> Self {
        self.phases_to_keep = phases;
        self.snapshot_every = (phases / 2).max(1);
        self
    }

    pub fn with_vote_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    pub fn with_snapshot_every(mut self, applied_phases: u64) -> Self {
        self.snapshot_every = applied_phases.max(1);
        self
    }
}

/// Configuration of the fixed cluster and the liveness probes the topology
/// manager runs on top of it.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// The fixed member list with transport addresses.
    pub core_nodes: Vec<(NodeId, SocketAddr)>,
    /// How often a `Ping` is broadcast.
    pub ping_interval: Duration,
    /// How often silent peers are reconciled out of the connected set.
    pub reconciliation_interval: Duration,
    /// A peer is considered gone after this long without a `Pong`.
    pub peer_timeout: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            core_nodes: Vec::new(),
            ping_interval: Duration::from_secs(1),
            reconciliation_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(3),
        }
    }
}

impl TopologyConfig {
    pub fn with_core_nodes(mut self, nodes: Vec<(NodeId, SocketAddr)>) -> Self {
        self.core_nodes = nodes;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_to_keep_drives_snapshot_cadence() {
        let config = EngineConfig::default().with_phases_to_keep(40);
        assert_eq!(config.phases_to_keep, 40);
        assert_eq!(config.snapshot_every, 20);

        let tiny = EngineConfig::default().with_phases_to_keep(1);
        assert_eq!(tiny.snapshot_every, 1);
    }
}
