//! Tunables of a node.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PaxosConfig {
    /// Application state is checkpointed after executing every slot that is a
    /// multiple of this.
    pub checkpoint_interval: u64,

    /// How far a decision may run ahead of execution before missing decisions
    /// are requested.
    pub sync_threshold: u64,

    /// Lagging further behind than this is remedied with a checkpoint rather
    /// than individual decisions.
    pub max_sync_gap: u64,

    /// Requests are rejected while the coordinator has this many proposals in
    /// flight.
    pub max_outstanding: usize,

    /// A coordinator re-sends its prepare after waiting this long for a
    /// majority of promises.
    pub election_timeout: Duration,

    /// Undecided slots are re-broadcast after this long.
    pub rebroadcast_timeout: Duration,

    /// Groups without activity for this long are paused.
    pub idle_threshold: Duration,

    pub min_resync_delay: Duration,

    /// Delay before the first retransmission of a partially sent frame.
    pub retransmit_base_delay: Duration,

    /// Size of the pool running retransmissions and maintenance.
    pub messenger_workers: usize,

    /// Nodes not heard from for this long are considered down.
    pub failure_detection_timeout: Duration,

    pub ping_interval: Duration,

    /// A coordinator not heard from for this long may be replaced by any
    /// member, not just the next in line.
    pub coordinator_failure_timeout: Duration,

    pub maintenance_interval: Duration,

    /// How long killed groups are remembered.
    pub morgue_delay: Duration,

    /// Upper bound of proposals admitted per second.
    pub max_request_rate: Option<u32>,

    /// Weight of new samples in the instrumentation's moving averages.
    pub profiler_alpha: f64,
}

impl PaxosConfig {
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        assert!(interval > 0, "checkpoint interval must be positive");

        self.checkpoint_interval = interval;
        self.max_sync_gap = interval - 1;
        self
    }

    /// Shrinks every timeout to `unit`-based values, for fast local clusters.
    pub fn with_time_unit(mut self, unit: Duration) -> Self {
        self.election_timeout = unit * 30;
        self.rebroadcast_timeout = unit;
        self.min_resync_delay = unit;
        self.retransmit_base_delay = unit;
        self.failure_detection_timeout = unit * 6;
        self.ping_interval = unit * 3;
        self.coordinator_failure_timeout = unit * 18;
        self.maintenance_interval = unit;
        self
    }
}

impl Default for PaxosConfig {
    fn default() -> Self {
        let checkpoint_interval = 100;

        Self {
            checkpoint_interval,
            sync_threshold: 10,
            max_sync_gap: checkpoint_interval - 1,
            max_outstanding: 100 * checkpoint_interval as usize,
            election_timeout: Duration::from_secs(30),
            rebroadcast_timeout: Duration::from_secs(1),
            idle_threshold: Duration::from_secs(60),
            min_resync_delay: Duration::from_secs(1),
            retransmit_base_delay: Duration::from_millis(1000),
            messenger_workers: 5,
            failure_detection_timeout: Duration::from_secs(6),
            ping_interval: Duration::from_secs(3),
            coordinator_failure_timeout: Duration::from_secs(18),
            maintenance_interval: Duration::from_secs(1),
            morgue_delay: Duration::from_secs(30),
            max_request_rate: None,
            profiler_alpha: 0.05,
        }
    }
}
