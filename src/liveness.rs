//! Per-group liveness bookkeeping which drives idle eviction and rate-limits
//! resynchronization.

use std::time::Duration;

use instant::Instant;

use crate::GroupId;

/// Volatile liveness state of one group.
///
/// Groups that go quiet are candidates for eviction, groups that are noisy are
/// protected from redundant resync traffic.
#[derive(Clone, Debug)]
pub struct ActivePaxosState {
    group: GroupId,
    last_active: Instant,
    last_sync: Instant,
    idle_threshold: Duration,
    min_resync_delay: Duration,
}

impl ActivePaxosState {
    pub fn new(group: GroupId, idle_threshold: Duration, min_resync_delay: Duration) -> Self {
        let now = Instant::now();

        Self {
            group,
            last_active: now,
            // allow the first sync right away
            last_sync: now.checked_sub(min_resync_delay).unwrap_or(now),
            idle_threshold,
            min_resync_delay,
        }
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&mut self, now: Instant) {
        self.last_active = self.last_active.max(now);
    }

    /// Records a sync, which also counts as activity.
    pub fn just_synced(&mut self) {
        self.just_synced_at(Instant::now());
    }

    pub fn just_synced_at(&mut self, now: Instant) {
        self.last_sync = self.last_sync.max(now);
        self.touch_at(now);
    }

    pub fn is_long_idle(&self) -> bool {
        self.is_long_idle_at(Instant::now())
    }

    pub fn is_long_idle_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_active) > self.idle_threshold
    }

    pub fn can_sync(&self) -> bool {
        self.can_sync_at(Instant::now())
    }

    pub fn can_sync_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sync) >= self.min_resync_delay
    }
}
