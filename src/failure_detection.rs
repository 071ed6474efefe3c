//! Node-level failure detection shared by all groups of a node.
//!
//! Every packet received from a node counts as a sign of life. Nodes that are
//! monitored, i.e. share a live group with this node, are additionally pinged
//! so that silence can be told apart from idleness.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use instant::Instant;

use crate::util::lock;
use crate::NodeId;

pub struct FailureDetector {
    me: NodeId,
    timeout: Duration,
    coordinator_timeout: Duration,
    /// Nodes never heard from are treated as if heard from at this point.
    init: Instant,
    last_heard: Mutex<HashMap<NodeId, Instant>>,
    /// Monitored nodes with the number of live groups they are a member of.
    targets: Mutex<BTreeMap<NodeId, usize>>,
}

impl FailureDetector {
    pub fn new(me: NodeId, timeout: Duration, coordinator_timeout: Duration) -> Self {
        Self {
            me,
            timeout,
            coordinator_timeout,
            init: Instant::now(),
            last_heard: Mutex::new(HashMap::new()),
            targets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn heard_from(&self, node: NodeId) {
        self.heard_from_at(node, Instant::now());
    }

    pub fn heard_from_at(&self, node: NodeId, now: Instant) {
        let mut last_heard = lock(&self.last_heard);
        let entry = last_heard.entry(node).or_insert(now);
        *entry = (*entry).max(now);
    }

    fn last_heard(&self, node: NodeId) -> Instant {
        lock(&self.last_heard)
            .get(&node)
            .copied()
            .unwrap_or(self.init)
    }

    pub fn is_node_up(&self, node: NodeId) -> bool {
        self.is_node_up_at(node, Instant::now())
    }

    pub fn is_node_up_at(&self, node: NodeId, now: Instant) -> bool {
        node == self.me || now.saturating_duration_since(self.last_heard(node)) < self.timeout
    }

    /// Whether `node` has been silent long enough for any member to replace it
    /// as coordinator.
    pub fn last_coordinator_long_dead(&self, node: NodeId) -> bool {
        node != self.me
            && Instant::now().saturating_duration_since(self.last_heard(node))
                > self.coordinator_timeout
    }

    /// Starts pinging `members` on behalf of a group that became live.
    pub fn monitor(&self, members: &[NodeId]) {
        let mut targets = lock(&self.targets);

        for &member in members.iter().filter(|m| **m != self.me) {
            *targets.entry(member).or_insert(0) += 1;
        }
    }

    /// Undoes [`monitor`](Self::monitor) once the group is no longer live.
    ///
    /// Nodes no remaining group shares with this node are no longer pinged.
    pub fn unmonitor(&self, members: &[NodeId]) {
        let mut targets = lock(&self.targets);

        for member in members.iter().filter(|m| **m != self.me) {
            if let Some(count) = targets.get_mut(member) {
                *count -= 1;
                if *count == 0 {
                    targets.remove(member);
                }
            }
        }
    }

    pub fn ping_targets(&self) -> Vec<NodeId> {
        lock(&self.targets).keys().copied().collect()
    }
}
