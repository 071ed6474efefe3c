//! Defines the [`QuorumTracker`].

use std::time::Duration;

use instant::Instant;

use crate::NodeId;

/// Counts distinct acknowledgements against a fixed membership.
///
/// A tracker knows nothing about ballots or slots. Instances bind one tracker
/// to each round they wait on, i.e. to a prepare round or to the accept round
/// of a slot.
#[derive(Clone, Debug)]
pub struct QuorumTracker {
    members: Vec<NodeId>,
    responded: Vec<bool>,
    heard: usize,
    retransmissions: u32,
    since: Instant,
}

impl QuorumTracker {
    pub fn new(members: &[NodeId]) -> Self {
        Self {
            members: members.to_vec(),
            responded: vec![false; members.len()],
            heard: 0,
            retransmissions: 0,
            since: Instant::now(),
        }
    }

    /// Marks `member` as having responded.
    ///
    /// Returns whether this changed anything, i.e. `false` for non-members and
    /// for members that were heard from before.
    pub fn update_heard_from(&mut self, member: NodeId) -> bool {
        match self.index_of(member) {
            Some(i) if !self.responded[i] => {
                self.responded[i] = true;
                self.heard += 1;
                true
            }
            _ => false,
        }
    }

    pub fn heard_from_majority(&self) -> bool {
        self.heard > self.members.len() / 2
    }

    pub fn already_heard_from(&self, member: NodeId) -> bool {
        self.index_of(member).map_or(false, |i| self.responded[i])
    }

    pub fn contains(&self, member: NodeId) -> bool {
        self.index_of(member).is_some()
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn members_heard_from(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .zip(&self.responded)
            .filter(|(_, responded)| **responded)
            .map(|(m, _)| *m)
            .collect()
    }

    pub fn heard_count(&self) -> usize {
        self.heard
    }

    /// Time spent waiting since creation or the last reset.
    pub fn total_wait_time(&self) -> Duration {
        self.total_wait_time_at(Instant::now())
    }

    pub fn total_wait_time_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.since)
    }

    pub fn reset_wait_time(&mut self) {
        self.since = Instant::now();
    }

    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// Records a re-broadcast of the round and restarts the wait time.
    pub fn note_retransmission(&mut self) {
        self.retransmissions += 1;
        self.reset_wait_time();
    }

    fn index_of(&self, member: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == member)
    }
}
