use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::ballot::Ballot;
use crate::error::ProposeError;
use crate::packet::{PValue, RequestPacket};
use crate::quorum::QuorumTracker;
use crate::util::quorum_floor;
use crate::{GroupId, NodeId, Slot};

/// The coordinator role of an instance, bound to one ballot.
///
/// A coordinator is created when its node runs for coordinator and dropped
/// when it sees a higher ballot.
#[derive(Debug)]
pub(crate) struct Coordinator {
    ballot: Ballot,
    members: Vec<NodeId>,
    phase: Phase,
    /// The slot the next request will be assigned.
    next_slot: Slot,
    /// Requests waiting for phase 1 to complete.
    pending: VecDeque<RequestPacket>,
    proposals: BTreeMap<Slot, Proposal>,
    /// The next slot each member is going to execute, as last reported.
    frontiers: HashMap<NodeId, Slot>,
    stop_proposed: bool,
}

#[derive(Debug)]
enum Phase {
    Preparing {
        tracker: QuorumTracker,
        /// Highest-ballot value accepted per slot, across all promises.
        carryover: BTreeMap<Slot, PValue>,
        /// Slots below were executed by a promising acceptor.
        first_slot: Slot,
    },
    Active,
}

#[derive(Debug)]
struct Proposal {
    pvalue: PValue,
    tracker: QuorumTracker,
}

impl Coordinator {
    /// A coordinator that has yet to complete phase 1.
    pub fn preparing(ballot: Ballot, members: &[NodeId], next_slot: Slot) -> Self {
        Self {
            ballot,
            members: members.to_vec(),
            phase: Phase::Preparing {
                tracker: QuorumTracker::new(members),
                carryover: BTreeMap::new(),
                first_slot: next_slot,
            },
            next_slot,
            pending: VecDeque::new(),
            proposals: BTreeMap::new(),
            frontiers: HashMap::new(),
            stop_proposed: false,
        }
    }

    /// A coordinator restored from a paused group, with nothing in flight.
    pub fn active(ballot: Ballot, members: &[NodeId], next_slot: Slot) -> Self {
        Self {
            phase: Phase::Active,
            ..Self::preparing(ballot, members, next_slot)
        }
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Active)
    }

    pub fn next_slot(&self) -> Slot {
        self.next_slot
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.proposals.len()
    }

    pub fn is_quiescent(&self) -> bool {
        self.outstanding() == 0
    }

    /// How long phase 1 has been waiting, if it is still running.
    pub fn prepare_wait_time(&self) -> Option<Duration> {
        match &self.phase {
            Phase::Preparing { tracker, .. } => Some(tracker.total_wait_time()),
            Phase::Active => None,
        }
    }

    pub fn note_prepare_retransmission(&mut self) {
        if let Phase::Preparing { tracker, .. } = &mut self.phase {
            tracker.note_retransmission();
        }
    }

    /// Counts a promise for this coordinator's ballot.
    ///
    /// Returns the values to propose if this promise completed phase 1.
    pub fn handle_promise(
        &mut self,
        from: NodeId,
        accepted: Vec<PValue>,
        promised_first_slot: Slot,
    ) -> Option<Vec<PValue>> {
        let (tracker, carryover, first_slot) = match &mut self.phase {
            Phase::Preparing {
                tracker,
                carryover,
                first_slot,
            } => (tracker, carryover, first_slot),
            Phase::Active => return None,
        };

        if !tracker.update_heard_from(from) {
            return None;
        }

        *first_slot = (*first_slot).max(promised_first_slot);
        self.frontiers
            .entry(from)
            .and_modify(|f| *f = (*f).max(promised_first_slot))
            .or_insert(promised_first_slot);

        for pvalue in accepted {
            match carryover.get(&pvalue.slot) {
                Some(existing) if existing.ballot >= pvalue.ballot => {}
                _ => {
                    carryover.insert(pvalue.slot, pvalue);
                }
            }
        }

        if tracker.heard_from_majority() {
            Some(self.activate())
        } else {
            None
        }
    }

    fn activate(&mut self) -> Vec<PValue> {
        let (carryover, start) = match std::mem::replace(&mut self.phase, Phase::Active) {
            Phase::Preparing {
                carryover,
                first_slot,
                ..
            } => (carryover, first_slot.max(self.next_slot)),
            Phase::Active => return Vec::new(),
        };

        let mut carryover = carryover;
        let carryover = carryover.split_off(&start);
        let end = carryover.keys().next_back().map_or(start, |last| last + 1);

        let mut proposed = Vec::new();

        for slot in start..end {
            let request = match carryover.get(&slot) {
                Some(pvalue) => pvalue.request.clone(),
                // a hole no acceptor of the majority knows anything about
                None => RequestPacket::noop(),
            };

            if request.is_stop() {
                self.stop_proposed = true;
            }

            proposed.push(self.track(slot, request));
        }

        self.next_slot = end;

        while let Some(request) = self.pending.pop_front() {
            if self.stop_proposed {
                self.pending.clear();
                break;
            }

            let slot = self.next_slot;
            self.next_slot += 1;
            self.stop_proposed = request.is_stop();
            proposed.push(self.track(slot, request));
        }

        proposed
    }

    fn track(&mut self, slot: Slot, request: RequestPacket) -> PValue {
        let pvalue = PValue {
            slot,
            ballot: self.ballot,
            request,
        };

        self.proposals.insert(
            slot,
            Proposal {
                pvalue: pvalue.clone(),
                tracker: QuorumTracker::new(&self.members),
            },
        );

        pvalue
    }

    /// Assigns `request` a slot, or queues it until phase 1 completes.
    pub fn propose(
        &mut self,
        group: &GroupId,
        request: RequestPacket,
        max_outstanding: usize,
    ) -> Result<Option<PValue>, ProposeError> {
        if self.stop_proposed {
            return Err(ProposeError::Stopped(group.clone()));
        }

        let outstanding = self.outstanding();
        if outstanding >= max_outstanding {
            return Err(ProposeError::Overloaded(outstanding));
        }

        if !self.is_active() {
            self.pending.push_back(request);
            return Ok(None);
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        self.stop_proposed = request.is_stop();

        Ok(Some(self.track(slot, request)))
    }

    /// Counts an acceptance of this coordinator's proposal for `slot`.
    ///
    /// Returns the proposal if it is now decided.
    pub fn handle_accepted(&mut self, from: NodeId, slot: Slot, frontier: Slot) -> Option<PValue> {
        self.record_frontier(from, frontier);

        let proposal = self.proposals.get_mut(&slot)?;
        proposal.tracker.update_heard_from(from);

        if proposal.tracker.heard_from_majority() {
            self.proposals.remove(&slot).map(|p| p.pvalue)
        } else {
            None
        }
    }

    fn record_frontier(&mut self, member: NodeId, frontier: Slot) {
        let entry = self.frontiers.entry(member).or_insert(frontier);
        *entry = (*entry).max(frontier);
    }

    /// Every slot below was executed by a majority of members.
    pub fn majority_frontier(&self) -> Slot {
        let frontiers = self
            .members
            .iter()
            .map(|m| self.frontiers.get(m).copied().unwrap_or(0));

        quorum_floor(frontiers, self.members.len() / 2 + 1).unwrap_or(0)
    }

    /// Every slot below was executed by every member.
    pub fn all_frontier(&self) -> Slot {
        self.members
            .iter()
            .map(|m| self.frontiers.get(m).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Drops whatever this coordinator proposed for `decided.slot`.
    ///
    /// Returns the request that lost the slot to another value, which needs to
    /// be proposed again.
    pub fn handle_decided(&mut self, decided: &PValue) -> Option<RequestPacket> {
        let proposal = self.proposals.remove(&decided.slot)?;
        let request = proposal.pvalue.request;

        if request == decided.request || request.is_noop() {
            None
        } else {
            if request.is_stop() {
                self.stop_proposed = false;
            }
            Some(request)
        }
    }

    /// Proposals waiting for longer than `timeout` and the members that have
    /// yet to accept them.
    ///
    /// The wait time of every returned proposal is restarted.
    pub fn stale_proposals(&mut self, timeout: Duration) -> Vec<(PValue, Vec<NodeId>)> {
        self.proposals
            .values_mut()
            .filter(|p| p.tracker.total_wait_time() > timeout)
            .map(|p| {
                p.tracker.note_retransmission();

                let laggards = p
                    .tracker
                    .members()
                    .iter()
                    .copied()
                    .filter(|m| !p.tracker.already_heard_from(*m))
                    .collect();

                (p.pvalue.clone(), laggards)
            })
            .collect()
    }

    /// Gives up coordinating, returning every request that is not yet decided.
    pub fn resign(self) -> Vec<RequestPacket> {
        self.pending
            .into_iter()
            .chain(self.proposals.into_values().map(|p| p.pvalue.request))
            .filter(|r| !r.is_noop())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::Coordinator;
    use crate::ballot::Ballot;
    use crate::error::ProposeError;
    use crate::packet::{PValue, RequestPacket};

    fn pvalue(slot: u64, ballot: Ballot, value: &str) -> PValue {
        PValue {
            slot,
            ballot,
            request: RequestPacket::new(slot, value),
        }
    }

    #[test]
    fn test_adopts_highest_ballot_value() {
        let ballot = Ballot::new(1, 4);
        let mut coordinator = Coordinator::preparing(ballot, &[0, 1, 2, 3, 4], 10);

        assert!(coordinator
            .handle_promise(0, vec![pvalue(10, Ballot::new(0, 2), "V")], 10)
            .is_none());
        assert!(coordinator
            .handle_promise(3, vec![pvalue(10, Ballot::new(0, 1), "W")], 10)
            .is_none());

        let proposed = coordinator.handle_promise(4, Vec::new(), 10).unwrap();

        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].slot, 10);
        assert_eq!(proposed[0].ballot, ballot);
        assert_eq!(proposed[0].request.value, "V");
    }

    #[test]
    fn test_fills_holes_with_noops() {
        let ballot = Ballot::new(2, 1);
        let mut coordinator = Coordinator::preparing(ballot, &[1, 2, 3], 3);

        coordinator.handle_promise(2, vec![pvalue(6, Ballot::new(1, 2), "x")], 3);
        let proposed = coordinator
            .handle_promise(3, vec![pvalue(1, Ballot::new(1, 2), "old")], 4)
            .unwrap();

        let slots: Vec<_> = proposed.iter().map(|p| p.slot).collect();
        assert_eq!(slots, vec![4, 5, 6]);
        assert!(proposed[0].request.is_noop());
        assert!(proposed[1].request.is_noop());
        assert_eq!(proposed[2].request.value, "x");
        assert_eq!(coordinator.next_slot(), 7);
    }

    #[test]
    fn test_pending_requests_follow_carryover() {
        let mut coordinator = Coordinator::preparing(Ballot::new(1, 1), &[1], 0);

        assert_eq!(
            coordinator
                .propose(&"g".to_string(), RequestPacket::new(9, "late"), 10)
                .unwrap(),
            None
        );

        let proposed = coordinator
            .handle_promise(1, vec![pvalue(0, Ballot::new(0, 1), "early")], 0)
            .unwrap();

        let values: Vec<_> = proposed.iter().map(|p| p.request.value.as_str()).collect();
        assert_eq!(values, vec!["early", "late"]);
    }

    #[test]
    fn test_decides_on_majority() {
        let mut coordinator = Coordinator::active(Ballot::new(1, 1), &[1, 2, 3], 0);
        let proposed = coordinator
            .propose(&"g".to_string(), RequestPacket::new(1, "a"), 10)
            .unwrap()
            .unwrap();

        assert!(coordinator.handle_accepted(2, proposed.slot, 0).is_none());
        assert!(coordinator.handle_accepted(2, proposed.slot, 0).is_none());
        assert_eq!(coordinator.handle_accepted(3, proposed.slot, 0), Some(proposed));
        assert!(coordinator.is_quiescent());
    }

    #[test]
    fn test_frontiers() {
        let mut coordinator = Coordinator::active(Ballot::new(1, 1), &[1, 2, 3, 4, 5], 0);

        for (member, frontier) in [(1, 9), (2, 7), (3, 3), (4, 8)] {
            coordinator.handle_accepted(member, 0, frontier);
        }

        assert_eq!(coordinator.majority_frontier(), 7);
        assert_eq!(coordinator.all_frontier(), 0);
    }

    #[test]
    fn test_refuses_when_overloaded_or_stopping() {
        let group = "g".to_string();
        let mut coordinator = Coordinator::active(Ballot::new(1, 1), &[1], 0);

        coordinator.propose(&group, RequestPacket::new(1, "a"), 1).unwrap();
        assert!(matches!(
            coordinator.propose(&group, RequestPacket::new(2, "b"), 1),
            Err(ProposeError::Overloaded(1))
        ));

        let mut coordinator = Coordinator::active(Ballot::new(1, 1), &[1], 0);
        coordinator
            .propose(&group, RequestPacket::stop(1, "end"), 10)
            .unwrap();
        assert!(matches!(
            coordinator.propose(&group, RequestPacket::new(2, "b"), 10),
            Err(ProposeError::Stopped(_))
        ));
    }

    #[test]
    fn test_lost_slot_is_handed_back() {
        let mut coordinator = Coordinator::active(Ballot::new(1, 1), &[1, 2, 3], 5);
        let mine = coordinator
            .propose(&"g".to_string(), RequestPacket::new(1, "mine"), 10)
            .unwrap()
            .unwrap();

        let theirs = pvalue(5, Ballot::new(0, 2), "theirs");

        assert_eq!(coordinator.handle_decided(&theirs), Some(mine.request));
        assert!(coordinator.resign().is_empty());
    }
}
