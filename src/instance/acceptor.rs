use std::collections::BTreeMap;

use crate::ballot::Ballot;
use crate::packet::PValue;
use crate::Slot;

/// The acceptor role of an instance, which every member plays.
#[derive(Debug)]
pub(crate) struct Acceptor {
    /// The highest ballot promised.
    ballot: Ballot,
    accepted: BTreeMap<Slot, PValue>,
    /// Decided but not yet executed.
    committed: BTreeMap<Slot, PValue>,
    /// The next slot to execute.
    slot: Slot,
    /// Log entries below were garbage-collected.
    gc_slot: Slot,
    /// Every member executed every slot below.
    all_frontier: Slot,
}

impl Acceptor {
    pub fn new(ballot: Ballot, slot: Slot, gc_slot: Slot) -> Self {
        Self {
            ballot,
            accepted: BTreeMap::new(),
            committed: BTreeMap::new(),
            slot,
            gc_slot,
            all_frontier: 0,
        }
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn gc_slot(&self) -> Slot {
        self.gc_slot
    }

    pub fn all_frontier(&self) -> Slot {
        self.all_frontier
    }

    /// Adopts `ballot` if it is greater than the one promised.
    pub fn handle_prepare(&mut self, ballot: Ballot) -> bool {
        if ballot > self.ballot {
            self.ballot = ballot;
            true
        } else {
            false
        }
    }

    /// Raises the promised ballot to `ballot`, if greater.
    pub fn observe(&mut self, ballot: Ballot) {
        self.handle_prepare(ballot);
    }

    /// The accepted values a promise reports and the slot they start at.
    ///
    /// Values below the start are decided and were executed locally.
    pub fn promise(&self) -> (Vec<PValue>, Slot) {
        let first_slot = self.slot.max(self.gc_slot);

        (
            self.accepted.range(first_slot..).map(|(_, p)| p.clone()).collect(),
            first_slot,
        )
    }

    /// Accepts `pvalue` unless a greater ballot was promised.
    ///
    /// Values for executed slots are acknowledged but not stored.
    pub fn handle_accept(&mut self, pvalue: &PValue) -> bool {
        if pvalue.ballot < self.ballot {
            return false;
        }

        self.ballot = pvalue.ballot;

        if pvalue.slot >= self.slot {
            self.accepted.insert(pvalue.slot, pvalue.clone());
        }

        true
    }

    /// Restores a logged acceptance regardless of the ballot promised since.
    pub fn restore_accepted(&mut self, pvalue: PValue) {
        self.observe(pvalue.ballot);

        if pvalue.slot < self.slot {
            return;
        }

        match self.accepted.get(&pvalue.slot) {
            Some(existing) if existing.ballot >= pvalue.ballot => {}
            _ => {
                self.accepted.insert(pvalue.slot, pvalue);
            }
        }
    }

    /// Takes note of what the coordinator knows about all members' progress.
    pub fn handle_frontiers(&mut self, majority_frontier: Slot, all_frontier: Slot) {
        // any majority of promises includes a member that executed these
        self.accepted = self.accepted.split_off(&majority_frontier);
        self.all_frontier = self.all_frontier.max(all_frontier);
    }

    /// Returns whether `pvalue` was newly committed.
    pub fn commit(&mut self, pvalue: PValue) -> bool {
        if pvalue.slot < self.slot || self.committed.contains_key(&pvalue.slot) {
            return false;
        }

        self.committed.insert(pvalue.slot, pvalue);
        true
    }

    pub fn is_committed(&self, slot: Slot) -> bool {
        slot < self.slot || self.committed.contains_key(&slot)
    }

    pub fn committed(&self, slot: Slot) -> Option<&PValue> {
        self.committed.get(&slot)
    }

    pub fn next_executable(&self) -> Option<&PValue> {
        self.committed.get(&self.slot)
    }

    /// Moves on after the next executable slot was executed.
    pub fn advance(&mut self) -> Option<PValue> {
        let executed = self.committed.remove(&self.slot)?;

        self.slot += 1;
        self.accepted = self.accepted.split_off(&self.slot);

        Some(executed)
    }

    pub fn max_committed(&self) -> Option<Slot> {
        self.committed.keys().next_back().copied()
    }

    pub fn has_unexecuted(&self) -> bool {
        !self.committed.is_empty()
    }

    /// Slots between the next to execute and the last committed that are not
    /// committed yet, at most `limit` of them.
    pub fn missing(&self, limit: usize) -> Vec<Slot> {
        let max = match self.max_committed() {
            Some(max) => max,
            None => return Vec::new(),
        };

        (self.slot..max)
            .filter(|s| !self.committed.contains_key(s))
            .take(limit)
            .collect()
    }

    pub fn garbage_collected(&mut self, below: Slot) {
        self.gc_slot = self.gc_slot.max(below);
    }

    /// Skips ahead past a checkpoint of `slot`.
    pub fn install(&mut self, slot: Slot) {
        self.slot = slot + 1;
        self.gc_slot = self.gc_slot.max(self.slot);
        self.committed = self.committed.split_off(&self.slot);
        self.accepted = self.accepted.split_off(&self.slot);
    }
}
