//! Defines the [`PaxosLogger`] trait and the in-memory [`MemoryLogger`].
//!
//! The log keeps, per group, the highest prepare this node promised, the values
//! it accepted, the decisions it learned and its latest checkpoint. Prepare and
//! accept records make promises durable before they are replied to; decision
//! records are replayed on top of the checkpoint on recovery and serve peers
//! which fell behind.
//!
//! The final state a group reached when it was stopped outlives the group
//! itself, keyed by group and version, until it is deleted explicitly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::packet::{PValue, PacketBody, PaxosPacket};
use crate::recovery::{IdlePaxosState, RecoveryInfo, SlotBallotState};
use crate::util::lock;
use crate::{GroupId, Slot, Version};

/// The durable log and checkpoint store.
pub trait PaxosLogger: Send + Sync + 'static {
    /// Appends a prepare, accept or decision. Other packets are ignored.
    fn append(&self, packet: &PaxosPacket) -> Result<(), LogError>;

    fn read_checkpoint(&self, group: &GroupId) -> Result<Option<SlotBallotState>, LogError>;

    /// Returns the logged promise plus accepts and decisions for slots from
    /// `slot` on, in that order.
    fn read_since(&self, group: &GroupId, slot: Slot) -> Result<Vec<PaxosPacket>, LogError>;

    /// Returns logged decisions for slots in `from..to`.
    fn logged_decisions(&self, group: &GroupId, from: Slot, to: Slot)
        -> Result<Vec<PValue>, LogError>;

    fn logged_accepts(&self, group: &GroupId, from: Slot) -> Result<Vec<PValue>, LogError>;

    /// Stores a checkpoint unless a later one is stored already.
    fn put_checkpoint(&self, group: &GroupId, checkpoint: SlotBallotState) -> Result<(), LogError>;

    /// Discards accepts and decisions for slots below `below`.
    fn garbage_collect(&self, group: &GroupId, below: Slot) -> Result<(), LogError>;

    fn put_recovery_info(&self, info: RecoveryInfo) -> Result<(), LogError>;

    fn recovery_info(&self, group: &GroupId) -> Result<Option<RecoveryInfo>, LogError>;

    fn recovery_infos(&self) -> Result<Vec<RecoveryInfo>, LogError>;

    /// Removes everything known about `group`, except its final states.
    fn remove(&self, group: &GroupId) -> Result<(), LogError>;

    /// Keeps `state` as what `group` stopped with at `version`.
    fn put_final_state(
        &self,
        group: &GroupId,
        version: Version,
        state: SlotBallotState,
    ) -> Result<(), LogError>;

    fn final_state(
        &self,
        group: &GroupId,
        version: Version,
    ) -> Result<Option<SlotBallotState>, LogError>;

    fn delete_final_state(&self, group: &GroupId, version: Version) -> Result<(), LogError>;

    fn pause(&self, state: IdlePaxosState) -> Result<(), LogError>;

    /// Removes and returns the pause record of `group`.
    fn unpause(&self, group: &GroupId) -> Result<Option<IdlePaxosState>, LogError>;
}

/// A log record as persisted by journaling loggers.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) enum Record {
    Message(PaxosPacket),
    Checkpoint(GroupId, SlotBallotState),
    GarbageCollect(GroupId, Slot),
    Recovery(RecoveryInfo),
    Remove(GroupId),
    Pause(IdlePaxosState),
    Unpause(GroupId),
    FinalState(GroupId, Version, SlotBallotState),
    DeleteFinalState(GroupId, Version),
}

#[derive(Default)]
struct GroupLog {
    promise: Option<PaxosPacket>,
    accepts: BTreeMap<Slot, PaxosPacket>,
    decisions: BTreeMap<Slot, PaxosPacket>,
    checkpoint: Option<SlotBallotState>,
    recovery: Option<RecoveryInfo>,
    paused: Option<IdlePaxosState>,
}

impl GroupLog {
    fn is_empty(&self) -> bool {
        self.promise.is_none()
            && self.accepts.is_empty()
            && self.decisions.is_empty()
            && self.checkpoint.is_none()
            && self.recovery.is_none()
            && self.paused.is_none()
    }
}

/// The state every logger maintains in memory, rebuilt from a journal.
#[derive(Default)]
pub(crate) struct LogIndex {
    groups: HashMap<GroupId, GroupLog>,
    final_states: BTreeMap<(GroupId, Version), SlotBallotState>,
}

impl LogIndex {
    /// Applies `record`, returning whether it changed anything.
    pub(crate) fn apply(&mut self, record: Record) -> bool {
        match record {
            Record::Message(packet) => self.append(packet),
            Record::Checkpoint(group, checkpoint) => {
                let log = self.groups.entry(group).or_default();
                let stale = log
                    .checkpoint
                    .as_ref()
                    .map_or(false, |existing| existing.slot > checkpoint.slot);
                if !stale {
                    log.checkpoint = Some(checkpoint);
                }
                !stale
            }
            Record::GarbageCollect(group, below) => match self.groups.get_mut(&group) {
                Some(log) => {
                    let before = log.accepts.len() + log.decisions.len();
                    log.accepts = log.accepts.split_off(&below);
                    log.decisions = log.decisions.split_off(&below);
                    before != log.accepts.len() + log.decisions.len()
                }
                None => false,
            },
            Record::Recovery(info) => {
                let log = self.groups.entry(info.group.clone()).or_default();
                log.recovery = Some(info);
                true
            }
            Record::Remove(group) => self.groups.remove(&group).is_some(),
            Record::Pause(state) => {
                let log = self.groups.entry(state.group.clone()).or_default();
                log.paused = Some(state);
                true
            }
            Record::Unpause(group) => self
                .groups
                .get_mut(&group)
                .map_or(false, |log| log.paused.take().is_some()),
            Record::FinalState(group, version, state) => {
                self.final_states.insert((group, version), state);
                true
            }
            Record::DeleteFinalState(group, version) => {
                self.final_states.remove(&(group, version)).is_some()
            }
        }
    }

    fn append(&mut self, packet: PaxosPacket) -> bool {
        match &packet.body {
            PacketBody::Prepare { ballot } => {
                let log = self.groups.entry(packet.group.clone()).or_default();
                let newer = log
                    .promise
                    .as_ref()
                    .and_then(PaxosPacket::ballot)
                    .map_or(true, |promised| *ballot > promised);
                if newer {
                    log.promise = Some(packet);
                }
                newer
            }
            PacketBody::Accept { pvalue, .. } => {
                let slot = pvalue.slot;
                let ballot = pvalue.ballot;
                let log = self.groups.entry(packet.group.clone()).or_default();
                let newer = log
                    .accepts
                    .get(&slot)
                    .and_then(PaxosPacket::ballot)
                    .map_or(true, |accepted| ballot > accepted);
                if newer {
                    log.accepts.insert(slot, packet);
                }
                newer
            }
            PacketBody::Decision { pvalue, .. } => {
                let slot = pvalue.slot;
                let log = self.groups.entry(packet.group.clone()).or_default();
                if log.decisions.contains_key(&slot) {
                    false
                } else {
                    log.decisions.insert(slot, packet);
                    true
                }
            }
            _ => false,
        }
    }

    pub(crate) fn checkpoint(&self, group: &GroupId) -> Option<SlotBallotState> {
        self.groups.get(group).and_then(|log| log.checkpoint.clone())
    }

    pub(crate) fn read_since(&self, group: &GroupId, slot: Slot) -> Vec<PaxosPacket> {
        let log = match self.groups.get(group) {
            Some(log) => log,
            None => return Vec::new(),
        };

        log.promise
            .iter()
            .cloned()
            .chain(log.accepts.range(slot..).map(|(_, p)| p.clone()))
            .chain(log.decisions.range(slot..).map(|(_, p)| p.clone()))
            .collect()
    }

    pub(crate) fn decisions(&self, group: &GroupId, from: Slot, to: Slot) -> Vec<PValue> {
        if from >= to {
            return Vec::new();
        }

        self.groups
            .get(group)
            .map(|log| {
                log.decisions
                    .range(from..to)
                    .filter_map(|(_, p)| pvalue_of(p))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn accepts(&self, group: &GroupId, from: Slot) -> Vec<PValue> {
        self.groups
            .get(group)
            .map(|log| {
                log.accepts
                    .range(from..)
                    .filter_map(|(_, p)| pvalue_of(p))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn recovery_info(&self, group: &GroupId) -> Option<RecoveryInfo> {
        self.groups.get(group).and_then(|log| log.recovery.clone())
    }

    pub(crate) fn recovery_infos(&self) -> Vec<RecoveryInfo> {
        let mut infos: Vec<_> = self
            .groups
            .values()
            .filter_map(|log| log.recovery.clone())
            .collect();
        infos.sort_by(|a, b| a.group.cmp(&b.group));
        infos
    }

    pub(crate) fn paused(&self, group: &GroupId) -> Option<IdlePaxosState> {
        self.groups.get(group).and_then(|log| log.paused.clone())
    }

    pub(crate) fn final_state(&self, group: &GroupId, version: Version) -> Option<SlotBallotState> {
        self.final_states.get(&(group.clone(), version)).cloned()
    }

    /// Records that reproduce the current state.
    pub(crate) fn live_records(&self) -> Vec<Record> {
        let mut records = Vec::new();

        let mut groups: Vec<_> = self.groups.iter().filter(|(_, l)| !l.is_empty()).collect();
        groups.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (group, log) in groups {
            if let Some(info) = &log.recovery {
                records.push(Record::Recovery(info.clone()));
            }
            if let Some(checkpoint) = &log.checkpoint {
                records.push(Record::Checkpoint(group.clone(), checkpoint.clone()));
            }
            records.extend(log.promise.iter().cloned().map(Record::Message));
            records.extend(log.accepts.values().cloned().map(Record::Message));
            records.extend(log.decisions.values().cloned().map(Record::Message));
            if let Some(paused) = &log.paused {
                records.push(Record::Pause(paused.clone()));
            }
        }

        records.extend(self.final_states.iter().map(|((group, version), state)| {
            Record::FinalState(group.clone(), *version, state.clone())
        }));

        records
    }
}

fn pvalue_of(packet: &PaxosPacket) -> Option<PValue> {
    match &packet.body {
        PacketBody::Accept { pvalue, .. } | PacketBody::Decision { pvalue, .. } => Some(pvalue.clone()),
        _ => None,
    }
}

/// Keeps the log in memory only.
///
/// Survives the loss of an instance's state, e.g. when it is paused, but not
/// the loss of the process.
#[derive(Default)]
pub struct MemoryLogger {
    index: Mutex<LogIndex>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&self, record: Record) {
        lock(&self.index).apply(record);
    }
}

impl PaxosLogger for MemoryLogger {
    fn append(&self, packet: &PaxosPacket) -> Result<(), LogError> {
        self.apply(Record::Message(packet.clone()));
        Ok(())
    }

    fn read_checkpoint(&self, group: &GroupId) -> Result<Option<SlotBallotState>, LogError> {
        Ok(lock(&self.index).checkpoint(group))
    }

    fn read_since(&self, group: &GroupId, slot: Slot) -> Result<Vec<PaxosPacket>, LogError> {
        Ok(lock(&self.index).read_since(group, slot))
    }

    fn logged_decisions(
        &self,
        group: &GroupId,
        from: Slot,
        to: Slot,
    ) -> Result<Vec<PValue>, LogError> {
        Ok(lock(&self.index).decisions(group, from, to))
    }

    fn logged_accepts(&self, group: &GroupId, from: Slot) -> Result<Vec<PValue>, LogError> {
        Ok(lock(&self.index).accepts(group, from))
    }

    fn put_checkpoint(&self, group: &GroupId, checkpoint: SlotBallotState) -> Result<(), LogError> {
        self.apply(Record::Checkpoint(group.clone(), checkpoint));
        Ok(())
    }

    fn garbage_collect(&self, group: &GroupId, below: Slot) -> Result<(), LogError> {
        self.apply(Record::GarbageCollect(group.clone(), below));
        Ok(())
    }

    fn put_recovery_info(&self, info: RecoveryInfo) -> Result<(), LogError> {
        self.apply(Record::Recovery(info));
        Ok(())
    }

    fn recovery_info(&self, group: &GroupId) -> Result<Option<RecoveryInfo>, LogError> {
        Ok(lock(&self.index).recovery_info(group))
    }

    fn recovery_infos(&self) -> Result<Vec<RecoveryInfo>, LogError> {
        Ok(lock(&self.index).recovery_infos())
    }

    fn remove(&self, group: &GroupId) -> Result<(), LogError> {
        self.apply(Record::Remove(group.clone()));
        Ok(())
    }

    fn put_final_state(
        &self,
        group: &GroupId,
        version: Version,
        state: SlotBallotState,
    ) -> Result<(), LogError> {
        self.apply(Record::FinalState(group.clone(), version, state));
        Ok(())
    }

    fn final_state(
        &self,
        group: &GroupId,
        version: Version,
    ) -> Result<Option<SlotBallotState>, LogError> {
        Ok(lock(&self.index).final_state(group, version))
    }

    fn delete_final_state(&self, group: &GroupId, version: Version) -> Result<(), LogError> {
        self.apply(Record::DeleteFinalState(group.clone(), version));
        Ok(())
    }

    fn pause(&self, state: IdlePaxosState) -> Result<(), LogError> {
        self.apply(Record::Pause(state));
        Ok(())
    }

    fn unpause(&self, group: &GroupId) -> Result<Option<IdlePaxosState>, LogError> {
        let mut index = lock(&self.index);
        let paused = index.paused(group);
        index.apply(Record::Unpause(group.clone()));
        Ok(paused)
    }
}
