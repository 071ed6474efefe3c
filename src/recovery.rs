//! Descriptors used to cold-start, pause and resume a group's agreement state.
//!
//! On cold start an instance is rebuilt from the latest [`SlotBallotState`]
//! plus the log records above it, using the membership recorded in the group's
//! [`RecoveryInfo`]. A paused group is resumed from its [`IdlePaxosState`] plus
//! the accepted-but-undecided values still in the log.

use serde::{Deserialize, Serialize};

use crate::ballot::Ballot;
use crate::{GroupId, NodeId, Slot, Version};

/// Durable identity of a group.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RecoveryInfo {
    pub group: GroupId,
    pub version: Version,
    pub members: Vec<NodeId>,
    /// The application state the group was created with.
    pub state: Option<Vec<u8>>,
}

/// A checkpoint summary.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SlotBallotState {
    /// The last slot whose decision is reflected in `state`.
    pub slot: Slot,
    pub ballot: Ballot,
    /// Opaque application state.
    pub state: Option<Vec<u8>>,
}

/// The compact state a quiescent group is paused to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct IdlePaxosState {
    pub group: GroupId,
    pub version: Version,
    pub members: Vec<NodeId>,
    /// The next slot to execute.
    pub slot: Slot,
    pub ballot: Ballot,
    /// Accepted values below this slot were discarded.
    pub gc_slot: Slot,
    /// Ballot and next proposal slot of the coordinator, if it was active.
    pub coordinator: Option<(Ballot, Slot)>,
}
