//! Defines [`Ballot`], the leadership epoch of a replica group.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{BallotNumber, NodeId};

/// A `(number, coordinator)` pair identifying who may lead a group.
///
/// Ballots are compared by number first and by coordinator second. Both
/// comparisons use serial number arithmetic, i.e. the sign of the wrapping
/// difference, so that numbers may wrap around without reordering ballots
/// that are less than `2^31` apart.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct Ballot {
    pub number: BallotNumber,
    pub coordinator: NodeId,
}

impl Ballot {
    pub const fn new(number: BallotNumber, coordinator: NodeId) -> Self {
        Self {
            number,
            coordinator,
        }
    }

    pub fn compare(&self, other: &Ballot) -> Ordering {
        self.compare_raw(other.number, other.coordinator)
    }

    /// Compares against the raw fields of a ballot without constructing one.
    pub fn compare_raw(&self, number: BallotNumber, coordinator: NodeId) -> Ordering {
        match serial_cmp(self.number, number) {
            Ordering::Equal => serial_cmp(self.coordinator, coordinator),
            ordering => ordering,
        }
    }

    /// The smallest ballot with which `node` can supersede this one.
    pub fn next_for(&self, node: NodeId) -> Ballot {
        Ballot::new(self.number.wrapping_add(1), node)
    }

    pub fn is_coordinated_by(&self, node: NodeId) -> bool {
        self.coordinator == node
    }
}

fn serial_cmp(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

impl PartialEq for Ballot {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Ballot {}

impl Hash for Ballot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.number.hash(state);
        self.coordinator.hash(state);
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Ballot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.number, self.coordinator)
    }
}
