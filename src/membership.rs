//! Defines the [`Membership`] trait, through which the placement service is
//! asked which nodes form a group.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{GroupId, NodeId, Version};

pub trait Membership: Send + Sync + 'static {
    /// The members of `group` at `version`, if known.
    fn current_members(&self, group: &GroupId, version: Version) -> Option<Vec<NodeId>>;
}

/// Knows no group at all. Groups are then only created explicitly or
/// discovered from peers.
pub struct NoMembership;

impl Membership for NoMembership {
    fn current_members(&self, _group: &GroupId, _version: Version) -> Option<Vec<NodeId>> {
        None
    }
}

/// A map-backed membership.
#[derive(Default)]
pub struct StaticMembership {
    groups: RwLock<HashMap<GroupId, (Version, Vec<NodeId>)>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group: GroupId, version: Version, members: Vec<NodeId>) {
        self.groups
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(group, (version, members));
    }
}

impl Membership for StaticMembership {
    fn current_members(&self, group: &GroupId, version: Version) -> Option<Vec<NodeId>> {
        self.groups
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(group)
            .filter(|(v, _)| *v == version)
            .map(|(_, members)| members.clone())
    }
}
