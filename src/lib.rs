//! Replipaxos is the consensus core of a geo-distributed name service. Each
//! replicated record lives in a _replica group_, a small set of nodes that
//! agree on one totally ordered sequence of operations by running
//! [Multi-Paxos][wikipedia]. A single node typically participates in a very
//! large number of groups, so per-group state is kept small and groups that go
//! quiet are paused to the durable log until they see traffic again.
//!
//! [wikipedia]: https://en.wikipedia.org/wiki/Paxos_(computer_science)
//!
//! # Usage
//!
//! Three collaborators need to be provided: a [`Transport`] which delivers
//! frames to other nodes, a [`Replicable`] application which executes decided
//! requests and a [`PaxosLogger`] which persists protocol state. The latter may
//! be left to the builder by calling
//! [`working_in`][manager::ManagerBuilderWithNodeId::working_in] or
//! [`working_ephemerally`][manager::ManagerBuilderWithNodeId::working_ephemerally].
//!
//! ```
//! use std::sync::Arc;
//!
//! use replipaxos::{GroupId, NodeId, Replicable, RequestPacket, SendOutcome, Transport};
//!
//! struct Discard;
//!
//! impl Replicable for Discard {
//!     fn execute(&self, _group: &GroupId, _request: &RequestPacket, _recovery: bool) -> bool {
//!         true
//!     }
//!
//!     fn checkpoint(&self, _group: &GroupId) -> Option<Vec<u8>> {
//!         None
//!     }
//!
//!     fn restore(&self, _group: &GroupId, _state: Option<&[u8]>) -> bool {
//!         true
//!     }
//! }
//!
//! struct Nowhere;
//!
//! impl Transport for Nowhere {
//!     fn send(&self, _to: NodeId, _frame: &[u8]) -> SendOutcome {
//!         SendOutcome::Unreachable
//!     }
//! }
//!
//! let (manager, _events) = replipaxos::manager_builder()
//!     .for_node(1)
//!     .working_ephemerally()
//!     .communicating_via(Arc::new(Nowhere))
//!     .executing(Arc::new(Discard))
//!     .build()
//!     .unwrap();
//!
//! let group: GroupId = "example.com".to_string();
//! manager.create_group(group.clone(), 0, vec![1], None).unwrap();
//! futures::executor::block_on(manager.propose(&group, RequestPacket::new(1, "A 10.0.0.1")))
//!     .unwrap();
//!
//! assert_eq!(manager.next_slot(&group), Some(1));
//! ```
//!
//! # Protocol
//!
//! Every group runs an independent [`PaxosInstance`][instance::PaxosInstance].
//! Each instance is an acceptor and, at times, a coordinator.
//!
//! 1. Prepare `(ballot)`
//!
//!    A node that suspects the current coordinator to be dead and considers
//!    itself next in line picks a [`Ballot`] strictly greater than any it has
//!    seen and multicasts a prepare message.
//!
//! 2. Promise
//!
//!    Acceptors adopt the ballot if it is greater than the one they promised
//!    before. Either way they reply with their current ballot and every value
//!    they accepted but have not yet executed. Once a majority promised, the
//!    coordinator carries over the highest-ballot value of every reported
//!    slot, fills holes with no-ops and becomes active.
//!
//! 3. Accept `(slot, ballot, request)`
//!
//!    The active coordinator assigns each request the next free slot and
//!    multicasts it. Acceptors accept if the ballot is not lower than the one
//!    they promised.
//!
//! 4. Decide
//!
//!    Once a majority accepted, the slot is decided. The decision is logged and
//!    multicast, and every replica executes decisions strictly in slot order.
//!
//! Replicas that miss decisions ask their peers for them or, if too far behind,
//! for a checkpoint. Every `checkpoint_interval` slots the application state is
//! checkpointed and log entries every member has executed are discarded.

pub mod app;
pub mod ballot;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod failure_detection;
pub mod instance;
pub mod instrument;
pub mod journal;
pub mod liveness;
pub mod logger;
pub mod manager;
pub mod membership;
pub mod messenger;
pub mod packet;
#[cfg(feature = "prototyping")]
pub mod prototyping;
pub mod quorum;
pub mod rate_limit;
pub mod recovery;
pub mod task;

mod util;

pub use app::Replicable;
pub use ballot::Ballot;
pub use config::PaxosConfig;
pub use event::{Event, EventStream};
pub use instrument::Instrumentation;
pub use logger::PaxosLogger;
pub use manager::PaxosManager;
pub use membership::Membership;
pub use messenger::{Messenger, SendOutcome, Transport};
pub use packet::{PValue, PacketBody, PaxosPacket, RequestPacket};
pub use quorum::QuorumTracker;
pub use recovery::{IdlePaxosState, RecoveryInfo, SlotBallotState};
pub use task::{LogMessagingTask, MessagingTask, Task};

/// Identifies a node.
pub type NodeId = u32;

/// Identifies a replica group, usually the name of the replicated record.
pub type GroupId = String;

/// Membership version of a replica group.
pub type Version = u16;

/// Position in a group's sequence of decisions.
pub type Slot = u64;

/// The epoch part of a [`Ballot`].
pub type BallotNumber = u32;

/// Returns a blank [`ManagerBuilder`][manager::ManagerBuilderBlank].
pub fn manager_builder() -> manager::ManagerBuilderBlank {
    manager::ManagerBuilderBlank::new()
}
