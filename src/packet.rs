//! Wire format of the protocol.
//!
//! Packets are serialized as JSON. Every packet carries the group it belongs to
//! and the group's membership version; the body holds the message type and its
//! fields.
//!
//! A frame holds either a single packet or, when several packets of a group go
//! to the same recipients at once, a JSON array of them.

use serde::{Deserialize, Serialize};

use crate::ballot::Ballot;
use crate::error::CodecError;
use crate::recovery::SlotBallotState;
use crate::{GroupId, NodeId, Slot, Version};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RequestKind {
    Normal,
    Noop,
    /// Stops the group once executed.
    Stop,
}

/// A client-visible request.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RequestPacket {
    pub id: u64,
    /// The node the request entered the system through.
    pub client: Option<NodeId>,
    pub value: String,
    pub kind: RequestKind,
}

impl RequestPacket {
    pub fn new(id: u64, value: impl Into<String>) -> Self {
        Self {
            id,
            client: None,
            value: value.into(),
            kind: RequestKind::Normal,
        }
    }

    pub fn stop(id: u64, value: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Stop,
            ..Self::new(id, value)
        }
    }

    pub fn noop() -> Self {
        Self {
            kind: RequestKind::Noop,
            ..Self::new(0, "")
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == RequestKind::Noop
    }

    pub fn is_stop(&self) -> bool {
        self.kind == RequestKind::Stop
    }
}

/// A request bound to a slot under a ballot.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PValue {
    pub slot: Slot,
    pub ballot: Ballot,
    pub request: RequestPacket,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketBody {
    /// A request submitted at this node.
    Request(RequestPacket),

    /// A request forwarded to the coordinator.
    Proposal(RequestPacket),

    Prepare {
        ballot: Ballot,
    },

    PrepareReply {
        from: NodeId,
        /// The acceptor's ballot after handling the prepare.
        ballot: Ballot,
        accepted: Vec<PValue>,
        /// Slots below were decided and are not reported.
        first_slot: Slot,
    },

    Accept {
        from: NodeId,
        pvalue: PValue,
        /// A majority of members executed every slot below.
        majority_frontier: Slot,
        /// Every member executed every slot below.
        all_frontier: Slot,
    },

    AcceptReply {
        from: NodeId,
        ballot: Ballot,
        slot: Slot,
        /// The next slot the acceptor will execute.
        frontier: Slot,
    },

    /// `from` is the node relaying the decision, not necessarily the one
    /// that decided it.
    Decision {
        from: NodeId,
        pvalue: PValue,
    },

    SyncRequest {
        from: NodeId,
        missing: Vec<Slot>,
        far_behind: bool,
    },

    CheckpointState {
        from: NodeId,
        checkpoint: SlotBallotState,
    },

    FindReplicaGroup {
        from: NodeId,
        members: Option<Vec<NodeId>>,
    },

    FailureDetect {
        from: NodeId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PaxosPacket {
    pub group: GroupId,
    pub version: Version,
    pub body: PacketBody,
}

impl PaxosPacket {
    pub fn new(group: impl Into<GroupId>, version: Version, body: PacketBody) -> Self {
        Self {
            group: group.into(),
            version,
            body,
        }
    }

    /// Creates a packet that is yet to be stamped with its group and version.
    pub fn unstamped(body: PacketBody) -> Self {
        Self::new(GroupId::new(), 0, body)
    }

    pub fn stamp(&mut self, group: &str, version: Version) {
        self.group.clear();
        self.group.push_str(group);
        self.version = version;
    }

    pub fn sender(&self) -> Option<NodeId> {
        match &self.body {
            PacketBody::Prepare { ballot } => Some(ballot.coordinator),
            PacketBody::Accept { from, .. }
            | PacketBody::Decision { from, .. }
            | PacketBody::PrepareReply { from, .. }
            | PacketBody::AcceptReply { from, .. }
            | PacketBody::SyncRequest { from, .. }
            | PacketBody::CheckpointState { from, .. }
            | PacketBody::FindReplicaGroup { from, .. }
            | PacketBody::FailureDetect { from } => Some(*from),
            PacketBody::Request(r) | PacketBody::Proposal(r) => r.client,
        }
    }

    pub fn ballot(&self) -> Option<Ballot> {
        match &self.body {
            PacketBody::Prepare { ballot }
            | PacketBody::PrepareReply { ballot, .. }
            | PacketBody::AcceptReply { ballot, .. } => Some(*ballot),
            PacketBody::Accept { pvalue, .. } | PacketBody::Decision { pvalue, .. } => {
                Some(pvalue.ballot)
            }
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<Slot> {
        match &self.body {
            PacketBody::Accept { pvalue, .. } | PacketBody::Decision { pvalue, .. } => {
                Some(pvalue.slot)
            }
            PacketBody::AcceptReply { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// The slot of an in-flight accept round this packet belongs to.
    ///
    /// Retransmitting such a packet is moot once the slot was executed.
    pub fn accept_round_slot(&self) -> Option<Slot> {
        match &self.body {
            PacketBody::Accept { pvalue, .. } => Some(pvalue.slot),
            PacketBody::AcceptReply { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.body {
            PacketBody::Request(_) => "request",
            PacketBody::Proposal(_) => "proposal",
            PacketBody::Prepare { .. } => "prepare",
            PacketBody::PrepareReply { .. } => "prepare_reply",
            PacketBody::Accept { .. } => "accept",
            PacketBody::AcceptReply { .. } => "accept_reply",
            PacketBody::Decision { .. } => "decision",
            PacketBody::SyncRequest { .. } => "sync_request",
            PacketBody::CheckpointState { .. } => "checkpoint_state",
            PacketBody::FindReplicaGroup { .. } => "find_replica_group",
            PacketBody::FailureDetect { .. } => "failure_detect",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encodes `packets` into one frame.
pub fn encode_frame(packets: &[PaxosPacket]) -> Result<Vec<u8>, CodecError> {
    match packets {
        [packet] => packet.to_bytes(),
        batch => Ok(serde_json::to_vec(batch)?),
    }
}

/// Decodes a frame holding one packet or a batch of them.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<PaxosPacket>, CodecError> {
    let batched = frame
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map_or(false, |b| *b == b'[');

    if batched {
        Ok(serde_json::from_slice(frame)?)
    } else {
        Ok(vec![PaxosPacket::from_bytes(frame)?])
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_frame, encode_frame, PValue, PacketBody, PaxosPacket, RequestPacket};
    use crate::ballot::Ballot;

    #[test]
    fn test_json_carries_stamp_and_type() {
        let mut packet = PaxosPacket::unstamped(PacketBody::Decision {
            from: 3,
            pvalue: PValue {
                slot: 10,
                ballot: Ballot::new(0, 2),
                request: RequestPacket::new(7, "V"),
            },
        });
        packet.stamp("example.com", 3);

        let json: serde_json::Value = serde_json::from_slice(&packet.to_bytes().unwrap()).unwrap();

        assert_eq!(json["group"], "example.com");
        assert_eq!(json["version"], 3);
        assert_eq!(json["body"]["decision"]["pvalue"]["slot"], 10);
        assert_eq!(json["body"]["decision"]["pvalue"]["ballot"]["coordinator"], 2);
    }

    #[test]
    fn test_relayed_decision_names_relaying_node() {
        let packet = PaxosPacket::new(
            "g",
            0,
            PacketBody::Decision {
                from: 2,
                pvalue: PValue {
                    slot: 4,
                    ballot: Ballot::new(1, 1),
                    request: RequestPacket::new(4, "V"),
                },
            },
        );

        assert_eq!(packet.sender(), Some(2));
        assert_eq!(packet.ballot(), Some(Ballot::new(1, 1)));
    }

    #[test]
    fn test_decodes_what_it_encodes() {
        let packet = PaxosPacket::new(
            "g",
            1,
            PacketBody::Prepare {
                ballot: Ballot::new(4, 1),
            },
        );

        let decoded = PaxosPacket::from_bytes(&packet.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, packet);
        assert_eq!(decoded.sender(), Some(1));
        assert_eq!(decoded.slot(), None);
    }

    #[test]
    fn test_batch_frame_keeps_order() {
        let batch: Vec<_> = (0..3)
            .map(|slot| {
                PaxosPacket::new(
                    "g",
                    0,
                    PacketBody::AcceptReply {
                        from: 2,
                        ballot: Ballot::new(1, 1),
                        slot,
                        frontier: 0,
                    },
                )
            })
            .collect();

        let frame = encode_frame(&batch).unwrap();

        assert_eq!(frame.first(), Some(&b'['));
        assert_eq!(decode_frame(&frame).unwrap(), batch);
    }

    #[test]
    fn test_single_packet_frame_is_a_plain_packet() {
        let packet = PaxosPacket::new("g", 0, PacketBody::FailureDetect { from: 4 });

        let frame = encode_frame(std::slice::from_ref(&packet)).unwrap();

        assert_eq!(PaxosPacket::from_bytes(&frame).unwrap(), packet);
        assert_eq!(decode_frame(&frame).unwrap(), vec![packet]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(PaxosPacket::from_bytes(b"{\"group\": 1}").is_err());
        assert!(decode_frame(b"[{\"group\": 1}]").is_err());
    }
}
