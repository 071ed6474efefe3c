//! An in-process network for prototyping and testing.
//!
//! Frames are queued until [`LoopbackNetwork::pump`] delivers them, which
//! keeps runs deterministic apart from the configured packet loss.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::trace;

use crate::manager::PaxosManager;
use crate::messenger::{SendOutcome, Transport};
use crate::util::lock;
use crate::NodeId;

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Network>>,
}

#[derive(Default)]
struct Network {
    queue: VecDeque<(NodeId, NodeId, Vec<u8>)>,
    managers: HashMap<NodeId, PaxosManager>,
    detached: HashSet<NodeId>,
    /// Links that silently drop everything, stored in both directions.
    partitioned: HashSet<(NodeId, NodeId)>,
    packet_loss: f32,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network that drops the given fraction of frames.
    pub fn with_packet_loss(packet_loss: f32) -> Self {
        assert!((0.0..1.0).contains(&packet_loss), "packet loss must be in [0, 1)");

        let network = Self::default();
        lock(&network.inner).packet_loss = packet_loss;
        network
    }

    pub fn transport_for(&self, node: NodeId) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport {
            me: node,
            network: Arc::clone(&self.inner),
        })
    }

    /// Makes `manager` receive the frames addressed to its node.
    pub fn register(&self, manager: &PaxosManager) {
        let mut network = lock(&self.inner);

        network.detached.remove(&manager.node_id());
        network.managers.insert(manager.node_id(), manager.clone());
    }

    /// Disconnects `node`, e.g. to simulate a crash. Queued frames from and to
    /// it are discarded.
    pub fn detach(&self, node: NodeId) {
        let mut network = lock(&self.inner);

        network.detached.insert(node);
        network.managers.remove(&node);
        network
            .queue
            .retain(|(from, to, _)| *from != node && *to != node);
    }

    pub fn partition(&self, a: NodeId, b: NodeId) {
        let mut network = lock(&self.inner);

        network.partitioned.insert((a, b));
        network.partitioned.insert((b, a));
    }

    pub fn heal(&self) {
        lock(&self.inner).partitioned.clear();
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    /// Delivers frames until none are left, returning how many were delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;

        loop {
            let (to, frame, manager) = {
                let mut network = lock(&self.inner);

                let (from, to, frame) = match network.queue.pop_front() {
                    Some(next) => next,
                    None => break,
                };

                match network.managers.get(&to) {
                    Some(manager) => (to, frame, manager.clone()),
                    None => {
                        trace!(from, to, "Dropping frame for unregistered node.");
                        continue;
                    }
                }
            };

            trace!(to, len = frame.len(), "Delivering frame.");

            manager.handle_incoming(&frame);
            delivered += 1;
        }

        delivered
    }
}

struct LoopbackTransport {
    me: NodeId,
    network: Arc<Mutex<Network>>,
}

impl Transport for LoopbackTransport {
    fn send(&self, to: NodeId, frame: &[u8]) -> SendOutcome {
        let mut network = lock(&self.network);

        if network.detached.contains(&self.me) || network.detached.contains(&to) {
            return SendOutcome::Unreachable;
        }

        let lost = network.partitioned.contains(&(self.me, to))
            || (network.packet_loss > 0.0 && rand::thread_rng().gen::<f32>() < network.packet_loss);

        if lost {
            trace!(from = self.me, to, "Frame lost.");
        } else {
            network.queue.push_back((self.me, to, frame.to_vec()));
        }

        SendOutcome::Sent(frame.len())
    }
}
