use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use replipaxos::membership::{Membership, NoMembership};
use replipaxos::prototyping::LoopbackNetwork;
use replipaxos::{EventStream, GroupId, NodeId, PaxosConfig, PaxosManager, Replicable, RequestPacket};

/// A name registry keeping, per record, every update in execution order.
#[derive(Default)]
pub struct Registry {
    records: Mutex<HashMap<GroupId, Vec<String>>>,
}

#[allow(dead_code)]
impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn updates(&self, group: &str) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .get(group)
            .cloned()
            .unwrap_or_default()
    }
}

impl Replicable for Registry {
    fn execute(&self, group: &GroupId, request: &RequestPacket, _recovery: bool) -> bool {
        self.records
            .lock()
            .unwrap()
            .entry(group.clone())
            .or_default()
            .push(request.value.clone());
        true
    }

    fn checkpoint(&self, group: &GroupId) -> Option<Vec<u8>> {
        let records = self.records.lock().unwrap();
        records
            .get(group)
            .map(|updates| serde_json::to_vec(updates).unwrap())
    }

    fn restore(&self, group: &GroupId, state: Option<&[u8]>) -> bool {
        let updates = match state {
            Some(state) => match serde_json::from_slice(state) {
                Ok(updates) => updates,
                Err(_) => return false,
            },
            None => Vec::new(),
        };

        self.records.lock().unwrap().insert(group.clone(), updates);
        true
    }
}

/// Sends the crate's log output to the test harness, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
pub fn fast_config() -> PaxosConfig {
    PaxosConfig::default()
        .with_checkpoint_interval(5)
        .with_time_unit(Duration::from_millis(10))
}

/// Starts a node attached to `network`. Timers are left to the test.
#[allow(dead_code)]
pub fn start_node(
    network: &LoopbackNetwork,
    id: NodeId,
    config: PaxosConfig,
) -> (PaxosManager, EventStream, Arc<Registry>) {
    start_member(network, id, config, Arc::new(NoMembership))
}

#[allow(dead_code)]
pub fn start_member(
    network: &LoopbackNetwork,
    id: NodeId,
    config: PaxosConfig,
    membership: Arc<dyn Membership>,
) -> (PaxosManager, EventStream, Arc<Registry>) {
    init_tracing();

    let registry = Registry::new();

    let (manager, events) = replipaxos::manager_builder()
        .for_node(id)
        .working_ephemerally()
        .communicating_via(network.transport_for(id))
        .executing(Arc::clone(&registry) as Arc<dyn Replicable>)
        .with_config(config)
        .with_membership(membership)
        .spawning_on(Arc::new(replipaxos::executor::Inline))
        .without_maintenance()
        .build()
        .unwrap();

    network.register(&manager);

    (manager, events, registry)
}

#[allow(dead_code)]
pub fn propose(manager: &PaxosManager, group: &str, id: u64, value: &str) {
    futures::executor::block_on(manager.propose(&group.to_string(), RequestPacket::new(id, value)))
        .unwrap();
}
