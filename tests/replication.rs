mod registry_app;

use std::sync::Arc;
use std::time::Duration;

use replipaxos::membership::{Membership, StaticMembership};
use replipaxos::prototyping::LoopbackNetwork;
use replipaxos::Event;

use registry_app::{fast_config, propose, start_member, start_node};

const GROUP: &str = "example.com";

#[test]
fn five_nodes_execute_the_same_sequence() {
    let network = LoopbackNetwork::new();
    let members: Vec<_> = (1..=5).collect();

    let nodes: Vec<_> = members
        .iter()
        .map(|id| start_node(&network, *id, fast_config()))
        .collect();

    for (manager, _, _) in &nodes {
        manager
            .create_group(GROUP.to_string(), 0, members.clone(), None)
            .unwrap();
    }
    network.pump();

    assert!(nodes[0].0.is_coordinator(&GROUP.to_string()));

    for i in 0..12 {
        let (manager, _, _) = &nodes[i as usize % nodes.len()];
        propose(manager, GROUP, i, &format!("A 10.0.0.{}", i));
        network.pump();
    }

    let expected: Vec<_> = (0..12).map(|i| format!("A 10.0.0.{}", i)).collect();

    for (manager, _, registry) in &nodes {
        assert_eq!(registry.updates(GROUP), expected);
        assert_eq!(manager.next_slot(&GROUP.to_string()), Some(12));
    }
}

#[test]
fn requests_queued_during_election_are_executed() {
    let network = LoopbackNetwork::new();
    let members = vec![1, 2, 3];

    let nodes: Vec<_> = members
        .iter()
        .map(|id| start_node(&network, *id, fast_config()))
        .collect();

    for (manager, _, _) in &nodes {
        manager
            .create_group(GROUP.to_string(), 0, members.clone(), None)
            .unwrap();
    }

    // nothing was delivered yet, node 1 is still preparing
    propose(&nodes[0].0, GROUP, 1, "first");
    propose(&nodes[0].0, GROUP, 2, "second");
    network.pump();

    for (_, _, registry) in &nodes {
        assert_eq!(registry.updates(GROUP), vec!["first", "second"]);
    }
}

#[test]
fn coordinator_failure_is_survived() {
    let network = LoopbackNetwork::new();
    let members = vec![1, 2, 3];

    let mut nodes: Vec<_> = members
        .iter()
        .map(|id| start_node(&network, *id, fast_config()))
        .collect();

    for (manager, _, _) in &nodes {
        manager
            .create_group(GROUP.to_string(), 0, members.clone(), None)
            .unwrap();
    }
    network.pump();

    propose(&nodes[1].0, GROUP, 1, "before");
    network.pump();

    network.detach(1);
    nodes.remove(0);

    // long enough for node 1 to be considered down
    std::thread::sleep(Duration::from_millis(100));

    for (manager, _, _) in &nodes {
        manager.tick();
    }
    network.pump();

    let group = GROUP.to_string();
    assert!(nodes.iter().any(|(manager, _, _)| manager.is_coordinator(&group)));

    let elected = nodes.iter_mut().find_map(|(_, events, _)| {
        events
            .drain()
            .into_iter()
            .find(|e| matches!(e, Event::Elected { .. }))
    });
    assert!(elected.is_some());

    propose(&nodes[0].0, GROUP, 2, "after");
    network.pump();

    for (_, _, registry) in &nodes {
        assert_eq!(registry.updates(GROUP), vec!["before", "after"]);
    }
}

#[test]
fn lagging_node_catches_up() {
    let network = LoopbackNetwork::new();
    let members = vec![1, 2, 3];

    let nodes: Vec<_> = members
        .iter()
        .map(|id| start_node(&network, *id, fast_config()))
        .collect();

    for (manager, _, _) in &nodes {
        manager
            .create_group(GROUP.to_string(), 0, members.clone(), None)
            .unwrap();
    }
    network.pump();

    network.partition(1, 3);

    for i in 0..8 {
        propose(&nodes[0].0, GROUP, i, &format!("v{}", i));
        network.pump();
    }

    assert!(nodes[2].2.updates(GROUP).is_empty());
    assert_eq!(nodes[1].2.updates(GROUP).len(), 8);

    network.heal();
    std::thread::sleep(Duration::from_millis(20));

    // the next decision reveals the gap, node 3 asks node 1 for what it missed
    propose(&nodes[0].0, GROUP, 8, "v8");
    network.pump();
    std::thread::sleep(Duration::from_millis(20));
    nodes[2].0.tick();
    network.pump();

    let expected: Vec<_> = (0..9).map(|i| format!("v{}", i)).collect();
    assert_eq!(nodes[2].2.updates(GROUP), expected);
    assert_eq!(nodes[2].0.next_slot(&GROUP.to_string()), Some(9));
}

#[test]
fn members_create_groups_they_hear_about() {
    let network = LoopbackNetwork::new();
    let membership = Arc::new(StaticMembership::new());
    membership.insert(GROUP.to_string(), 4, vec![1, 2, 3]);

    let nodes: Vec<_> = (1..=3)
        .map(|id| start_member(&network, id, fast_config(), Arc::clone(&membership) as Arc<dyn Membership>))
        .collect();

    nodes[0]
        .0
        .create_group(GROUP.to_string(), 4, vec![1, 2, 3], None)
        .unwrap();
    network.pump();

    assert!(nodes[0].0.is_coordinator(&GROUP.to_string()));

    propose(&nodes[1].0, GROUP, 1, "A 192.0.2.1");
    network.pump();

    for (manager, _, registry) in &nodes {
        assert_eq!(manager.version_of(&GROUP.to_string()), Some(4));
        assert_eq!(registry.updates(GROUP), vec!["A 192.0.2.1"]);
    }
}

#[test]
fn nodes_ask_about_unknown_groups() {
    let network = LoopbackNetwork::new();

    let nodes: Vec<_> = (1..=3)
        .map(|id| start_node(&network, id, fast_config()))
        .collect();

    // only node 1 is told; the others learn about it from node 1's packets
    nodes[0]
        .0
        .create_group(GROUP.to_string(), 4, vec![1, 2, 3], None)
        .unwrap();
    network.pump();

    for (manager, _, _) in &nodes[1..] {
        assert_eq!(manager.version_of(&GROUP.to_string()), Some(4));
    }

    // the prepare that revealed the group was dropped, so it is sent again
    std::thread::sleep(Duration::from_millis(350));
    nodes[0].0.tick();
    network.pump();

    propose(&nodes[2].0, GROUP, 1, "found");
    network.pump();

    for (_, _, registry) in &nodes {
        assert_eq!(registry.updates(GROUP), vec!["found"]);
    }
}
