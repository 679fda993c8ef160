//! Registry Conflict Tests
//!
//! Every registry mutation is conditional. Concurrent writers race on the
//! same record and exactly one wins; the loser sees a conflict, never a
//! half-applied change.

use std::sync::Barrier;
use std::thread;

use walwarden::error::{ClusterError, ErrorClass};
use walwarden::registry::{
    Demotion, MemoryRegistry, NodeChange, NodeId, NodeRecord, NodeRegistry, NodeRole,
};

fn record(id: u32, role: NodeRole, upstream: Option<u32>) -> NodeRecord {
    NodeRecord {
        id: NodeId(id),
        name: format!("node{}", id),
        role,
        upstream_id: upstream.map(NodeId),
        connection_target: format!("host=node{} dbname=walwarden", id),
        ssh_target: format!("node{}", id),
        slot_name: String::new(),
        priority: 100,
        active: true,
    }
}

fn three_nodes() -> MemoryRegistry {
    MemoryRegistry::with_nodes([
        record(1, NodeRole::Leader, None),
        record(2, NodeRole::Standby, Some(1)),
        record(3, NodeRole::Standby, Some(1)),
    ])
}

// =============================================================================
// Leadership Transfer Tests
// =============================================================================

/// Two standbys promoting at once: one transfer succeeds, one conflicts.
#[test]
fn test_concurrent_transfers_single_winner() {
    for _ in 0..50 {
        let registry = three_nodes();
        let barrier = Barrier::new(2);

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = [2, 3]
                .into_iter()
                .map(|id| {
                    let registry = &registry;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        registry.transfer_leadership(NodeId(id), NodeId(1), Demotion::Failed)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<&NodeRecord> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(loser.class(), ErrorClass::Conflict);

        let leaders: Vec<NodeRecord> = registry
            .nodes()
            .unwrap()
            .into_iter()
            .filter(|n| n.active && n.role == NodeRole::Leader)
            .collect();
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders[0].id, winners[0].id);
    }
}

/// A planned transfer keeps the old leader as a standby of the new one.
#[test]
fn test_transfer_with_standby_demotion() {
    let registry = three_nodes();
    let new_leader = registry
        .transfer_leadership(NodeId(2), NodeId(1), Demotion::Standby)
        .unwrap();
    assert_eq!(new_leader.role, NodeRole::Leader);
    assert_eq!(new_leader.upstream_id, None);

    let old = registry.node(NodeId(1)).unwrap().unwrap();
    assert_eq!(old.role, NodeRole::Standby);
    assert_eq!(old.upstream_id, Some(NodeId(2)));
    assert!(old.active);
    // Siblings are not touched by the transfer itself.
    assert_eq!(registry.node(NodeId(3)).unwrap().unwrap().upstream_id, Some(NodeId(1)));
}

/// A witness can never receive leadership.
#[test]
fn test_transfer_to_witness_conflicts() {
    let registry = three_nodes();
    registry.register(&record(4, NodeRole::Witness, Some(1)), false).unwrap();
    let err = registry
        .transfer_leadership(NodeId(4), NodeId(1), Demotion::Failed)
        .unwrap_err();
    assert!(matches!(err, ClusterError::Conflict(_)));
    assert_eq!(registry.leader().unwrap().unwrap().id, NodeId(1));
}

// =============================================================================
// Conditional Update Tests
// =============================================================================

/// An update based on a stale view is rejected and changes nothing.
#[test]
fn test_stale_update_conflicts() {
    let registry = three_nodes();
    let stale = registry.node(NodeId(3)).unwrap().unwrap();
    registry
        .update_node(NodeId(3), &stale.condition(), &NodeChange::follow(NodeId(2)))
        .unwrap();

    let err = registry
        .update_node(NodeId(3), &stale.condition(), &NodeChange::deactivate())
        .unwrap_err();
    assert!(matches!(err, ClusterError::Conflict(_)));
    let current = registry.node(NodeId(3)).unwrap().unwrap();
    assert!(current.active);
    assert_eq!(current.upstream_id, Some(NodeId(2)));
}

/// Registering an existing id needs `replace`.
#[test]
fn test_duplicate_registration_conflicts() {
    let registry = three_nodes();
    let mut changed = record(2, NodeRole::Standby, Some(1));
    changed.priority = 10;

    let err = registry.register(&changed, false).unwrap_err();
    assert!(matches!(err, ClusterError::Conflict(_)));
    assert_eq!(registry.node(NodeId(2)).unwrap().unwrap().priority, 100);

    registry.register(&changed, true).unwrap();
    assert_eq!(registry.node(NodeId(2)).unwrap().unwrap().priority, 10);
}

/// Two active leaders in the registry are an ambiguity, not a choice.
#[test]
fn test_two_leaders_is_fatal() {
    let registry = three_nodes();
    registry.register(&record(4, NodeRole::Leader, None), false).unwrap();
    let err = registry.leader().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Fatal);
}

/// Unregistering reports whether the record existed.
#[test]
fn test_unregister() {
    let registry = three_nodes();
    assert!(registry.unregister(NodeId(3)).unwrap());
    assert!(!registry.unregister(NodeId(3)).unwrap());
    assert_eq!(registry.nodes().unwrap().len(), 2);
}
