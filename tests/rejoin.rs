//! Promote and Rejoin Tests
//!
//! Operator-driven recovery of a cluster that lost its leader:
//! - `promote` refuses while a leader is still running
//! - `rejoin` decides everything it can from the local control file first
//! - A diverged data directory is rewound only on request

use walwarden::error::ClusterError;
use walwarden::monitor::RecoveryState;
use walwarden::registry::{NodeId, NodeRegistry, NodeRole};
use walwarden::sim::SimCluster;
use walwarden::switchover::{promote, rejoin, RejoinOptions, RejoinOutcome};

const NODE2: &str = "host=node2 dbname=walwarden";

fn waiting() -> RejoinOptions {
    RejoinOptions {
        wait: true,
        ..RejoinOptions::default()
    }
}

/// Leader 1 stopped cleanly, standby 2 promoted in its place.
fn promoted_after_clean_stop() -> SimCluster {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let (code, _) = cluster.run(1, &["service", "stop"]).unwrap();
    assert_eq!(code, 0);
    promote(&cluster.context(2).unwrap()).unwrap();
    cluster
}

// =============================================================================
// Promote Tests
// =============================================================================

/// Promotion marks the old leader failed and makes this node leader.
#[test]
fn test_promote_after_leader_loss() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.kill(1);

    promote(&cluster.context(2).unwrap()).unwrap();
    assert_eq!(cluster.node(2).unwrap().recovery, RecoveryState::Leader);
    assert_eq!(cluster.node(2).unwrap().timeline, 2);

    let old = cluster.registry().node(NodeId(1)).unwrap().unwrap();
    assert!(!old.active);
    assert_eq!(cluster.registry().leader().unwrap().unwrap().id, NodeId(2));
}

/// A running leader blocks promotion.
#[test]
fn test_promote_with_running_leader_rejected() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let err = promote(&cluster.context(2).unwrap()).unwrap_err();
    assert!(matches!(err, ClusterError::Fatal(_)));
    assert_eq!(cluster.node(2).unwrap().promotions, 0);
}

/// The leader itself cannot be promoted.
#[test]
fn test_promote_on_leader_rejected() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let err = promote(&cluster.context(1).unwrap()).unwrap_err();
    assert!(matches!(err, ClusterError::Configuration(_)));
}

// =============================================================================
// Rejoin Tests
// =============================================================================

/// An unclean shutdown is refused before any network access.
#[test]
fn test_unclean_rejoin_refused_locally() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    cluster.crash(1);
    promote(&cluster.context(2).unwrap()).unwrap();
    let before = cluster.network_actions();

    let err = rejoin(&cluster.context(1).unwrap(), NODE2, waiting()).unwrap_err();
    assert!(matches!(err, ClusterError::Configuration(_)));
    assert!(err.to_string().contains("--allow-unclean"));
    assert_eq!(cluster.network_actions(), before);
    assert!(!cluster.node(1).unwrap().running);
}

/// A running server cannot be rejoined.
#[test]
fn test_rejoin_running_server_refused() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let err = rejoin(&cluster.context(2).unwrap(), NODE2, waiting()).unwrap_err();
    assert!(matches!(err, ClusterError::Configuration(_)));
}

/// A cleanly stopped former leader attaches to the new leader.
#[test]
fn test_clean_rejoin_attaches() {
    let cluster = promoted_after_clean_stop();

    let outcome = rejoin(&cluster.context(1).unwrap(), NODE2, waiting()).unwrap();
    assert_eq!(outcome, RejoinOutcome::Attached);

    let node = cluster.node(1).unwrap();
    assert!(node.running);
    assert_eq!(node.recovery, RecoveryState::Standby);
    assert_eq!(node.timeline, 2);
    assert_eq!(node.rewinds, 0);

    let record = cluster.registry().node(NodeId(1)).unwrap().unwrap();
    assert_eq!(record.role, NodeRole::Standby);
    assert_eq!(record.upstream_id, Some(NodeId(2)));
    assert!(record.active);
}

/// Writes the old leader made after the fork need a rewind.
#[test]
fn test_diverged_rejoin_requires_rewind() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    cluster.kill(1);
    promote(&cluster.context(2).unwrap()).unwrap();
    // The isolated old leader kept accepting writes before it stopped.
    cluster.set_reachable(1, true);
    cluster.update(1, |n| {
        n.running = true;
        n.write_lsn = n.write_lsn.advance(0x80);
    });
    let (code, _) = cluster.run(1, &["service", "stop"]).unwrap();
    assert_eq!(code, 0);

    let err = rejoin(&cluster.context(1).unwrap(), NODE2, waiting()).unwrap_err();
    assert!(err.to_string().contains("--force-rewind"));
    assert!(!cluster.node(1).unwrap().running);

    let options = RejoinOptions {
        force_rewind: true,
        ..waiting()
    };
    let outcome = rejoin(&cluster.context(1).unwrap(), NODE2, options).unwrap();
    assert_eq!(outcome, RejoinOutcome::Attached);
    let node = cluster.node(1).unwrap();
    assert_eq!(node.rewinds, 1);
    assert_eq!(node.recovery, RecoveryState::Standby);
    assert!(node.receive_lsn <= cluster.node(2).unwrap().write_lsn);
}

/// Rejoin with replication slots creates this node's slot on the leader.
#[test]
fn test_rejoin_creates_slot() {
    let cluster = promoted_after_clean_stop();
    cluster.configure(1, |c| c.use_replication_slots = true);

    rejoin(&cluster.context(1).unwrap(), NODE2, waiting()).unwrap();
    assert!(cluster.node(2).unwrap().slots.contains("walwarden_slot_1"));
    let record = cluster.registry().node(NodeId(1)).unwrap().unwrap();
    assert_eq!(record.slot_name, "walwarden_slot_1");
}
