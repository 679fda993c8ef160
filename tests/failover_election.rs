//! Failover Election Tests
//!
//! Automatic failover driven by the replication monitor against a simulated
//! cluster:
//! - The most advanced standby wins and the others follow it
//! - A witness re-points at the winner
//! - A minority partition never promotes

use proptest::prelude::*;

use walwarden::lsn::Lsn;
use walwarden::monitor::{RecoveryState, ReplicationMonitor, TickOutcome};
use walwarden::registry::{Demotion, EventKind, NodeId, NodeRegistry, NodeRole};
use walwarden::sim::SimCluster;
use walwarden::voting::{FailoverOutcome, VotingEngine};
use walwarden::error::ClusterError;

fn lsn(text: &str) -> Lsn {
    text.parse().unwrap()
}

fn tick(cluster: &SimCluster, id: u32) -> TickOutcome {
    let mut monitor = ReplicationMonitor::new(cluster.context(id).unwrap());
    monitor.tick().unwrap()
}

// =============================================================================
// Election Winner Tests
// =============================================================================

/// The standby with the greatest receive LSN is promoted; its sibling follows.
#[test]
fn test_most_advanced_standby_wins() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.update(2, |n| n.receive_lsn = lsn("0/300"));
    cluster.update(3, |n| n.receive_lsn = lsn("0/200"));
    cluster.kill(1);

    let outcome = tick(&cluster, 2);
    assert_eq!(outcome, TickOutcome::Failover(FailoverOutcome::Promoted { term: 1 }));
    assert_eq!(cluster.node(2).unwrap().recovery, RecoveryState::Leader);

    let leader = cluster.registry().leader().unwrap().unwrap();
    assert_eq!(leader.id, NodeId(2));
    let old = cluster.registry().node(NodeId(1)).unwrap().unwrap();
    assert!(!old.active);

    let directive = cluster.control(3).unwrap().pending_follow().unwrap();
    assert_eq!(directive, Some(NodeId(2)));

    let outcome = tick(&cluster, 3);
    assert_eq!(
        outcome,
        TickOutcome::Failover(FailoverOutcome::Followed {
            leader: NodeId(2),
            term: 1
        })
    );
    let follower = cluster.registry().node(NodeId(3)).unwrap().unwrap();
    assert_eq!(follower.upstream_id, Some(NodeId(2)));
    assert_eq!(cluster.control(3).unwrap().pending_follow().unwrap(), None);

    let ctx = cluster.context(2).unwrap();
    assert!(ctx.connect_local().unwrap().is_attached("node3").unwrap());
}

/// The less advanced standby detects the loss too but waits for the winner.
#[test]
fn test_losing_standby_follows_directive_on_next_tick() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.update(2, |n| n.receive_lsn = lsn("0/300"));
    cluster.update(3, |n| n.receive_lsn = lsn("0/200"));
    cluster.kill(1);

    assert!(matches!(
        tick(&cluster, 2),
        TickOutcome::Failover(FailoverOutcome::Promoted { .. })
    ));
    // Node 3 has a directive now; it must not start an election of its own.
    assert!(matches!(
        tick(&cluster, 3),
        TickOutcome::Failover(FailoverOutcome::Followed { .. })
    ));
    assert_eq!(cluster.node(3).unwrap().recovery, RecoveryState::Standby);
    assert_eq!(cluster.node(3).unwrap().promotions, 0);

    let events = cluster.registry().events(10).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::FailoverPromote && e.node_id == NodeId(2)));
    assert!(events.iter().any(|e| e.kind == EventKind::FailoverFollow && e.node_id == NodeId(3)));
}

/// A witness counts toward the majority and follows the new leader.
#[test]
fn test_witness_follows_winner() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.add_node(4, NodeRole::Witness, Some(1)).unwrap();
    cluster.update(3, |n| n.receive_lsn = lsn("0/400"));
    cluster.kill(1);

    assert_eq!(
        tick(&cluster, 3),
        TickOutcome::Failover(FailoverOutcome::Promoted { term: 1 })
    );
    assert_eq!(cluster.registry().leader().unwrap().unwrap().id, NodeId(3));

    assert!(matches!(tick(&cluster, 4), TickOutcome::Failover(_)));
    let witness = cluster.registry().node(NodeId(4)).unwrap().unwrap();
    assert_eq!(witness.upstream_id, Some(NodeId(3)));
    assert_eq!(witness.role, NodeRole::Witness);
}

/// Equal positions fall back to priority; the loser never promotes itself.
#[test]
fn test_priority_breaks_lsn_tie() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    let mut record = cluster.registry().node(NodeId(3)).unwrap().unwrap();
    record.priority = 200;
    cluster.registry().register(&record, true).unwrap();
    cluster.kill(1);

    // Node 2 loses term 1, waits for a directive that never comes and gives up.
    let mut monitor = ReplicationMonitor::new(cluster.context(2).unwrap());
    let err = monitor.tick().unwrap_err();
    assert!(matches!(err, ClusterError::Fatal(_)));
    assert_eq!(cluster.node(2).unwrap().promotions, 0);
    assert_eq!(cluster.registry().leader().unwrap().unwrap().id, NodeId(1));

    // Node 3 starts past node 2's term.
    assert_eq!(
        tick(&cluster, 3),
        TickOutcome::Failover(FailoverOutcome::Promoted { term: 2 })
    );
    assert_eq!(
        tick(&cluster, 2),
        TickOutcome::Failover(FailoverOutcome::Followed {
            leader: NodeId(3),
            term: 2
        })
    );
}

// =============================================================================
// Single Leader Tests
// =============================================================================

fn promotions(cluster: &SimCluster) -> Vec<u32> {
    (1..=3).map(|id| cluster.node(id).unwrap().promotions).collect()
}

/// A loser ahead in term still takes the winner's directive.
#[test]
fn test_loser_with_higher_term_follows_winner() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.update(2, |n| n.receive_lsn = lsn("0/300"));
    cluster.update(3, |n| n.receive_lsn = lsn("0/200"));
    let control = cluster.control(3).unwrap();
    assert_eq!(control.start_election(4).unwrap(), 5);
    control.reset_election().unwrap();
    cluster.kill(1);

    assert_eq!(
        tick(&cluster, 2),
        TickOutcome::Failover(FailoverOutcome::Promoted { term: 6 })
    );
    assert_eq!(control.pending_follow().unwrap(), Some(NodeId(2)));
    assert_eq!(
        tick(&cluster, 3),
        TickOutcome::Failover(FailoverOutcome::Followed {
            leader: NodeId(2),
            term: 6
        })
    );

    assert_eq!(promotions(&cluster), vec![0, 1, 0]);
    assert_eq!(cluster.node(3).unwrap().recovery, RecoveryState::Standby);
    assert_eq!(cluster.registry().leader().unwrap().unwrap().id, NodeId(2));
}

/// A loser that missed the directive finds the new leader instead of
/// electing itself.
#[test]
fn test_loser_without_directive_follows_established_leader() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.update(2, |n| n.receive_lsn = lsn("0/300"));
    cluster.update(3, |n| n.receive_lsn = lsn("0/200"));
    cluster.kill(1);

    assert!(matches!(
        tick(&cluster, 2),
        TickOutcome::Failover(FailoverOutcome::Promoted { .. })
    ));
    cluster.control(3).unwrap().reset_election().unwrap();

    assert!(matches!(
        tick(&cluster, 3),
        TickOutcome::Failover(FailoverOutcome::Followed { leader: NodeId(2), .. })
    ));
    assert_eq!(promotions(&cluster), vec![0, 1, 0]);
    let follower = cluster.registry().node(NodeId(3)).unwrap().unwrap();
    assert_eq!(follower.upstream_id, Some(NodeId(2)));
    assert!(cluster
        .context(2)
        .unwrap()
        .connect_local()
        .unwrap()
        .is_attached("node3")
        .unwrap());
}

/// Losing the registry claim after promotion stops the monitor.
#[test]
fn test_registry_claim_conflict_after_promotion_is_fatal() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.kill(1);
    // Node 3 holds the registry claim but its server never left recovery.
    cluster
        .registry()
        .transfer_leadership(NodeId(3), NodeId(1), Demotion::Failed)
        .unwrap();

    let ctx = cluster.context(2).unwrap();
    let leader = cluster.registry().node(NodeId(1)).unwrap().unwrap();
    let err = VotingEngine::new(&ctx).handle_leader_lost(&leader).unwrap_err();
    assert!(matches!(err, ClusterError::Fatal(_)));
    assert!(err.to_string().contains("another node claimed leadership"));
}

// =============================================================================
// Monitor Gating Tests
// =============================================================================

/// A paused monitor records nothing and promotes nobody.
#[test]
fn test_paused_monitor_does_not_fail_over() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.control(2).unwrap().set_paused(true).unwrap();
    cluster.kill(1);

    assert_eq!(tick(&cluster, 2), TickOutcome::Failover(FailoverOutcome::Paused));
    assert_eq!(cluster.node(2).unwrap().recovery, RecoveryState::Standby);
    assert_eq!(cluster.registry().leader().unwrap().unwrap().id, NodeId(1));
}

/// Manual failover mode records the loss and waits for the operator.
#[test]
fn test_manual_mode_waits_for_operator() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.configure(2, |c| c.failover = walwarden::config::FailoverMode::Manual);
    cluster.kill(1);

    assert_eq!(tick(&cluster, 2), TickOutcome::Failover(FailoverOutcome::ManualMode));
    assert_eq!(cluster.node(2).unwrap().promotions, 0);

    // The operator promotes node 2; its first registry write carries the
    // recorded loss along.
    walwarden::switchover::promote(&cluster.context(2).unwrap()).unwrap();
    let events = cluster.registry().events(10).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::FailoverManual && e.node_id == NodeId(2)));
    assert!(cluster.control(2).unwrap().deferred_events().unwrap().is_empty());
}

/// A healthy leader keeps every standby's tick quiet.
#[test]
fn test_healthy_cluster_ticks_quietly() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    for id in 1..=3 {
        assert_eq!(tick(&cluster, id), TickOutcome::Healthy);
    }
    assert_eq!(cluster.control(2).unwrap().snapshot().unwrap().election.term, 0);
}

// =============================================================================
// Majority Property
// =============================================================================

/// Two of five nodes cannot elect anyone.
#[test]
fn test_minority_partition_aborts() {
    let cluster = SimCluster::with_standbys(4).unwrap();
    cluster.kill(1);
    cluster.set_reachable(4, false);
    cluster.set_reachable(5, false);

    let ctx = cluster.context(2).unwrap();
    let leader = cluster.registry().node(NodeId(1)).unwrap().unwrap();
    let err = VotingEngine::new(&ctx).handle_leader_lost(&leader).unwrap_err();
    assert!(matches!(err, ClusterError::NoMajority { visible: 2, total: 5 }));
    assert_eq!(cluster.node(2).unwrap().promotions, 0);

    // No registry is writable inside the partition; the event waits.
    let deferred = cluster.control(2).unwrap().deferred_events().unwrap();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].kind, EventKind::FailoverAborted);
    assert!(!cluster
        .registry()
        .events(5)
        .unwrap()
        .iter()
        .any(|e| e.kind == EventKind::FailoverAborted));

    // The leader answers again and the next tick writes it.
    cluster.set_reachable(1, true);
    cluster.update(1, |n| n.running = true);
    assert_eq!(tick(&cluster, 2), TickOutcome::Healthy);
    let events = cluster.registry().events(5).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::FailoverAborted && !e.success));
    assert!(cluster.control(2).unwrap().deferred_events().unwrap().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A promotion only ever happens with a majority of active nodes visible.
    #[test]
    fn prop_no_promotion_without_majority(isolated in proptest::collection::btree_set(3u32..=5, 0..=3)) {
        let cluster = SimCluster::with_standbys(4).unwrap();
        cluster.kill(1);
        for id in &isolated {
            cluster.set_reachable(*id, false);
        }
        let visible = 4 - isolated.len();

        let ctx = cluster.context(2).unwrap();
        let leader = cluster.registry().node(NodeId(1)).unwrap().unwrap();
        let result = VotingEngine::new(&ctx).handle_leader_lost(&leader);

        let promotions: u32 = (2..=5).map(|id| cluster.node(id).unwrap().promotions).sum();
        if visible * 2 < 5 {
            let is_no_majority = matches!(result, Err(ClusterError::NoMajority { .. }));
            prop_assert!(is_no_majority);
            prop_assert_eq!(promotions, 0);
        } else {
            prop_assert_eq!(result.unwrap(), FailoverOutcome::Promoted { term: 1 });
            prop_assert_eq!(promotions, 1);
        }
    }
}
