//! Remote Protocol Tests
//!
//! The CLI is both the operator interface and the wire protocol between
//! nodes. These tests drive it the way a peer does (`--format optformat`)
//! and check the replies parse, exit codes follow the error taxonomy, and
//! state-changing commands leave an audit trail.

use walwarden::registry::{EventKind, NodeId, NodeRegistry, NodeRole};
use walwarden::remote::OptReply;
use walwarden::sim::SimCluster;

fn run(cluster: &SimCluster, id: u32, args: &[&str]) -> (i32, String) {
    cluster.run(id, args).unwrap()
}

fn reply(output: &str) -> OptReply {
    OptReply::parse("test", output).unwrap()
}

// =============================================================================
// Status Tests
// =============================================================================

/// `status` reports identity, replication position and election state.
#[test]
fn test_status_reply() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let (code, out) = run(&cluster, 2, &["--format", "optformat", "status"]);
    assert_eq!(code, 0);

    let reply = reply(&out);
    assert_eq!(reply.get("node-id"), Some("2"));
    assert_eq!(reply.get("node-name"), Some("node2"));
    assert_eq!(reply.get("role"), Some("standby"));
    assert_eq!(reply.get("recovery-state"), Some("standby"));
    assert!(reply.flag("running").unwrap());
    assert!(!reply.flag("paused").unwrap());
    assert_eq!(reply.get("voting-status"), Some("no_vote"));
}

/// A cleanly stopped server reports its shutdown checkpoint.
#[test]
fn test_shutdown_state_reply() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let (code, out) = run(&cluster, 1, &["--format", "optformat", "status", "--is-shutdown-cleanly"]);
    assert_eq!(code, 0);
    assert_eq!(reply(&out).get("state"), Some("RUNNING"));

    assert_eq!(run(&cluster, 1, &["service", "stop", "--checkpoint"]).0, 0);
    let (_, out) = run(&cluster, 1, &["--format", "optformat", "status", "--is-shutdown-cleanly"]);
    let reply = reply(&out);
    assert_eq!(reply.get("state"), Some("SHUTDOWN"));
    assert_eq!(reply.get("last-checkpoint-lsn"), Some("0/100"));
}

// =============================================================================
// Check Tests
// =============================================================================

/// A passing check exits 0.
#[test]
fn test_role_check_passes() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let (code, out) = run(&cluster, 2, &["check", "role", "--format", "optformat"]);
    assert_eq!(code, 0);
    assert_eq!(reply(&out).get("status"), Some("OK"));
}

/// A failing check exits with the check-failed code.
#[test]
fn test_upstream_check_fails_when_leader_down() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    cluster.kill(1);
    let (code, out) = run(&cluster, 2, &["check", "upstream", "--format", "nagios"]);
    assert_eq!(code, 7);
    assert!(out.starts_with("WALWARDEN_UPSTREAM CRITICAL"));
}

/// The data directory check answers with its own status token.
#[test]
fn test_data_directory_check_token() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let (code, out) = run(&cluster, 1, &["--format", "optformat", "check", "data-directory"]);
    assert_eq!(code, 0);
    assert_eq!(reply(&out).get("configured-data-directory"), Some("OK"));
}

// =============================================================================
// Daemon Control Tests
// =============================================================================

/// Pausing is visible in `daemon status` and recorded on the leader.
#[test]
fn test_pause_and_status() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let (code, out) = run(&cluster, 2, &["--format", "optformat", "daemon", "pause"]);
    assert_eq!(code, 0);
    assert_eq!(reply(&out).get("status"), Some("OK"));

    let (_, out) = run(&cluster, 2, &["--format", "optformat", "daemon", "status"]);
    let status = reply(&out);
    assert!(status.flag("paused").unwrap());
    assert_eq!(status.get("candidate-id"), None);

    let events = cluster.registry().events(5).unwrap();
    assert_eq!(events[0].kind, EventKind::MonitorPause);
    assert_eq!(events[0].node_id, NodeId(2));

    run(&cluster, 2, &["daemon", "unpause"]);
    assert!(!cluster.control(2).unwrap().is_paused().unwrap());
}

/// Directives from an older term are acknowledged but ignored.
#[test]
fn test_stale_follow_directive_ignored() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    let notify = |leader: &str, term: &str| {
        run(
            &cluster,
            3,
            &["--format", "optformat", "daemon", "notify-follow", "--leader-id", leader, "--term", term],
        )
    };

    assert_eq!(notify("2", "5").0, 0);
    let (code, out) = notify("1", "3");
    assert_eq!(code, 0);
    assert!(reply(&out).get("message").unwrap().starts_with("ignored_stale_directive"));

    let control = cluster.control(3).unwrap();
    assert_eq!(control.pending_follow().unwrap(), Some(NodeId(2)));
    assert_eq!(control.snapshot().unwrap().election.term, 5);
}

// =============================================================================
// Error Reply Tests
// =============================================================================

/// Failures print one ERROR line and exit with the class code.
#[test]
fn test_error_reply_line() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let (code, out) = run(&cluster, 2, &["--format", "optformat", "follow", "--upstream-node-id", "9"]);
    assert_eq!(code, 1);
    let reply = reply(&out);
    assert_eq!(reply.get("status"), Some("ERROR"));
    assert_eq!(reply.get("error-class"), Some("CONFIGURATION"));
    assert!(reply.get("message").unwrap().contains("node_9_is_not_registered"));
}

/// Text output leaves errors to the log and keeps stdout empty.
#[test]
fn test_text_error_keeps_stdout_empty() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    let (code, out) = run(&cluster, 2, &["follow", "--upstream-node-id", "2"]);
    assert_eq!(code, 1);
    assert!(out.is_empty());
}

// =============================================================================
// Registration Tests
// =============================================================================

/// Unregister then register again; a second registration needs `--force`.
#[test]
fn test_register_round_trip() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    assert_eq!(run(&cluster, 1, &["unregister", "--node-id", "3"]).0, 0);
    assert!(cluster.registry().node(NodeId(3)).unwrap().is_none());

    assert_eq!(run(&cluster, 3, &["register"]).0, 0);
    let record = cluster.registry().node(NodeId(3)).unwrap().unwrap();
    assert_eq!(record.role, NodeRole::Standby);
    assert_eq!(record.upstream_id, Some(NodeId(1)));

    assert_eq!(run(&cluster, 3, &["register"]).0, 1);
    assert_eq!(run(&cluster, 3, &["register", "--force"]).0, 0);

    let events = cluster.registry().events(10).unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::NodeUnregister));
    assert!(events.iter().any(|e| e.kind == EventKind::StandbyRegister && e.success));
    assert!(events.iter().any(|e| e.kind == EventKind::StandbyRegister && !e.success));
}

/// The active leader cannot be unregistered.
#[test]
fn test_unregister_leader_refused() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    assert_eq!(run(&cluster, 2, &["unregister", "--node-id", "1"]).0, 1);
    assert!(cluster.registry().node(NodeId(1)).unwrap().is_some());
}

/// A standby cannot register itself as leader.
#[test]
fn test_register_role_mismatch() {
    let cluster = SimCluster::with_standbys(1).unwrap();
    assert_eq!(run(&cluster, 2, &["register", "--role", "leader", "--force"]).0, 1);
}

// =============================================================================
// Cluster Listing Tests
// =============================================================================

/// One row per node with live reachability.
#[test]
fn test_cluster_show_rows() {
    let cluster = SimCluster::with_standbys(2).unwrap();
    cluster.kill(3);
    let (code, out) = run(&cluster, 1, &["--format", "csv", "cluster", "show"]);
    assert_eq!(code, 0);

    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "id,name,role,upstream,reachable,recovery-state,priority");
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[1], "1,node1,leader,,true,leader,100");
    assert_eq!(lines[3], "3,node3,standby,1,false,unknown,100");
}
