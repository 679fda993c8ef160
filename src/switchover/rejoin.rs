//! Rejoin and follow
//!
//! `rejoin` brings a stopped former leader back as a standby of the current
//! leader; `follow_upstream` re-parents a running standby. Both rewrite the
//! local replication settings and update the registry conditionally.
//!
//! Everything `rejoin` can decide from the local control file is decided
//! before it touches the network.

use crate::clock::{poll_until, PollOutcome};
use crate::context::NodeContext;
use crate::error::{ClusterError, ClusterResult};
use crate::local::StandbyConfig;
use crate::lsn::Lsn;
use crate::monitor::{NodeConnection, RecoveryState};
use crate::observability::{Logger, ObservationScope};
use crate::registry::{
    default_slot_name, EventKind, NodeChange, NodeRecord, NodeRegistry, NodeRole,
};

/// Options of one rejoin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejoinOptions {
    /// Rewind the data directory if its timeline diverged.
    pub force_rewind: bool,
    /// Proceed although the server did not shut down cleanly.
    pub allow_unclean: bool,
    /// Wait until the upstream reports the node as streaming.
    pub wait: bool,
}

/// Result of a rejoin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejoinOutcome {
    /// The upstream reports the node streaming.
    Attached,
    /// Started as a standby; attachment was not awaited.
    Started,
    /// Started, but attachment was not confirmed in time.
    Incomplete { reason: String },
}

/// Rejoin the stopped local server to the leader at `upstream_conninfo`.
pub fn rejoin(
    ctx: &NodeContext,
    upstream_conninfo: &str,
    options: RejoinOptions,
) -> ClusterResult<RejoinOutcome> {
    if ctx.local.is_running()? {
        return Err(ClusterError::config(
            "the local server is running; rejoin requires a stopped server",
        ));
    }
    let control = ctx.local.control_file()?;
    if !control.state.is_clean_shutdown() && !options.allow_unclean {
        return Err(ClusterError::config(format!(
            "the local server was not shut down cleanly (state: {}); \
             start and stop it cleanly or pass --allow-unclean",
            control.state
        )));
    }

    let scope = ObservationScope::with_fields(
        "NODE_REJOIN",
        &[
            ("node_id", &ctx.node_id().to_string()),
            ("checkpoint_lsn", &control.checkpoint_lsn.to_string()),
            ("timeline", &control.timeline.to_string()),
        ],
    );
    let result = rejoin_upstream(
        ctx,
        upstream_conninfo,
        control.timeline,
        control.checkpoint_lsn,
        options,
    );
    scope.finish(&result);
    result
}

fn rejoin_upstream(
    ctx: &NodeContext,
    upstream_conninfo: &str,
    local_timeline: u32,
    checkpoint_lsn: Lsn,
    options: RejoinOptions,
) -> ClusterResult<RejoinOutcome> {
    let upstream = ctx.connector.connect(upstream_conninfo)?;
    if upstream.recovery_state()? != RecoveryState::Leader {
        return Err(ClusterError::config(format!(
            "rejoin target \"{}\" is not a leader",
            upstream_conninfo
        )));
    }
    let registry = upstream.registry();
    let own = ctx.own_record(registry)?;
    let leader = registry
        .leader()?
        .ok_or_else(|| ClusterError::config("no active leader is registered"))?;

    let slot = wanted_slot(ctx, &own);
    let capacity = upstream.replication_capacity()?;
    if capacity.free_wal_senders() < 1 {
        return Err(ClusterError::config(format!(
            "no free WAL senders on node {}",
            leader.id
        )));
    }
    let has_slot = match &slot {
        Some(name) => upstream.replication_slots()?.iter().any(|s| &s.name == name),
        None => true,
    };
    if !has_slot && capacity.free_replication_slots() < 1 {
        return Err(ClusterError::config(format!(
            "no free replication slots on node {}",
            leader.id
        )));
    }

    // Divergence: the leader's history left our timeline before our last
    // checkpoint, or we are on a timeline the leader never reached.
    let upstream_timeline = upstream.timeline_id()?;
    let diverged = if upstream_timeline < local_timeline {
        true
    } else if upstream_timeline == local_timeline {
        false
    } else {
        match upstream.timeline_switch_lsn(local_timeline)? {
            Some(switch) => switch < checkpoint_lsn,
            None => true,
        }
    };
    if diverged {
        if !options.force_rewind {
            return Err(ClusterError::config(format!(
                "local timeline {} (checkpoint {}) diverged from the leader's timeline {}; \
                 pass --force-rewind",
                local_timeline, checkpoint_lsn, upstream_timeline
            )));
        }
        Logger::notice(
            "REWIND_STARTED",
            &[("source", upstream_conninfo), ("timeline", &local_timeline.to_string())],
        );
        ctx.local.rewind(upstream_conninfo)?;
    }

    if let Some(name) = &slot {
        upstream.create_replication_slot(name)?;
    }
    ctx.local.write_standby_config(&StandbyConfig {
        upstream_conninfo: upstream_conninfo.to_string(),
        slot_name: slot.clone(),
        application_name: own.name.clone(),
    })?;
    ctx.local.start()?;

    let mut change = NodeChange::follow(leader.id);
    change.slot_name = Some(slot.unwrap_or_default());
    registry.update_node(own.id, &own.condition(), &change)?;

    let outcome = if options.wait {
        wait_attached(ctx, upstream.as_ref(), &own.name)
    } else {
        RejoinOutcome::Started
    };
    let success = !matches!(outcome, RejoinOutcome::Incomplete { .. });
    ctx.record_event(
        registry,
        EventKind::NodeRejoin,
        success,
        &format!("node {} rejoined as a standby of node {}", own.id, leader.id),
    );
    Ok(outcome)
}

fn wait_attached(ctx: &NodeContext, upstream: &dyn NodeConnection, name: &str) -> RejoinOutcome {
    let polled = poll_until(
        &ctx.clock,
        ctx.config.node_rejoin_timeout(),
        ctx.config.promote_check_interval(),
        |_| upstream.is_attached(name).map(|ok| ok.then_some(())),
    );
    match polled {
        Ok(PollOutcome::Ready { .. }) => RejoinOutcome::Attached,
        Ok(PollOutcome::TimedOut { .. }) => RejoinOutcome::Incomplete {
            reason: format!(
                "node \"{}\" did not attach within {} seconds",
                name, ctx.config.node_rejoin_timeout_secs
            ),
        },
        Err(e) => RejoinOutcome::Incomplete {
            reason: format!("unable to confirm attachment: {}", e),
        },
    }
}

/// Slot this node should occupy on its upstream, if any.
fn wanted_slot(ctx: &NodeContext, own: &NodeRecord) -> Option<String> {
    if own.uses_slot() {
        Some(own.slot_name.clone())
    } else if ctx.config.use_replication_slots {
        Some(default_slot_name(own.id))
    } else {
        None
    }
}

/// Re-parent this running node under `upstream`.
///
/// A witness only has its registry record updated; a standby rewrites its
/// replication settings and restarts. Returns the updated record.
pub fn follow_upstream(
    ctx: &NodeContext,
    upstream: &NodeRecord,
    kind: EventKind,
) -> ClusterResult<NodeRecord> {
    let upstream_conn = ctx.connect_with_retry(&upstream.connection_target)?;
    if upstream.role == NodeRole::Leader
        && upstream_conn.recovery_state()? != RecoveryState::Leader
    {
        return Err(ClusterError::fatal(format!(
            "node {} is registered as leader but is in recovery",
            upstream.id
        )));
    }

    // Registry writes go to the running leader.
    let leader_conn = if upstream.role == NodeRole::Leader {
        None
    } else {
        let leader = upstream_conn
            .registry()
            .leader()?
            .ok_or_else(|| ClusterError::config("no active leader is registered"))?;
        Some(ctx.connect_with_retry(&leader.connection_target)?)
    };
    let registry: &dyn NodeRegistry = match &leader_conn {
        Some(conn) => conn.registry(),
        None => upstream_conn.registry(),
    };
    let own = ctx.own_record(registry)?;

    if own.role == NodeRole::Witness {
        let change = NodeChange {
            upstream_id: Some(Some(upstream.id)),
            ..NodeChange::default()
        };
        let record = registry.update_node(own.id, &own.condition(), &change)?;
        ctx.record_event(
            registry,
            kind,
            true,
            &format!("witness {} now follows node {}", own.id, upstream.id),
        );
        return Ok(record);
    }

    let slot = wanted_slot(ctx, &own);
    if let Some(name) = &slot {
        upstream_conn.create_replication_slot(name)?;
    }
    ctx.local.write_standby_config(&StandbyConfig {
        upstream_conninfo: upstream.connection_target.clone(),
        slot_name: slot.clone(),
        application_name: own.name.clone(),
    })?;
    if ctx.local.is_running()? {
        ctx.local.restart()?;
    } else {
        ctx.local.start()?;
    }

    let mut change = NodeChange::follow(upstream.id);
    change.slot_name = Some(slot.unwrap_or_default());
    let record = registry.update_node(own.id, &own.condition(), &change)?;
    ctx.record_event(
        registry,
        kind,
        true,
        &format!("node {} now follows node {}", own.id, upstream.id),
    );
    Logger::notice(
        "NODE_FOLLOWED",
        &[
            ("node_id", &own.id.to_string()),
            ("upstream_id", &upstream.id.to_string()),
        ],
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;

    #[test]
    fn test_wait_attached_confirms_streaming_standby() {
        let cluster = SimCluster::with_standbys(1).unwrap();
        let ctx = cluster.context(1).unwrap();
        let leader = ctx.connect_local().unwrap();
        assert_eq!(
            wait_attached(&ctx, leader.as_ref(), "node2"),
            RejoinOutcome::Attached
        );
    }

    #[test]
    fn test_wait_attached_times_out_as_incomplete() {
        let cluster = SimCluster::with_standbys(1).unwrap();
        let ctx = cluster.context(1).unwrap();
        let leader = ctx.connect_local().unwrap();
        match wait_attached(&ctx, leader.as_ref(), "node9") {
            RejoinOutcome::Incomplete { reason } => {
                assert!(reason.contains("did not attach"));
            }
            other => panic!("expected incomplete, got {:?}", other),
        }
    }
}
