//! Local promotion
//!
//! Shared by the switchover orchestrator, the voting engine and the
//! operator-driven `promote` command.

use crate::clock::poll_until;
use crate::context::NodeContext;
use crate::error::{ClusterError, ClusterResult};
use crate::monitor::{NodeConnection, RecoveryState};
use crate::observability::Logger;
use crate::registry::{Demotion, EventKind, NodeChange, NodeRole};

/// Promote the local server and wait until it leaves recovery.
///
/// The in-database promote call is tried first; the configured promote
/// command is the fallback. Returns a fresh connection to the new leader.
pub fn promote_local(ctx: &NodeContext) -> ClusterResult<Box<dyn NodeConnection>> {
    let conn = ctx.connect_local()?;
    if let Err(e) = conn.promote() {
        Logger::warning(
            "PROMOTE_FUNCTION_FAILED",
            &[("detail", &e.to_string()), ("fallback", "promote_command")],
        );
        ctx.local.promote()?;
    }
    drop(conn);

    let outcome = poll_until(
        &ctx.clock,
        ctx.config.promote_check_timeout(),
        ctx.config.promote_check_interval(),
        |_| {
            // The server may refuse connections briefly while it switches
            // timelines; that is not a failure yet.
            let conn = match ctx.connect_local() {
                Ok(conn) => conn,
                Err(e) if e.is_transient() => return Ok(None),
                Err(e) => return Err(e),
            };
            match conn.recovery_state() {
                Ok(RecoveryState::Leader) => Ok(Some(conn)),
                Ok(_) => Ok(None),
                Err(e) if e.is_transient() => Ok(None),
                Err(e) => Err(e),
            }
        },
    )?;
    let polls = outcome.polls();
    let conn = outcome.into_value().ok_or_else(|| {
        ClusterError::fatal(format!(
            "node {} did not leave recovery within {} seconds of promotion",
            ctx.node_id(),
            ctx.config.promote_check_timeout_secs
        ))
    })?;
    Logger::notice(
        "NODE_PROMOTED",
        &[
            ("node_id", &ctx.node_id().to_string()),
            ("polls", &polls.to_string()),
        ],
    );
    Ok(conn)
}

/// Operator-driven promotion of this standby when no leader is running.
pub fn promote(ctx: &NodeContext) -> ClusterResult<()> {
    let local = ctx.connect_local()?;
    let own = ctx.own_record(local.registry())?;

    match local.recovery_state()? {
        RecoveryState::Leader => {
            return Err(ClusterError::config(format!(
                "node {} is already a leader",
                own.id
            )))
        }
        RecoveryState::Unknown => {
            return Err(ClusterError::fatal(format!(
                "recovery state of node {} is unknown",
                own.id
            )))
        }
        RecoveryState::Standby => {}
    }
    if own.role != NodeRole::Standby {
        return Err(ClusterError::config(format!(
            "node {} is registered as {}, only a standby can be promoted",
            own.id, own.role
        )));
    }

    // A reachable running leader means the cluster already has one.
    let old_leader = local.registry().leader()?;
    if let Some(leader) = &old_leader {
        let running = ctx
            .connect(leader)
            .and_then(|c| c.recovery_state())
            .map(|state| state == RecoveryState::Leader)
            .unwrap_or(false);
        if running {
            return Err(ClusterError::fatal(format!(
                "leader {} (\"{}\") is still running; use \"switchover\" instead",
                leader.id, leader.name
            )));
        }
    }
    drop(local);

    let conn = promote_local(ctx)?;
    let registry = conn.registry();
    match &old_leader {
        Some(leader) => {
            registry.transfer_leadership(own.id, leader.id, Demotion::Failed)?;
        }
        None => {
            let change = NodeChange {
                role: Some(NodeRole::Leader),
                upstream_id: Some(None),
                ..NodeChange::default()
            };
            registry.update_node(own.id, &own.condition(), &change)?;
        }
    }
    ctx.record_event(
        registry,
        EventKind::StandbyPromote,
        true,
        &format!("node {} was promoted to leader", own.id),
    );
    Ok(())
}
