//! Checks of this node's replication relationships

use std::collections::BTreeSet;

use crate::context::NodeContext;
use crate::error::{ClusterError, ClusterResult};
use crate::monitor::NodeConnection;
use crate::output::{CheckResult, CheckStatus};
use crate::registry::{NodeRecord, NodeRole};

/// Active registered standbys replicating from this node.
fn children(ctx: &NodeContext, conn: &dyn NodeConnection) -> ClusterResult<Vec<NodeRecord>> {
    Ok(conn
        .registry()
        .active_nodes()?
        .into_iter()
        .filter(|n| n.role == NodeRole::Standby && n.upstream_id == Some(ctx.node_id()))
        .collect())
}

fn names(nodes: &[&NodeRecord]) -> String {
    nodes
        .iter()
        .map(|n| n.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(super) fn downstream(ctx: &NodeContext) -> ClusterResult<CheckResult> {
    let local = ctx.connect_local()?;
    let expected = children(ctx, local.as_ref())?;
    let attached: BTreeSet<String> = local
        .attached_standbys()?
        .into_iter()
        .filter(|s| s.is_streaming())
        .map(|s| s.application_name)
        .collect();
    let missing: Vec<&NodeRecord> = expected
        .iter()
        .filter(|n| !attached.contains(&n.name))
        .collect();

    let result = if expected.is_empty() {
        CheckResult::new("downstream", CheckStatus::Ok, "no downstream nodes registered")
    } else if missing.is_empty() {
        CheckResult::new(
            "downstream",
            CheckStatus::Ok,
            format!("{} of {} downstream nodes attached", expected.len(), expected.len()),
        )
    } else {
        CheckResult::new(
            "downstream",
            CheckStatus::Critical,
            format!(
                "{} of {} downstream nodes not attached: {}",
                missing.len(),
                expected.len(),
                names(&missing)
            ),
        )
    };
    Ok(result
        .detail("attached", expected.len() - missing.len())
        .detail("missing", missing.len()))
}

pub(super) fn slots(ctx: &NodeContext) -> ClusterResult<CheckResult> {
    let local = ctx.connect_local()?;
    let slots = local.replication_slots()?;
    let inactive: Vec<&str> = slots
        .iter()
        .filter(|s| !s.active)
        .map(|s| s.name.as_str())
        .collect();

    let result = if inactive.is_empty() {
        CheckResult::new(
            "slots",
            CheckStatus::Ok,
            format!("{} replication slots, all active", slots.len()),
        )
    } else {
        CheckResult::new(
            "slots",
            CheckStatus::Critical,
            format!(
                "{} of {} replication slots inactive: {}",
                inactive.len(),
                slots.len(),
                inactive.join(", ")
            ),
        )
    };
    Ok(result
        .detail("slots", slots.len())
        .detail("inactive", inactive.len()))
}

pub(super) fn missing_slots(ctx: &NodeContext) -> ClusterResult<CheckResult> {
    let local = ctx.connect_local()?;
    let existing: BTreeSet<String> = local
        .replication_slots()?
        .into_iter()
        .map(|s| s.name)
        .collect();
    let expected = children(ctx, local.as_ref())?;
    let missing: Vec<&NodeRecord> = expected
        .iter()
        .filter(|n| n.uses_slot() && !existing.contains(&n.slot_name))
        .collect();

    let result = if missing.is_empty() {
        CheckResult::new(
            "missing-slots",
            CheckStatus::Ok,
            "every registered downstream slot exists",
        )
    } else {
        CheckResult::new(
            "missing-slots",
            CheckStatus::Critical,
            format!(
                "{} registered slots missing: {}",
                missing.len(),
                missing
                    .iter()
                    .map(|n| n.slot_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )
    };
    Ok(result.detail("missing", missing.len()))
}

pub(super) fn upstream(ctx: &NodeContext) -> ClusterResult<CheckResult> {
    let local = ctx.connect_local()?;
    let registry = local.registry();
    let own = ctx.own_record(registry)?;
    let Some(upstream_id) = own.upstream_id.filter(|_| own.role == NodeRole::Standby) else {
        return Ok(CheckResult::new(
            "upstream",
            CheckStatus::Ok,
            format!("node is a {} and has no upstream", own.role),
        ));
    };
    let upstream = registry.node(upstream_id)?.ok_or_else(|| {
        ClusterError::config(format!("upstream node {} is not registered", upstream_id))
    })?;

    let conn = match ctx.connect(&upstream) {
        Ok(conn) => conn,
        Err(e) => {
            return Ok(CheckResult::new(
                "upstream",
                CheckStatus::Critical,
                format!("upstream node {} is unreachable: {}", upstream.id, e),
            )
            .detail("upstream-node-id", upstream.id))
        }
    };
    let result = if conn.is_attached(&own.name)? {
        CheckResult::new(
            "upstream",
            CheckStatus::Ok,
            format!("attached to upstream node {} (\"{}\")", upstream.id, upstream.name),
        )
    } else {
        CheckResult::new(
            "upstream",
            CheckStatus::Critical,
            format!("not attached to upstream node {} (\"{}\")", upstream.id, upstream.name),
        )
    };
    Ok(result.detail("upstream-node-id", upstream.id))
}
