//! Checks of this node's own server

use std::path::Path;

use super::threshold_status;
use crate::context::NodeContext;
use crate::error::ClusterResult;
use crate::monitor::RecoveryState;
use crate::output::{CheckResult, CheckStatus};
use crate::registry::NodeRole;

/// Optformat key carrying the data directory verdict.
pub(super) const DATA_DIRECTORY_KEY: &str = "configured-data-directory";

pub(super) fn role(ctx: &NodeContext) -> ClusterResult<CheckResult> {
    let local = ctx.connect_local()?;
    let own = ctx.own_record(local.registry())?;
    let state = local.recovery_state()?;

    let consistent = match own.role {
        NodeRole::Leader => state == RecoveryState::Leader,
        NodeRole::Standby => state == RecoveryState::Standby,
        NodeRole::Witness => state != RecoveryState::Unknown,
    };
    let result = if consistent {
        CheckResult::new(
            "role",
            CheckStatus::Ok,
            format!("node is registered as {} and is {}", own.role, state),
        )
    } else {
        CheckResult::new(
            "role",
            CheckStatus::Critical,
            format!("node is registered as {} but is {}", own.role, state),
        )
    };
    Ok(result
        .detail("registered-role", own.role)
        .detail("recovery-state", state))
}

pub(super) fn replication_lag(ctx: &NodeContext) -> ClusterResult<CheckResult> {
    let local = ctx.connect_local()?;
    if local.recovery_state()? != RecoveryState::Standby {
        return Ok(CheckResult::new("replication-lag", CheckStatus::Ok, "node is not a standby")
            .detail("lag", 0));
    }
    let lag = local.wal_positions()?.lag_seconds;
    let config = &ctx.config;
    let status = threshold_status(
        lag,
        config.replication_lag_warning_secs,
        config.replication_lag_critical_secs,
    );
    Ok(CheckResult::new(
        "replication-lag",
        status,
        format!("{} seconds behind the upstream", lag),
    )
    .detail("lag", lag)
    .detail("warning", config.replication_lag_warning_secs)
    .detail("critical", config.replication_lag_critical_secs))
}

pub(super) fn archive_ready(ctx: &NodeContext) -> ClusterResult<CheckResult> {
    let local = ctx.connect_local()?;
    let pending = local.archive_ready_count()?;
    let config = &ctx.config;
    let status = threshold_status(pending, config.archive_ready_warning, config.archive_ready_critical);
    Ok(CheckResult::new(
        "archive-ready",
        status,
        format!("{} WAL files pending archiving", pending),
    )
    .detail("files", pending)
    .detail("warning", config.archive_ready_warning)
    .detail("critical", config.archive_ready_critical))
}

pub(super) fn data_directory(ctx: &NodeContext) -> ClusterResult<CheckResult> {
    let local = ctx.connect_local()?;
    let running = local.data_directory()?;
    let configured = &ctx.config.data_directory;

    let result = if same_directory(configured, Path::new(&running)) {
        CheckResult::new(
            "data-directory",
            CheckStatus::Ok,
            format!("configured data directory \"{}\" is in use", configured.display()),
        )
        .with_status_token(DATA_DIRECTORY_KEY, "OK")
    } else {
        CheckResult::new(
            "data-directory",
            CheckStatus::Critical,
            format!(
                "configured data directory \"{}\" differs from the running \"{}\"",
                configured.display(),
                running
            ),
        )
        .with_status_token(DATA_DIRECTORY_KEY, "MISMATCH")
    };
    Ok(result)
}

/// Compare directories, resolving symlinks where possible.
fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.components().eq(b.components()),
    }
}
