//! Node checks
//!
//! Each check produces exactly one [`CheckResult`]. A check that cannot
//! reach the data it needs reports UNKNOWN instead of failing the command,
//! so monitoring systems always receive a parseable line.

mod node;
mod topology;

use clap::ValueEnum;

use crate::context::NodeContext;
use crate::output::{CheckResult, CheckStatus};

/// Checks available through `check <name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CheckKind {
    /// Registry role matches the recovery state
    Role,
    /// Replay lag against the configured thresholds
    ReplicationLag,
    /// WAL segments waiting for archiving
    ArchiveReady,
    /// Registered children are attached
    Downstream,
    /// No inactive replication slots
    Slots,
    /// Slots of registered children exist
    MissingSlots,
    /// Configured data directory is the running one
    DataDirectory,
    /// This standby is attached to its upstream
    Upstream,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Role => "role",
            CheckKind::ReplicationLag => "replication-lag",
            CheckKind::ArchiveReady => "archive-ready",
            CheckKind::Downstream => "downstream",
            CheckKind::Slots => "slots",
            CheckKind::MissingSlots => "missing-slots",
            CheckKind::DataDirectory => "data-directory",
            CheckKind::Upstream => "upstream",
        }
    }
}

/// Run one check against this node.
pub fn run_check(ctx: &NodeContext, kind: CheckKind) -> CheckResult {
    let result = match kind {
        CheckKind::Role => node::role(ctx),
        CheckKind::ReplicationLag => node::replication_lag(ctx),
        CheckKind::ArchiveReady => node::archive_ready(ctx),
        CheckKind::DataDirectory => node::data_directory(ctx),
        CheckKind::Downstream => topology::downstream(ctx),
        CheckKind::Slots => topology::slots(ctx),
        CheckKind::MissingSlots => topology::missing_slots(ctx),
        CheckKind::Upstream => topology::upstream(ctx),
    };
    result.unwrap_or_else(|e| {
        let unknown = CheckResult::new(kind.as_str(), CheckStatus::Unknown, e.to_string());
        match kind {
            CheckKind::DataDirectory => unknown.with_status_token(node::DATA_DIRECTORY_KEY, "UNKNOWN"),
            _ => unknown,
        }
    })
}

/// Status for `value` against warning and critical thresholds.
fn threshold_status(value: u64, warning: u64, critical: u64) -> CheckStatus {
    if value >= critical {
        CheckStatus::Critical
    } else if value >= warning {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_status() {
        assert_eq!(threshold_status(0, 300, 600), CheckStatus::Ok);
        assert_eq!(threshold_status(300, 300, 600), CheckStatus::Warning);
        assert_eq!(threshold_status(601, 300, 600), CheckStatus::Critical);
    }

    #[test]
    fn test_check_names_match_cli_values() {
        for kind in CheckKind::value_variants() {
            let value = kind.to_possible_value().map(|v| v.get_name().to_string());
            assert_eq!(value.as_deref(), Some(kind.as_str()));
        }
    }
}
