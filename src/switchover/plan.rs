//! Switchover plan
//!
//! Built by the pre-flight phase and discarded at the end of the run.

use uuid::Uuid;

use crate::output::{CheckResult, CheckStatus};
use crate::registry::NodeRecord;

/// Operator options for one switchover run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchoverOptions {
    /// Run pre-flight only.
    pub dry_run: bool,
    /// Downgrade capacity, lag and archive deficits to warnings.
    pub force: bool,
    /// Promote even if the candidate never reaches the shutdown checkpoint.
    pub always_promote: bool,
    /// Accept an unclean shutdown of the old leader.
    pub allow_unclean: bool,
    /// Let the old leader rewind if its timeline diverged.
    pub force_rewind: bool,
    /// Re-point the siblings at the new leader.
    pub siblings_follow: bool,
    /// Leave the monitors running during the switchover.
    pub no_pause: bool,
    /// Resume every monitor at the end, not only those this run paused.
    pub force_unpause: bool,
}

/// One pre-flight verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl PreflightCheck {
    pub fn ok(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    pub fn warning(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warning,
            detail: detail.into(),
        }
    }

    pub fn to_result(&self) -> CheckResult {
        CheckResult::new(self.name, self.status, self.detail.clone())
    }
}

/// Participants and pre-flight results of one switchover.
#[derive(Debug, Clone)]
pub struct SwitchoverPlan {
    pub run_id: Uuid,
    /// Current leader, to be demoted.
    pub leader: NodeRecord,
    /// This node, to be promoted.
    pub candidate: NodeRecord,
    /// Other active standbys of the leader.
    pub siblings: Vec<NodeRecord>,
    /// Siblings that answered a remote status request.
    pub reachable_siblings: Vec<NodeRecord>,
    /// Witnesses, paused and resumed with everyone else.
    pub witnesses: Vec<NodeRecord>,
    pub required_free_wal_senders: u32,
    pub required_free_slots: u32,
    pub checks: Vec<PreflightCheck>,
}

impl SwitchoverPlan {
    /// Every node whose monitor takes part in the run.
    pub fn all_nodes(&self) -> Vec<&NodeRecord> {
        let mut nodes = vec![&self.leader, &self.candidate];
        nodes.extend(self.siblings.iter());
        nodes.extend(self.witnesses.iter());
        nodes
    }

    /// Worst status among the checks.
    pub fn verdict(&self) -> CheckStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Ok)
    }
}
