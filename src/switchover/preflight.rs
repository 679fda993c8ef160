//! Phase A: pre-flight
//!
//! Read-only. Running it any number of times without a change in the
//! cluster yields the same verdict and writes nothing to the registry or to
//! any node's control state.

use uuid::Uuid;

use super::plan::{PreflightCheck, SwitchoverOptions, SwitchoverPlan};
use crate::context::NodeContext;
use crate::error::{ClusterError, ClusterResult};
use crate::monitor::{NodeConnection, RecoveryState};
use crate::output::CheckStatus;
use crate::registry::{NodeId, NodeRecord, NodeRole};
use crate::remote::{CheckReply, RemoteAction};

/// Pre-flight validator for a switchover to this node.
pub struct Preflight<'a> {
    ctx: &'a NodeContext,
    options: SwitchoverOptions,
}

impl<'a> Preflight<'a> {
    pub fn new(ctx: &'a NodeContext, options: SwitchoverOptions) -> Self {
        Self { ctx, options }
    }

    pub fn run(&self) -> ClusterResult<SwitchoverPlan> {
        let mut checks = Vec::new();
        let local = self.ctx.connect_local()?;
        let registry = local.registry();

        let candidate = self.ctx.own_record(registry)?;
        if candidate.role != NodeRole::Standby || !candidate.active {
            return Err(ClusterError::config(format!(
                "switchover must be executed on an active standby; node {} is {}",
                candidate.id, candidate.role
            )));
        }
        if local.recovery_state()? != RecoveryState::Standby {
            return Err(ClusterError::config(format!(
                "node {} is registered as standby but is not in recovery",
                candidate.id
            )));
        }

        let leader = registry
            .leader()?
            .ok_or_else(|| ClusterError::config("no active leader is registered"))?;
        if candidate.upstream_id != Some(leader.id) {
            return Err(ClusterError::config(format!(
                "node {} is not attached to the leader (node {}); its upstream is {}",
                candidate.id,
                leader.id,
                candidate
                    .upstream_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "none".to_string())
            )));
        }
        checks.push(PreflightCheck::ok(
            "candidate",
            format!("node {} is a standby of leader {}", candidate.id, leader.id),
        ));

        let wal = local.wal_positions()?;
        if wal.replay_paused && wal.replay < wal.receive {
            return Err(ClusterError::config(format!(
                "WAL replay is paused on node {} with outstanding WAL (replayed {}, received {})",
                candidate.id, wal.replay, wal.receive
            )));
        }

        let leader_conn = self.ctx.connect(&leader).map_err(|e| {
            ClusterError::config(format!("unable to connect to leader {}: {}", leader.id, e))
        })?;
        if leader_conn.exclusive_backup_in_progress()? {
            return Err(ClusterError::config(format!(
                "an exclusive backup is in progress on leader {}",
                leader.id
            )));
        }

        self.check_remote_leader(&leader)?;
        checks.push(PreflightCheck::ok(
            "leader-host",
            format!("remote commands on \"{}\" succeed", leader.ssh_target),
        ));

        let active = registry.active_nodes()?;
        let siblings: Vec<NodeRecord> = active
            .iter()
            .filter(|n| {
                n.id != candidate.id && n.role == NodeRole::Standby && n.upstream_id == Some(leader.id)
            })
            .cloned()
            .collect();
        let witnesses: Vec<NodeRecord> = active
            .iter()
            .filter(|n| n.role == NodeRole::Witness)
            .cloned()
            .collect();

        let mut reachable_siblings = Vec::new();
        for sibling in &siblings {
            match self.remote_node_id(sibling) {
                Ok(id) if id == sibling.id => reachable_siblings.push(sibling.clone()),
                Ok(id) => checks.push(PreflightCheck::warning(
                    "sibling",
                    format!("host of node {} answered as node {}", sibling.id, id),
                )),
                Err(e) => checks.push(PreflightCheck::warning(
                    "sibling",
                    format!("node {} unreachable: {}", sibling.id, e),
                )),
            }
        }

        let required_free_wal_senders = 1 + reachable_siblings.len() as u32;
        let required_free_slots = siblings.iter().filter(|s| s.uses_slot()).count() as u32;
        self.check_capacity(
            local.as_ref(),
            &candidate,
            required_free_wal_senders,
            required_free_slots,
            &mut checks,
        )?;
        self.check_thresholds(leader_conn.as_ref(), wal.lag_seconds, &mut checks)?;

        Ok(SwitchoverPlan {
            run_id: Uuid::new_v4(),
            leader,
            candidate,
            siblings,
            reachable_siblings,
            witnesses,
            required_free_wal_senders,
            required_free_slots,
            checks,
        })
    }

    /// Remote binary is invocable on the leader host, its configuration
    /// belongs to the leader and names the running data directory.
    fn check_remote_leader(&self, leader: &NodeRecord) -> ClusterResult<()> {
        let id = self.remote_node_id(leader).map_err(|e| {
            ClusterError::config(format!(
                "unable to execute remote commands on leader host \"{}\": {}",
                leader.ssh_target, e
            ))
        })?;
        if id != leader.id {
            return Err(ClusterError::config(format!(
                "host \"{}\" reports node id {}, expected {}",
                leader.ssh_target, id, leader.id
            )));
        }

        let reply = self
            .ctx
            .remote(leader, &RemoteAction::DataDirectoryCheck)
            .and_then(|r| CheckReply::from_reply(&r, "configured-data-directory"))
            .map_err(|e| ClusterError::config(format!("data directory check failed on leader: {}", e)))?;
        if reply.status != CheckStatus::Ok {
            return Err(ClusterError::config(format!(
                "configured data directory on leader {} does not match the running instance",
                leader.id
            )));
        }
        Ok(())
    }

    fn remote_node_id(&self, node: &NodeRecord) -> ClusterResult<NodeId> {
        self.ctx
            .remote(node, &RemoteAction::Status)?
            .parse_value("node-id")
    }

    fn check_capacity(
        &self,
        local: &dyn NodeConnection,
        candidate: &NodeRecord,
        required_senders: u32,
        required_slots: u32,
        checks: &mut Vec<PreflightCheck>,
    ) -> ClusterResult<()> {
        let capacity = local.replication_capacity()?;
        let mut deficits = Vec::new();

        let free_senders = capacity.free_wal_senders();
        if free_senders < required_senders {
            deficits.push(format!(
                "insufficient free WAL senders on node {}: {} required, {} available (deficit {})",
                candidate.id,
                required_senders,
                free_senders,
                required_senders - free_senders
            ));
        }
        let free_slots = capacity.free_replication_slots();
        if free_slots < required_slots {
            deficits.push(format!(
                "insufficient free replication slots on node {}: {} required, {} available (deficit {})",
                candidate.id,
                required_slots,
                free_slots,
                required_slots - free_slots
            ));
        }

        if deficits.is_empty() {
            checks.push(PreflightCheck::ok(
                "capacity",
                format!(
                    "{} free WAL senders, {} free replication slots",
                    free_senders, free_slots
                ),
            ));
            return Ok(());
        }
        let message = deficits.join("; ");
        if self.options.force {
            checks.push(PreflightCheck::warning("capacity", message));
            Ok(())
        } else {
            Err(ClusterError::config(message))
        }
    }

    fn check_thresholds(
        &self,
        leader_conn: &dyn NodeConnection,
        lag_seconds: u64,
        checks: &mut Vec<PreflightCheck>,
    ) -> ClusterResult<()> {
        let config = &self.ctx.config;
        let mut problems = Vec::new();

        let archive_ready = leader_conn.archive_ready_count()?;
        if archive_ready >= config.archive_ready_critical {
            problems.push(format!(
                "{} WAL files pending archiving on the leader (critical: {})",
                archive_ready, config.archive_ready_critical
            ));
        } else if archive_ready >= config.archive_ready_warning {
            checks.push(PreflightCheck::warning(
                "archive-ready",
                format!("{} WAL files pending archiving", archive_ready),
            ));
        }

        if lag_seconds >= config.replication_lag_critical_secs {
            problems.push(format!(
                "replication lag is {} seconds (critical: {})",
                lag_seconds, config.replication_lag_critical_secs
            ));
        } else if lag_seconds >= config.replication_lag_warning_secs {
            checks.push(PreflightCheck::warning(
                "replication-lag",
                format!("replication lag is {} seconds", lag_seconds),
            ));
        }

        if problems.is_empty() {
            return Ok(());
        }
        let message = problems.join("; ");
        if self.options.force {
            checks.push(PreflightCheck::warning("thresholds", message));
            Ok(())
        } else {
            Err(ClusterError::config(message))
        }
    }
}
