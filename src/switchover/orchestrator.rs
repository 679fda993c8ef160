//! Switchover orchestrator
//!
//! ```text
//! Phase A  pre-flight, pause monitors          (no side effects on failure)
//! Phase B  stop leader, catch up, promote      (not restartable)
//! Phase C  rejoin old leader, siblings, slots  (failures make it incomplete)
//! ```
//!
//! Each Phase B step re-reads the state its predecessor established rather
//! than assuming it.

use std::time::Duration;

use uuid::Uuid;

use super::plan::{SwitchoverOptions, SwitchoverPlan};
use super::preflight::Preflight;
use super::promote::promote_local;
use crate::clock::poll_until;
use crate::context::NodeContext;
use crate::error::{ClusterError, ClusterResult};
use crate::lsn::Lsn;
use crate::monitor::NodeConnection;
use crate::observability::{Logger, ObservationScope};
use crate::registry::{Demotion, EventKind, NodeId, NodeRecord};
use crate::remote::{ActionReply, DaemonReply, RemoteAction, ShutdownReply, ShutdownState};

/// Final state of a switchover run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchoverOutcome {
    /// Pre-flight passed; nothing was changed.
    DryRun,
    /// New leader promoted and every follow-up confirmed.
    Completed,
    /// New leader promoted; some follow-up steps need attention.
    Incomplete { reasons: Vec<String> },
}

/// Report of one switchover run.
#[derive(Debug, Clone)]
pub struct SwitchoverReport {
    pub run_id: Uuid,
    pub plan: SwitchoverPlan,
    pub outcome: SwitchoverOutcome,
    /// Polls of the candidate's receive position before it reached the
    /// shutdown checkpoint.
    pub catchup_polls: u32,
    /// Time from the leader's confirmed shutdown until the candidate was
    /// promoted and registered as leader.
    pub promotion_elapsed: Duration,
    /// Nodes whose monitor this run paused.
    pub paused_nodes: Vec<NodeId>,
}

/// Runs a switchover that promotes this node.
pub struct Switchover<'a> {
    ctx: &'a NodeContext,
    options: SwitchoverOptions,
}

impl<'a> Switchover<'a> {
    pub fn new(ctx: &'a NodeContext, options: SwitchoverOptions) -> Self {
        Self { ctx, options }
    }

    pub fn run(&self) -> ClusterResult<SwitchoverReport> {
        let scope = ObservationScope::new("SWITCHOVER_PREFLIGHT");
        let plan = Preflight::new(self.ctx, self.options).run();
        scope.finish(&plan);
        let plan = plan?;
        for check in &plan.checks {
            Logger::info(
                "SWITCHOVER_CHECK",
                &[
                    ("check", check.name),
                    ("status", check.status.as_str()),
                    ("detail", &check.detail),
                ],
            );
        }

        if self.options.dry_run {
            return Ok(SwitchoverReport {
                run_id: plan.run_id,
                plan,
                outcome: SwitchoverOutcome::DryRun,
                catchup_polls: 0,
                promotion_elapsed: Duration::ZERO,
                paused_nodes: Vec::new(),
            });
        }

        let paused_nodes = if self.options.no_pause {
            Vec::new()
        } else {
            self.pause_monitors(&plan)
        };

        let run_id = plan.run_id.to_string();
        let scope = ObservationScope::with_fields(
            "SWITCHOVER",
            &[
                ("run_id", &run_id),
                ("leader_id", &plan.leader.id.to_string()),
                ("candidate_id", &plan.candidate.id.to_string()),
            ],
        );

        let shutdown_lsn = match self.stop_leader(&plan) {
            Ok(lsn) => lsn,
            Err(e) => {
                // Nothing has changed yet; give the monitors back.
                self.resume_monitors(&plan, &paused_nodes);
                scope.fail(&e);
                return Err(e);
            }
        };

        let promoted = self.promote_candidate(&plan, shutdown_lsn);
        let (new_leader, catchup_polls, promotion_elapsed) = match promoted {
            Ok(value) => value,
            Err(e) => {
                Logger::error(
                    "SWITCHOVER_ABANDONED",
                    &[
                        ("run_id", &run_id),
                        ("detail", &e.to_string()),
                        (
                            "hint",
                            "the old leader is stopped; monitors stay paused until the cluster is repaired",
                        ),
                    ],
                );
                scope.fail(&e);
                return Err(e);
            }
        };

        let reasons = self.rejoin_phase(&plan, new_leader.as_ref());
        self.resume_monitors(&plan, &paused_nodes);

        let success = reasons.is_empty();
        self.ctx.record_event(
            new_leader.registry(),
            EventKind::StandbySwitchover,
            success,
            &format!(
                "node {} promoted, node {} demoted{}",
                plan.candidate.id,
                plan.leader.id,
                if success {
                    String::new()
                } else {
                    format!(" ({})", reasons.join("; "))
                }
            ),
        );

        let outcome = if success {
            scope.complete_with_fields(&[("catchup_polls", &catchup_polls.to_string())]);
            SwitchoverOutcome::Completed
        } else {
            scope.complete_with_fields(&[
                ("catchup_polls", &catchup_polls.to_string()),
                ("incomplete", &reasons.len().to_string()),
            ]);
            SwitchoverOutcome::Incomplete { reasons }
        };

        Ok(SwitchoverReport {
            run_id: plan.run_id,
            plan,
            outcome,
            catchup_polls,
            promotion_elapsed,
            paused_nodes,
        })
    }

    /// Pause every reachable monitor that is not already paused.
    fn pause_monitors(&self, plan: &SwitchoverPlan) -> Vec<NodeId> {
        let mut paused = Vec::new();
        for node in plan.all_nodes() {
            match self.pause_one(node) {
                Ok(true) => paused.push(node.id),
                Ok(false) => Logger::info(
                    "MONITOR_ALREADY_PAUSED",
                    &[("node_id", &node.id.to_string())],
                ),
                Err(e) => Logger::warning(
                    "MONITOR_PAUSE_FAILED",
                    &[("node_id", &node.id.to_string()), ("detail", &e.to_string())],
                ),
            }
        }
        paused
    }

    /// Returns whether this call changed the pause flag.
    fn pause_one(&self, node: &NodeRecord) -> ClusterResult<bool> {
        if node.id == self.ctx.node_id() {
            return Ok(!self.ctx.control.set_paused(true)?);
        }
        let status = DaemonReply::from_reply(&self.ctx.remote(node, &RemoteAction::DaemonStatus)?)?;
        if status.paused {
            return Ok(false);
        }
        let reply = self.ctx.remote(node, &RemoteAction::DaemonPause)?;
        ActionReply::from_reply(&reply)?.into_result(&node.ssh_target)?;
        Ok(true)
    }

    /// Resume the monitors this run paused, or all of them when forced.
    fn resume_monitors(&self, plan: &SwitchoverPlan, paused: &[NodeId]) {
        let targets: Vec<&NodeRecord> = plan
            .all_nodes()
            .into_iter()
            .filter(|n| self.options.force_unpause || paused.contains(&n.id))
            .collect();
        for node in targets {
            let result = if node.id == self.ctx.node_id() {
                self.ctx.control.set_paused(false).map(|_| ())
            } else {
                self.ctx
                    .remote(node, &RemoteAction::DaemonUnpause)
                    .and_then(|r| ActionReply::from_reply(&r))
                    .and_then(|r| r.into_result(&node.ssh_target))
            };
            if let Err(e) = result {
                Logger::warning(
                    "MONITOR_UNPAUSE_FAILED",
                    &[("node_id", &node.id.to_string()), ("detail", &e.to_string())],
                );
            }
        }
    }

    /// Phase B step 1: stop the leader and return its shutdown checkpoint.
    fn stop_leader(&self, plan: &SwitchoverPlan) -> ClusterResult<Lsn> {
        let leader = &plan.leader;
        let checkpoint = self.ctx.connect(leader).and_then(|c| c.checkpoint());
        if let Err(e) = checkpoint {
            Logger::warning(
                "LEADER_CHECKPOINT_SKIPPED",
                &[("node_id", &leader.id.to_string()), ("detail", &e.to_string())],
            );
        }

        let reply = self
            .ctx
            .remote(leader, &RemoteAction::ServiceStop { checkpoint: true })?;
        ActionReply::from_reply(&reply)?.into_result(&leader.ssh_target)?;

        let outcome = poll_until(
            &self.ctx.clock,
            self.ctx.config.shutdown_check_timeout(),
            self.ctx.config.promote_check_interval(),
            |_| {
                let reply = self
                    .ctx
                    .remote(leader, &RemoteAction::ShutdownState)
                    .and_then(|r| ShutdownReply::from_reply(&r));
                match reply {
                    Ok(r) if r.state == ShutdownState::Running => Ok(None),
                    Ok(r) => Ok(Some(r)),
                    Err(e) if e.is_transient() => Ok(None),
                    Err(e) => Err(e),
                }
            },
        )?;
        let reply = outcome.into_value().ok_or_else(|| {
            ClusterError::fatal(format!(
                "leader {} did not report a shutdown within {} seconds",
                leader.id, self.ctx.config.shutdown_check_timeout_secs
            ))
        })?;

        match reply.state {
            ShutdownState::Shutdown => {}
            ShutdownState::UncleanShutdown if self.options.allow_unclean => {
                Logger::warning(
                    "LEADER_UNCLEAN_SHUTDOWN_ACCEPTED",
                    &[("node_id", &leader.id.to_string())],
                );
            }
            state => {
                return Err(ClusterError::fatal(format!(
                    "leader {} reported shutdown state {}; pass --allow-unclean to continue",
                    leader.id, state
                )))
            }
        }
        if !reply.last_checkpoint_lsn.is_valid() {
            return Err(ClusterError::fatal(format!(
                "leader {} reported no shutdown checkpoint",
                leader.id
            )));
        }
        Logger::notice(
            "LEADER_STOPPED",
            &[
                ("node_id", &leader.id.to_string()),
                ("checkpoint_lsn", &reply.last_checkpoint_lsn.to_string()),
            ],
        );
        Ok(reply.last_checkpoint_lsn)
    }

    /// Phase B steps 2-4.
    fn promote_candidate(
        &self,
        plan: &SwitchoverPlan,
        shutdown_lsn: Lsn,
    ) -> ClusterResult<(Box<dyn NodeConnection>, u32, Duration)> {
        let started = self.ctx.clock.now();
        let (caught_up, polls) = self.wait_for_catchup(shutdown_lsn)?;
        if !caught_up {
            if !self.options.always_promote {
                return Err(ClusterError::fatal(format!(
                    "node {} did not receive WAL up to the shutdown checkpoint {} within {} seconds",
                    plan.candidate.id,
                    shutdown_lsn,
                    self.ctx.config.wal_receive_check_timeout_secs
                )));
            }
            Logger::warning(
                "PROMOTING_BEHIND_CHECKPOINT",
                &[("checkpoint_lsn", &shutdown_lsn.to_string())],
            );
        }

        let new_leader = promote_local(self.ctx)?;
        new_leader.registry().transfer_leadership(
            plan.candidate.id,
            plan.leader.id,
            Demotion::Standby,
        )?;
        let elapsed = self.ctx.clock.now().saturating_duration_since(started);
        Logger::notice(
            "CANDIDATE_PROMOTED",
            &[
                ("node_id", &plan.candidate.id.to_string()),
                ("elapsed_ms", &elapsed.as_millis().to_string()),
            ],
        );
        Ok((new_leader, polls, elapsed))
    }

    /// Poll the local receive position until it reaches `target`.
    ///
    /// Returns whether it did and how many polls it took.
    fn wait_for_catchup(&self, target: Lsn) -> ClusterResult<(bool, u32)> {
        let local = self.ctx.connect_local()?;
        let outcome = poll_until(
            &self.ctx.clock,
            self.ctx.config.wal_receive_check_timeout(),
            self.ctx.config.promote_check_interval(),
            |_| {
                let receive = local.wal_positions()?.receive;
                Ok((receive >= target).then_some(receive))
            },
        )?;
        let polls = outcome.polls();
        Ok((outcome.into_value().is_some(), polls))
    }

    /// Phase C. Returns the steps that could not be confirmed.
    fn rejoin_phase(&self, plan: &SwitchoverPlan, new_leader: &dyn NodeConnection) -> Vec<String> {
        let mut reasons = Vec::new();
        let old = &plan.leader;
        let candidate = &plan.candidate;

        let rejoin = RemoteAction::Rejoin {
            upstream_conninfo: candidate.connection_target.clone(),
            force_rewind: self.options.force_rewind,
            allow_unclean: self.options.allow_unclean,
        };
        let rejoined = self
            .ctx
            .remote(old, &rejoin)
            .and_then(|r| ActionReply::from_reply(&r))
            .and_then(|r| r.into_result(&old.ssh_target));
        match rejoined {
            Ok(()) => {
                let attached = poll_until(
                    &self.ctx.clock,
                    self.ctx.config.standby_reconnect_timeout(),
                    self.ctx.config.promote_check_interval(),
                    |_| new_leader.is_attached(&old.name).map(|ok| ok.then_some(())),
                );
                match attached.map(|o| o.into_value().is_some()) {
                    Ok(true) => {}
                    Ok(false) => reasons.push(format!(
                        "node {} did not attach to the new leader within {} seconds",
                        old.id, self.ctx.config.standby_reconnect_timeout_secs
                    )),
                    Err(e) => reasons.push(format!("unable to confirm node {} attached: {}", old.id, e)),
                }
            }
            Err(e) => reasons.push(format!("rejoin of node {} failed: {}", old.id, e)),
        }

        let mut obsolete_slots = Vec::new();
        if candidate.uses_slot() {
            obsolete_slots.push(candidate.slot_name.clone());
        }
        if self.options.siblings_follow {
            for sibling in &plan.reachable_siblings {
                let result = self
                    .ctx
                    .remote(sibling, &RemoteAction::Follow { upstream_id: candidate.id })
                    .and_then(|r| ActionReply::from_reply(&r))
                    .and_then(|r| r.into_result(&sibling.ssh_target));
                match result {
                    Ok(()) if sibling.uses_slot() => obsolete_slots.push(sibling.slot_name.clone()),
                    Ok(()) => {}
                    Err(e) => reasons.push(format!("node {} did not follow: {}", sibling.id, e)),
                }
            }
            for sibling in plan.siblings.iter().filter(|s| !plan.reachable_siblings.contains(s)) {
                reasons.push(format!("node {} was unreachable and still follows node {}", sibling.id, old.id));
            }
        } else if !plan.siblings.is_empty() {
            Logger::notice(
                "SIBLINGS_NOT_FOLLOWING",
                &[
                    ("count", &plan.siblings.len().to_string()),
                    ("hint", "run \"follow\" on each sibling or pass --siblings-follow"),
                ],
            );
        }

        if !obsolete_slots.is_empty() {
            self.drop_slots(old, &obsolete_slots);
        }
        reasons
    }

    /// Best-effort removal of slots the old leader no longer serves.
    fn drop_slots(&self, old: &NodeRecord, slots: &[String]) {
        let conn = match self.ctx.connect(old) {
            Ok(conn) => conn,
            Err(e) => {
                Logger::warning(
                    "SLOT_CLEANUP_SKIPPED",
                    &[("node_id", &old.id.to_string()), ("detail", &e.to_string())],
                );
                return;
            }
        };
        for slot in slots {
            if let Err(e) = conn.drop_replication_slot(slot) {
                Logger::warning(
                    "SLOT_DROP_FAILED",
                    &[("slot", slot), ("detail", &e.to_string())],
                );
            }
        }
    }
}
