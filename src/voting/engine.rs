//! Failover Voting Engine
//!
//! Reacts to a confirmed leader loss on this node:
//!
//! ```text
//! paused?            -> do nothing
//! follow directive?  -> follow the announced winner
//! manual failover?   -> log, record, wait for the operator
//! witness?           -> wait for the survivors' winner, then re-point
//! new leader already? -> follow it
//! minority?          -> abort (never self-promote)
//! otherwise          -> new term, poll siblings, rank, promote or follow
//! ```
//!
//! Terms are comparable across nodes: a new election starts past the
//! highest term any reachable peer reports, so the winner's follow
//! directives are never stale on its siblings.

use std::collections::BTreeSet;

use super::election::Election;
use super::ranking::has_majority;
use crate::clock::{poll_until, PollOutcome};
use crate::config::FailoverMode;
use crate::context::NodeContext;
use crate::error::{ClusterError, ClusterResult, ErrorClass};
use crate::monitor::RecoveryState;
use crate::observability::{log_event, Event, Logger, ObservationScope};
use crate::registry::{
    Demotion, EventKind, NodeChange, NodeId, NodeRecord, NodeRegistry, NodeRole,
};
use crate::remote::{ActionReply, DaemonReply, RemoteAction};
use crate::switchover::{follow_upstream, promote_local};

/// How a leader loss was resolved on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// This node won the election and is now the leader.
    Promoted { term: u64 },
    /// This node re-parented to the winner.
    Followed { leader: NodeId, term: u64 },
    /// The witness re-pointed at the new leader.
    WitnessFollowed { leader: NodeId },
    /// The monitor is paused; nothing was done.
    Paused,
    /// Failover is manual; the loss was recorded.
    ManualMode,
    /// The lost leader answered again before the election started.
    LeaderReturned,
}

/// Runs elections for one node.
pub struct VotingEngine<'a> {
    ctx: &'a NodeContext,
}

impl<'a> VotingEngine<'a> {
    pub fn new(ctx: &'a NodeContext) -> Self {
        Self { ctx }
    }

    /// Resolve the loss of `lost_leader`.
    pub fn handle_leader_lost(&self, lost_leader: &NodeRecord) -> ClusterResult<FailoverOutcome> {
        let control = &self.ctx.control;
        if control.is_paused()? {
            log_event(
                Event::MonitorPaused,
                &[("leader_id", &lost_leader.id.to_string())],
            );
            return Ok(FailoverOutcome::Paused);
        }

        if let Some(leader) = control.pending_follow()? {
            return self.apply_follow_directive(leader);
        }

        let local = self.ctx.connect_local()?;
        let own = self.ctx.own_record(local.registry())?;

        if self.ctx.config.failover == FailoverMode::Manual {
            log_event(
                Event::ManualFailoverRequired,
                &[
                    ("leader_id", &lost_leader.id.to_string()),
                    ("hint", "promote a standby with \"walwarden promote\""),
                ],
            );
            self.ctx.record_event(
                local.registry(),
                EventKind::FailoverManual,
                true,
                &format!("leader {} unreachable; failover is manual", lost_leader.id),
            );
            return Ok(FailoverOutcome::ManualMode);
        }

        if own.role == NodeRole::Witness {
            return self.witness_reacquire(&own, lost_leader);
        }

        // A sibling may have won while this node missed the directive.
        if let Some(leader) = self.established_leader(&own, lost_leader, local.registry())? {
            Logger::notice(
                "NEW_LEADER_FOUND",
                &[
                    ("leader_id", &leader.to_string()),
                    ("lost_leader_id", &lost_leader.id.to_string()),
                ],
            );
            drop(local);
            return self.apply_follow_directive(leader);
        }

        self.run_election(&own, lost_leader, local.registry())
    }

    /// A directive names the leader to follow; follow it and end the term.
    pub fn apply_follow_directive(&self, leader: NodeId) -> ClusterResult<FailoverOutcome> {
        let local = self.ctx.connect_local()?;
        let target = local
            .registry()
            .node(leader)?
            .ok_or_else(|| ClusterError::config(format!("follow target {} is not registered", leader)))?;
        let term = self.ctx.control.snapshot()?.election.term;
        follow_upstream(self.ctx, &target, EventKind::FailoverFollow)?;
        self.ctx.control.reset_election()?;
        log_event(
            Event::FollowDirectiveApplied,
            &[("leader_id", &leader.to_string()), ("term", &term.to_string())],
        );
        Ok(FailoverOutcome::Followed { leader, term })
    }

    fn run_election(
        &self,
        own: &NodeRecord,
        lost_leader: &NodeRecord,
        registry: &dyn NodeRegistry,
    ) -> ClusterResult<FailoverOutcome> {
        let active = registry.active_nodes()?;
        let total = active.len();

        // Reachability: self plus every peer that accepts a connection.
        let mut reachable = BTreeSet::new();
        reachable.insert(own.id);
        for node in active.iter().filter(|n| n.id != own.id) {
            if self.ctx.connect(node).is_ok() {
                reachable.insert(node.id);
            }
        }
        if reachable.contains(&lost_leader.id) {
            Logger::notice(
                "LEADER_RETURNED",
                &[("leader_id", &lost_leader.id.to_string())],
            );
            return Ok(FailoverOutcome::LeaderReturned);
        }

        let visible = reachable.len();
        if !has_majority(visible, total) {
            let err = ClusterError::NoMajority { visible, total };
            self.ctx.record_event(
                registry,
                EventKind::FailoverAborted,
                false,
                &err.to_string(),
            );
            return Err(err);
        }

        // Direct siblings of this node under the lost leader, plus witnesses.
        let participants: Vec<NodeRecord> = active
            .iter()
            .filter(|n| n.id == own.id || reachable.contains(&n.id))
            .filter(|n| {
                n.id == own.id
                    || n.role == NodeRole::Witness
                    || (n.role == NodeRole::Standby && n.upstream_id == own.upstream_id)
            })
            .cloned()
            .collect();
        let siblings: Vec<NodeRecord> = participants
            .iter()
            .filter(|n| n.id != own.id && n.role == NodeRole::Standby)
            .cloned()
            .collect();

        let seen = self.highest_peer_term(&active, &reachable, own.id);
        let term = self.ctx.control.start_election(seen)?;
        let term_text = term.to_string();
        let scope = ObservationScope::with_fields(
            "ELECTION",
            &[
                ("node_id", &own.id.to_string()),
                ("term", &term_text),
                ("visible", &visible.to_string()),
                ("total", &total.to_string()),
            ],
        );

        let result = self.poll_and_decide(own, lost_leader, term, participants, &siblings);
        scope.finish(&result);
        result
    }

    fn poll_and_decide(
        &self,
        own: &NodeRecord,
        lost_leader: &NodeRecord,
        term: u64,
        participants: Vec<NodeRecord>,
        siblings: &[NodeRecord],
    ) -> ClusterResult<FailoverOutcome> {
        let mut election = Election::new(term, participants);

        let outcome = poll_until(
            &self.ctx.clock,
            self.ctx.config.election_timeout(),
            self.ctx.config.sibling_poll_interval(),
            |_| {
                for id in election.pending() {
                    if id == own.id {
                        let local = self.ctx.connect_local()?;
                        election.report(id, local.wal_positions()?.receive);
                        continue;
                    }
                    let Some(node) = siblings.iter().find(|n| n.id == id) else {
                        continue;
                    };
                    match self.ctx.connect(node).and_then(|c| c.wal_positions()) {
                        Ok(wal) => election.report(id, wal.receive),
                        Err(e) => {
                            Logger::warning(
                                "ELECTION_SIBLING_UNREACHABLE",
                                &[("node_id", &id.to_string()), ("detail", &e.to_string())],
                            );
                            election.exclude(id);
                        }
                    }
                }
                let lost_all = !siblings.is_empty()
                    && siblings.iter().all(|s| election.is_excluded(s.id));
                if lost_all {
                    return Err(ClusterError::Isolated { node_id: own.id });
                }
                Ok(election.is_settled().then_some(()))
            },
        )?;
        if let PollOutcome::TimedOut { polls } = outcome {
            Logger::warning(
                "ELECTION_TIMEOUT",
                &[("term", &term.to_string()), ("polls", &polls.to_string())],
            );
        }
        election.close();

        let winner = election.winner().ok_or_else(|| {
            ClusterError::fatal(format!(
                "no promotion candidate reported a valid WAL position within {} seconds",
                self.ctx.config.election_timeout_secs
            ))
        })?;

        Logger::notice(
            "ELECTION_DECIDED",
            &[
                ("term", &term.to_string()),
                ("winner_id", &winner.id.to_string()),
                ("receive_lsn", &winner.receive_lsn.to_string()),
            ],
        );

        if winner.id == own.id {
            self.ctx.control.announce(own.id, true)?;
            self.promote_self(own, lost_leader, term)
        } else {
            self.ctx.control.announce(winner.id, false)?;
            self.await_winner(winner.id, term, siblings)
        }
    }

    fn promote_self(
        &self,
        own: &NodeRecord,
        lost_leader: &NodeRecord,
        term: u64,
    ) -> ClusterResult<FailoverOutcome> {
        // Another node may have been promoted while this one polled.
        let local = self.ctx.connect_local()?;
        if let Some(leader) = self.established_leader(own, lost_leader, local.registry())? {
            Logger::warning(
                "ELECTION_SUPERSEDED",
                &[("term", &term.to_string()), ("leader_id", &leader.to_string())],
            );
            drop(local);
            return self.apply_follow_directive(leader);
        }
        drop(local);

        let conn = promote_local(self.ctx)?;
        let claimed = conn
            .registry()
            .transfer_leadership(own.id, lost_leader.id, Demotion::Failed);
        if let Err(e) = claimed {
            // The server is already out of recovery; do not keep running as a
            // second leader.
            return Err(match e.class() {
                ErrorClass::Conflict => ClusterError::fatal(format!(
                    "node {} was promoted but another node claimed leadership first ({}); \
                     stop this server and rejoin it to the registered leader",
                    own.id, e
                )),
                _ => e,
            });
        }
        self.ctx.record_event(
            conn.registry(),
            EventKind::FailoverPromote,
            true,
            &format!("node {} promoted to leader in term {}", own.id, term),
        );

        // Every other node that replicated from the lost leader, including
        // the witness, is told to follow.
        let notify = conn
            .registry()
            .active_nodes()?
            .into_iter()
            .filter(|n| n.id != own.id && n.upstream_id == Some(lost_leader.id));
        for node in notify {
            let action = RemoteAction::NotifyFollow {
                leader: own.id,
                term,
            };
            let result = self
                .ctx
                .remote(&node, &action)
                .and_then(|reply| ActionReply::from_reply(&reply))
                .and_then(|reply| reply.into_result(&node.ssh_target));
            if let Err(e) = result {
                Logger::warning(
                    "FOLLOW_NOTIFY_FAILED",
                    &[("node_id", &node.id.to_string()), ("detail", &e.to_string())],
                );
            }
        }

        self.ctx.control.reset_election()?;
        Ok(FailoverOutcome::Promoted { term })
    }

    /// A peer that is running as leader and registered as the active
    /// leader in its own registry.
    fn established_leader(
        &self,
        own: &NodeRecord,
        lost_leader: &NodeRecord,
        registry: &dyn NodeRegistry,
    ) -> ClusterResult<Option<NodeId>> {
        let peers = registry.active_nodes()?;
        let candidates = peers
            .iter()
            .filter(|n| n.id != own.id && n.id != lost_leader.id && n.role != NodeRole::Witness);
        for peer in candidates {
            let Ok(conn) = self.ctx.connect(peer) else {
                continue;
            };
            if !matches!(conn.recovery_state(), Ok(RecoveryState::Leader)) {
                continue;
            }
            let registered = conn
                .registry()
                .node(peer.id)
                .ok()
                .flatten()
                .is_some_and(|r| r.active && r.role == NodeRole::Leader);
            if registered {
                return Ok(Some(peer.id));
            }
        }
        Ok(None)
    }

    /// Highest election term reported by the reachable peers.
    fn highest_peer_term(
        &self,
        active: &[NodeRecord],
        reachable: &BTreeSet<NodeId>,
        own: NodeId,
    ) -> u64 {
        active
            .iter()
            .filter(|n| n.id != own && reachable.contains(&n.id))
            .filter_map(|node| {
                let reply = self
                    .ctx
                    .remote(node, &RemoteAction::DaemonStatus)
                    .and_then(|reply| DaemonReply::from_reply(&reply));
                match reply {
                    Ok(status) => Some(status.term),
                    Err(e) => {
                        Logger::debug(
                            "PEER_TERM_UNKNOWN",
                            &[("node_id", &node.id.to_string()), ("detail", &e.to_string())],
                        );
                        None
                    }
                }
            })
            .max()
            .unwrap_or(0)
    }

    fn await_winner(
        &self,
        winner: NodeId,
        term: u64,
        siblings: &[NodeRecord],
    ) -> ClusterResult<FailoverOutcome> {
        let control = &self.ctx.control;
        let outcome = poll_until(
            &self.ctx.clock,
            self.ctx.config.follow_wait_timeout(),
            self.ctx.config.sibling_poll_interval(),
            |_| control.pending_follow(),
        )?;

        let leader = match outcome.into_value() {
            Some(leader) => leader,
            None => {
                // No directive: follow the winner only if it really is leader.
                let node = siblings
                    .iter()
                    .find(|s| s.id == winner)
                    .ok_or_else(|| ClusterError::fatal(format!("winner {} is not a sibling", winner)))?;
                let state = self.ctx.connect(node)?.recovery_state()?;
                if state != RecoveryState::Leader {
                    return Err(ClusterError::fatal(format!(
                        "no follow directive from node {} within {} seconds and it is not a leader",
                        winner, self.ctx.config.follow_wait_timeout_secs
                    )));
                }
                winner
            }
        };

        match self.apply_follow_directive(leader)? {
            FailoverOutcome::Followed { leader, .. } => Ok(FailoverOutcome::Followed { leader, term }),
            other => Ok(other),
        }
    }

    fn witness_reacquire(
        &self,
        own: &NodeRecord,
        lost_leader: &NodeRecord,
    ) -> ClusterResult<FailoverOutcome> {
        let outcome = poll_until(
            &self.ctx.clock,
            self.ctx.config.follow_wait_timeout(),
            self.ctx.config.sibling_poll_interval(),
            |_| {
                if let Some(leader) = self.ctx.control.pending_follow()? {
                    return Ok(Some(leader));
                }
                let local = self.ctx.connect_local()?;
                Ok(local
                    .registry()
                    .leader()?
                    .filter(|l| l.id != lost_leader.id)
                    .map(|l| l.id))
            },
        )?;
        let leader = outcome.into_value().ok_or_else(|| {
            ClusterError::fatal(format!(
                "witness {} found no new leader within {} seconds",
                own.id, self.ctx.config.follow_wait_timeout_secs
            ))
        })?;

        let local = self.ctx.connect_local()?;
        let target = local
            .registry()
            .node(leader)?
            .ok_or_else(|| ClusterError::config(format!("leader {} is not registered", leader)))?;
        let conn = self.ctx.connect(&target)?;
        let current = self.ctx.own_record(conn.registry())?;
        let change = NodeChange {
            upstream_id: Some(Some(leader)),
            ..NodeChange::default()
        };
        conn.registry()
            .update_node(own.id, &current.condition(), &change)?;
        self.ctx.control.reset_election()?;
        Logger::notice(
            "WITNESS_REPOINTED",
            &[("leader_id", &leader.to_string())],
        );
        Ok(FailoverOutcome::WitnessFollowed { leader })
    }
}
