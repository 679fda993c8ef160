//! Replication monitor loop
//!
//! One tick:
//!
//! ```text
//! local database reachable?   no  -> mark self failed on the leader, stop
//! follow directive pending?   yes -> follow the announced leader
//! leader?                         -> sample self
//! upstream reachable?         yes -> sample, healthy
//!                             no  -> leader lost: voting engine
//!                                    cascading upstream lost: follow the leader
//! ```
//!
//! Stop and reload requests are only looked at between ticks.

use chrono::Utc;

use super::connection::NodeConnection;
use super::signals::ShutdownFlags;
use super::status::ReplicationStatus;
use crate::config::Config;
use crate::context::NodeContext;
use crate::error::{ClusterError, ClusterResult, ErrorClass};
use crate::observability::{log_event, Event, Logger};
use crate::registry::{EventKind, MonitoringSample, NodeChange, NodeId, NodeRecord, NodeRole};
use crate::switchover::follow_upstream;
use crate::voting::{FailoverOutcome, VotingEngine};

/// Result of one monitor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Upstream (or this leader) answered.
    Healthy,
    /// Upstream lost while paused; nothing was done.
    Paused,
    /// This node re-parented to `leader`.
    Followed { leader: NodeId },
    /// The leader was lost and the voting engine ran.
    Failover(FailoverOutcome),
}

/// Long-lived monitor for one node.
pub struct ReplicationMonitor {
    ctx: NodeContext,
    /// Last leader seen in the registry, used when the local database is gone.
    known_leader: Option<NodeRecord>,
}

impl ReplicationMonitor {
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            known_leader: None,
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Poll `node` within the retry budget.
    pub fn poll(&self, node: &NodeRecord) -> ClusterResult<ReplicationStatus> {
        self.ctx.retry_policy().run(self.ctx.clock.as_ref(), |_| {
            let conn = self.ctx.connect(node)?;
            ReplicationStatus::collect(conn.as_ref())
        })
    }

    pub fn tick(&mut self) -> ClusterResult<TickOutcome> {
        let local = match self.ctx.connect_with_retry(&self.ctx.config.conninfo) {
            Ok(conn) => conn,
            Err(e) => return Err(self.local_lost(e)),
        };

        let paused = self.ctx.control.is_paused()?;
        if !paused {
            if let Some(leader) = self.ctx.control.pending_follow()? {
                drop(local);
                let outcome = VotingEngine::new(&self.ctx).apply_follow_directive(leader)?;
                return Ok(TickOutcome::Failover(outcome));
            }
        }

        let registry = local.registry();
        let own = self.ctx.own_record(registry)?;
        self.known_leader = registry.leader()?;
        self.flush_deferred_events(&own, local.as_ref());

        if own.role == NodeRole::Leader {
            let status = ReplicationStatus::collect(local.as_ref())?;
            Logger::debug(
                "LEADER_SAMPLE",
                &[("wal_lsn", &status.wal_receive_position.to_string())],
            );
            return Ok(TickOutcome::Healthy);
        }

        let upstream_id = match own.role {
            NodeRole::Witness => self.known_leader.as_ref().map(|l| l.id),
            _ => own.upstream_id,
        };
        let Some(upstream) = upstream_id.and_then(|id| registry.node(id).ok().flatten()) else {
            Logger::warning(
                "UPSTREAM_UNKNOWN",
                &[("node_id", &own.id.to_string())],
            );
            return Ok(TickOutcome::Healthy);
        };

        match self.poll(&upstream) {
            Ok(status) => {
                if own.role == NodeRole::Standby {
                    self.record_sample(local.as_ref(), &own, &upstream, &status);
                }
                Ok(TickOutcome::Healthy)
            }
            Err(e) => {
                drop(local);
                self.upstream_lost(&own, &upstream, paused, e)
            }
        }
    }

    fn upstream_lost(
        &mut self,
        own: &NodeRecord,
        upstream: &NodeRecord,
        paused: bool,
        cause: ClusterError,
    ) -> ClusterResult<TickOutcome> {
        let detail = cause.to_string();
        if upstream.role == NodeRole::Leader {
            log_event(
                Event::LeaderLost,
                &[("leader_id", &upstream.id.to_string()), ("detail", &detail)],
            );
            let outcome = VotingEngine::new(&self.ctx).handle_leader_lost(upstream)?;
            return Ok(TickOutcome::Failover(outcome));
        }

        log_event(
            Event::UpstreamLost,
            &[("upstream_id", &upstream.id.to_string()), ("detail", &detail)],
        );
        if paused {
            log_event(Event::MonitorPaused, &[("node_id", &own.id.to_string())]);
            return Ok(TickOutcome::Paused);
        }
        let leader = self
            .known_leader
            .clone()
            .ok_or_else(|| ClusterError::fatal("upstream lost and no active leader is registered"))?;
        follow_upstream(&self.ctx, &leader, EventKind::StandbyFollow)?;
        Ok(TickOutcome::Followed { leader: leader.id })
    }

    /// Best-effort: write events no registry accepted earlier.
    fn flush_deferred_events(&self, own: &NodeRecord, local: &dyn NodeConnection) {
        let flushed = self.ctx.control.deferred_events().and_then(|pending| {
            if pending.is_empty() {
                return Ok(0);
            }
            if own.role == NodeRole::Leader {
                return self.ctx.flush_deferred_events(local.registry());
            }
            let leader = self
                .known_leader
                .as_ref()
                .ok_or_else(|| ClusterError::config("no active leader is registered"))?;
            self.ctx.flush_deferred_events(self.ctx.connect(leader)?.registry())
        });
        match flushed {
            Ok(0) => {}
            Ok(count) => Logger::info("DEFERRED_EVENTS_WRITTEN", &[("count", &count.to_string())]),
            Err(e) => Logger::debug("DEFERRED_EVENTS_PENDING", &[("detail", &e.to_string())]),
        }
    }

    /// Best-effort: mark this node failed on the last known leader.
    fn local_lost(&self, cause: ClusterError) -> ClusterError {
        log_event(
            Event::LocalConnectionLost,
            &[("node_id", &self.ctx.node_id().to_string()), ("detail", &cause.to_string())],
        );
        let Some(leader) = self.known_leader.as_ref().filter(|l| l.id != self.ctx.node_id()) else {
            return ClusterError::fatal(format!("local database unreachable: {}", cause));
        };
        let marked = self.ctx.connect(leader).and_then(|conn| {
            let registry = conn.registry();
            let own = self.ctx.own_record(registry)?;
            registry.update_node(own.id, &own.condition(), &NodeChange::deactivate())?;
            self.ctx.record_event(
                registry,
                EventKind::NodeFailed,
                true,
                &format!("node {} lost its local database: {}", own.id, cause),
            );
            Ok(())
        });
        if let Err(e) = marked {
            Logger::warning(
                "NODE_FAILED_NOT_RECORDED",
                &[("leader_id", &leader.id.to_string()), ("detail", &e.to_string())],
            );
        }
        ClusterError::fatal(format!("local database unreachable: {}", cause))
    }

    fn record_sample(
        &self,
        local: &dyn NodeConnection,
        own: &NodeRecord,
        upstream: &NodeRecord,
        upstream_status: &ReplicationStatus,
    ) {
        if !self.ctx.config.monitoring_history {
            return;
        }
        let written = local.wal_positions().and_then(|wal| {
            let sample = MonitoringSample {
                node_id: own.id,
                upstream_id: upstream.id,
                sampled_at: Utc::now(),
                upstream_lsn: upstream_status.wal_receive_position,
                receive_lsn: wal.receive,
                replay_lsn: wal.replay,
                lag_seconds: wal.lag_seconds,
            };
            // Samples are written on the leader.
            let leader = self
                .known_leader
                .as_ref()
                .ok_or_else(|| ClusterError::config("no active leader is registered"))?;
            self.ctx.connect(leader)?.registry().record_sample(&sample)
        });
        if let Err(e) = written {
            log_event(Event::SampleWriteFailed, &[("detail", &e.to_string())]);
        }
    }

    /// Re-read the configuration file; the node id may not change.
    pub fn reload(&mut self) -> ClusterResult<()> {
        let path = self
            .ctx
            .config_path
            .clone()
            .ok_or_else(|| ClusterError::config("no configuration file to reload"))?;
        let config = Config::load(&path)?;
        if config.node_id != self.ctx.config.node_id {
            return Err(ClusterError::config(format!(
                "node_id changed from {} to {}; restart the monitor instead",
                self.ctx.config.node_id, config.node_id
            )));
        }
        self.ctx.config = config;
        Ok(())
    }

    /// Run ticks until a stop is requested or an error ends monitoring.
    pub fn run(&mut self, flags: &ShutdownFlags) -> ClusterResult<()> {
        log_event(
            Event::MonitorStart,
            &[
                ("node_id", &self.ctx.node_id().to_string()),
                ("interval_secs", &self.ctx.config.monitor_interval_secs.to_string()),
            ],
        );
        loop {
            if flags.stop_requested() {
                log_event(Event::MonitorStop, &[]);
                return Ok(());
            }
            if flags.take_reload() {
                match self.reload() {
                    Ok(()) => log_event(Event::ConfigReloaded, &[]),
                    Err(e) => log_event(Event::ConfigReloadFailed, &[("detail", &e.to_string())]),
                }
            }

            match self.tick() {
                Ok(outcome) => Logger::debug("MONITOR_TICK", &[("outcome", &format!("{:?}", outcome))]),
                Err(e @ ClusterError::NoMajority { .. }) => {
                    // The leader may come back or the partition heal.
                    Logger::error(
                        "FAILOVER_ABORTED",
                        &[("detail", &e.to_string()), ("class", e.class().as_str())],
                    );
                }
                Err(e) => match e.class() {
                    ErrorClass::Transient | ErrorClass::Conflict => Logger::warning(
                        "MONITOR_TICK_FAILED",
                        &[("detail", &e.to_string()), ("class", e.class().as_str())],
                    ),
                    _ => return Err(e),
                },
            }

            self.ctx.clock.sleep(self.ctx.config.monitor_interval());
        }
    }
}
