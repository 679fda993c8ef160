//! CLI command implementations
//!
//! Every command runs against a [`NodeContext`] and writes through the
//! formatter chosen by `--format`. Nothing below [`run`] terminates the
//! process: errors travel back here and are mapped to an exit code once.
//!
//! In optformat a failed command still prints a `--status=ERROR` line on
//! stdout, because that is the only thing a remote caller sees.

use std::io::{self, Write};

use super::args::{Cli, ClusterAction, Command, DaemonAction, ServiceAction};
use crate::checks::run_check;
use crate::config::Config;
use crate::context::NodeContext;
use crate::error::{ClusterError, ClusterResult, ErrorClass};
use crate::local;
use crate::monitor::{
    NodeConnection, RecoveryState, ReplicationMonitor, ReplicationStatus, ShutdownFlags,
};
use crate::observability::{Logger, Severity};
use crate::output::{Formatter, OutputFormat};
use crate::registry::{default_slot_name, EventKind, NodeId, NodeRecord, NodeRegistry, NodeRole};
use crate::switchover::{
    self, follow_upstream, RejoinOptions, RejoinOutcome, Switchover, SwitchoverOutcome,
};

/// How a command that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    /// The main action happened but a follow-up could not be confirmed.
    Incomplete,
    /// A check reported CRITICAL or UNKNOWN.
    CheckFailed,
}

impl CommandOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandOutcome::Success => 0,
            CommandOutcome::Incomplete => ErrorClass::Incomplete.exit_code(),
            CommandOutcome::CheckFailed => ErrorClass::CheckFailed.exit_code(),
        }
    }
}

/// Parse the process arguments, run the command and return the exit code.
pub fn run() -> i32 {
    let cli = Cli::parse_args();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => return report_error(cli.format, &mut io::stdout(), &e),
    };
    apply_log_level(&cli, &config);
    let ctx = match NodeContext::production(config, Some(cli.config.clone())) {
        Ok(ctx) => ctx,
        Err(e) => return report_error(cli.format, &mut io::stdout(), &e),
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    execute_and_report(&cli, &ctx, &mut out)
}

fn apply_log_level(cli: &Cli, config: &Config) {
    let name = cli.log_level.as_deref().unwrap_or(&config.log_level);
    match Severity::parse(name) {
        Some(severity) => Logger::set_min_severity(severity),
        None => Logger::warning("UNKNOWN_LOG_LEVEL", &[("log_level", name)]),
    }
}

/// Run `cli` and map the result to an exit code, reporting any error.
pub fn execute_and_report<W: Write>(cli: &Cli, ctx: &NodeContext, out: &mut W) -> i32 {
    match execute(cli, ctx, out) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => report_error(cli.format, out, &e),
    }
}

fn report_error(format: OutputFormat, out: &mut dyn Write, err: &ClusterError) -> i32 {
    let class = err.class();
    let message = err.to_string();
    let mut fields = vec![("class", class.as_str()), ("detail", message.as_str())];
    if let Some(hint) = err.hint() {
        fields.push(("hint", hint));
    }
    Logger::error("COMMAND_FAILED", &fields);
    if let Err(e) = format.formatter().emit_error(out, err) {
        Logger::warning("OUTPUT_FAILED", &[("detail", &e.to_string())]);
    }
    class.exit_code()
}

/// Execute a parsed command against `ctx`, writing output to `out`.
pub fn execute<W: Write>(
    cli: &Cli,
    ctx: &NodeContext,
    out: &mut W,
) -> ClusterResult<CommandOutcome> {
    let mut session = Session {
        ctx,
        formatter: cli.format.formatter(),
        out,
    };
    session.dispatch(&cli.command)
}

/// One command invocation: context, formatter and output stream.
struct Session<'a> {
    ctx: &'a NodeContext,
    formatter: Box<dyn Formatter>,
    out: &'a mut dyn Write,
}

impl<'a> Session<'a> {
    fn dispatch(&mut self, command: &Command) -> ClusterResult<CommandOutcome> {
        match command {
            Command::Status {
                is_shutdown_cleanly,
            } => {
                if *is_shutdown_cleanly {
                    self.shutdown_status()
                } else {
                    self.status()
                }
            }
            Command::Check { kind } => {
                let result = run_check(self.ctx, *kind);
                self.formatter.emit_check(self.out, &result)?;
                if result.status.is_failure() {
                    Ok(CommandOutcome::CheckFailed)
                } else {
                    Ok(CommandOutcome::Success)
                }
            }
            Command::Promote => {
                switchover::promote(self.ctx)?;
                self.action(true, &format!("node {} promoted to leader", self.ctx.node_id()))
            }
            Command::Switchover(args) => self.switchover(args.options()),
            Command::Rejoin {
                upstream_conninfo,
                force_rewind,
                allow_unclean,
                no_wait,
            } => {
                let options = RejoinOptions {
                    force_rewind: *force_rewind,
                    allow_unclean: *allow_unclean,
                    wait: !*no_wait,
                };
                match switchover::rejoin(self.ctx, upstream_conninfo, options)? {
                    RejoinOutcome::Attached => {
                        self.action(true, "node rejoined and is attached to its upstream")
                    }
                    RejoinOutcome::Started => self.action(true, "node started as a standby"),
                    RejoinOutcome::Incomplete { reason } => self.action(false, &reason),
                }
            }
            Command::Follow { upstream_node_id } => self.follow(*upstream_node_id),
            Command::Service { action } => self.service(*action),
            Command::Register {
                role,
                upstream_node_id,
                upstream_conninfo,
                force,
            } => self.register(*role, *upstream_node_id, upstream_conninfo.as_deref(), *force),
            Command::Unregister { node_id } => self.unregister(*node_id),
            Command::Cluster { action } => match action {
                ClusterAction::Show => self.cluster_show(),
                ClusterAction::Events { limit } => self.cluster_events(*limit),
            },
            Command::Daemon { action } => self.daemon(*action),
        }
    }

    fn action(&mut self, complete: bool, message: &str) -> ClusterResult<CommandOutcome> {
        self.formatter.emit_action(self.out, complete, message)?;
        Ok(if complete {
            CommandOutcome::Success
        } else {
            CommandOutcome::Incomplete
        })
    }

    fn fields(&mut self, fields: &[(&str, String)]) -> ClusterResult<CommandOutcome> {
        self.formatter.emit_fields(self.out, fields)?;
        Ok(CommandOutcome::Success)
    }

    /// Answered from the local server and control file only.
    fn shutdown_status(&mut self) -> ClusterResult<CommandOutcome> {
        let reply = local::shutdown_state(self.ctx.local.as_ref());
        self.fields(&[
            ("state", reply.state.as_str().to_string()),
            ("last-checkpoint-lsn", reply.last_checkpoint_lsn.to_string()),
        ])
    }

    fn status(&mut self) -> ClusterResult<CommandOutcome> {
        let control = self.ctx.control.snapshot()?;
        let mut role = "unknown".to_string();
        let mut status = ReplicationStatus::unreachable();
        match self.ctx.connect_local() {
            Ok(conn) => {
                if let Some(own) = conn.registry().node(self.ctx.node_id())? {
                    role = own.role.to_string();
                }
                status = ReplicationStatus::collect(conn.as_ref())?;
            }
            Err(e) => Logger::debug("LOCAL_CONNECTION_FAILED", &[("detail", &e.to_string())]),
        }
        let running = status.is_reachable || self.ctx.local.is_running().unwrap_or(false);

        self.fields(&[
            ("node-id", self.ctx.node_id().to_string()),
            ("node-name", self.ctx.config.node_name.clone()),
            ("role", role),
            ("recovery-state", status.recovery_state.to_string()),
            ("running", running.to_string()),
            ("receive-lsn", status.wal_receive_position.to_string()),
            ("replay-lsn", status.wal_replay_position.to_string()),
            ("lag", status.lag_seconds.to_string()),
            ("paused", control.paused.to_string()),
            ("term", control.election.term.to_string()),
            ("voting-status", control.election.voting_status.to_string()),
        ])
    }

    fn switchover(&mut self, options: switchover::SwitchoverOptions) -> ClusterResult<CommandOutcome> {
        let report = Switchover::new(self.ctx, options).run()?;
        match report.outcome {
            SwitchoverOutcome::DryRun => {
                for check in &report.plan.checks {
                    self.formatter.emit_check(self.out, &check.to_result())?;
                }
                self.action(
                    true,
                    &format!(
                        "pre-flight passed: node {} can be promoted in place of node {}",
                        report.plan.candidate.id, report.plan.leader.id
                    ),
                )
            }
            SwitchoverOutcome::Completed => self.action(
                true,
                &format!(
                    "switchover complete: node {} is the leader, node {} follows it",
                    report.plan.candidate.id, report.plan.leader.id
                ),
            ),
            SwitchoverOutcome::Incomplete { reasons } => self.action(
                false,
                &format!(
                    "node {} is the leader but the switchover is incomplete: {}",
                    report.plan.candidate.id,
                    reasons.join("; ")
                ),
            ),
        }
    }

    fn follow(&mut self, upstream_id: Option<NodeId>) -> ClusterResult<CommandOutcome> {
        let local = self.ctx.connect_local()?;
        let registry = local.registry();
        let upstream = match upstream_id {
            Some(id) => registry
                .node(id)?
                .ok_or_else(|| ClusterError::config(format!("node {} is not registered", id)))?,
            None => registry
                .leader()?
                .ok_or_else(|| ClusterError::config("registry lists no active leader"))?,
        };
        if upstream.id == self.ctx.node_id() {
            return Err(ClusterError::config("a node cannot follow itself"));
        }
        // The local replica may predate a leadership change the upstream
        // already knows about.
        let upstream = match self.ctx.connect(&upstream) {
            Ok(conn) => conn.registry().node(upstream.id)?.unwrap_or(upstream),
            Err(_) => upstream,
        };
        drop(local);

        let record = follow_upstream(self.ctx, &upstream, EventKind::StandbyFollow)?;
        self.action(
            true,
            &format!("node {} now follows node {}", record.id, upstream.id),
        )
    }

    fn service(&mut self, action: ServiceAction) -> ClusterResult<CommandOutcome> {
        let ctx = self.ctx;
        let server = ctx.local.as_ref();
        match action {
            ServiceAction::Start => {
                server.start()?;
                self.action(true, "server started")
            }
            ServiceAction::Stop { checkpoint } => {
                if checkpoint {
                    match ctx.connect_local().and_then(|c| c.checkpoint()) {
                        Ok(()) => Logger::info("CHECKPOINT_ISSUED", &[]),
                        Err(e) => {
                            Logger::warning("CHECKPOINT_FAILED", &[("detail", &e.to_string())])
                        }
                    }
                }
                server.stop()?;
                self.action(true, "server stopped")
            }
            ServiceAction::Restart => {
                server.restart()?;
                self.action(true, "server restarted")
            }
        }
    }

    fn register(
        &mut self,
        role: Option<NodeRole>,
        upstream_id: Option<NodeId>,
        upstream_conninfo: Option<&str>,
        force: bool,
    ) -> ClusterResult<CommandOutcome> {
        let ctx = self.ctx;
        let local = ctx.connect_local()?;
        let state = local.recovery_state()?;
        let role = match role {
            Some(role) => role,
            None => match state {
                RecoveryState::Leader => NodeRole::Leader,
                RecoveryState::Standby => NodeRole::Standby,
                RecoveryState::Unknown => {
                    return Err(ClusterError::config(
                        "cannot determine the role of this node; pass --role",
                    ))
                }
            },
        };
        if role == NodeRole::Leader && state != RecoveryState::Leader {
            return Err(ClusterError::config(format!(
                "node {} is {} and cannot be registered as leader",
                ctx.node_id(),
                state
            )));
        }
        if role == NodeRole::Standby && state != RecoveryState::Standby {
            return Err(ClusterError::config(format!(
                "node {} is {} and cannot be registered as standby",
                ctx.node_id(),
                state
            )));
        }

        let leader_conn: Box<dyn NodeConnection> = match (role, upstream_conninfo) {
            (NodeRole::Leader, _) => local,
            (_, Some(target)) => ctx.connector.connect(target)?,
            (_, None) => {
                let leader = local.registry().leader()?.ok_or_else(|| {
                    ClusterError::config("registry lists no active leader; pass --upstream-conninfo")
                })?;
                ctx.connect(&leader)?
            }
        };
        if leader_conn.recovery_state()? != RecoveryState::Leader {
            return Err(ClusterError::config(
                "registration must be written to the current leader",
            ));
        }
        let registry = leader_conn.registry();

        let upstream = match role {
            NodeRole::Leader => None,
            NodeRole::Standby => match upstream_id {
                Some(id) => {
                    let upstream = registry.node(id)?.ok_or_else(|| {
                        ClusterError::config(format!("upstream node {} is not registered", id))
                    })?;
                    if !upstream.active || upstream.role == NodeRole::Witness {
                        return Err(ClusterError::config(format!(
                            "node {} cannot be an upstream",
                            id
                        )));
                    }
                    Some(id)
                }
                None => Some(leader_id(registry)?),
            },
            NodeRole::Witness => Some(leader_id(registry)?),
        };
        if role == NodeRole::Leader {
            if let Some(current) = registry.leader()? {
                if current.id != ctx.node_id() {
                    return Err(ClusterError::config(format!(
                        "node {} is already registered as the active leader",
                        current.id
                    )));
                }
            }
        }

        let record = self_record(ctx, role, upstream);
        let kind = match role {
            NodeRole::Leader => EventKind::LeaderRegister,
            NodeRole::Standby => EventKind::StandbyRegister,
            NodeRole::Witness => EventKind::WitnessRegister,
        };
        if let Err(e) = registry.register(&record, force) {
            ctx.record_event(registry, kind, false, &e.to_string());
            return Err(match e {
                ClusterError::Conflict(_) => ClusterError::config(format!(
                    "node {} is already registered; use --force to overwrite",
                    record.id
                )),
                other => other,
            });
        }
        ctx.record_event(
            registry,
            kind,
            true,
            &format!("node {} registered as {}", record.id, role),
        );
        Logger::notice(
            "NODE_REGISTERED",
            &[("node_id", &record.id.to_string()), ("role", role.as_str())],
        );
        self.action(
            true,
            &format!("node {} registered as {}", record.id, role),
        )
    }

    fn unregister(&mut self, node_id: NodeId) -> ClusterResult<CommandOutcome> {
        let leader_conn = connect_leader(self.ctx)?;
        let registry = leader_conn.registry();
        let record = registry
            .node(node_id)?
            .ok_or_else(|| ClusterError::config(format!("node {} is not registered", node_id)))?;
        if record.active && record.role == NodeRole::Leader {
            return Err(ClusterError::config(format!(
                "node {} is the active leader and cannot be unregistered",
                node_id
            )));
        }
        let children: Vec<String> = registry
            .active_nodes()?
            .iter()
            .filter(|n| n.upstream_id == Some(node_id) && n.role == NodeRole::Standby)
            .map(|n| n.id.to_string())
            .collect();
        if !children.is_empty() {
            Logger::warning(
                "UNREGISTER_HAS_DOWNSTREAM",
                &[("node_id", &node_id.to_string()), ("downstream", &children.join(","))],
            );
        }
        if !registry.unregister(node_id)? {
            return Err(ClusterError::conflict(format!(
                "node {} was removed concurrently",
                node_id
            )));
        }
        self.ctx.record_event(
            registry,
            EventKind::NodeUnregister,
            true,
            &format!("node {} unregistered", node_id),
        );
        self.action(true, &format!("node {} unregistered", node_id))
    }

    fn cluster_show(&mut self) -> ClusterResult<CommandOutcome> {
        let local = self.ctx.connect_local()?;
        let mut rows = Vec::new();
        for node in local.registry().nodes()? {
            let state = self
                .ctx
                .connect(&node)
                .and_then(|conn| conn.recovery_state())
                .ok();
            rows.push(vec![
                node.id.to_string(),
                node.name.clone(),
                if node.active {
                    node.role.to_string()
                } else {
                    format!("{} (inactive)", node.role)
                },
                node.upstream_id.map(|id| id.to_string()).unwrap_or_default(),
                state.is_some().to_string(),
                state.unwrap_or(RecoveryState::Unknown).to_string(),
                node.priority.to_string(),
            ]);
        }
        self.formatter.emit_table(
            self.out,
            &[
                "id",
                "name",
                "role",
                "upstream",
                "reachable",
                "recovery-state",
                "priority",
            ],
            &rows,
        )?;
        Ok(CommandOutcome::Success)
    }

    fn cluster_events(&mut self, limit: usize) -> ClusterResult<CommandOutcome> {
        let local = self.ctx.connect_local()?;
        let rows: Vec<Vec<String>> = local
            .registry()
            .events(limit)?
            .into_iter()
            .map(|e| {
                vec![
                    e.node_id.to_string(),
                    e.kind.to_string(),
                    e.success.to_string(),
                    e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                    e.details,
                ]
            })
            .collect();
        self.formatter.emit_table(
            self.out,
            &["node-id", "event", "successful", "timestamp", "details"],
            &rows,
        )?;
        Ok(CommandOutcome::Success)
    }

    fn daemon(&mut self, action: DaemonAction) -> ClusterResult<CommandOutcome> {
        let ctx = self.ctx;
        let control = &ctx.control;
        match action {
            DaemonAction::Run => {
                let flags = ShutdownFlags::install()?;
                ReplicationMonitor::new(ctx.clone()).run(&flags)?;
                Ok(CommandOutcome::Success)
            }
            DaemonAction::Pause | DaemonAction::Unpause => {
                let paused = action == DaemonAction::Pause;
                let previous = control.set_paused(paused)?;
                let kind = if paused {
                    EventKind::MonitorPause
                } else {
                    EventKind::MonitorUnpause
                };
                match connect_leader(ctx) {
                    Ok(conn) => ctx.record_event(
                        conn.registry(),
                        kind,
                        true,
                        &format!("pause flag {} -> {}", previous, paused),
                    ),
                    Err(e) => Logger::warning(
                        "EVENT_WRITE_FAILED",
                        &[("event", kind.as_str()), ("detail", &e.to_string())],
                    ),
                }
                let message = match (previous, paused) {
                    (true, true) => "monitor was already paused",
                    (false, false) => "monitor was not paused",
                    (_, true) => "monitor paused",
                    (_, false) => "monitor unpaused",
                };
                self.action(true, message)
            }
            DaemonAction::Status => {
                let snapshot = control.snapshot()?;
                let mut fields = vec![
                    ("paused", snapshot.paused.to_string()),
                    ("term", snapshot.election.term.to_string()),
                    ("voting-status", snapshot.election.voting_status.to_string()),
                ];
                if let Some(candidate) = snapshot.election.candidate_id {
                    fields.push(("candidate-id", candidate.to_string()));
                }
                self.fields(&fields)
            }
            DaemonAction::NotifyFollow { leader_id, term } => {
                let accepted = control.receive_follow(leader_id, term)?;
                let term = term.to_string();
                let leader = leader_id.to_string();
                if accepted {
                    Logger::notice(
                        "FOLLOW_DIRECTIVE_RECEIVED",
                        &[("leader_id", &leader), ("term", &term)],
                    );
                    self.action(true, &format!("will follow node {}", leader))
                } else {
                    Logger::info(
                        "FOLLOW_DIRECTIVE_STALE",
                        &[("leader_id", &leader), ("term", &term)],
                    );
                    self.action(true, &format!("ignored stale directive from term {}", term))
                }
            }
        }
    }
}

/// This node's record as it would be registered.
fn self_record(ctx: &NodeContext, role: NodeRole, upstream_id: Option<NodeId>) -> NodeRecord {
    let config = &ctx.config;
    let slot_name = if config.use_replication_slots && role == NodeRole::Standby {
        default_slot_name(config.node_id)
    } else {
        String::new()
    };
    NodeRecord {
        id: config.node_id,
        name: config.node_name.clone(),
        role,
        upstream_id,
        connection_target: config.conninfo.clone(),
        ssh_target: config.ssh_target().to_string(),
        slot_name,
        priority: if role == NodeRole::Witness { 0 } else { config.priority },
        active: true,
    }
}

fn leader_id(registry: &dyn NodeRegistry) -> ClusterResult<NodeId> {
    registry
        .leader()?
        .map(|l| l.id)
        .ok_or_else(|| ClusterError::config("registry lists no active leader"))
}

/// Connection to the node that accepts registry writes.
fn connect_leader(ctx: &NodeContext) -> ClusterResult<Box<dyn NodeConnection>> {
    let local = ctx.connect_local()?;
    if local.recovery_state()? == RecoveryState::Leader {
        return Ok(local);
    }
    let leader = local
        .registry()
        .leader()?
        .ok_or_else(|| ClusterError::config("registry lists no active leader"))?;
    ctx.connect(&leader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(CommandOutcome::Success.exit_code(), 0);
        assert_eq!(CommandOutcome::Incomplete.exit_code(), 6);
        assert_eq!(CommandOutcome::CheckFailed.exit_code(), 7);
    }

    #[test]
    fn test_optformat_error_line() {
        let mut out = Vec::new();
        let code = report_error(
            OutputFormat::Optformat,
            &mut out,
            &ClusterError::config("node 9 is not registered"),
        );
        assert_eq!(code, 1);
        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with("--status=ERROR --error-class=CONFIGURATION"));
        assert!(line.contains("--message=configuration_error:_node_9_is_not_registered"));
    }

    #[test]
    fn test_text_error_prints_nothing() {
        let mut out = Vec::new();
        let code = report_error(OutputFormat::Text, &mut out, &ClusterError::fatal("split brain"));
        assert_eq!(code, 2);
        assert!(out.is_empty());
    }
}
