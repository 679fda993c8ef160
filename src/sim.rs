//! In-memory cluster simulation
//!
//! [`SimCluster`] implements every I/O seam of the engine against shared
//! in-memory state: database connections, the registry (read-only on
//! anything but a running leader), the local server, and the Remote Command
//! Channel. The channel parses the command line with the real CLI
//! definitions and runs the real dispatcher against the target node's
//! context, so the `--key=value` protocol is exercised end to end.
//!
//! Time comes from one shared [`ManualClock`]. A standby receives WAL from
//! its upstream at `receive_rate` bytes per simulated second, capped at the
//! upstream's position.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use clap::Parser;

use crate::cli::{execute_and_report, Cli};
use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::context::NodeContext;
use crate::control::ControlState;
use crate::error::{ClusterError, ClusterResult};
use crate::local::{ControlFileInfo, DbState, LocalServer, StandbyConfig};
use crate::lsn::Lsn;
use crate::monitor::{
    AttachedStandby, Connector, NodeConnection, RecoveryState, ReplicationCapacity, SlotInfo,
    WalPositions,
};
use crate::registry::{
    Demotion, EventRecord, MemoryRegistry, MonitoringSample, NodeChange, NodeCondition, NodeId,
    NodeRecord, NodeRegistry, NodeRole,
};
use crate::remote::{split_command_line, RemoteChannel};

/// State of one simulated database server and its host.
#[derive(Debug, Clone)]
pub struct SimNode {
    pub name: String,
    pub conninfo: String,
    pub running: bool,
    /// False while the host is cut off from every other node.
    pub reachable: bool,
    pub recovery: RecoveryState,
    /// Leader: current write position.
    pub write_lsn: Lsn,
    pub receive_lsn: Lsn,
    pub replay_lsn: Lsn,
    /// Bytes received per simulated second; `None` catches up instantly.
    pub receive_rate: Option<u64>,
    pub lag_seconds: u64,
    pub replay_paused: bool,
    /// Replication settings the server starts with (standby mode when set).
    pub standby_config: Option<StandbyConfig>,
    /// Upstream the running standby is connected to.
    pub upstream_conninfo: Option<String>,
    pub slots: BTreeSet<String>,
    pub max_wal_senders: u32,
    pub max_replication_slots: u32,
    pub archive_ready: u64,
    pub exclusive_backup: bool,
    pub timeline: u32,
    /// Timeline history: the LSN at which each past timeline ended.
    pub history: BTreeMap<u32, Lsn>,
    /// Control file as of the last stop.
    pub control_file: ControlFileInfo,
    pub data_directory: String,
    pub rewinds: u32,
    pub promotions: u32,
}

impl SimNode {
    fn new(config: &Config) -> Self {
        Self {
            name: config.node_name.clone(),
            conninfo: config.conninfo.clone(),
            running: true,
            reachable: true,
            recovery: RecoveryState::Leader,
            write_lsn: Lsn::new(0x100),
            receive_lsn: Lsn::new(0x100),
            replay_lsn: Lsn::new(0x100),
            receive_rate: None,
            lag_seconds: 0,
            replay_paused: false,
            standby_config: None,
            upstream_conninfo: None,
            slots: BTreeSet::new(),
            max_wal_senders: 10,
            max_replication_slots: 10,
            archive_ready: 0,
            exclusive_backup: false,
            timeline: 1,
            history: BTreeMap::new(),
            control_file: ControlFileInfo {
                state: DbState::InProduction,
                checkpoint_lsn: Lsn::INVALID,
                timeline: 1,
            },
            data_directory: config.data_directory.display().to_string(),
            rewinds: 0,
            promotions: 0,
        }
    }

    /// Newest WAL position this server has.
    pub fn current_lsn(&self) -> Lsn {
        match self.recovery {
            RecoveryState::Leader => self.write_lsn,
            _ => self.receive_lsn,
        }
    }

    fn promote(&mut self) -> ClusterResult<()> {
        if !self.running || self.recovery != RecoveryState::Standby {
            return Err(ClusterError::query(format!(
                "{}: server is not in standby mode",
                self.name
            )));
        }
        self.history.insert(self.timeline, self.receive_lsn);
        self.timeline += 1;
        self.recovery = RecoveryState::Leader;
        self.write_lsn = self.receive_lsn;
        self.replay_lsn = self.receive_lsn;
        self.standby_config = None;
        self.upstream_conninfo = None;
        self.promotions += 1;
        Ok(())
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.upstream_conninfo = None;
        self.control_file = ControlFileInfo {
            state: match self.recovery {
                RecoveryState::Leader => DbState::ShutDown,
                _ => DbState::ShutDownInRecovery,
            },
            checkpoint_lsn: self.current_lsn(),
            timeline: self.timeline,
        };
    }
}

#[derive(Default)]
struct SimInner {
    nodes: BTreeMap<NodeId, SimNode>,
    configs: BTreeMap<NodeId, Config>,
    controls: BTreeMap<NodeId, ControlState>,
    synced_at: Duration,
}

impl SimInner {
    fn by_conninfo(&self, target: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.conninfo == target)
            .map(|(id, _)| *id)
    }

    fn by_host(&self, host: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.name == host)
            .map(|(id, _)| *id)
    }

    fn node(&self, id: NodeId) -> ClusterResult<&SimNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| ClusterError::config(format!("no simulated node {}", id)))
    }

    fn node_mut(&mut self, id: NodeId) -> ClusterResult<&mut SimNode> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| ClusterError::config(format!("no simulated node {}", id)))
    }

    /// Running standbys streaming from `id`.
    fn attached(&self, id: NodeId) -> Vec<&SimNode> {
        let Some(upstream) = self.nodes.get(&id) else {
            return Vec::new();
        };
        if !(upstream.running && upstream.reachable) {
            return Vec::new();
        }
        self.nodes
            .values()
            .filter(|n| {
                n.running
                    && n.reachable
                    && n.recovery == RecoveryState::Standby
                    && n.upstream_conninfo.as_deref() == Some(upstream.conninfo.as_str())
            })
            .collect()
    }

    /// Start `id`, in standby mode if it has replication settings.
    fn start(&mut self, id: NodeId) -> ClusterResult<()> {
        let upstream = {
            let node = self.node(id)?;
            if node.running {
                return Err(ClusterError::config(format!(
                    "{}: server is already running",
                    node.name
                )));
            }
            node.standby_config
                .as_ref()
                .and_then(|c| self.by_conninfo(&c.upstream_conninfo))
                .and_then(|up| self.nodes.get(&up))
                .map(|up| (up.timeline, up.history.clone()))
        };
        let node = self.node_mut(id)?;
        node.running = true;
        if let Some(standby) = node.standby_config.clone() {
            if node.recovery == RecoveryState::Leader {
                node.receive_lsn = node.write_lsn;
                node.replay_lsn = node.write_lsn;
            }
            node.recovery = RecoveryState::Standby;
            node.upstream_conninfo = Some(standby.upstream_conninfo);
            if let Some((timeline, history)) = upstream {
                if timeline > node.timeline {
                    node.timeline = timeline;
                    node.history = history;
                }
            }
        }
        node.control_file.state = DbState::InProduction;
        Ok(())
    }

    /// Deliver WAL to running standbys for `elapsed` of simulated time.
    fn advance(&mut self, elapsed: Duration) {
        let sources: BTreeMap<String, Lsn> = self
            .nodes
            .values()
            .filter(|n| n.reachable)
            .map(|n| (n.conninfo.clone(), n.current_lsn()))
            .collect();
        for node in self.nodes.values_mut() {
            if !(node.running && node.reachable && node.recovery == RecoveryState::Standby) {
                continue;
            }
            let Some(&target) = node.upstream_conninfo.as_ref().and_then(|c| sources.get(c)) else {
                continue;
            };
            if node.receive_lsn < target {
                node.receive_lsn = match node.receive_rate {
                    None => target,
                    Some(rate) => {
                        let bytes = (rate as u128 * elapsed.as_nanos() / 1_000_000_000) as u64;
                        node.receive_lsn.advance(bytes).min(target)
                    }
                };
            }
            if !node.replay_paused {
                node.replay_lsn = node.receive_lsn;
            }
        }
    }
}

struct SimState {
    clock: Arc<ManualClock>,
    registry: MemoryRegistry,
    inner: Mutex<SimInner>,
    network_actions: AtomicU64,
}

impl SimState {
    /// Lock the state after delivering WAL up to the current simulated time.
    fn lock(&self) -> MutexGuard<'_, SimInner> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let now = self.clock.elapsed();
        let elapsed = now.saturating_sub(inner.synced_at);
        if !elapsed.is_zero() {
            inner.advance(elapsed);
            inner.synced_at = now;
        }
        inner
    }

    fn context(self: &Arc<Self>, id: NodeId) -> ClusterResult<NodeContext> {
        let inner = self.lock();
        let config = inner
            .configs
            .get(&id)
            .cloned()
            .ok_or_else(|| ClusterError::config(format!("no simulated node {}", id)))?;
        let control = inner
            .controls
            .get(&id)
            .cloned()
            .ok_or_else(|| ClusterError::config(format!("no simulated node {}", id)))?;
        let clock: Arc<dyn Clock> = self.clock.clone();
        Ok(NodeContext {
            config,
            config_path: None,
            connector: Arc::new(SimConnector {
                state: Arc::clone(self),
                from: id,
            }),
            remote: Arc::new(SimChannel {
                state: Arc::clone(self),
                from: id,
            }),
            local: Arc::new(SimServer {
                state: Arc::clone(self),
                id,
            }),
            control,
            clock,
        })
    }

    fn count_network(&self, from: NodeId, to: NodeId) {
        if from != to {
            self.network_actions.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Whether a running `id` would serve `from` right now.
    fn check_link(inner: &SimInner, from: NodeId, to: NodeId) -> ClusterResult<()> {
        let target = inner.node(to)?;
        if from != to && !(target.reachable && inner.node(from)?.reachable) {
            return Err(ClusterError::unreachable(&target.conninfo, "timeout expired"));
        }
        if !target.running {
            return Err(ClusterError::unreachable(&target.conninfo, "connection refused"));
        }
        Ok(())
    }
}

/// Handle to a simulated cluster.
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<SimState>,
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SimState {
                clock: Arc::new(ManualClock::new()),
                registry: MemoryRegistry::new(),
                inner: Mutex::new(SimInner::default()),
                network_actions: AtomicU64::new(0),
            }),
        }
    }

    /// Add node `id` named `node<id>` and register it.
    ///
    /// A standby starts streaming from `upstream`; a witness runs its own
    /// database and records `upstream` as the leader it watches.
    pub fn add_node(&self, id: u32, role: NodeRole, upstream: Option<u32>) -> ClusterResult<()> {
        let node_id = NodeId(id);
        let name = format!("node{}", id);
        let config = Config::for_node(id, &name)?;
        let mut node = SimNode::new(&config);
        {
            let mut inner = self.state.lock();
            if role == NodeRole::Standby {
                let upstream_id = upstream
                    .map(NodeId)
                    .ok_or_else(|| ClusterError::config("a standby needs an upstream"))?;
                let up = inner.node(upstream_id)?;
                node.recovery = RecoveryState::Standby;
                node.receive_lsn = up.current_lsn();
                node.replay_lsn = up.current_lsn();
                node.timeline = up.timeline;
                node.history = up.history.clone();
                node.standby_config = Some(StandbyConfig {
                    upstream_conninfo: up.conninfo.clone(),
                    slot_name: None,
                    application_name: name.clone(),
                });
                node.upstream_conninfo = Some(up.conninfo.clone());
            }
            inner.nodes.insert(node_id, node);
            inner.controls.insert(node_id, ControlState::in_memory());
            inner.configs.insert(node_id, config.clone());
        }
        self.state.registry.register(
            &NodeRecord {
                id: node_id,
                name: name.clone(),
                role,
                upstream_id: upstream.map(NodeId),
                connection_target: config.conninfo.clone(),
                ssh_target: name,
                slot_name: String::new(),
                priority: config.priority,
                active: true,
            },
            false,
        )
    }

    /// Leader 1 with standbys 2..=n following it.
    pub fn with_standbys(standbys: u32) -> ClusterResult<Self> {
        let cluster = Self::new();
        cluster.add_node(1, NodeRole::Leader, None)?;
        for id in 2..=standbys + 1 {
            cluster.add_node(id, NodeRole::Standby, Some(1))?;
        }
        Ok(cluster)
    }

    /// Context of node `id`, wired to the simulation.
    pub fn context(&self, id: u32) -> ClusterResult<NodeContext> {
        self.state.context(NodeId(id))
    }

    /// Change node `id`'s configuration (affects contexts built afterwards).
    pub fn configure(&self, id: u32, f: impl FnOnce(&mut Config)) {
        if let Some(config) = self.state.lock().configs.get_mut(&NodeId(id)) {
            f(config);
        }
    }

    /// Change node `id`'s server state.
    pub fn update(&self, id: u32, f: impl FnOnce(&mut SimNode)) {
        if let Some(node) = self.state.lock().nodes.get_mut(&NodeId(id)) {
            f(node);
        }
    }

    /// Snapshot of node `id`.
    pub fn node(&self, id: u32) -> Option<SimNode> {
        self.state.lock().nodes.get(&NodeId(id)).cloned()
    }

    /// Stop the server and cut the host off the network.
    pub fn kill(&self, id: u32) {
        self.update(id, |n| {
            n.running = false;
            n.reachable = false;
        });
    }

    /// Stop the server without a shutdown checkpoint.
    pub fn crash(&self, id: u32) {
        self.update(id, |n| {
            n.running = false;
            n.upstream_conninfo = None;
            n.control_file.state = DbState::InProduction;
            n.control_file.timeline = n.timeline;
        });
    }

    /// Cut the host off (or reconnect it) without stopping its server.
    pub fn set_reachable(&self, id: u32, reachable: bool) {
        self.update(id, |n| n.reachable = reachable);
    }

    pub fn registry(&self) -> &MemoryRegistry {
        &self.state.registry
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.state.clock)
    }

    pub fn control(&self, id: u32) -> Option<ControlState> {
        self.state.lock().controls.get(&NodeId(id)).cloned()
    }

    /// Connections and remote commands between distinct nodes so far.
    pub fn network_actions(&self) -> u64 {
        self.state.network_actions.load(Ordering::SeqCst)
    }

    /// Run a command line on node `id` as an operator would; returns the
    /// exit code and stdout.
    pub fn run(&self, id: u32, args: &[&str]) -> ClusterResult<(i32, String)> {
        let cli = Cli::try_parse_from(std::iter::once("walwarden").chain(args.iter().copied()))
            .map_err(|e| ClusterError::config(e.to_string()))?;
        let ctx = self.context(id)?;
        let mut out = Vec::new();
        let code = execute_and_report(&cli, &ctx, &mut out);
        Ok((code, String::from_utf8_lossy(&out).into_owned()))
    }
}

struct SimConnector {
    state: Arc<SimState>,
    from: NodeId,
}

impl Connector for SimConnector {
    fn connect(&self, target: &str) -> ClusterResult<Box<dyn NodeConnection>> {
        let to = {
            let inner = self.state.lock();
            let to = inner
                .by_conninfo(target)
                .ok_or_else(|| ClusterError::unreachable(target, "could not translate host name"))?;
            self.state.count_network(self.from, to);
            SimState::check_link(&inner, self.from, to)?;
            to
        };
        Ok(Box::new(SimConnection {
            state: Arc::clone(&self.state),
            from: self.from,
            to,
            registry: SimRegistry {
                state: Arc::clone(&self.state),
                node: to,
            },
        }))
    }
}

struct SimConnection {
    state: Arc<SimState>,
    from: NodeId,
    to: NodeId,
    registry: SimRegistry,
}

impl SimConnection {
    /// Run `f` against the live server, failing if the link went away.
    fn session<T>(
        &self,
        f: impl FnOnce(&mut SimInner, NodeId) -> ClusterResult<T>,
    ) -> ClusterResult<T> {
        let mut inner = self.state.lock();
        SimState::check_link(&inner, self.from, self.to)?;
        f(&mut inner, self.to)
    }
}

impl NodeConnection for SimConnection {
    fn recovery_state(&self) -> ClusterResult<RecoveryState> {
        self.session(|inner, id| Ok(inner.node(id)?.recovery))
    }

    fn wal_positions(&self) -> ClusterResult<WalPositions> {
        self.session(|inner, id| {
            let node = inner.node(id)?;
            Ok(match node.recovery {
                RecoveryState::Leader => WalPositions {
                    receive: node.write_lsn,
                    replay: node.write_lsn,
                    lag_seconds: 0,
                    replay_paused: false,
                },
                _ => WalPositions {
                    receive: node.receive_lsn,
                    replay: node.replay_lsn,
                    lag_seconds: node.lag_seconds,
                    replay_paused: node.replay_paused,
                },
            })
        })
    }

    fn replication_capacity(&self) -> ClusterResult<ReplicationCapacity> {
        self.session(|inner, id| {
            let node = inner.node(id)?;
            let attached = inner.attached(id);
            let active_slots = node
                .slots
                .iter()
                .filter(|slot| {
                    attached.iter().any(|s| {
                        s.standby_config
                            .as_ref()
                            .and_then(|c| c.slot_name.as_deref())
                            == Some(slot.as_str())
                    })
                })
                .count();
            Ok(ReplicationCapacity {
                max_wal_senders: node.max_wal_senders,
                used_wal_senders: attached.len() as u32,
                max_replication_slots: node.max_replication_slots,
                used_replication_slots: node.slots.len() as u32,
                active_replication_slots: active_slots as u32,
            })
        })
    }

    fn attached_standbys(&self) -> ClusterResult<Vec<AttachedStandby>> {
        self.session(|inner, id| {
            Ok(inner
                .attached(id)
                .into_iter()
                .map(|n| AttachedStandby {
                    application_name: n.name.clone(),
                    state: "streaming".to_string(),
                })
                .collect())
        })
    }

    fn replication_slots(&self) -> ClusterResult<Vec<SlotInfo>> {
        self.session(|inner, id| {
            let used: BTreeSet<String> = inner
                .attached(id)
                .iter()
                .filter_map(|s| s.standby_config.as_ref().and_then(|c| c.slot_name.clone()))
                .collect();
            Ok(inner
                .node(id)?
                .slots
                .iter()
                .map(|name| SlotInfo {
                    name: name.clone(),
                    active: used.contains(name),
                })
                .collect())
        })
    }

    fn create_replication_slot(&self, name: &str) -> ClusterResult<()> {
        self.session(|inner, id| {
            let node = inner.node_mut(id)?;
            if node.slots.contains(name) {
                return Ok(());
            }
            if node.slots.len() as u32 >= node.max_replication_slots {
                return Err(ClusterError::query("all replication slots are in use"));
            }
            node.slots.insert(name.to_string());
            Ok(())
        })
    }

    fn drop_replication_slot(&self, name: &str) -> ClusterResult<bool> {
        self.session(|inner, id| {
            let active = inner.attached(id).iter().any(|s| {
                s.standby_config.as_ref().and_then(|c| c.slot_name.as_deref()) == Some(name)
            });
            if active {
                return Err(ClusterError::query(format!(
                    "replication slot \"{}\" is active",
                    name
                )));
            }
            Ok(inner.node_mut(id)?.slots.remove(name))
        })
    }

    fn archive_ready_count(&self) -> ClusterResult<u64> {
        self.session(|inner, id| Ok(inner.node(id)?.archive_ready))
    }

    fn exclusive_backup_in_progress(&self) -> ClusterResult<bool> {
        self.session(|inner, id| Ok(inner.node(id)?.exclusive_backup))
    }

    fn data_directory(&self) -> ClusterResult<String> {
        self.session(|inner, id| Ok(inner.node(id)?.data_directory.clone()))
    }

    fn timeline_id(&self) -> ClusterResult<u32> {
        self.session(|inner, id| Ok(inner.node(id)?.timeline))
    }

    fn timeline_switch_lsn(&self, timeline: u32) -> ClusterResult<Option<Lsn>> {
        self.session(|inner, id| Ok(inner.node(id)?.history.get(&timeline).copied()))
    }

    fn checkpoint(&self) -> ClusterResult<()> {
        self.session(|_, _| Ok(()))
    }

    fn promote(&self) -> ClusterResult<()> {
        self.session(|inner, id| inner.node_mut(id)?.promote())
    }

    fn registry(&self) -> &dyn NodeRegistry {
        &self.registry
    }
}

/// The shared registry as seen through one node's database.
struct SimRegistry {
    state: Arc<SimState>,
    node: NodeId,
}

impl SimRegistry {
    fn writable(&self) -> ClusterResult<()> {
        let inner = self.state.lock();
        let node = inner.node(self.node)?;
        if node.running && node.recovery == RecoveryState::Leader {
            Ok(())
        } else {
            Err(ClusterError::ReadOnly(node.name.clone()))
        }
    }
}

impl NodeRegistry for SimRegistry {
    fn node(&self, id: NodeId) -> ClusterResult<Option<NodeRecord>> {
        self.state.registry.node(id)
    }

    fn nodes(&self) -> ClusterResult<Vec<NodeRecord>> {
        self.state.registry.nodes()
    }

    fn register(&self, record: &NodeRecord, replace: bool) -> ClusterResult<()> {
        self.writable()?;
        self.state.registry.register(record, replace)
    }

    fn unregister(&self, id: NodeId) -> ClusterResult<bool> {
        self.writable()?;
        self.state.registry.unregister(id)
    }

    fn update_node(
        &self,
        id: NodeId,
        expected: &NodeCondition,
        change: &NodeChange,
    ) -> ClusterResult<NodeRecord> {
        self.writable()?;
        self.state.registry.update_node(id, expected, change)
    }

    fn transfer_leadership(
        &self,
        candidate: NodeId,
        old_leader: NodeId,
        demotion: Demotion,
    ) -> ClusterResult<NodeRecord> {
        self.writable()?;
        self.state
            .registry
            .transfer_leadership(candidate, old_leader, demotion)
    }

    fn record_event(&self, event: &EventRecord) -> ClusterResult<()> {
        self.writable()?;
        self.state.registry.record_event(event)
    }

    fn events(&self, limit: usize) -> ClusterResult<Vec<EventRecord>> {
        self.state.registry.events(limit)
    }

    fn record_sample(&self, sample: &MonitoringSample) -> ClusterResult<()> {
        self.writable()?;
        self.state.registry.record_sample(sample)
    }
}

/// Local server of one simulated node.
struct SimServer {
    state: Arc<SimState>,
    id: NodeId,
}

impl LocalServer for SimServer {
    fn is_running(&self) -> ClusterResult<bool> {
        Ok(self.state.lock().node(self.id)?.running)
    }

    fn start(&self) -> ClusterResult<()> {
        self.state.lock().start(self.id)
    }

    fn stop(&self) -> ClusterResult<()> {
        self.state.lock().node_mut(self.id)?.stop();
        Ok(())
    }

    fn restart(&self) -> ClusterResult<()> {
        let mut inner = self.state.lock();
        inner.node_mut(self.id)?.stop();
        inner.start(self.id)
    }

    fn promote(&self) -> ClusterResult<()> {
        self.state.lock().node_mut(self.id)?.promote()
    }

    fn control_file(&self) -> ClusterResult<ControlFileInfo> {
        Ok(self.state.lock().node(self.id)?.control_file)
    }

    fn write_standby_config(&self, standby: &StandbyConfig) -> ClusterResult<()> {
        self.state.lock().node_mut(self.id)?.standby_config = Some(standby.clone());
        Ok(())
    }

    fn rewind(&self, source_conninfo: &str) -> ClusterResult<()> {
        let mut inner = self.state.lock();
        let source_id = inner
            .by_conninfo(source_conninfo)
            .ok_or_else(|| ClusterError::unreachable(source_conninfo, "could not translate host name"))?;
        self.state.count_network(self.id, source_id);
        SimState::check_link(&inner, self.id, source_id)?;
        let (timeline, history) = {
            let source = inner.node(source_id)?;
            (source.timeline, source.history.clone())
        };
        let node = inner.node_mut(self.id)?;
        if node.running {
            return Err(ClusterError::config("cannot rewind a running server"));
        }
        let fork = history
            .get(&node.control_file.timeline)
            .copied()
            .unwrap_or(Lsn::INVALID);
        let position = node.current_lsn().min(fork);
        node.write_lsn = position;
        node.receive_lsn = position;
        node.replay_lsn = position;
        node.timeline = timeline;
        node.history = history;
        node.control_file = ControlFileInfo {
            state: DbState::ShutDown,
            checkpoint_lsn: position,
            timeline,
        };
        node.rewinds += 1;
        Ok(())
    }
}

/// Remote Command Channel that runs the CLI in-process on the target node.
struct SimChannel {
    state: Arc<SimState>,
    from: NodeId,
}

impl RemoteChannel for SimChannel {
    fn run(&self, host: &str, _user: Option<&str>, command: &str) -> ClusterResult<String> {
        let target = {
            let inner = self.state.lock();
            let target = inner
                .by_host(host)
                .ok_or_else(|| ClusterError::remote(host, "could not resolve hostname"))?;
            self.state.count_network(self.from, target);
            let reachable = inner.node(target)?.reachable && inner.node(self.from)?.reachable;
            if self.from != target && !reachable {
                return Err(ClusterError::remote(host, "connect to host: No route to host"));
            }
            target
        };
        // A command line the CLI rejects prints nothing on stdout.
        let Ok(cli) = Cli::try_parse_from(split_command_line(command)?) else {
            return Ok(String::new());
        };
        let ctx = self.state.context(target)?;
        let mut out = Vec::new();
        execute_and_report(&cli, &ctx, &mut out);
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standby_receives_at_configured_rate() {
        let cluster = SimCluster::with_standbys(1).unwrap();
        cluster.update(1, |n| n.write_lsn = Lsn::new(1000));
        cluster.update(2, |n| {
            n.receive_lsn = Lsn::new(900);
            n.receive_rate = Some(40);
        });
        cluster.clock().advance(Duration::from_secs(2));
        assert_eq!(cluster.node(2).unwrap().receive_lsn, Lsn::new(980));
        cluster.clock().advance(Duration::from_secs(2));
        assert_eq!(cluster.node(2).unwrap().receive_lsn, Lsn::new(1000));
    }

    #[test]
    fn test_registry_rejects_writes_on_standby() {
        let cluster = SimCluster::with_standbys(1).unwrap();
        let ctx = cluster.context(2).unwrap();
        let conn = ctx.connect_local().unwrap();
        let own = conn.registry().node(NodeId(2)).unwrap().unwrap();
        let err = conn
            .registry()
            .update_node(own.id, &own.condition(), &NodeChange::deactivate())
            .unwrap_err();
        assert!(matches!(err, ClusterError::ReadOnly(_)));
    }

    #[test]
    fn test_remote_status_round_trip() {
        let cluster = SimCluster::with_standbys(1).unwrap();
        let ctx = cluster.context(1).unwrap();
        let standby = cluster.registry().node(NodeId(2)).unwrap().unwrap();
        let reply = ctx
            .remote(&standby, &crate::remote::RemoteAction::Status)
            .unwrap();
        assert_eq!(reply.get("node-id"), Some("2"));
        assert_eq!(reply.get("recovery-state"), Some("standby"));
        assert_eq!(cluster.network_actions(), 1);
    }

    #[test]
    fn test_killed_node_is_unreachable() {
        let cluster = SimCluster::with_standbys(1).unwrap();
        cluster.kill(1);
        let ctx = cluster.context(2).unwrap();
        let leader = cluster.registry().node(NodeId(1)).unwrap().unwrap();
        assert!(ctx.connect(&leader).err().unwrap().is_transient());
        // The standby's own server is still up.
        assert!(ctx.connect_local().is_ok());
    }
}
