//! Per-node execution context
//!
//! Every component receives the node's collaborators through a
//! [`NodeContext`] instead of reaching for process-wide state.

use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::PgConnector;
use crate::clock::{Clock, RetryPolicy, SystemClock};
use crate::config::Config;
use crate::control::{ControlState, FileControlStore};
use crate::error::{ClusterError, ClusterResult};
use crate::local::{LocalServer, PgCtlServer};
use crate::monitor::{Connector, NodeConnection};
use crate::observability::Logger;
use crate::registry::{EventKind, EventRecord, NodeId, NodeRecord, NodeRegistry};
use crate::remote::{OptReply, RemoteAction, RemoteChannel, RemoteInvocation, SshChannel};

/// Everything one node's commands need.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Config,
    /// Path the configuration was loaded from, passed to remote invocations
    /// unless `remote_config_file` overrides it.
    pub config_path: Option<PathBuf>,
    pub connector: Arc<dyn Connector>,
    pub remote: Arc<dyn RemoteChannel>,
    pub local: Arc<dyn LocalServer>,
    pub control: ControlState,
    pub clock: Arc<dyn Clock>,
}

impl NodeContext {
    /// Context backed by PostgreSQL, SSH, `pg_ctl` and the state file.
    pub fn production(config: Config, config_path: Option<PathBuf>) -> ClusterResult<Self> {
        let connector = PgConnector::new()?;
        let store = FileControlStore::new(config.state_directory());
        Ok(Self {
            connector: Arc::new(connector),
            remote: Arc::new(SshChannel::new(&config.ssh_options)),
            local: Arc::new(PgCtlServer::new(config.clone())),
            control: ControlState::new(Arc::new(store)),
            clock: Arc::new(SystemClock),
            config,
            config_path,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Open a connection to this node's own database.
    pub fn connect_local(&self) -> ClusterResult<Box<dyn NodeConnection>> {
        self.connector.connect(&self.config.conninfo)
    }

    pub fn connect(&self, node: &NodeRecord) -> ClusterResult<Box<dyn NodeConnection>> {
        self.connector.connect(&node.connection_target)
    }

    /// Connect with the configured reconnect budget.
    pub fn connect_with_retry(&self, target: &str) -> ClusterResult<Box<dyn NodeConnection>> {
        self.retry_policy()
            .run(self.clock.as_ref(), |_| self.connector.connect(target))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.reconnect_attempts,
            interval: self.config.reconnect_interval(),
        }
    }

    pub fn invocation(&self) -> RemoteInvocation {
        let mut invocation = RemoteInvocation::from_config(&self.config);
        if invocation.config_file.is_none() {
            invocation.config_file = self
                .config_path
                .as_ref()
                .map(|p| p.display().to_string());
        }
        invocation
    }

    /// Run `action` on `node`'s host.
    pub fn remote(&self, node: &NodeRecord, action: &RemoteAction) -> ClusterResult<OptReply> {
        self.invocation().execute(self.remote.as_ref(), node, action)
    }

    /// This node's record in `registry`.
    pub fn own_record(&self, registry: &dyn NodeRegistry) -> ClusterResult<NodeRecord> {
        registry.node(self.node_id())?.ok_or_else(|| {
            ClusterError::config(format!(
                "node {} is not registered; run \"register\" first",
                self.node_id()
            ))
        })
    }

    /// Append an event record; a failed write is logged, not returned.
    ///
    /// An event `registry` rejects (a standby, or no leader at all) is kept
    /// in the control state and written before the next event that does
    /// reach a writable registry, or by the monitor once a leader answers.
    pub fn record_event(
        &self,
        registry: &dyn NodeRegistry,
        kind: EventKind,
        success: bool,
        details: &str,
    ) {
        if let Err(e) = self.flush_deferred_events(registry) {
            Logger::debug("DEFERRED_EVENTS_PENDING", &[("detail", &e.to_string())]);
        }
        let event = EventRecord::new(self.node_id(), kind, success, details);
        let Err(e) = registry.record_event(&event) else {
            return;
        };
        Logger::warning(
            "EVENT_WRITE_DEFERRED",
            &[("event", kind.as_str()), ("detail", &e.to_string())],
        );
        if let Err(e) = self.control.defer_event(event) {
            Logger::warning(
                "EVENT_WRITE_FAILED",
                &[("event", kind.as_str()), ("detail", &e.to_string())],
            );
        }
    }

    /// Write deferred events to `registry`, oldest first; returns how many
    /// were written. Stops at the first rejected write.
    pub fn flush_deferred_events(&self, registry: &dyn NodeRegistry) -> ClusterResult<usize> {
        let pending = self.control.deferred_events()?;
        let mut written = Vec::with_capacity(pending.len());
        let mut rejected = None;
        for event in &pending {
            if let Err(e) = registry.record_event(event) {
                rejected = Some(e);
                break;
            }
            written.push(event.id);
        }
        if !written.is_empty() {
            self.control.discard_deferred(&written)?;
        }
        match rejected {
            Some(e) => Err(e),
            None => Ok(written.len()),
        }
    }
}
