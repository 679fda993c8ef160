//! Database connection seam
//!
//! Everything the engine asks of a node's database goes through
//! [`NodeConnection`]; [`Connector`] opens one connection per poll. The
//! production implementation lives in `backend::postgres`, the simulated
//! one in `sim`.

use crate::error::ClusterResult;
use crate::lsn::Lsn;
use crate::registry::NodeRegistry;

use super::status::RecoveryState;

/// WAL positions reported by a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalPositions {
    /// Leader: current write position. Standby: last received position.
    pub receive: Lsn,
    /// Standby: last replayed position. Leader: same as `receive`.
    pub replay: Lsn,
    /// Seconds since the last replayed transaction (zero on a leader).
    pub lag_seconds: u64,
    /// Whether WAL replay is paused.
    pub replay_paused: bool,
}

/// Replication capacity of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationCapacity {
    pub max_wal_senders: u32,
    pub used_wal_senders: u32,
    pub max_replication_slots: u32,
    pub used_replication_slots: u32,
    pub active_replication_slots: u32,
}

impl ReplicationCapacity {
    /// WAL sender processes still available.
    pub fn free_wal_senders(&self) -> u32 {
        self.max_wal_senders.saturating_sub(self.used_wal_senders)
    }

    /// Replication slots still available.
    pub fn free_replication_slots(&self) -> u32 {
        self.max_replication_slots
            .saturating_sub(self.used_replication_slots)
    }
}

/// A standby currently streaming from this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedStandby {
    /// Application name the standby connected with (its node name).
    pub application_name: String,
    /// Walsender state, e.g. `streaming` or `catchup`.
    pub state: String,
}

impl AttachedStandby {
    /// Whether the standby is fully attached.
    pub fn is_streaming(&self) -> bool {
        self.state == "streaming"
    }
}

/// A physical replication slot on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub name: String,
    pub active: bool,
}

/// Live connection to one node's database.
pub trait NodeConnection: Send {
    /// Whether the server is in recovery.
    fn recovery_state(&self) -> ClusterResult<RecoveryState>;

    /// Current WAL positions and lag.
    fn wal_positions(&self) -> ClusterResult<WalPositions>;

    /// WAL sender and slot usage.
    fn replication_capacity(&self) -> ClusterResult<ReplicationCapacity>;

    /// Standbys currently attached to this node.
    fn attached_standbys(&self) -> ClusterResult<Vec<AttachedStandby>>;

    /// Physical replication slots on this node.
    fn replication_slots(&self) -> ClusterResult<Vec<SlotInfo>>;

    /// Create a physical slot if it does not exist.
    fn create_replication_slot(&self, name: &str) -> ClusterResult<()>;

    /// Drop a slot; returns whether it existed.
    fn drop_replication_slot(&self, name: &str) -> ClusterResult<bool>;

    /// Number of WAL segments waiting to be archived.
    fn archive_ready_count(&self) -> ClusterResult<u64>;

    /// Whether an exclusive backup is running.
    fn exclusive_backup_in_progress(&self) -> ClusterResult<bool>;

    /// Data directory of the running instance.
    fn data_directory(&self) -> ClusterResult<String>;

    /// Current timeline id.
    fn timeline_id(&self) -> ClusterResult<u32>;

    /// LSN at which this node's history left `timeline`, if it did.
    fn timeline_switch_lsn(&self, timeline: u32) -> ClusterResult<Option<Lsn>>;

    /// Issue a checkpoint (requires a privileged connection).
    fn checkpoint(&self) -> ClusterResult<()>;

    /// Ask the server to leave recovery.
    fn promote(&self) -> ClusterResult<()>;

    /// Registry as seen through this connection.
    fn registry(&self) -> &dyn NodeRegistry;

    /// Whether a standby named `application_name` is streaming from here.
    fn is_attached(&self, application_name: &str) -> ClusterResult<bool> {
        Ok(self
            .attached_standbys()?
            .iter()
            .any(|s| s.application_name == application_name && s.is_streaming()))
    }
}

/// Opens connections to nodes.
pub trait Connector: Send + Sync {
    /// Connect to `target` (a node's connection target string).
    fn connect(&self, target: &str) -> ClusterResult<Box<dyn NodeConnection>>;
}
