//! Event log and monitoring history records
//!
//! Every state-changing operation appends one event record to the shared
//! registry so that operators (and other nodes) can audit what happened.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeId;
use crate::lsn::Lsn;

/// Kinds of audited operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LeaderRegister,
    StandbyRegister,
    WitnessRegister,
    NodeUnregister,
    StandbyPromote,
    StandbyFollow,
    StandbySwitchover,
    NodeRejoin,
    FailoverPromote,
    FailoverFollow,
    FailoverAborted,
    FailoverManual,
    NodeFailed,
    MonitorPause,
    MonitorUnpause,
}

impl EventKind {
    /// Stable name stored in the event log.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LeaderRegister => "leader_register",
            EventKind::StandbyRegister => "standby_register",
            EventKind::WitnessRegister => "witness_register",
            EventKind::NodeUnregister => "node_unregister",
            EventKind::StandbyPromote => "standby_promote",
            EventKind::StandbyFollow => "standby_follow",
            EventKind::StandbySwitchover => "standby_switchover",
            EventKind::NodeRejoin => "node_rejoin",
            EventKind::FailoverPromote => "failover_promote",
            EventKind::FailoverFollow => "failover_follow",
            EventKind::FailoverAborted => "failover_aborted",
            EventKind::FailoverManual => "failover_manual",
            EventKind::NodeFailed => "node_failed",
            EventKind::MonitorPause => "monitor_pause",
            EventKind::MonitorUnpause => "monitor_unpause",
        }
    }

    /// Inverse of [`EventKind::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [EventKind; 15] = [
            EventKind::LeaderRegister,
            EventKind::StandbyRegister,
            EventKind::WitnessRegister,
            EventKind::NodeUnregister,
            EventKind::StandbyPromote,
            EventKind::StandbyFollow,
            EventKind::StandbySwitchover,
            EventKind::NodeRejoin,
            EventKind::FailoverPromote,
            EventKind::FailoverFollow,
            EventKind::FailoverAborted,
            EventKind::FailoverManual,
            EventKind::NodeFailed,
            EventKind::MonitorPause,
            EventKind::MonitorUnpause,
        ];
        ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub node_id: NodeId,
    pub kind: EventKind,
    pub success: bool,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// New event stamped with the current time.
    pub fn new(node_id: NodeId, kind: EventKind, success: bool, details: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            kind,
            success,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One replication monitoring sample (history collection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSample {
    pub node_id: NodeId,
    pub upstream_id: NodeId,
    pub sampled_at: DateTime<Utc>,
    pub upstream_lsn: Lsn,
    pub receive_lsn: Lsn,
    pub replay_lsn: Lsn,
    pub lag_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_names_round_trip() {
        for kind in [
            EventKind::StandbySwitchover,
            EventKind::NodeRejoin,
            EventKind::FailoverPromote,
            EventKind::MonitorUnpause,
        ] {
            assert_eq!(EventKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_name("bogus"), None);
    }
}
