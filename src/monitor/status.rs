//! Replication status snapshot
//!
//! Produced fresh on every monitor tick and never persisted beyond the
//! decision it feeds.

use std::fmt;
use std::str::FromStr;

use crate::error::{ClusterError, ClusterResult};
use crate::lsn::Lsn;

use super::connection::NodeConnection;

/// Observed recovery state of a running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Not in recovery: accepting writes.
    Leader,
    /// In recovery: replaying WAL.
    Standby,
    /// Could not be determined.
    Unknown,
}

impl RecoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryState::Leader => "leader",
            RecoveryState::Standby => "standby",
            RecoveryState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecoveryState {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" => Ok(RecoveryState::Leader),
            "standby" => Ok(RecoveryState::Standby),
            "unknown" => Ok(RecoveryState::Unknown),
            other => Err(ClusterError::Protocol(format!(
                "unknown recovery state \"{}\"",
                other
            ))),
        }
    }
}

/// One node's replication status for the current poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub wal_receive_position: Lsn,
    pub wal_replay_position: Lsn,
    pub lag_seconds: u64,
    pub is_reachable: bool,
    pub recovery_state: RecoveryState,
    pub active_slot_count: u32,
    pub free_slot_count: u32,
    pub free_sender_count: u32,
}

impl ReplicationStatus {
    /// Status of a node that could not be reached.
    pub fn unreachable() -> Self {
        Self {
            wal_receive_position: Lsn::INVALID,
            wal_replay_position: Lsn::INVALID,
            lag_seconds: 0,
            is_reachable: false,
            recovery_state: RecoveryState::Unknown,
            active_slot_count: 0,
            free_slot_count: 0,
            free_sender_count: 0,
        }
    }

    /// Collect a status snapshot over an open connection.
    ///
    /// A standby reporting a replay position ahead of its receive position
    /// (possible right after restart, before the receiver reconnects) has its
    /// receive position raised to the replay position.
    pub fn collect(conn: &dyn NodeConnection) -> ClusterResult<Self> {
        let recovery_state = conn.recovery_state()?;
        let wal = conn.wal_positions()?;
        let capacity = conn.replication_capacity()?;

        let (receive, replay) = match recovery_state {
            RecoveryState::Leader => (wal.receive, wal.receive),
            _ => (wal.receive.max(wal.replay), wal.replay),
        };

        Ok(Self {
            wal_receive_position: receive,
            wal_replay_position: replay,
            lag_seconds: wal.lag_seconds,
            is_reachable: true,
            recovery_state,
            active_slot_count: capacity.active_replication_slots,
            free_slot_count: capacity.free_replication_slots(),
            free_sender_count: capacity.free_wal_senders(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_state_round_trip() {
        for state in [RecoveryState::Leader, RecoveryState::Standby, RecoveryState::Unknown] {
            assert_eq!(state.as_str().parse::<RecoveryState>().unwrap(), state);
        }
        assert!("primary-ish".parse::<RecoveryState>().is_err());
    }

    #[test]
    fn test_unreachable_status() {
        let status = ReplicationStatus::unreachable();
        assert!(!status.is_reachable);
        assert!(!status.wal_receive_position.is_valid());
    }
}
