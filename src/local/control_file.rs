//! Control-file state of a stopped server

use std::fmt;

use regex::Regex;

use crate::error::{ClusterError, ClusterResult};
use crate::lsn::Lsn;

/// `Database cluster state` as recorded in the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Starting,
    ShutDown,
    ShutDownInRecovery,
    ShuttingDown,
    InCrashRecovery,
    InArchiveRecovery,
    InProduction,
    Unknown,
}

impl DbState {
    /// Parse the human-readable state printed by `pg_controldata`.
    pub fn from_controldata(text: &str) -> DbState {
        match text.trim() {
            "starting up" => DbState::Starting,
            "shut down" => DbState::ShutDown,
            "shut down in recovery" => DbState::ShutDownInRecovery,
            "shutting down" => DbState::ShuttingDown,
            "in crash recovery" => DbState::InCrashRecovery,
            "in archive recovery" => DbState::InArchiveRecovery,
            "in production" => DbState::InProduction,
            _ => DbState::Unknown,
        }
    }

    /// Whether the last shutdown wrote a shutdown checkpoint.
    pub fn is_clean_shutdown(&self) -> bool {
        matches!(self, DbState::ShutDown | DbState::ShutDownInRecovery)
    }
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DbState::Starting => "starting up",
            DbState::ShutDown => "shut down",
            DbState::ShutDownInRecovery => "shut down in recovery",
            DbState::ShuttingDown => "shutting down",
            DbState::InCrashRecovery => "in crash recovery",
            DbState::InArchiveRecovery => "in archive recovery",
            DbState::InProduction => "in production",
            DbState::Unknown => "unknown",
        };
        write!(f, "{}", text)
    }
}

/// Fields of the control file the orchestration needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFileInfo {
    pub state: DbState,
    pub checkpoint_lsn: Lsn,
    pub timeline: u32,
}

impl ControlFileInfo {
    /// Parse `pg_controldata` output (run with `LC_ALL=C`).
    pub fn parse(output: &str) -> ClusterResult<Self> {
        let state_re = Regex::new(r"(?m)^Database cluster state:\s+(.+)$")
            .map_err(|e| ClusterError::fatal(e.to_string()))?;
        let checkpoint_re =
            Regex::new(r"(?m)^Latest checkpoint location:\s+([0-9A-Fa-f]+/[0-9A-Fa-f]+)")
                .map_err(|e| ClusterError::fatal(e.to_string()))?;
        let timeline_re = Regex::new(r"(?m)^Latest checkpoint's TimeLineID:\s+(\d+)")
            .map_err(|e| ClusterError::fatal(e.to_string()))?;

        let state = state_re
            .captures(output)
            .map(|c| DbState::from_controldata(&c[1]))
            .ok_or_else(|| {
                ClusterError::Protocol("control data lacks \"Database cluster state\"".to_string())
            })?;
        let checkpoint_lsn = match checkpoint_re.captures(output) {
            Some(c) => c[1].parse()?,
            None => Lsn::INVALID,
        };
        let timeline = match timeline_re.captures(output) {
            Some(c) => c[1]
                .parse()
                .map_err(|_| ClusterError::Protocol(format!("invalid timeline \"{}\"", &c[1])))?,
            None => 0,
        };

        Ok(Self {
            state,
            checkpoint_lsn,
            timeline,
        })
    }
}
