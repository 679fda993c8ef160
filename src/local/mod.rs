//! Local server seam
//!
//! Service actions on this node's own database server and the control-file
//! reader for a stopped server. Only `rejoin`, `follow`, `service`,
//! `promote` and `status --is-shutdown-cleanly` touch it; none of these need
//! the network to answer.

mod control_file;
mod pgctl;

pub use control_file::{ControlFileInfo, DbState};
pub use pgctl::PgCtlServer;

use crate::error::ClusterResult;
use crate::lsn::Lsn;
use crate::remote::{ShutdownReply, ShutdownState};

/// Replication settings written before a node starts as a standby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandbyConfig {
    pub upstream_conninfo: String,
    pub slot_name: Option<String>,
    /// Name the standby reports to its upstream (the node name).
    pub application_name: String,
}

/// The database server running on this host.
pub trait LocalServer: Send + Sync {
    fn is_running(&self) -> ClusterResult<bool>;
    fn start(&self) -> ClusterResult<()>;
    fn stop(&self) -> ClusterResult<()>;
    fn restart(&self) -> ClusterResult<()>;
    /// Promote through the configured promote command.
    fn promote(&self) -> ClusterResult<()>;
    /// Read the control file. Meaningful only while stopped.
    fn control_file(&self) -> ClusterResult<ControlFileInfo>;
    fn write_standby_config(&self, standby: &StandbyConfig) -> ClusterResult<()>;
    /// Resynchronise a diverged data directory from `source_conninfo`.
    fn rewind(&self, source_conninfo: &str) -> ClusterResult<()>;
}

/// Shutdown state as reported by `status --is-shutdown-cleanly`.
///
/// A running server reports no checkpoint; an unreadable control file is
/// `Unknown` rather than an error.
pub fn shutdown_state(server: &dyn LocalServer) -> ShutdownReply {
    let running = match server.is_running() {
        Ok(running) => running,
        Err(_) => {
            return ShutdownReply {
                state: ShutdownState::Unknown,
                last_checkpoint_lsn: Lsn::INVALID,
            }
        }
    };
    if running {
        return ShutdownReply {
            state: ShutdownState::Running,
            last_checkpoint_lsn: Lsn::INVALID,
        };
    }
    match server.control_file() {
        Ok(info) if info.state.is_clean_shutdown() => ShutdownReply {
            state: ShutdownState::Shutdown,
            last_checkpoint_lsn: info.checkpoint_lsn,
        },
        Ok(info) => ShutdownReply {
            state: ShutdownState::UncleanShutdown,
            last_checkpoint_lsn: info.checkpoint_lsn,
        },
        Err(_) => ShutdownReply {
            state: ShutdownState::Unknown,
            last_checkpoint_lsn: Lsn::INVALID,
        },
    }
}
