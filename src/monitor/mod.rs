//! Replication Monitor
//!
//! Periodically polls this node's upstream, records samples, and hands a
//! confirmed leader loss to the voting engine.
//!
//! - A poll failure counts only after the reconnect budget is spent
//! - A paused monitor keeps probing but never acts on a loss
//! - Signals are honoured at tick boundaries, never mid-poll

mod connection;
mod daemon;
mod signals;
mod status;

pub use connection::{
    AttachedStandby, Connector, NodeConnection, ReplicationCapacity, SlotInfo, WalPositions,
};
pub use daemon::{ReplicationMonitor, TickOutcome};
pub use signals::ShutdownFlags;
pub use status::{RecoveryState, ReplicationStatus};
