//! CLI module for walwarden
//!
//! Provides the command-line interface for:
//! - status / check: one-shot inspection, also answered for remote callers
//! - promote / switchover / rejoin / follow: topology changes
//! - service: local server start/stop/restart
//! - register / unregister / cluster: registry maintenance and views
//! - daemon: the replication monitor and its control state

mod args;
mod commands;

pub use args::{
    Cli, ClusterAction, Command, DaemonAction, ServiceAction, SwitchoverArgs, DEFAULT_CONFIG_PATH,
};
pub use commands::{execute, execute_and_report, run, CommandOutcome};
