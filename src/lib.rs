//! walwarden - failover control plane for replicated PostgreSQL clusters
//!
//! Each node runs the same binary. A replication monitor watches the node's
//! upstream; when the leader disappears the standbys hold a term-scoped
//! election and the best-placed one is promoted. Planned switchovers,
//! manual promotion and rejoining a stopped node are operator commands.
//! Nodes talk to each other through the `--key=value` replies of this same
//! binary, executed over SSH.

pub mod backend;
pub mod checks;
pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod local;
pub mod lsn;
pub mod monitor;
pub mod observability;
pub mod output;
pub mod registry;
pub mod remote;
pub mod sim;
pub mod switchover;
pub mod voting;
