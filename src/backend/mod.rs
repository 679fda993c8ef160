//! Production database backend
//!
//! Implements [`Connector`](crate::monitor::Connector),
//! [`NodeConnection`](crate::monitor::NodeConnection) and
//! [`NodeRegistry`](crate::registry::NodeRegistry) on PostgreSQL. The
//! registry lives in the `walwarden` schema on the leader and reaches the
//! standbys through replication; writes against a standby fail with
//! [`ClusterError::ReadOnly`](crate::error::ClusterError::ReadOnly).

mod postgres;
mod schema;

pub use postgres::{PgConnection, PgConnector};
pub use schema::SCHEMA_SQL;
