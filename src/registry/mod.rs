//! Node Registry
//!
//! Authoritative list of cluster members, their roles and replication
//! relationships, plus the shared event log and monitoring history.
//!
//! - Read-mostly: callers re-fetch before any topology-dependent decision
//! - Every mutation is conditional on the caller's view of the record
//! - Two racing promotions never both succeed

mod events;
mod node;
mod store;

pub use events::{EventKind, EventRecord, MonitoringSample};
pub use node::{
    default_slot_name, Demotion, NodeChange, NodeCondition, NodeId, NodeRecord, NodeRole,
};
pub use store::{MemoryRegistry, NodeRegistry};

#[cfg(test)]
pub(crate) use node::test_record;
