//! Node records
//!
//! One record per cluster member. Records are created by registration on
//! the current leader and changed only through conditional updates, so a
//! caller always states what it believes the record looks like before it
//! is allowed to change it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Stable node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(NodeId)
            .map_err(|_| ClusterError::Protocol(format!("invalid node id \"{}\"", s)))
    }
}

/// Registered role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Accepts writes; source of WAL.
    Leader,
    /// Replays WAL from an upstream.
    Standby,
    /// Votes on visibility; never serves data, never promoted.
    Witness,
}

impl NodeRole {
    /// Lower-case name as stored in the registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Leader => "leader",
            NodeRole::Standby => "standby",
            NodeRole::Witness => "witness",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" | "primary" => Ok(NodeRole::Leader),
            "standby" => Ok(NodeRole::Standby),
            "witness" => Ok(NodeRole::Witness),
            other => Err(ClusterError::Protocol(format!("unknown node role \"{}\"", other))),
        }
    }
}

/// A cluster member as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub role: NodeRole,
    /// Node this one replicates from; `None` for the leader.
    pub upstream_id: Option<NodeId>,
    /// Database connection target.
    pub connection_target: String,
    /// Host used for remote commands.
    pub ssh_target: String,
    /// Slot this node occupies on its upstream; empty when unused.
    pub slot_name: String,
    /// Higher wins when WAL positions tie.
    pub priority: u32,
    pub active: bool,
}

impl NodeRecord {
    /// Whether this node may ever be promoted.
    pub fn is_promotable(&self) -> bool {
        self.active && self.role == NodeRole::Standby && self.priority > 0
    }

    /// Whether this node holds a replication slot on its upstream.
    pub fn uses_slot(&self) -> bool {
        !self.slot_name.is_empty()
    }

    /// Current values of the fields a conditional update can check.
    pub fn condition(&self) -> NodeCondition {
        NodeCondition {
            role: self.role,
            upstream_id: self.upstream_id,
            active: self.active,
        }
    }
}

/// Expected state of a record, confirmed as part of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCondition {
    pub role: NodeRole,
    pub upstream_id: Option<NodeId>,
    pub active: bool,
}

impl NodeCondition {
    /// Whether `record` currently satisfies this condition.
    pub fn matches(&self, record: &NodeRecord) -> bool {
        record.role == self.role
            && record.upstream_id == self.upstream_id
            && record.active == self.active
    }
}

/// Field changes applied by a conditional update. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeChange {
    pub role: Option<NodeRole>,
    pub upstream_id: Option<Option<NodeId>>,
    pub slot_name: Option<String>,
    pub active: Option<bool>,
}

impl NodeChange {
    /// Re-parent under `upstream` as a standby.
    pub fn follow(upstream: NodeId) -> Self {
        Self {
            role: Some(NodeRole::Standby),
            upstream_id: Some(Some(upstream)),
            active: Some(true),
            ..Self::default()
        }
    }

    /// Mark the node failed (inactive).
    pub fn deactivate() -> Self {
        Self {
            active: Some(false),
            ..Self::default()
        }
    }

    /// Apply the change to `record` in place.
    pub fn apply(&self, record: &mut NodeRecord) {
        if let Some(role) = self.role {
            record.role = role;
        }
        if let Some(upstream) = self.upstream_id {
            record.upstream_id = upstream;
        }
        if let Some(slot) = &self.slot_name {
            record.slot_name = slot.clone();
        }
        if let Some(active) = self.active {
            record.active = active;
        }
    }
}

/// What happens to the old leader's record when leadership moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demotion {
    /// Unplanned failover: the old leader is marked inactive.
    Failed,
    /// Switchover: the old leader becomes a standby of the new leader.
    Standby,
}

/// Default slot name for a node.
pub fn default_slot_name(id: NodeId) -> String {
    format!("walwarden_slot_{}", id.0)
}

#[cfg(test)]
pub(crate) fn test_record(id: u32, role: NodeRole, upstream: Option<u32>) -> NodeRecord {
    NodeRecord {
        id: NodeId(id),
        name: format!("node{}", id),
        role,
        upstream_id: upstream.map(NodeId),
        connection_target: format!("host=node{} dbname=walwarden", id),
        ssh_target: format!("node{}", id),
        slot_name: String::new(),
        priority: 100,
        active: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_accepts_primary_alias() {
        assert_eq!("primary".parse::<NodeRole>().unwrap(), NodeRole::Leader);
        assert_eq!("witness".parse::<NodeRole>().unwrap(), NodeRole::Witness);
        assert!("cascade".parse::<NodeRole>().is_err());
    }

    #[test]
    fn test_witness_and_zero_priority_not_promotable() {
        let mut witness = test_record(3, NodeRole::Witness, Some(1));
        assert!(!witness.is_promotable());
        witness.role = NodeRole::Standby;
        assert!(witness.is_promotable());
        witness.priority = 0;
        assert!(!witness.is_promotable());
    }

    #[test]
    fn test_change_apply() {
        let mut record = test_record(2, NodeRole::Standby, Some(1));
        NodeChange::follow(NodeId(3)).apply(&mut record);
        assert_eq!(record.upstream_id, Some(NodeId(3)));
        assert_eq!(record.role, NodeRole::Standby);

        let before = record.condition();
        NodeChange::deactivate().apply(&mut record);
        assert!(!before.matches(&record));
    }
}
