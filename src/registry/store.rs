//! Registry storage
//!
//! The registry is the only resource several nodes may write concurrently.
//! Every mutation is a single conditional operation: the caller's view of
//! the record is confirmed as part of the write, and a mismatch surfaces as
//! [`ClusterError::Conflict`] instead of being retried.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::events::{EventRecord, MonitoringSample};
use super::node::{Demotion, NodeChange, NodeCondition, NodeId, NodeRecord, NodeRole};
use crate::error::{ClusterError, ClusterResult};

/// Access to the shared node catalog.
pub trait NodeRegistry {
    /// Fetch one record.
    fn node(&self, id: NodeId) -> ClusterResult<Option<NodeRecord>>;

    /// All records ordered by id.
    fn nodes(&self) -> ClusterResult<Vec<NodeRecord>>;

    /// Insert a record. An existing id is a conflict unless `replace` is set.
    fn register(&self, record: &NodeRecord, replace: bool) -> ClusterResult<()>;

    /// Remove a record; returns whether it existed.
    fn unregister(&self, id: NodeId) -> ClusterResult<bool>;

    /// Apply `change` to `id` only if it still matches `expected`.
    fn update_node(
        &self,
        id: NodeId,
        expected: &NodeCondition,
        change: &NodeChange,
    ) -> ClusterResult<NodeRecord>;

    /// Move leadership from `old_leader` to `candidate` in one step.
    ///
    /// Succeeds only while `old_leader` is the active leader and `candidate`
    /// an active standby; afterwards `candidate` is leader with no upstream
    /// and `old_leader` is handled per `demotion`.
    fn transfer_leadership(
        &self,
        candidate: NodeId,
        old_leader: NodeId,
        demotion: Demotion,
    ) -> ClusterResult<NodeRecord>;

    /// Append to the event log.
    fn record_event(&self, event: &EventRecord) -> ClusterResult<()>;

    /// Most recent events, newest first.
    fn events(&self, limit: usize) -> ClusterResult<Vec<EventRecord>>;

    /// Append a monitoring history sample.
    fn record_sample(&self, sample: &MonitoringSample) -> ClusterResult<()>;

    /// The active leader record, if exactly one exists.
    fn leader(&self) -> ClusterResult<Option<NodeRecord>> {
        let leaders: Vec<NodeRecord> = self
            .nodes()?
            .into_iter()
            .filter(|n| n.active && n.role == NodeRole::Leader)
            .collect();
        match leaders.len() {
            0 => Ok(None),
            1 => Ok(leaders.into_iter().next()),
            n => Err(ClusterError::fatal(format!(
                "registry lists {} active leaders",
                n
            ))),
        }
    }

    /// Active records only.
    fn active_nodes(&self) -> ClusterResult<Vec<NodeRecord>> {
        Ok(self.nodes()?.into_iter().filter(|n| n.active).collect())
    }
}

/// Validate and apply a leadership transfer to an in-memory node map.
fn apply_transfer(
    nodes: &mut BTreeMap<NodeId, NodeRecord>,
    candidate: NodeId,
    old_leader: NodeId,
    demotion: Demotion,
) -> ClusterResult<NodeRecord> {
    if candidate == old_leader {
        return Err(ClusterError::config("candidate and old leader are the same node"));
    }
    let old = nodes
        .get(&old_leader)
        .ok_or_else(|| ClusterError::config(format!("node {} is not registered", old_leader)))?;
    if !(old.active && old.role == NodeRole::Leader) {
        return Err(ClusterError::conflict(format!(
            "node {} is no longer the active leader",
            old_leader
        )));
    }
    let cand = nodes
        .get(&candidate)
        .ok_or_else(|| ClusterError::config(format!("node {} is not registered", candidate)))?;
    if !(cand.active && cand.role == NodeRole::Standby) {
        return Err(ClusterError::conflict(format!(
            "node {} is no longer an active standby",
            candidate
        )));
    }

    if let Some(old) = nodes.get_mut(&old_leader) {
        match demotion {
            Demotion::Failed => old.active = false,
            Demotion::Standby => {
                old.role = NodeRole::Standby;
                old.upstream_id = Some(candidate);
            }
        }
    }
    let cand = nodes
        .get_mut(&candidate)
        .ok_or_else(|| ClusterError::fatal("candidate vanished during transfer"))?;
    cand.role = NodeRole::Leader;
    cand.upstream_id = None;
    Ok(cand.clone())
}

#[derive(Debug, Default)]
struct MemoryInner {
    nodes: BTreeMap<NodeId, NodeRecord>,
    events: Vec<EventRecord>,
    samples: Vec<MonitoringSample>,
}

/// In-memory registry used by tests and the cluster simulation.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    inner: Mutex<MemoryInner>,
}

impl MemoryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `records`.
    pub fn with_nodes(records: impl IntoIterator<Item = NodeRecord>) -> Self {
        let registry = Self::new();
        {
            let mut inner = registry.lock();
            for record in records {
                inner.nodes.insert(record.id, record);
            }
        }
        registry
    }

    /// Number of stored monitoring samples.
    pub fn sample_count(&self) -> usize {
        self.lock().samples.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NodeRegistry for MemoryRegistry {
    fn node(&self, id: NodeId) -> ClusterResult<Option<NodeRecord>> {
        Ok(self.lock().nodes.get(&id).cloned())
    }

    fn nodes(&self) -> ClusterResult<Vec<NodeRecord>> {
        Ok(self.lock().nodes.values().cloned().collect())
    }

    fn register(&self, record: &NodeRecord, replace: bool) -> ClusterResult<()> {
        let mut inner = self.lock();
        if inner.nodes.contains_key(&record.id) && !replace {
            return Err(ClusterError::conflict(format!(
                "node {} is already registered",
                record.id
            )));
        }
        inner.nodes.insert(record.id, record.clone());
        Ok(())
    }

    fn unregister(&self, id: NodeId) -> ClusterResult<bool> {
        Ok(self.lock().nodes.remove(&id).is_some())
    }

    fn update_node(
        &self,
        id: NodeId,
        expected: &NodeCondition,
        change: &NodeChange,
    ) -> ClusterResult<NodeRecord> {
        let mut inner = self.lock();
        let record = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| ClusterError::config(format!("node {} is not registered", id)))?;
        if !expected.matches(record) {
            return Err(ClusterError::conflict(format!(
                "node {} changed concurrently (expected role={} upstream={:?} active={}, found role={} upstream={:?} active={})",
                id,
                expected.role,
                expected.upstream_id.map(|u| u.0),
                expected.active,
                record.role,
                record.upstream_id.map(|u| u.0),
                record.active
            )));
        }
        change.apply(record);
        Ok(record.clone())
    }

    fn transfer_leadership(
        &self,
        candidate: NodeId,
        old_leader: NodeId,
        demotion: Demotion,
    ) -> ClusterResult<NodeRecord> {
        let mut inner = self.lock();
        apply_transfer(&mut inner.nodes, candidate, old_leader, demotion)
    }

    fn record_event(&self, event: &EventRecord) -> ClusterResult<()> {
        self.lock().events.push(event.clone());
        Ok(())
    }

    fn events(&self, limit: usize) -> ClusterResult<Vec<EventRecord>> {
        Ok(self.lock().events.iter().rev().take(limit).cloned().collect())
    }

    fn record_sample(&self, sample: &MonitoringSample) -> ClusterResult<()> {
        self.lock().samples.push(sample.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::events::EventKind;
    use crate::registry::node::test_record;
    use std::sync::Arc;
    use std::thread;

    fn three_nodes() -> MemoryRegistry {
        MemoryRegistry::with_nodes([
            test_record(1, NodeRole::Leader, None),
            test_record(2, NodeRole::Standby, Some(1)),
            test_record(3, NodeRole::Standby, Some(1)),
        ])
    }

    #[test]
    fn test_register_duplicate_requires_replace() {
        let reg = three_nodes();
        let record = test_record(2, NodeRole::Standby, Some(1));
        assert!(matches!(
            reg.register(&record, false),
            Err(ClusterError::Conflict(_))
        ));
        reg.register(&record, true).unwrap();
    }

    #[test]
    fn test_update_node_checks_precondition() {
        let reg = three_nodes();
        let current = reg.node(NodeId(2)).unwrap().unwrap().condition();
        let updated = reg
            .update_node(NodeId(2), &current, &NodeChange::follow(NodeId(3)))
            .unwrap();
        assert_eq!(updated.upstream_id, Some(NodeId(3)));

        // Same stale precondition again must fail.
        let err = reg
            .update_node(NodeId(2), &current, &NodeChange::follow(NodeId(3)))
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[test]
    fn test_transfer_leadership_switchover() {
        let reg = three_nodes();
        let leader = reg
            .transfer_leadership(NodeId(2), NodeId(1), Demotion::Standby)
            .unwrap();
        assert_eq!(leader.role, NodeRole::Leader);
        assert_eq!(leader.upstream_id, None);
        let old = reg.node(NodeId(1)).unwrap().unwrap();
        assert_eq!(old.role, NodeRole::Standby);
        assert_eq!(old.upstream_id, Some(NodeId(2)));
        assert!(old.active);
        assert_eq!(reg.leader().unwrap().unwrap().id, NodeId(2));
    }

    #[test]
    fn test_transfer_leadership_failover_deactivates_old() {
        let reg = three_nodes();
        reg.transfer_leadership(NodeId(3), NodeId(1), Demotion::Failed)
            .unwrap();
        assert!(!reg.node(NodeId(1)).unwrap().unwrap().active);
    }

    #[test]
    fn test_racing_promotions_exactly_one_wins() {
        for _ in 0..50 {
            let reg = Arc::new(three_nodes());
            let handles: Vec<_> = [2u32, 3u32]
                .into_iter()
                .map(|cand| {
                    let reg = Arc::clone(&reg);
                    thread::spawn(move || {
                        reg.transfer_leadership(NodeId(cand), NodeId(1), Demotion::Failed)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let wins = results.iter().filter(|r| r.is_ok()).count();
            let conflicts = results
                .iter()
                .filter(|r| matches!(r, Err(ClusterError::Conflict(_))))
                .count();
            assert_eq!(wins, 1);
            assert_eq!(conflicts, 1);
            assert!(reg.leader().is_ok());
        }
    }

    #[test]
    fn test_witness_cannot_take_leadership() {
        let reg = MemoryRegistry::with_nodes([
            test_record(1, NodeRole::Leader, None),
            test_record(9, NodeRole::Witness, Some(1)),
        ]);
        let err = reg
            .transfer_leadership(NodeId(9), NodeId(1), Demotion::Failed)
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[test]
    fn test_events_newest_first() {
        let reg = three_nodes();
        reg.record_event(&EventRecord::new(NodeId(1), EventKind::LeaderRegister, true, "a"))
            .unwrap();
        reg.record_event(&EventRecord::new(NodeId(2), EventKind::StandbyRegister, true, "b"))
            .unwrap();
        let events = reg.events(10).unwrap();
        assert_eq!(events[0].kind, EventKind::StandbyRegister);
        assert_eq!(reg.events(1).unwrap().len(), 1);
    }

    #[test]
    fn test_two_leaders_is_fatal() {
        let reg = MemoryRegistry::with_nodes([
            test_record(1, NodeRole::Leader, None),
            test_record(2, NodeRole::Leader, None),
        ]);
        assert!(matches!(reg.leader(), Err(ClusterError::Fatal(_))));
    }
}
