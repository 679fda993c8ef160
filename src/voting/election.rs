//! Per-term election bookkeeping

use std::collections::{BTreeMap, BTreeSet};

use super::ranking::{select_winner, Candidate};
use crate::lsn::Lsn;
use crate::registry::{NodeId, NodeRecord, NodeRole};

/// Participants of one election term and their readiness.
///
/// Readiness is monotonic: once a participant is ready it stays ready for
/// the rest of the term, and a later report can only raise its position.
#[derive(Debug, Clone)]
pub struct Election {
    term: u64,
    participants: BTreeMap<NodeId, NodeRecord>,
    ready: BTreeMap<NodeId, Lsn>,
    excluded: BTreeSet<NodeId>,
}

impl Election {
    pub fn new(term: u64, participants: impl IntoIterator<Item = NodeRecord>) -> Self {
        let participants: BTreeMap<NodeId, NodeRecord> =
            participants.into_iter().map(|n| (n.id, n)).collect();
        let mut election = Self {
            term,
            participants,
            ready: BTreeMap::new(),
            excluded: BTreeSet::new(),
        };
        // Witnesses never report a position and are ready from the start.
        let witnesses: Vec<NodeId> = election
            .participants
            .values()
            .filter(|n| n.role == NodeRole::Witness)
            .map(|n| n.id)
            .collect();
        for id in witnesses {
            election.ready.insert(id, Lsn::INVALID);
        }
        election
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Record a reported position. An invalid position leaves the
    /// participant pending.
    pub fn report(&mut self, id: NodeId, lsn: Lsn) {
        if !lsn.is_valid() || !self.participants.contains_key(&id) || self.excluded.contains(&id) {
            return;
        }
        let entry = self.ready.entry(id).or_insert(lsn);
        if lsn > *entry {
            *entry = lsn;
        }
    }

    /// Drop a participant that has not become ready.
    pub fn exclude(&mut self, id: NodeId) {
        if !self.ready.contains_key(&id) {
            self.excluded.insert(id);
        }
    }

    pub fn is_ready(&self, id: NodeId) -> bool {
        self.ready.contains_key(&id)
    }

    pub fn is_excluded(&self, id: NodeId) -> bool {
        self.excluded.contains(&id)
    }

    /// Participants neither ready nor excluded.
    pub fn pending(&self) -> Vec<NodeId> {
        self.participants
            .keys()
            .filter(|id| !self.ready.contains_key(id) && !self.excluded.contains(id))
            .copied()
            .collect()
    }

    pub fn is_settled(&self) -> bool {
        self.pending().is_empty()
    }

    /// Exclude everything still pending (the election timed out).
    pub fn close(&mut self) {
        for id in self.pending() {
            self.excluded.insert(id);
        }
    }

    /// Ready participants that may be promoted.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.ready
            .iter()
            .filter_map(|(id, lsn)| {
                let node = self.participants.get(id)?;
                node.is_promotable().then_some(Candidate {
                    id: *id,
                    receive_lsn: *lsn,
                    priority: node.priority,
                })
            })
            .collect()
    }

    pub fn winner(&self) -> Option<Candidate> {
        select_winner(&self.candidates())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_record;

    fn election() -> Election {
        Election::new(
            1,
            vec![
                test_record(2, NodeRole::Standby, Some(1)),
                test_record(3, NodeRole::Standby, Some(1)),
                test_record(4, NodeRole::Witness, Some(1)),
            ],
        )
    }

    #[test]
    fn test_witness_ready_but_not_candidate() {
        let e = election();
        assert!(e.is_ready(NodeId(4)));
        assert!(e.candidates().is_empty());
        assert_eq!(e.pending(), vec![NodeId(2), NodeId(3)]);
    }

    #[test]
    fn test_invalid_position_stays_pending() {
        let mut e = election();
        e.report(NodeId(2), Lsn::INVALID);
        assert!(!e.is_ready(NodeId(2)));
        e.report(NodeId(2), Lsn::new(0x300));
        assert!(e.is_ready(NodeId(2)));
    }

    #[test]
    fn test_ready_is_monotonic() {
        let mut e = election();
        e.report(NodeId(2), Lsn::new(0x300));
        e.exclude(NodeId(2));
        e.report(NodeId(2), Lsn::new(0x200));
        assert!(e.is_ready(NodeId(2)));
        assert_eq!(e.candidates()[0].receive_lsn, Lsn::new(0x300));
    }

    #[test]
    fn test_close_excludes_pending() {
        let mut e = election();
        e.report(NodeId(3), Lsn::new(0x200));
        e.close();
        assert!(e.is_settled());
        assert_eq!(e.winner().map(|c| c.id), Some(NodeId(3)));
        e.report(NodeId(2), Lsn::new(0x900));
        assert_eq!(e.winner().map(|c| c.id), Some(NodeId(3)));
    }
}
