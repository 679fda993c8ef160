//! Candidate ranking and majority rule
//!
//! Pure functions: no I/O, deterministic for every input.

use std::cmp::Reverse;

use crate::lsn::Lsn;
use crate::registry::NodeId;

/// A promotable node with the WAL position it reported this term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: NodeId,
    pub receive_lsn: Lsn,
    pub priority: u32,
}

impl Candidate {
    /// Greatest WAL position first, then highest priority, then lowest id.
    fn rank_key(&self) -> (Lsn, u32, Reverse<NodeId>) {
        (self.receive_lsn, self.priority, Reverse(self.id))
    }
}

/// The winning candidate, or `None` for an empty set.
pub fn select_winner(candidates: &[Candidate]) -> Option<Candidate> {
    candidates.iter().copied().max_by_key(Candidate::rank_key)
}

/// Whether `visible` of `total` active nodes may elect a leader.
///
/// Strictly fewer than half is a minority; exactly half may proceed.
pub fn has_majority(visible: usize, total: usize) -> bool {
    total > 0 && visible * 2 >= total
}
