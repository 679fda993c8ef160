//! Election state machine
//!
//! States per election term:
//!
//! ```text
//! NoVote ──start──▶ Initiated ──▶ Won | Lost ──reset──▶ NoVote
//! NoVote ──follow directive──▶ RequestReceived ──reset──▶ NoVote
//! ```
//!
//! The term only moves forward. A directive from an older term is stale and
//! ignored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::registry::{EventRecord, NodeId};

/// Voting status of this node in the current term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStatus {
    #[default]
    NoVote,
    RequestReceived,
    Initiated,
    Won,
    Lost,
}

impl VotingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingStatus::NoVote => "no_vote",
            VotingStatus::RequestReceived => "request_received",
            VotingStatus::Initiated => "initiated",
            VotingStatus::Won => "won",
            VotingStatus::Lost => "lost",
        }
    }

    /// Whether an election involving this node is under way.
    pub fn in_election(&self) -> bool {
        !matches!(self, VotingStatus::NoVote)
    }
}

impl fmt::Display for VotingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VotingStatus {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_vote" => Ok(VotingStatus::NoVote),
            "request_received" => Ok(VotingStatus::RequestReceived),
            "initiated" => Ok(VotingStatus::Initiated),
            "won" => Ok(VotingStatus::Won),
            "lost" => Ok(VotingStatus::Lost),
            other => Err(ClusterError::Protocol(format!(
                "unknown voting status \"{}\"",
                other
            ))),
        }
    }
}

/// Per-node election state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionState {
    pub term: u64,
    pub voting_status: VotingStatus,
    /// Winner once decided (or the leader named by a follow directive).
    pub candidate_id: Option<NodeId>,
    /// "You must re-parent to `candidate_id` now."
    pub follow_directive: bool,
}

impl ElectionState {
    /// Begin a new election: the term moves past both the local term and
    /// `seen`, the highest term reported by peers, and status becomes
    /// Initiated.
    pub fn start(&mut self, seen: u64) -> u64 {
        self.term = self.term.max(seen) + 1;
        self.voting_status = VotingStatus::Initiated;
        self.candidate_id = None;
        self.follow_directive = false;
        self.term
    }

    /// Record the election result for the current term.
    pub fn decide(&mut self, winner: NodeId, won: bool) {
        self.candidate_id = Some(winner);
        self.voting_status = if won { VotingStatus::Won } else { VotingStatus::Lost };
    }

    /// Accept a follow directive; returns false if it is stale.
    pub fn receive_follow(&mut self, leader: NodeId, term: u64) -> bool {
        if term < self.term {
            return false;
        }
        self.term = term;
        if self.voting_status == VotingStatus::NoVote {
            self.voting_status = VotingStatus::RequestReceived;
        }
        self.candidate_id = Some(leader);
        self.follow_directive = true;
        true
    }

    /// Pending follow target, if a directive is outstanding.
    pub fn pending_follow(&self) -> Option<NodeId> {
        if self.follow_directive {
            self.candidate_id
        } else {
            None
        }
    }

    /// Back to NoVote, keeping the term.
    pub fn reset(&mut self) {
        self.voting_status = VotingStatus::NoVote;
        self.candidate_id = None;
        self.follow_directive = false;
    }
}

/// Everything a node exposes through its shared control state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub paused: bool,
    pub election: ElectionState,
    /// Events no registry accepted yet, oldest first.
    #[serde(default)]
    pub deferred_events: Vec<EventRecord>,
}
