//! Failover Voting Engine
//!
//! Term-scoped elections among the survivors of a leader loss.
//!
//! # Rules
//!
//! 1. A node that sees strictly fewer than half of the active registered
//!    nodes (itself included) never starts an election
//! 2. Candidates are the reachable, promotable direct siblings under the
//!    lost leader; witnesses count toward visibility but are never ranked
//! 3. Greatest received WAL position wins, then priority, then lowest id
//! 4. Readiness within a term is monotonic
//! 5. The winner promotes and tells every other survivor to follow it

mod election;
mod engine;
mod ranking;

pub use election::Election;
pub use engine::{FailoverOutcome, VotingEngine};
pub use ranking::{has_majority, select_winner, Candidate};
