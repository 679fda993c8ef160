//! Switchover / Promote / Rejoin Orchestrator
//!
//! Operator-driven leadership changes:
//!
//! - `Switchover`: planned three-phase handover from a live leader to this
//!   standby (pre-flight, demote/promote, rejoin)
//! - `promote`: promote this standby when no leader is running
//! - `rejoin`: attach a stopped node to the current leader
//! - `follow_upstream`: re-parent a running standby
//!
//! Pre-flight is read-only and can be repeated freely. Once the leader has
//! been stopped there is no cancellation: a failure before the candidate is
//! promoted is fatal, a failure after it only makes the run incomplete.

mod orchestrator;
mod plan;
mod preflight;
mod promote;
mod rejoin;

pub use orchestrator::{Switchover, SwitchoverOutcome, SwitchoverReport};
pub use plan::{PreflightCheck, SwitchoverOptions, SwitchoverPlan};
pub use preflight::Preflight;
pub use promote::{promote, promote_local};
pub use rejoin::{follow_upstream, rejoin, RejoinOptions, RejoinOutcome};
