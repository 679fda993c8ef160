//! Error taxonomy
//!
//! Lower-level checks return typed results; only the top-level dispatcher
//! decides what a failure means for the process. Every error belongs to
//! exactly one [`ErrorClass`] and the class alone determines the exit code.
//!
//! - Configuration: bad or missing registry records, unreachable hosts at
//!   pre-flight. Surfaced to the operator, never auto-retried.
//! - Transient: a poll or remote command failed after its retry budget.
//! - Fatal: ambiguous cluster state. The process stops rather than guess.
//! - Partition: this node cannot see a majority of the cluster.
//! - Conflict: a conditional registry write lost a race.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::registry::NodeId;

/// Result type used throughout the crate.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Taxonomy class of an error or outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Operator must fix configuration or registry contents.
    Configuration,
    /// Retry budget exhausted against a flaky peer.
    Transient,
    /// Cluster state is ambiguous; stop immediately.
    Fatal,
    /// This node is in a minority partition.
    Partition,
    /// A conditional registry write observed a changed precondition.
    Conflict,
    /// Promotion succeeded but the follow-up could not be confirmed.
    Incomplete,
    /// A `check` reported CRITICAL or UNKNOWN.
    CheckFailed,
}

impl ErrorClass {
    /// Process exit code for this class.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorClass::Configuration => 1,
            ErrorClass::Fatal => 2,
            ErrorClass::Partition => 3,
            ErrorClass::Conflict => 4,
            ErrorClass::Transient => 5,
            ErrorClass::Incomplete => 6,
            ErrorClass::CheckFailed => 7,
        }
    }

    /// Upper-case name used in log events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Configuration => "CONFIGURATION",
            ErrorClass::Transient => "TRANSIENT",
            ErrorClass::Fatal => "FATAL",
            ErrorClass::Partition => "PARTITION",
            ErrorClass::Conflict => "CONFLICT",
            ErrorClass::Incomplete => "INCOMPLETE",
            ErrorClass::CheckFailed => "CHECK_FAILED",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unable to connect to node \"{target}\": {message}")]
    Unreachable { target: String, message: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("remote command on host \"{host}\" failed: {message}")]
    Remote { host: String, message: String },

    #[error("malformed reply: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("registry conflict: {0}")]
    Conflict(String),

    #[error("registry write rejected: node is read-only ({0})")]
    ReadOnly(String),

    #[error("unable to reach a majority of nodes: {visible} of {total} visible")]
    NoMajority { visible: usize, total: usize },

    #[error("node {node_id} lost contact with all peers during the election")]
    Isolated { node_id: NodeId },

    #[error("{0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        ClusterError::Configuration(message.into())
    }

    /// Build a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        ClusterError::Fatal(message.into())
    }

    /// Build a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        ClusterError::Conflict(message.into())
    }

    /// Build a query error.
    pub fn query(message: impl fmt::Display) -> Self {
        ClusterError::Query(message.to_string())
    }

    /// Build an unreachable-node error.
    pub fn unreachable(target: impl Into<String>, message: impl fmt::Display) -> Self {
        ClusterError::Unreachable {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Build a remote command error.
    pub fn remote(host: impl Into<String>, message: impl Into<String>) -> Self {
        ClusterError::Remote {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ClusterError::Configuration(_) => ErrorClass::Configuration,
            ClusterError::Unreachable { .. }
            | ClusterError::Query(_)
            | ClusterError::Remote { .. }
            | ClusterError::Protocol(_)
            | ClusterError::Timeout(_) => ErrorClass::Transient,
            ClusterError::Conflict(_) | ClusterError::ReadOnly(_) => ErrorClass::Conflict,
            ClusterError::NoMajority { .. } | ClusterError::Isolated { .. } => {
                ErrorClass::Partition
            }
            ClusterError::Fatal(_) | ClusterError::Io(_) | ClusterError::Json(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Operator-actionable hint, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ClusterError::NoMajority { .. } => {
                Some("this node may be in a minority partition; check network connectivity to the other nodes")
            }
            ClusterError::Isolated { .. } => {
                Some("no promotion was attempted; restore connectivity and restart the monitor")
            }
            ClusterError::Conflict(_) => {
                Some("another node changed the registry concurrently; inspect \"cluster show\" before retrying")
            }
            ClusterError::ReadOnly(_) => Some("registry writes must be executed against the current leader"),
            ClusterError::Remote { .. } => {
                Some("verify passwordless SSH access and that the remote binary is installed")
            }
            ClusterError::Timeout(_) => Some("increase the corresponding *_timeout_secs setting if the cluster is slow"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let classes = [
            ErrorClass::Configuration,
            ErrorClass::Transient,
            ErrorClass::Fatal,
            ErrorClass::Partition,
            ErrorClass::Conflict,
            ErrorClass::Incomplete,
            ErrorClass::CheckFailed,
        ];
        let mut codes: Vec<i32> = classes.iter().map(|c| c.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), classes.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_classification() {
        assert_eq!(ClusterError::config("x").class(), ErrorClass::Configuration);
        assert_eq!(
            ClusterError::unreachable("host=a", "refused").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ClusterError::NoMajority { visible: 1, total: 3 }.class(),
            ErrorClass::Partition
        );
        assert_eq!(ClusterError::conflict("x").class(), ErrorClass::Conflict);
        assert_eq!(ClusterError::fatal("x").class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_partition_errors_carry_hint() {
        let err = ClusterError::Isolated { node_id: NodeId(2) };
        assert!(err.hint().is_some());
        assert!(err.to_string().contains("node 2"));
    }
}
