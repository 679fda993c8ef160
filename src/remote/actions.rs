//! Remote actions and their replies
//!
//! Each action is an invocation of this same binary on the target host with
//! `--format optformat`; the reply is parsed positionally by key.

use std::fmt;
use std::str::FromStr;

use super::channel::RemoteChannel;
use super::optformat::OptReply;
use crate::config::Config;
use crate::control::VotingStatus;
use crate::error::{ClusterError, ClusterResult};
use crate::lsn::Lsn;
use crate::output::CheckStatus;
use crate::registry::{NodeId, NodeRecord};

/// An action executed on another node's host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAction {
    /// Identify the node and its replication state.
    Status,
    /// Report whether the server is stopped and how it was shut down.
    ShutdownState,
    /// Compare configured and running data directory.
    DataDirectoryCheck,
    /// Stop the server, optionally after a checkpoint.
    ServiceStop { checkpoint: bool },
    /// Attach the stopped node to `upstream_conninfo`.
    Rejoin {
        upstream_conninfo: String,
        force_rewind: bool,
        allow_unclean: bool,
    },
    /// Re-point a running standby at `upstream_id`.
    Follow { upstream_id: NodeId },
    /// Pause/voting state of the monitor.
    DaemonStatus,
    DaemonPause,
    DaemonUnpause,
    /// Tell the node to re-parent to `leader`.
    NotifyFollow { leader: NodeId, term: u64 },
}

impl RemoteAction {
    /// Arguments after the global options.
    fn arguments(&self) -> String {
        match self {
            RemoteAction::Status => "status".to_string(),
            RemoteAction::ShutdownState => "status --is-shutdown-cleanly".to_string(),
            RemoteAction::DataDirectoryCheck => "check data-directory".to_string(),
            RemoteAction::ServiceStop { checkpoint } => {
                if *checkpoint {
                    "service stop --checkpoint".to_string()
                } else {
                    "service stop".to_string()
                }
            }
            RemoteAction::Rejoin {
                upstream_conninfo,
                force_rewind,
                allow_unclean,
            } => {
                let mut args = format!(
                    "rejoin --upstream-conninfo {} --no-wait",
                    shell_quote(upstream_conninfo)
                );
                if *force_rewind {
                    args.push_str(" --force-rewind");
                }
                if *allow_unclean {
                    args.push_str(" --allow-unclean");
                }
                args
            }
            RemoteAction::Follow { upstream_id } => {
                format!("follow --upstream-node-id {}", upstream_id)
            }
            RemoteAction::DaemonStatus => "daemon status".to_string(),
            RemoteAction::DaemonPause => "daemon pause".to_string(),
            RemoteAction::DaemonUnpause => "daemon unpause".to_string(),
            RemoteAction::NotifyFollow { leader, term } => {
                format!("daemon notify-follow --leader-id {} --term {}", leader, term)
            }
        }
    }
}

/// How to invoke this binary on other hosts.
#[derive(Debug, Clone)]
pub struct RemoteInvocation {
    pub binary: String,
    pub config_file: Option<String>,
    pub user: Option<String>,
}

impl RemoteInvocation {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.remote_binary.clone(),
            config_file: config
                .remote_config_file
                .as_ref()
                .map(|p| p.display().to_string()),
            user: config.ssh_user.clone(),
        }
    }

    /// Full command line for `action`.
    pub fn command_line(&self, action: &RemoteAction) -> String {
        let mut line = self.binary.clone();
        if let Some(config) = &self.config_file {
            line.push_str(" -f ");
            line.push_str(&shell_quote(config));
        }
        line.push_str(" --format optformat ");
        line.push_str(&action.arguments());
        line
    }

    /// Execute `action` on `node`'s host and parse the reply line.
    pub fn execute(
        &self,
        channel: &dyn RemoteChannel,
        node: &NodeRecord,
        action: &RemoteAction,
    ) -> ClusterResult<OptReply> {
        let output = channel.run(&node.ssh_target, self.user.as_deref(), &self.command_line(action))?;
        OptReply::parse(&node.ssh_target, &output)
    }
}

/// Quote `value` for a POSIX shell if it needs it.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Split a command line produced by [`RemoteInvocation::command_line`].
///
/// Understands whitespace separation and single quotes (including the
/// `'\''` escape), which is everything [`shell_quote`] emits.
pub fn split_command_line(line: &str) -> ClusterResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ClusterError::Protocol(format!(
                                "unterminated quote in \"{}\"",
                                line
                            )))
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Server state reported by `status --is-shutdown-cleanly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Shutdown,
    UncleanShutdown,
    Unknown,
}

impl ShutdownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownState::Running => "RUNNING",
            ShutdownState::Shutdown => "SHUTDOWN",
            ShutdownState::UncleanShutdown => "UNCLEAN_SHUTDOWN",
            ShutdownState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ShutdownState {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ShutdownState::Running),
            "SHUTDOWN" => Ok(ShutdownState::Shutdown),
            "UNCLEAN_SHUTDOWN" => Ok(ShutdownState::UncleanShutdown),
            "UNKNOWN" => Ok(ShutdownState::Unknown),
            other => Err(ClusterError::Protocol(format!(
                "unknown shutdown state \"{}\"",
                other
            ))),
        }
    }
}

/// Reply to [`RemoteAction::ShutdownState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReply {
    pub state: ShutdownState,
    pub last_checkpoint_lsn: Lsn,
}

impl ShutdownReply {
    pub fn from_reply(reply: &OptReply) -> ClusterResult<Self> {
        let state: ShutdownState = reply.parse_value("state")?;
        let last_checkpoint_lsn = match reply.get("last-checkpoint-lsn") {
            Some(raw) if !raw.is_empty() => raw.parse()?,
            _ => Lsn::INVALID,
        };
        Ok(Self {
            state,
            last_checkpoint_lsn,
        })
    }
}

/// Reply to [`RemoteAction::DaemonStatus`] and the pause actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonReply {
    pub paused: bool,
    pub term: u64,
    pub voting_status: VotingStatus,
}

impl DaemonReply {
    pub fn from_reply(reply: &OptReply) -> ClusterResult<Self> {
        Ok(Self {
            paused: reply.flag("paused")?,
            term: reply.parse_value("term")?,
            voting_status: reply.parse_value("voting-status")?,
        })
    }
}

/// Reply to an action that changes state (`service`, `rejoin`, `follow`,
/// `daemon notify-follow`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReply {
    pub ok: bool,
    /// Error class name when the action failed.
    pub class: Option<String>,
    pub message: Option<String>,
}

impl ActionReply {
    pub fn from_reply(reply: &OptReply) -> ClusterResult<Self> {
        let ok = match reply.require("status")? {
            "OK" => true,
            "ERROR" | "INCOMPLETE" => false,
            other => {
                return Err(ClusterError::Protocol(format!(
                    "unexpected action status \"{}\"",
                    other
                )))
            }
        };
        Ok(Self {
            ok,
            class: reply.get("error-class").map(str::to_string),
            message: reply.get("message").map(|m| m.replace('_', " ")),
        })
    }

    /// Convert a failed reply into an error for `host`.
    pub fn into_result(self, host: &str) -> ClusterResult<()> {
        if self.ok {
            Ok(())
        } else {
            Err(ClusterError::remote(
                host,
                format!(
                    "action failed ({}): {}",
                    self.class.as_deref().unwrap_or("UNKNOWN"),
                    self.message.as_deref().unwrap_or("no detail")
                ),
            ))
        }
    }
}

/// Reply to a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReply {
    pub status: CheckStatus,
}

impl CheckReply {
    /// `key` is the check's status token (`status` for most checks).
    pub fn from_reply(reply: &OptReply, key: &str) -> ClusterResult<Self> {
        let status = match reply.require(key)? {
            "OK" => CheckStatus::Ok,
            "WARNING" => CheckStatus::Warning,
            "CRITICAL" | "MISMATCH" => CheckStatus::Critical,
            _ => CheckStatus::Unknown,
        };
        Ok(Self { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> RemoteInvocation {
        RemoteInvocation {
            binary: "walwarden".to_string(),
            config_file: Some("/etc/walwarden.json".to_string()),
            user: None,
        }
    }

    #[test]
    fn test_command_line_quotes_conninfo() {
        let line = invocation().command_line(&RemoteAction::Rejoin {
            upstream_conninfo: "host=db2 dbname=walwarden".to_string(),
            force_rewind: true,
            allow_unclean: false,
        });
        assert_eq!(
            line,
            "walwarden -f /etc/walwarden.json --format optformat rejoin --upstream-conninfo 'host=db2 dbname=walwarden' --no-wait --force-rewind"
        );
        let args = split_command_line(&line).unwrap();
        assert_eq!(args[6], "--upstream-conninfo");
        assert_eq!(args[7], "host=db2 dbname=walwarden");
    }

    #[test]
    fn test_split_handles_embedded_quote() {
        let quoted = shell_quote("it's");
        let args = split_command_line(&format!("a {} b", quoted)).unwrap();
        assert_eq!(args, vec!["a", "it's", "b"]);
        assert!(split_command_line("a 'b").is_err());
    }

    #[test]
    fn test_shutdown_reply() {
        let reply = OptReply::parse("h", "--state=SHUTDOWN --last-checkpoint-lsn=0/500").unwrap();
        let parsed = ShutdownReply::from_reply(&reply).unwrap();
        assert_eq!(parsed.state, ShutdownState::Shutdown);
        assert_eq!(parsed.last_checkpoint_lsn, Lsn::new(0x500));

        let reply = OptReply::parse("h", "--state=RUNNING").unwrap();
        let parsed = ShutdownReply::from_reply(&reply).unwrap();
        assert!(!parsed.last_checkpoint_lsn.is_valid());
    }

    #[test]
    fn test_action_reply_failure() {
        let reply =
            OptReply::parse("h", "--status=ERROR --error-class=FATAL --message=server_down").unwrap();
        let parsed = ActionReply::from_reply(&reply).unwrap();
        assert!(!parsed.ok);
        let err = parsed.into_result("h").unwrap_err();
        assert!(err.to_string().contains("server down"));
    }

    #[test]
    fn test_daemon_reply() {
        let reply = OptReply::parse("h", "--paused=true --term=3 --voting-status=no_vote").unwrap();
        let parsed = DaemonReply::from_reply(&reply).unwrap();
        assert!(parsed.paused);
        assert_eq!(parsed.term, 3);
    }
}
