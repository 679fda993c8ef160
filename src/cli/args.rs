//! CLI argument definitions using clap
//!
//! Global options precede the subcommand so that remote invocations
//! (`walwarden -f <path> --format optformat <command>`) parse the same way
//! as interactive ones.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::checks::CheckKind;
use crate::output::OutputFormat;
use crate::registry::{NodeId, NodeRole};
use crate::switchover::SwitchoverOptions;

/// Configuration file used when `-f` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/walwarden/walwarden.json";

/// walwarden - failover control plane for replicated PostgreSQL clusters
#[derive(Parser, Debug)]
#[command(name = "walwarden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short = 'f', long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Minimum log severity (overrides the configuration file)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show this node's replication and election state
    Status {
        /// Report only whether the stopped server shut down cleanly
        #[arg(long)]
        is_shutdown_cleanly: bool,
    },

    /// Run a single health check
    Check {
        #[arg(value_enum)]
        kind: CheckKind,
    },

    /// Promote this standby after its leader has failed
    Promote,

    /// Promote this standby and demote the running leader
    Switchover(SwitchoverArgs),

    /// Attach this stopped node to a leader as a standby
    Rejoin {
        /// Connection target of the new upstream
        #[arg(long)]
        upstream_conninfo: String,

        /// Rewind the data directory if its timeline diverged
        #[arg(long)]
        force_rewind: bool,

        /// Accept a data directory that was not shut down cleanly
        #[arg(long)]
        allow_unclean: bool,

        /// Do not wait for the node to attach to the upstream
        #[arg(long)]
        no_wait: bool,
    },

    /// Re-point this running standby at another upstream
    Follow {
        /// Upstream node (default: the current leader)
        #[arg(long)]
        upstream_node_id: Option<NodeId>,
    },

    /// Start or stop the local database server
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },

    /// Add this node to the registry
    Register {
        /// Role to register (default: derived from the server's recovery state)
        #[arg(long)]
        role: Option<NodeRole>,

        /// Upstream node of a standby (default: the current leader)
        #[arg(long)]
        upstream_node_id: Option<NodeId>,

        /// Leader to register against, for nodes without a registry replica
        #[arg(long)]
        upstream_conninfo: Option<String>,

        /// Overwrite an existing record with the same id
        #[arg(long)]
        force: bool,
    },

    /// Remove a node from the registry
    Unregister {
        #[arg(long)]
        node_id: NodeId,
    },

    /// Inspect the whole cluster
    Cluster {
        #[command(subcommand)]
        action: ClusterAction,
    },

    /// Control the replication monitor
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Args, Debug, Default)]
pub struct SwitchoverArgs {
    /// Run the pre-flight checks only
    #[arg(long)]
    pub dry_run: bool,

    /// Downgrade capacity, lag and archiving deficits to warnings
    #[arg(long)]
    pub force: bool,

    /// Promote even if this node never reaches the leader's shutdown checkpoint
    #[arg(long)]
    pub always_promote: bool,

    /// Continue if the old leader did not shut down cleanly
    #[arg(long)]
    pub allow_unclean: bool,

    /// Let the old leader rewind when rejoining
    #[arg(long)]
    pub force_rewind: bool,

    /// Re-point the other standbys at the new leader
    #[arg(long)]
    pub siblings_follow: bool,

    /// Leave the monitors running during the switchover
    #[arg(long)]
    pub no_pause: bool,

    /// Resume every monitor afterwards, including ones paused beforehand
    #[arg(long)]
    pub force_unpause: bool,
}

impl SwitchoverArgs {
    pub fn options(&self) -> SwitchoverOptions {
        SwitchoverOptions {
            dry_run: self.dry_run,
            force: self.force,
            always_promote: self.always_promote,
            allow_unclean: self.allow_unclean,
            force_rewind: self.force_rewind,
            siblings_follow: self.siblings_follow,
            no_pause: self.no_pause,
            force_unpause: self.force_unpause,
        }
    }
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop {
        /// Issue a checkpoint before stopping
        #[arg(long)]
        checkpoint: bool,
    },
    Restart,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAction {
    /// One row per registered node
    Show,
    /// Most recent registry events
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonAction {
    /// Run the replication monitor in the foreground
    Run,
    /// Stop the monitor from acting on failures
    Pause,
    /// Let the monitor act on failures again
    Unpause,
    /// Report pause flag and election state
    Status,
    /// Store a directive to follow a newly elected leader
    NotifyFollow {
        #[arg(long)]
        leader_id: NodeId,
        #[arg(long)]
        term: u64,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{split_command_line, RemoteAction, RemoteInvocation};

    fn parse_remote(action: &RemoteAction) -> Cli {
        let invocation = RemoteInvocation {
            binary: "walwarden".to_string(),
            config_file: Some("/etc/walwarden/node 2.json".to_string()),
            user: None,
        };
        let args = split_command_line(&invocation.command_line(action)).unwrap();
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_remote_command_lines_parse() {
        let cli = parse_remote(&RemoteAction::ShutdownState);
        assert_eq!(cli.format, OutputFormat::Optformat);
        assert_eq!(cli.config, PathBuf::from("/etc/walwarden/node 2.json"));
        assert!(matches!(
            cli.command,
            Command::Status {
                is_shutdown_cleanly: true
            }
        ));

        let cli = parse_remote(&RemoteAction::Rejoin {
            upstream_conninfo: "host=node2 dbname=app".to_string(),
            force_rewind: true,
            allow_unclean: false,
        });
        match cli.command {
            Command::Rejoin {
                upstream_conninfo,
                force_rewind,
                allow_unclean,
                no_wait,
            } => {
                assert_eq!(upstream_conninfo, "host=node2 dbname=app");
                assert!(force_rewind && no_wait && !allow_unclean);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = parse_remote(&RemoteAction::NotifyFollow {
            leader: NodeId(3),
            term: 9,
        });
        assert!(matches!(
            cli.command,
            Command::Daemon {
                action: DaemonAction::NotifyFollow {
                    leader_id: NodeId(3),
                    term: 9
                }
            }
        ));
    }

    #[test]
    fn test_register_accepts_primary_alias() {
        let cli = Cli::try_parse_from(["walwarden", "register", "--role", "primary"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Register {
                role: Some(NodeRole::Leader),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["walwarden", "register", "--role", "arbiter"]).is_err());
    }

    #[test]
    fn test_switchover_flags_map_to_options() {
        let cli = Cli::try_parse_from([
            "walwarden",
            "switchover",
            "--siblings-follow",
            "--always-promote",
        ])
        .unwrap();
        let Command::Switchover(args) = cli.command else {
            panic!("expected switchover");
        };
        let options = args.options();
        assert!(options.siblings_follow && options.always_promote);
        assert!(!options.dry_run && !options.force);
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["walwarden", "check", "role", "--format", "nagios"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Nagios);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}
