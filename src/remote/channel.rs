//! Byte transport for remote actions
//!
//! The channel runs a command line on another host and hands back stdout.
//! It never interprets the output.

use std::process::{Command, Stdio};

use crate::error::{ClusterError, ClusterResult};

/// Executes a command line on a remote host.
pub trait RemoteChannel: Send + Sync {
    /// Run `command` on `host` as `user` and return its stdout.
    ///
    /// An error means the transport failed; a command that ran but printed
    /// nothing yields `Ok` with an empty string.
    fn run(&self, host: &str, user: Option<&str>, command: &str) -> ClusterResult<String>;
}

/// SSH transport (`ssh <options> [user@]host <command>`).
#[derive(Debug, Clone)]
pub struct SshChannel {
    options: Vec<String>,
}

impl SshChannel {
    /// `options` is split on whitespace, e.g. `"-q -o ConnectTimeout=10"`.
    pub fn new(options: &str) -> Self {
        Self {
            options: options.split_whitespace().map(str::to_string).collect(),
        }
    }

    fn destination(host: &str, user: Option<&str>) -> String {
        match user {
            Some(user) if !user.is_empty() => format!("{}@{}", user, host),
            _ => host.to_string(),
        }
    }
}

impl RemoteChannel for SshChannel {
    fn run(&self, host: &str, user: Option<&str>, command: &str) -> ClusterResult<String> {
        let output = Command::new("ssh")
            .args(&self.options)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(Self::destination(host, user))
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ClusterError::remote(host, format!("unable to execute ssh: {}", e)))?;

        // 255 is ssh's own failure code; anything else came from the remote command.
        if output.status.code() == Some(255) {
            return Err(ClusterError::remote(
                host,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_formatting() {
        assert_eq!(SshChannel::destination("db1", Some("postgres")), "postgres@db1");
        assert_eq!(SshChannel::destination("db1", None), "db1");
        assert_eq!(SshChannel::destination("db1", Some("")), "db1");
    }

    #[test]
    fn test_options_split() {
        let channel = SshChannel::new("-q  -o ConnectTimeout=10");
        assert_eq!(channel.options, vec!["-q", "-o", "ConnectTimeout=10"]);
    }
}
