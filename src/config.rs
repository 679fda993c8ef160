//! Node configuration
//!
//! A single JSON file per node. Every optional key has a default; the file
//! is rejected as a whole if any value is out of range.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::observability::Severity;
use crate::registry::NodeId;

/// What the monitor does when it loses its leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    #[default]
    Automatic,
    Manual,
}

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: NodeId,
    pub node_name: String,
    /// Connection target of this node's database
    pub conninfo: String,

    /// Host other nodes log into (defaults to `node_name`)
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default = "default_ssh_options")]
    pub ssh_options: String,

    pub data_directory: PathBuf,
    /// Where the control state lives (defaults to `data_directory`)
    #[serde(default)]
    pub state_directory: Option<PathBuf>,

    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub failover: FailoverMode,
    #[serde(default)]
    pub use_replication_slots: bool,

    // --- Monitoring ---
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default)]
    pub monitoring_history: bool,

    // --- Voting ---
    #[serde(default = "default_election_timeout")]
    pub election_timeout_secs: u64,
    #[serde(default = "default_sibling_poll_interval")]
    pub sibling_poll_interval_secs: u64,
    #[serde(default = "default_follow_wait_timeout")]
    pub follow_wait_timeout_secs: u64,

    // --- Switchover / promote / rejoin ---
    #[serde(default = "default_promote_check_timeout")]
    pub promote_check_timeout_secs: u64,
    #[serde(default = "default_promote_check_interval")]
    pub promote_check_interval_secs: u64,
    #[serde(default = "default_shutdown_check_timeout")]
    pub shutdown_check_timeout_secs: u64,
    #[serde(default = "default_wal_receive_check_timeout")]
    pub wal_receive_check_timeout_secs: u64,
    #[serde(default = "default_standby_reconnect_timeout")]
    pub standby_reconnect_timeout_secs: u64,
    #[serde(default = "default_node_rejoin_timeout")]
    pub node_rejoin_timeout_secs: u64,

    // --- Check thresholds ---
    #[serde(default = "default_lag_warning")]
    pub replication_lag_warning_secs: u64,
    #[serde(default = "default_lag_critical")]
    pub replication_lag_critical_secs: u64,
    #[serde(default = "default_archive_ready_warning")]
    pub archive_ready_warning: u64,
    #[serde(default = "default_archive_ready_critical")]
    pub archive_ready_critical: u64,

    // --- Command templates ---
    #[serde(default)]
    pub pg_bindir: Option<PathBuf>,
    #[serde(default = "default_start_command")]
    pub service_start_command: String,
    #[serde(default = "default_stop_command")]
    pub service_stop_command: String,
    #[serde(default = "default_restart_command")]
    pub service_restart_command: String,
    #[serde(default = "default_promote_command")]
    pub service_promote_command: String,
    #[serde(default = "default_rewind_command")]
    pub rewind_command: String,

    // --- Remote invocation ---
    #[serde(default = "default_remote_binary")]
    pub remote_binary: String,
    #[serde(default)]
    pub remote_config_file: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_ssh_options() -> String {
    "-q -o ConnectTimeout=10".to_string()
}
fn default_priority() -> u32 {
    100
}
fn default_monitor_interval() -> u64 {
    2
}
fn default_reconnect_attempts() -> u32 {
    6
}
fn default_reconnect_interval() -> u64 {
    10
}
fn default_election_timeout() -> u64 {
    60
}
fn default_sibling_poll_interval() -> u64 {
    1
}
fn default_follow_wait_timeout() -> u64 {
    30
}
fn default_promote_check_timeout() -> u64 {
    60
}
fn default_promote_check_interval() -> u64 {
    1
}
fn default_shutdown_check_timeout() -> u64 {
    60
}
fn default_wal_receive_check_timeout() -> u64 {
    30
}
fn default_standby_reconnect_timeout() -> u64 {
    60
}
fn default_node_rejoin_timeout() -> u64 {
    60
}
fn default_lag_warning() -> u64 {
    300
}
fn default_lag_critical() -> u64 {
    600
}
fn default_archive_ready_warning() -> u64 {
    16
}
fn default_archive_ready_critical() -> u64 {
    128
}
fn default_start_command() -> String {
    "{bindir}pg_ctl -w -D {data_directory} start".to_string()
}
fn default_stop_command() -> String {
    "{bindir}pg_ctl -w -D {data_directory} -m fast stop".to_string()
}
fn default_restart_command() -> String {
    "{bindir}pg_ctl -w -D {data_directory} -m fast restart".to_string()
}
fn default_promote_command() -> String {
    "{bindir}pg_ctl -w -D {data_directory} promote".to_string()
}
fn default_rewind_command() -> String {
    "{bindir}pg_rewind -D {data_directory} --source-server='{source_conninfo}'".to_string()
}
fn default_remote_binary() -> String {
    "walwarden".to_string()
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Config {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> ClusterResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ClusterError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration text
    pub fn from_json(content: &str) -> ClusterResult<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| ClusterError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.node_id.0 == 0 {
            return Err(ClusterError::config("node_id must be > 0"));
        }
        if self.node_name.trim().is_empty() {
            return Err(ClusterError::config("node_name must not be empty"));
        }
        if self.conninfo.trim().is_empty() {
            return Err(ClusterError::config("conninfo must not be empty"));
        }
        if self.replication_lag_warning_secs >= self.replication_lag_critical_secs {
            return Err(ClusterError::config(format!(
                "replication_lag_warning_secs ({}) must be below replication_lag_critical_secs ({})",
                self.replication_lag_warning_secs, self.replication_lag_critical_secs
            )));
        }
        if self.archive_ready_warning >= self.archive_ready_critical {
            return Err(ClusterError::config(format!(
                "archive_ready_warning ({}) must be below archive_ready_critical ({})",
                self.archive_ready_warning, self.archive_ready_critical
            )));
        }
        if self.reconnect_attempts == 0 {
            return Err(ClusterError::config("reconnect_attempts must be >= 1"));
        }

        let durations = [
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("reconnect_interval_secs", self.reconnect_interval_secs),
            ("election_timeout_secs", self.election_timeout_secs),
            ("sibling_poll_interval_secs", self.sibling_poll_interval_secs),
            ("follow_wait_timeout_secs", self.follow_wait_timeout_secs),
            ("promote_check_timeout_secs", self.promote_check_timeout_secs),
            ("promote_check_interval_secs", self.promote_check_interval_secs),
            ("shutdown_check_timeout_secs", self.shutdown_check_timeout_secs),
            ("wal_receive_check_timeout_secs", self.wal_receive_check_timeout_secs),
            ("standby_reconnect_timeout_secs", self.standby_reconnect_timeout_secs),
            ("node_rejoin_timeout_secs", self.node_rejoin_timeout_secs),
        ];
        for (key, value) in durations {
            if value == 0 {
                return Err(ClusterError::config(format!("{} must be > 0", key)));
            }
        }

        Severity::parse(&self.log_level).ok_or_else(|| {
            ClusterError::config(format!("unknown log_level \"{}\"", self.log_level))
        })?;
        Ok(())
    }

    /// Host name other nodes use to reach this node.
    pub fn ssh_target(&self) -> &str {
        self.ssh_host.as_deref().unwrap_or(&self.node_name)
    }

    pub fn state_directory(&self) -> &Path {
        self.state_directory
            .as_deref()
            .unwrap_or(&self.data_directory)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_secs(self.election_timeout_secs)
    }

    pub fn sibling_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sibling_poll_interval_secs)
    }

    pub fn follow_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.follow_wait_timeout_secs)
    }

    pub fn promote_check_timeout(&self) -> Duration {
        Duration::from_secs(self.promote_check_timeout_secs)
    }

    pub fn promote_check_interval(&self) -> Duration {
        Duration::from_secs(self.promote_check_interval_secs)
    }

    pub fn shutdown_check_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_check_timeout_secs)
    }

    pub fn wal_receive_check_timeout(&self) -> Duration {
        Duration::from_secs(self.wal_receive_check_timeout_secs)
    }

    pub fn standby_reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.standby_reconnect_timeout_secs)
    }

    pub fn node_rejoin_timeout(&self) -> Duration {
        Duration::from_secs(self.node_rejoin_timeout_secs)
    }

    /// Expand `{data_directory}`, `{bindir}` and `{source_conninfo}` in a
    /// command template.
    pub fn expand_command(&self, template: &str, source_conninfo: Option<&str>) -> String {
        let bindir = match &self.pg_bindir {
            Some(dir) => {
                let mut s = dir.display().to_string();
                if !s.ends_with('/') {
                    s.push('/');
                }
                s
            }
            None => String::new(),
        };
        template
            .replace("{data_directory}", &self.data_directory.display().to_string())
            .replace("{bindir}", &bindir)
            .replace("{source_conninfo}", source_conninfo.unwrap_or(""))
    }

    /// A valid configuration for `node_id`, used by tests and the simulation.
    pub fn for_node(node_id: u32, name: &str) -> ClusterResult<Self> {
        let minimal = serde_json::json!({
            "node_id": node_id,
            "node_name": name,
            "conninfo": format!("host={} dbname=walwarden", name),
            "data_directory": format!("/var/lib/walwarden/{}", name),
        });
        Ok(serde_json::from_value(minimal)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "node_id": 1,
        "node_name": "db1",
        "conninfo": "host=db1 dbname=walwarden",
        "data_directory": "/var/lib/pgsql/data"
    }"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.failover, FailoverMode::Automatic);
        assert_eq!(config.reconnect_attempts, 6);
        assert_eq!(config.ssh_target(), "db1");
        assert_eq!(config.state_directory(), Path::new("/var/lib/pgsql/data"));
        assert!(!config.use_replication_slots);
    }

    #[test]
    fn test_rejects_inverted_lag_thresholds() {
        let mut config = Config::from_json(MINIMAL).unwrap();
        config.replication_lag_warning_secs = 600;
        config.replication_lag_critical_secs = 600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("replication_lag_warning_secs"));
    }

    #[test]
    fn test_rejects_zero_timeouts_and_ids() {
        let mut config = Config::from_json(MINIMAL).unwrap();
        config.shutdown_check_timeout_secs = 0;
        assert!(config.validate().is_err());

        let err = Config::from_json(&MINIMAL.replace("\"node_id\": 1", "\"node_id\": 0")).unwrap_err();
        assert!(err.to_string().contains("node_id"));
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let mut config = Config::from_json(MINIMAL).unwrap();
        config.log_level = "LOUD".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_failover_mode_parsing() {
        let text = MINIMAL.replace("\"node_id\": 1,", "\"node_id\": 1, \"failover\": \"manual\",");
        let config = Config::from_json(&text).unwrap();
        assert_eq!(config.failover, FailoverMode::Manual);
    }

    #[test]
    fn test_expand_command() {
        let mut config = Config::from_json(MINIMAL).unwrap();
        config.pg_bindir = Some(PathBuf::from("/usr/pgsql/bin"));
        assert_eq!(
            config.expand_command(&config.service_start_command, None),
            "/usr/pgsql/bin/pg_ctl -w -D /var/lib/pgsql/data start"
        );
        assert_eq!(
            config.expand_command(&config.rewind_command, Some("host=db2")),
            "/usr/pgsql/bin/pg_rewind -D /var/lib/pgsql/data --source-server='host=db2'"
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/walwarden.json")).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Configuration);
    }
}
