//! Local server control through command templates

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::control_file::ControlFileInfo;
use super::{LocalServer, StandbyConfig};
use crate::config::Config;
use crate::error::{ClusterError, ClusterResult};
use crate::observability::Logger;

const AUTO_CONF: &str = "postgresql.auto.conf";
const STANDBY_SIGNAL: &str = "standby.signal";
const MANAGED_SETTINGS: [&str; 3] = ["primary_conninfo", "primary_slot_name", "recovery_target_timeline"];

/// Runs the configured service commands and `pg_controldata`.
pub struct PgCtlServer {
    config: Config,
}

impl PgCtlServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn data_directory(&self) -> &Path {
        &self.config.data_directory
    }

    fn bin(&self, name: &str) -> PathBuf {
        match &self.config.pg_bindir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn run_template(&self, template: &str, source_conninfo: Option<&str>) -> ClusterResult<()> {
        let command = self.config.expand_command(template, source_conninfo);
        Logger::debug("LOCAL_COMMAND", &[("command", &command)]);
        let output = Command::new("sh").arg("-c").arg(&command).output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ClusterError::fatal(format!(
                "command \"{}\" failed: {}",
                command,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Quote a value for a postgresql.conf setting.
fn conf_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Replace the managed settings in postgresql.auto.conf text.
fn rewrite_auto_conf(existing: &str, standby: &StandbyConfig) -> String {
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| {
            let key = line.split('=').next().unwrap_or("").trim();
            !MANAGED_SETTINGS.contains(&key)
        })
        .map(str::to_string)
        .collect();

    let conninfo = format!(
        "{} application_name={}",
        standby.upstream_conninfo, standby.application_name
    );
    lines.push(format!("primary_conninfo = {}", conf_quote(&conninfo)));
    if let Some(slot) = &standby.slot_name {
        lines.push(format!("primary_slot_name = {}", conf_quote(slot)));
    }
    lines.push("recovery_target_timeline = 'latest'".to_string());

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

impl LocalServer for PgCtlServer {
    fn is_running(&self) -> ClusterResult<bool> {
        let status = Command::new(self.bin("pg_ctl"))
            .arg("status")
            .arg("-D")
            .arg(self.data_directory())
            .output()?
            .status;
        // pg_ctl status: 0 running, 3 not running, 4 no data directory.
        match status.code() {
            Some(0) => Ok(true),
            Some(3) => Ok(false),
            other => Err(ClusterError::fatal(format!(
                "unable to determine server status for {} (pg_ctl exit code {:?})",
                self.data_directory().display(),
                other
            ))),
        }
    }

    fn start(&self) -> ClusterResult<()> {
        self.run_template(&self.config.service_start_command, None)
    }

    fn stop(&self) -> ClusterResult<()> {
        self.run_template(&self.config.service_stop_command, None)
    }

    fn restart(&self) -> ClusterResult<()> {
        self.run_template(&self.config.service_restart_command, None)
    }

    fn promote(&self) -> ClusterResult<()> {
        self.run_template(&self.config.service_promote_command, None)
    }

    fn control_file(&self) -> ClusterResult<ControlFileInfo> {
        let output = Command::new(self.bin("pg_controldata"))
            .arg(self.data_directory())
            .env("LC_ALL", "C")
            .output()?;
        if !output.status.success() {
            return Err(ClusterError::fatal(format!(
                "pg_controldata failed for {}: {}",
                self.data_directory().display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        ControlFileInfo::parse(&String::from_utf8_lossy(&output.stdout))
    }

    fn write_standby_config(&self, standby: &StandbyConfig) -> ClusterResult<()> {
        let auto_conf = self.data_directory().join(AUTO_CONF);
        let existing = match fs::read_to_string(&auto_conf) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        fs::write(&auto_conf, rewrite_auto_conf(&existing, standby))?;
        fs::write(self.data_directory().join(STANDBY_SIGNAL), b"")?;
        Ok(())
    }

    fn rewind(&self, source_conninfo: &str) -> ClusterResult<()> {
        self.run_template(&self.config.rewind_command, Some(source_conninfo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standby(slot: Option<&str>) -> StandbyConfig {
        StandbyConfig {
            upstream_conninfo: "host=db2 dbname=walwarden".to_string(),
            slot_name: slot.map(str::to_string),
            application_name: "db1".to_string(),
        }
    }

    #[test]
    fn test_rewrite_replaces_managed_settings() {
        let existing = "work_mem = '64MB'\nprimary_conninfo = 'host=old'\nprimary_slot_name = 'x'\n";
        let text = rewrite_auto_conf(existing, &standby(Some("walwarden_slot_1")));
        assert_eq!(
            text,
            "work_mem = '64MB'\n\
             primary_conninfo = 'host=db2 dbname=walwarden application_name=db1'\n\
             primary_slot_name = 'walwarden_slot_1'\n\
             recovery_target_timeline = 'latest'\n"
        );
    }

    #[test]
    fn test_write_standby_config_creates_signal_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_node(1, "db1").unwrap();
        config.data_directory = dir.path().to_path_buf();
        let server = PgCtlServer::new(config);

        server.write_standby_config(&standby(None)).unwrap();
        assert!(dir.path().join(STANDBY_SIGNAL).exists());
        let text = fs::read_to_string(dir.path().join(AUTO_CONF)).unwrap();
        assert!(!text.contains("primary_slot_name"));
        assert!(text.contains("application_name=db1"));
    }

    #[test]
    fn test_conf_quote_escapes() {
        assert_eq!(conf_quote("it's"), "'it''s'");
    }
}
