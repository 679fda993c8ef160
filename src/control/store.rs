//! Control state storage backends
//!
//! The file backend writes atomically (temp file, fsync, rename) and guards
//! the payload with a CRC32, so remote tooling can read it at any time
//! without taking a lock.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::state::ControlRecord;
use crate::error::{ClusterError, ClusterResult};

const STATE_FILE_NAME: &str = "walwarden.state";

/// Storage for one node's control record.
pub trait ControlStore: Send + Sync {
    /// Current record; the default record if nothing was stored yet.
    fn load(&self) -> ClusterResult<ControlRecord>;

    /// Replace the stored record.
    fn store(&self, record: &ControlRecord) -> ClusterResult<()>;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryControlStore {
    record: Mutex<ControlRecord>,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControlStore for MemoryControlStore {
    fn load(&self) -> ClusterResult<ControlRecord> {
        Ok(self
            .record
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone())
    }

    fn store(&self, record: &ControlRecord) -> ClusterResult<()> {
        *self.record.lock().unwrap_or_else(|p| p.into_inner()) = record.clone();
        Ok(())
    }
}

/// File backend: `<state_directory>/walwarden.state`.
///
/// Layout: first line is the CRC32 of the JSON payload in hex, second line
/// the payload.
#[derive(Debug)]
pub struct FileControlStore {
    path: PathBuf,
    temp_path: PathBuf,
}

impl FileControlStore {
    pub fn new(state_directory: &Path) -> Self {
        Self {
            path: state_directory.join(STATE_FILE_NAME),
            temp_path: state_directory.join(format!("{}.tmp", STATE_FILE_NAME)),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ControlStore for FileControlStore {
    fn load(&self) -> ClusterResult<ControlRecord> {
        if !self.path.exists() {
            return Ok(ControlRecord::default());
        }
        let content = fs::read_to_string(&self.path)?;
        let (checksum, payload) = content.split_once('\n').ok_or_else(|| {
            ClusterError::fatal(format!("control state file {} is truncated", self.path.display()))
        })?;
        let payload = payload.trim_end();
        let expected = u32::from_str_radix(checksum.trim(), 16).map_err(|_| {
            ClusterError::fatal(format!(
                "control state file {} has an invalid checksum header",
                self.path.display()
            ))
        })?;
        if crc32fast::hash(payload.as_bytes()) != expected {
            return Err(ClusterError::fatal(format!(
                "control state file {} failed checksum verification",
                self.path.display()
            )));
        }
        Ok(serde_json::from_str(payload)?)
    }

    fn store(&self, record: &ControlRecord) -> ClusterResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string(record)?;
        let checksum = crc32fast::hash(payload.as_bytes());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)?;
        write!(file, "{:08x}\n{}\n", checksum, payload)?;
        file.sync_all()?;
        fs::rename(&self.temp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}
