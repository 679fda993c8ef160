//! Check results

use std::fmt;

/// Outcome of a single check, in Nagios terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warning => "WARNING",
            CheckStatus::Critical => "CRITICAL",
            CheckStatus::Unknown => "UNKNOWN",
        }
    }

    /// Nagios plugin exit status.
    pub fn nagios_code(&self) -> i32 {
        match self {
            CheckStatus::Ok => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Critical => 2,
            CheckStatus::Unknown => 3,
        }
    }

    /// Whether the check counts as failed for the process exit code.
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckStatus::Critical | CheckStatus::Unknown)
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One check's verdict plus supporting details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Check name as given on the command line (`replication-lag`).
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub details: Vec<(String, String)>,
    /// Replaces `--status=<STATUS>` in the line format when set.
    pub status_token: Option<(String, String)>,
}

impl CheckResult {
    pub fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            details: Vec::new(),
            status_token: None,
        }
    }

    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_status_token(mut self, key: &str, value: &str) -> Self {
        self.status_token = Some((key.to_string(), value.to_string()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_statuses() {
        assert!(!CheckStatus::Ok.is_failure());
        assert!(!CheckStatus::Warning.is_failure());
        assert!(CheckStatus::Critical.is_failure());
        assert!(CheckStatus::Unknown.is_failure());
        assert_eq!(CheckStatus::Unknown.nagios_code(), 3);
    }
}
