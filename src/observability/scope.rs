//! ObservationScope for phase and election logging
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` on `complete()`
//! - Logs `{name}_FAILED` on `fail()` or when dropped unfinished

use std::time::Instant;

use super::logger::{Logger, Severity};
use crate::error::ClusterError;

/// A scope that logs the start and end of one unit of work
///
/// ```ignore
/// let scope = ObservationScope::with_fields("SWITCHOVER_PREFLIGHT", &[("candidate", "2")]);
/// // ... do work ...
/// scope.complete();
/// ```
pub struct ObservationScope {
    name: String,
    fields: Vec<(String, String)>,
    started: Instant,
    finished: bool,
}

impl ObservationScope {
    pub fn new(name: &str) -> Self {
        Self::with_fields(name, &[])
    }

    pub fn with_fields(name: &str, fields: &[(&str, &str)]) -> Self {
        Logger::info(&format!("{}_BEGIN", name), fields);
        Self {
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn emit(&mut self, severity: Severity, suffix: &str, extra: &[(&str, &str)]) {
        self.finished = true;
        let elapsed = self.started.elapsed().as_millis().to_string();
        let mut fields: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        fields.extend_from_slice(extra);
        fields.push(("elapsed_ms", &elapsed));
        Logger::log(severity, &format!("{}_{}", self.name, suffix), &fields);
    }

    /// Logs `{name}_COMPLETE`.
    pub fn complete(mut self) {
        self.emit(Severity::Info, "COMPLETE", &[]);
    }

    pub fn complete_with_fields(mut self, extra: &[(&str, &str)]) {
        self.emit(Severity::Info, "COMPLETE", extra);
    }

    /// Logs `{name}_FAILED` with the error, its class and hint.
    pub fn fail(mut self, err: &ClusterError) {
        let detail = err.to_string();
        let class = err.class().as_str();
        let mut extra = vec![("detail", detail.as_str()), ("class", class)];
        if let Some(hint) = err.hint() {
            extra.push(("hint", hint));
        }
        self.emit(Severity::Error, "FAILED", &extra);
    }

    /// Finish with the outcome of `result`.
    pub fn finish<T>(self, result: &Result<T, ClusterError>) {
        match result {
            Ok(_) => self.complete(),
            Err(err) => self.fail(err),
        }
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.finished {
            self.emit(
                Severity::Warning,
                "FAILED",
                &[("detail", "scope dropped without completion")],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_complete() {
        let scope = ObservationScope::with_fields("TEST", &[("key", "value")]);
        assert!(!scope.finished);
        scope.complete();
    }

    #[test]
    fn test_scope_finish_with_error() {
        let scope = ObservationScope::new("TEST");
        let result: Result<(), _> = Err(ClusterError::fatal("boom"));
        scope.finish(&result);
    }

    #[test]
    fn test_scope_drop_without_complete() {
        let scope = ObservationScope::new("TEST");
        drop(scope);
    }
}
