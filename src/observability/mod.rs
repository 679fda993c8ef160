//! Observability subsystem
//!
//! - Structured logging (JSON lines on stderr)
//! - Typed lifecycle events for the monitor loop
//! - Scope-based begin/complete/failed logging for phases and elections
//!
//! Observability is read-only: nothing here changes control flow, and a
//! failed log write never fails the caller.
//!
//! ```ignore
//! use walwarden::observability::{log_event, Event, Logger, ObservationScope};
//!
//! Logger::notice("NODE_PROMOTED", &[("node_id", "2")]);
//! log_event(Event::LeaderLost, &[("leader_id", "1")]);
//!
//! let scope = ObservationScope::new("ELECTION");
//! // ... do work ...
//! scope.complete();
//! ```

mod events;
mod logger;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use scope::ObservationScope;

/// Log a lifecycle event at its own severity.
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::MonitorStart, &[("node_id", "1")]);
        log_event(Event::LocalConnectionLost, &[]);
    }
}
