//! Lifecycle log events
//!
//! Typed names for the log events the monitor loop emits outside any
//! [`ObservationScope`](super::ObservationScope).

use std::fmt;

use super::logger::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Monitor loop entered
    MonitorStart,
    /// Monitor loop left on a stop signal
    MonitorStop,
    /// Configuration re-read on SIGHUP
    ConfigReloaded,
    /// Configuration re-read failed; previous one kept
    ConfigReloadFailed,
    /// Leader did not answer within the retry budget
    LeaderLost,
    /// A cascading upstream did not answer within the retry budget
    UpstreamLost,
    /// This node's own database did not answer
    LocalConnectionLost,
    /// Leader lost, but failover is manual
    ManualFailoverRequired,
    /// Monitor is paused; leader loss is not acted on
    MonitorPaused,
    /// Follow directive received and executed
    FollowDirectiveApplied,
    /// Monitoring sample could not be written
    SampleWriteFailed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::MonitorStart => "MONITOR_START",
            Event::MonitorStop => "MONITOR_STOP",
            Event::ConfigReloaded => "CONFIG_RELOADED",
            Event::ConfigReloadFailed => "CONFIG_RELOAD_FAILED",
            Event::LeaderLost => "LEADER_LOST",
            Event::UpstreamLost => "UPSTREAM_LOST",
            Event::LocalConnectionLost => "LOCAL_CONNECTION_LOST",
            Event::ManualFailoverRequired => "MANUAL_FAILOVER_REQUIRED",
            Event::MonitorPaused => "MONITOR_PAUSED",
            Event::FollowDirectiveApplied => "FOLLOW_DIRECTIVE_APPLIED",
            Event::SampleWriteFailed => "SAMPLE_WRITE_FAILED",
        }
    }

    /// Severity the event is logged at.
    pub fn severity(&self) -> Severity {
        match self {
            Event::LocalConnectionLost => Severity::Fatal,
            Event::LeaderLost | Event::UpstreamLost | Event::ManualFailoverRequired => {
                Severity::Error
            }
            Event::ConfigReloadFailed | Event::SampleWriteFailed => Severity::Warning,
            Event::FollowDirectiveApplied | Event::MonitorPaused => Severity::Notice,
            Event::MonitorStart | Event::MonitorStop | Event::ConfigReloaded => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_upper_snake() {
        let events = [
            Event::MonitorStart,
            Event::MonitorStop,
            Event::ConfigReloaded,
            Event::ConfigReloadFailed,
            Event::LeaderLost,
            Event::UpstreamLost,
            Event::LocalConnectionLost,
            Event::ManualFailoverRequired,
            Event::MonitorPaused,
            Event::FollowDirectiveApplied,
            Event::SampleWriteFailed,
        ];
        for event in events {
            assert!(event.as_str().chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert_eq!(Event::LocalConnectionLost.severity(), Severity::Fatal);
        assert_eq!(Event::MonitorStart.severity(), Severity::Info);
    }
}
