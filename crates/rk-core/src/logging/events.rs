//! Stable names for agent log events.
//!
//! Every structured log line emitted by rk-core carries an `event` field
//! from [`event_names`] and a `component` field from [`Component`], so
//! JSONL output can be filtered without parsing messages.

use serde::{Deserialize, Serialize};

/// Agent components, used as the `component` log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Agent,
    Anr,
    Session,
    Pipeline,
    Jobs,
    Lifecycle,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Component::Agent => "agent",
            Component::Anr => "anr",
            Component::Session => "session",
            Component::Pipeline => "pipeline",
            Component::Jobs => "jobs",
            Component::Lifecycle => "lifecycle",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Agent lifecycle
    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_STOPPED: &str = "agent.stopped";
    pub const AGENT_NOOP: &str = "agent.noop";

    // ANR
    pub const ANR_WATCHDOG_STARTED: &str = "anr.watchdog_started";
    pub const ANR_WATCHDOG_STOPPED: &str = "anr.watchdog_stopped";
    pub const ANR_DETECTED: &str = "anr.detected";
    pub const ANR_REPORT_FAILED: &str = "anr.report_failed";

    // Session
    pub const SESSION_CREATED: &str = "session.created";
    pub const SESSION_RESUMED_CLOSED: &str = "session.resumed_closed";
    pub const SESSION_ROTATED: &str = "session.rotated";
    pub const SESSION_CLOSED: &str = "session.closed";
    pub const SESSION_PERSIST_FAILED: &str = "session.persist_failed";

    // Pipeline
    pub const EVENT_PUBLISHED: &str = "pipeline.published";
    pub const EVENT_DROPPED: &str = "pipeline.dropped";
    pub const SESSION_START_SENT: &str = "pipeline.session_start_sent";
    pub const SESSION_START_FAILED: &str = "pipeline.session_start_failed";
    pub const PULSE_SENT: &str = "pipeline.pulse";
    pub const DELETE_DATA_FAILED: &str = "pipeline.delete_data_failed";

    // Jobs
    pub const JOB_STARTED: &str = "jobs.started";
    pub const JOB_STOPPED: &str = "jobs.stopped";
    pub const JOB_SUSPENDED: &str = "jobs.suspended";
    pub const JOB_RESUMED: &str = "jobs.resumed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_serialization() {
        assert_eq!(serde_json::to_string(&Component::Anr).unwrap(), "\"anr\"");
        assert_eq!(Component::Session.to_string(), "session");
    }

    #[test]
    fn test_event_names_are_namespaced() {
        for name in [
            event_names::AGENT_STARTED,
            event_names::ANR_DETECTED,
            event_names::SESSION_ROTATED,
            event_names::PULSE_SENT,
            event_names::JOB_SUSPENDED,
        ] {
            assert!(name.contains('.'), "{name} has no namespace");
        }
    }
}
