//! rumkit agent core.
//!
//! This library assembles the telemetry agent:
//! - ANR detection ([`anr`])
//! - Session identity and rotation ([`session`])
//! - Event publication, session-start dedup and pulses ([`pipeline`])
//! - Lifecycle signals and periodic jobs ([`lifecycle`], [`jobs`])
//! - Structured logging setup ([`logging`])
//!
//! [`Agent::builder`] wires everything from one [`rk_common::AgentConfig`].

pub mod agent;
pub mod anr;
pub mod jobs;
pub mod lifecycle;
pub mod logging;
pub mod pipeline;
pub mod session;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use agent::{Agent, AgentBuilder, AgentError};
pub use anr::{AnrReport, AnrReporter, AnrWatchdog, Heartbeat, MainContext};
pub use lifecycle::{LifecycleBus, LifecycleObserver, LifecycleSignal};
pub use pipeline::{EventMetadata, EventPayload, EventPipeline, EventSource, WireEvent};
pub use session::{RotationReason, SessionListener, SessionManager, SessionRecord};
