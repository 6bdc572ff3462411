//! Event pipeline: module output in, durable uploads out.
//!
//! Modules hand the pipeline `(metadata, payload)` pairs. The pipeline
//! attributes each to the session active at its timestamp, serializes it as
//! a [`WireEvent`] and hands it to an [`EventSink`] (the retrying uploader,
//! or a no-op sink when no endpoint is configured). Completion reports
//! whether the handoff was durable, after which the module may drop its own
//! copy.
//!
//! The pipeline also emits its own events:
//! - `session.start` once per session, deduplicated by [`SessionStartGate`]
//! - `session.pulse` periodically while the app is in the foreground
//! - `app.anr` for stalls reported by the ANR watchdog

mod gate;
mod sink;
mod wire;

pub use gate::{
    SessionStartGate, SessionStartState, SESSION_STARTS_CACHE_NAME, SESSION_STARTS_CAPACITY,
};
pub use sink::{EventSink, NoopSink};
pub use wire::{AttributeValue, EventMetadata, EventPayload, WireEvent};

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rk_cache::{CacheError, KeyValueStore};
use rk_common::{AgentConfig, SessionId, SharedClock};
use rk_export::ExportError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::anr::{AnrReport, AnrReporter};
use crate::jobs::{JobError, LifecycleRepeatingJob};
use crate::lifecycle::{LifecycleObserver, LifecycleSignal};
use crate::logging::{event_names, truncate_for_log, Component};
use crate::session::{SessionListener, SessionManager, SessionRecord};

pub const SESSION_DOMAIN: &str = "session";
pub const APP_DOMAIN: &str = "app";
pub const SESSION_START_EVENT: &str = "session.start";
pub const SESSION_PULSE_EVENT: &str = "session.pulse";
pub const ANR_EVENT: &str = "app.anr";
/// Name of the pulse thread.
pub const PULSE_THREAD_NAME: &str = "rk-pulse";

const MAX_LOGGED_ERROR_LEN: usize = 256;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no endpoint configured")]
    NoEndpoint,

    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("session start store: {0}")]
    Gate(#[from] CacheError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl From<PipelineError> for rk_common::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NoEndpoint => rk_common::Error::Config(err.to_string()),
            PipelineError::Serialize(e) => rk_common::Error::Json(e),
            PipelineError::Export(e) => e.into(),
            PipelineError::Gate(e) => e.into(),
            PipelineError::Job(e) => rk_common::Error::Io(std::io::Error::other(e.to_string())),
        }
    }
}

/// A module whose published data can be deleted once handed off.
pub trait EventSource: Send + Sync {
    fn delete_data(&self, metadata: &EventMetadata) -> rk_common::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub instrumentation_scope: String,
    pub app_name: String,
    pub pulse_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for PipelineConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            instrumentation_scope: config.instrumentation_scope.clone(),
            app_name: config.app_name.clone(),
            pulse_interval: config.pulse_interval(),
        }
    }
}

pub struct EventPipeline {
    config: PipelineConfig,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn EventSink>,
    gate: SessionStartGate,
    clock: SharedClock,
    pulse: LifecycleRepeatingJob,
}

impl EventPipeline {
    /// Build the pipeline and subscribe it to session rotation.
    ///
    /// `state_store` holds the sent session-start ids.
    pub fn new(
        config: PipelineConfig,
        sessions: Arc<SessionManager>,
        sink: Arc<dyn EventSink>,
        state_store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
    ) -> Result<Arc<Self>, PipelineError> {
        let gate = SessionStartGate::open(state_store, clock.clone())?;

        let pipeline = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let pulse = LifecycleRepeatingJob::new(PULSE_THREAD_NAME, config.pulse_interval, move || {
                if let Some(pipeline) = weak.upgrade() {
                    pipeline.send_pulse();
                }
            });
            Self {
                config,
                sessions: sessions.clone(),
                sink,
                gate,
                clock,
                pulse,
            }
        });

        sessions.add_listener(Arc::new(SessionStartListener {
            pipeline: Arc::downgrade(&pipeline),
        }));
        Ok(pipeline)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn session_start_state(&self, id: &SessionId) -> SessionStartState {
        self.gate.state(id)
    }

    /// Send the start event of the current session and start pulsing.
    pub fn start(&self) -> Result<(), PipelineError> {
        self.send_session_start(None);
        self.pulse.start()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.pulse.shutdown();
    }

    pub fn is_pulsing(&self) -> bool {
        self.pulse.is_running()
    }

    /// Hand one module event to the sink. `completion` receives `true` only
    /// after a durable handoff.
    pub fn publish(
        &self,
        metadata: EventMetadata,
        payload: EventPayload,
        completion: impl FnOnce(bool),
    ) {
        let name = metadata.name.clone();
        let delivered = match self.publish_event(metadata, payload) {
            Ok(()) => true,
            Err(e) => {
                self.log_dropped(&name, &e);
                false
            }
        };
        completion(delivered);
    }

    /// [`Self::publish`], then delete the source's copy once handed off.
    pub fn publish_from(
        &self,
        source: &dyn EventSource,
        metadata: EventMetadata,
        payload: EventPayload,
    ) -> bool {
        let mut delivered = false;
        self.publish(metadata.clone(), payload, |ok| delivered = ok);
        if delivered {
            if let Err(e) = source.delete_data(&metadata) {
                warn!(
                    component = %Component::Pipeline,
                    event = event_names::DELETE_DATA_FAILED,
                    name = %metadata.name,
                    error = %truncate_for_log(&e.to_string(), MAX_LOGGED_ERROR_LEN),
                    "module failed to delete published data"
                );
            }
        }
        delivered
    }

    /// Send `session.start` for the current session unless it is already
    /// being sent or was sent.
    pub fn send_session_start(&self, previous: Option<&SessionId>) -> bool {
        let current = self.sessions.current_session();
        self.send_session_start_for(&current, previous)
    }

    fn send_session_start_for(
        &self,
        session: &SessionRecord,
        previous: Option<&SessionId>,
    ) -> bool {
        if !self.gate.try_begin(&session.id) {
            debug!(
                component = %Component::Pipeline,
                session_id = %session.id,
                "session start already sent"
            );
            return false;
        }

        let mut event = WireEvent::new(
            SESSION_DOMAIN,
            SESSION_START_EVENT,
            self.config.instrumentation_scope.as_str(),
            session.start,
        )
        .with_session(session.id.clone())
        .with_attribute("session.id", session.id.as_str());
        if let Some(previous) = previous {
            event = event.with_attribute("session.previous_id", previous.as_str());
        }

        match self.submit(&event, BTreeMap::new()) {
            Ok(()) => {
                self.gate.mark_sent(&session.id);
                info!(
                    component = %Component::Pipeline,
                    event = event_names::SESSION_START_SENT,
                    session_id = %session.id,
                    previous_session_id = previous.map(SessionId::as_str),
                    "session start sent"
                );
                true
            }
            Err(e) => {
                self.gate.revert(&session.id);
                warn!(
                    component = %Component::Pipeline,
                    event = event_names::SESSION_START_FAILED,
                    session_id = %session.id,
                    error = %truncate_for_log(&e.to_string(), MAX_LOGGED_ERROR_LEN),
                    "session start not sent"
                );
                false
            }
        }
    }

    /// Emit `session.pulse` for the session current right now.
    pub fn send_pulse(&self) -> bool {
        let session_id = self.sessions.current_session_id();
        let event = WireEvent::new(
            SESSION_DOMAIN,
            SESSION_PULSE_EVENT,
            self.config.instrumentation_scope.as_str(),
            self.clock.now(),
        )
        .with_session(session_id.clone())
        .with_attribute("session.id", session_id.as_str());

        match self.submit(&event, BTreeMap::new()) {
            Ok(()) => {
                debug!(
                    component = %Component::Pipeline,
                    event = event_names::PULSE_SENT,
                    session_id = %session_id,
                    "pulse sent"
                );
                true
            }
            Err(e) => {
                self.log_dropped(SESSION_PULSE_EVENT, &e);
                false
            }
        }
    }

    fn publish_event(
        &self,
        metadata: EventMetadata,
        payload: EventPayload,
    ) -> Result<(), PipelineError> {
        let session_id = self.sessions.session_id_for(metadata.timestamp);
        let headers = metadata.headers.clone();
        let event = WireEvent::from_module(
            metadata,
            payload,
            self.config.instrumentation_scope.as_str(),
            session_id,
        );
        self.submit(&event, headers)
    }

    fn submit(
        &self,
        event: &WireEvent,
        headers: BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        let bytes = event.to_json()?;
        self.sink.submit(&bytes, headers)?;
        debug!(
            component = %Component::Pipeline,
            event = event_names::EVENT_PUBLISHED,
            name = %event.name,
            session_id = event.session_id.as_ref().map(SessionId::as_str),
            bytes = bytes.len(),
            "event handed off"
        );
        Ok(())
    }

    fn log_dropped(&self, name: &str, error: &PipelineError) {
        if matches!(error, PipelineError::NoEndpoint) {
            debug!(
                component = %Component::Pipeline,
                event = event_names::EVENT_DROPPED,
                name,
                "no endpoint, event dropped"
            );
            return;
        }
        warn!(
            component = %Component::Pipeline,
            event = event_names::EVENT_DROPPED,
            name,
            error = %truncate_for_log(&error.to_string(), MAX_LOGGED_ERROR_LEN),
            "event dropped"
        );
    }
}

impl AnrReporter for EventPipeline {
    fn report_anr(&self, report: &AnrReport) -> rk_common::Result<()> {
        let metadata = EventMetadata::new(APP_DOMAIN, ANR_EVENT, self.clock.now())
            .with_attribute("anr.duration_ms", report.duration_ms())
            .with_attribute("anr.capped", report.capped);
        self.publish_event(metadata, EventPayload::Empty)
            .map_err(Into::into)
    }
}

impl LifecycleObserver for EventPipeline {
    fn on_lifecycle(&self, signal: LifecycleSignal) {
        self.pulse.on_lifecycle(signal);
    }
}

struct SessionStartListener {
    pipeline: Weak<EventPipeline>,
}

impl SessionListener for SessionStartListener {
    fn session_did_reset(&self, new: &SessionRecord, previous_session_id: Option<&SessionId>) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.send_session_start_for(new, previous_session_id);
        }
    }
}
