//! Agent assembly.
//!
//! [`Agent::builder`] wires the stores, uploader, session manager, pipeline
//! and ANR watchdog from one [`AgentConfig`] and returns an owned handle.
//! There is no global instance; the host keeps the handle alive for as long
//! as it wants telemetry.
//!
//! On-disk layout under the data dir:
//!
//! ```text
//! <data_dir>/state/<key>.json   sessions, uploads, events.session_starts
//! <data_dir>/uploads/<uuid>     serialized events awaiting delivery
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rk_cache::{
    CacheError, CachePolicy, FsKeyValueStore, KeyValueStore, PersistentCache, StoreError,
};
use rk_common::{system_clock, AgentConfig, SessionId, SharedClock};
use rk_export::{
    BlobStore, ExportError, FsBlobStore, HttpTransport, HttpTransportConfig, PendingRequest,
    RetryingUploader, TransportError, UploadTransport, UploaderConfig, INDEX_CACHE_NAME,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::anr::{AnrReporter, AnrWatchdog, AnrWatchdogConfig, Heartbeat, MainContext};
use crate::jobs::JobError;
use crate::lifecycle::LifecycleBus;
use crate::logging::{event_names, Component};
use crate::pipeline::{
    EventMetadata, EventPayload, EventPipeline, EventSink, EventSource, NoopSink, PipelineConfig,
    PipelineError, SESSION_STARTS_CACHE_NAME,
};
use crate::session::{
    SessionConfig, SessionError, SessionManager, SessionRecord, SESSIONS_CACHE_NAME,
};

pub const STATE_DIR: &str = "state";
pub const UPLOADS_DIR: &str = "uploads";

/// State keys owned by the agent itself; module caches may not use them.
pub const RESERVED_CACHE_NAMES: [&str; 3] =
    [SESSIONS_CACHE_NAME, INDEX_CACHE_NAME, SESSION_STARTS_CACHE_NAME];

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] rk_common::Error),

    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("cache name {0:?} is reserved")]
    ReservedCacheName(String),
}

impl From<AgentError> for rk_common::Error {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Config(e) => e,
            AgentError::Store(e) => rk_common::Error::Storage(e.to_string()),
            AgentError::Session(e) => e.into(),
            AgentError::Pipeline(e) => e.into(),
            AgentError::Export(e) => e.into(),
            AgentError::Transport(e) => e.into(),
            AgentError::Job(e) => rk_common::Error::Io(std::io::Error::other(e.to_string())),
            AgentError::Cache(e) => e.into(),
            AgentError::ReservedCacheName(_) => rk_common::Error::Config(err.to_string()),
        }
    }
}

/// Configures and builds an [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    clock: Option<SharedClock>,
    state_store: Option<Arc<dyn KeyValueStore>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    transport: Option<Arc<dyn UploadTransport>>,
    main_context: Option<Arc<dyn MainContext>>,
    recovery_delay: Option<Duration>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            clock: None,
            state_store: None,
            blob_store: None,
            transport: None,
            main_context: None,
            recovery_delay: None,
        }
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use these stores instead of the ones under the data dir.
    pub fn stores(mut self, state: Arc<dyn KeyValueStore>, blobs: Arc<dyn BlobStore>) -> Self {
        self.state_store = Some(state);
        self.blob_store = Some(blobs);
        self
    }

    /// Use this transport instead of the HTTP one.
    pub fn transport(mut self, transport: Arc<dyn UploadTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Let the ANR watchdog schedule its heartbeat on the host's main context.
    pub fn main_context(mut self, context: Arc<dyn MainContext>) -> Self {
        self.main_context = Some(context);
        self
    }

    /// Fixed delay before recovering uploads from a previous run, instead
    /// of the randomized default.
    pub fn recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = Some(delay);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(system_clock);

        let (state, blobs) = match (self.state_store, self.blob_store) {
            (Some(state), Some(blobs)) => (state, blobs),
            _ => {
                let data_dir = config.resolve_data_dir()?;
                let state: Arc<dyn KeyValueStore> =
                    Arc::new(FsKeyValueStore::open(data_dir.join(STATE_DIR))?);
                let blobs: Arc<dyn BlobStore> =
                    Arc::new(FsBlobStore::open(data_dir.join(UPLOADS_DIR))?);
                (state, blobs)
            }
        };

        let sessions = Arc::new(SessionManager::new(
            SessionConfig::from(&config),
            state.clone(),
            clock.clone(),
        )?);

        let uploader = match UploaderConfig::from_agent_config(&config) {
            Some(uploader_config) => {
                let transport: Arc<dyn UploadTransport> = match self.transport {
                    Some(transport) => transport,
                    None => Arc::new(HttpTransport::start(
                        blobs.clone(),
                        clock.clone(),
                        HttpTransportConfig::default(),
                    )?),
                };
                let uploader = Arc::new(RetryingUploader::new(
                    uploader_config,
                    blobs,
                    state.clone(),
                    transport,
                    clock.clone(),
                )?);
                match self.recovery_delay {
                    Some(delay) => uploader.schedule_recovery_after(delay)?,
                    None => uploader.schedule_recovery()?,
                }
                Some(uploader)
            }
            None => {
                info!(
                    component = %Component::Agent,
                    event = event_names::AGENT_NOOP,
                    "no endpoint configured, events will not be exported"
                );
                None
            }
        };

        let sink: Arc<dyn EventSink> = match &uploader {
            Some(uploader) => uploader.clone(),
            None => Arc::new(NoopSink),
        };
        let pipeline = EventPipeline::new(
            PipelineConfig::from(&config),
            sessions.clone(),
            sink,
            state.clone(),
            clock.clone(),
        )?;

        let lifecycle = LifecycleBus::new();
        lifecycle.register(&sessions);
        lifecycle.register(&pipeline);

        sessions.start_refresh_job()?;
        pipeline.start()?;

        let watchdog = if config.anr_enabled {
            let reporter: Arc<dyn AnrReporter> = pipeline.clone();
            let mut watchdog = AnrWatchdog::new(AnrWatchdogConfig::from(&config), reporter);
            if let Some(context) = self.main_context {
                watchdog = watchdog.with_main_context(context);
            }
            watchdog.start()?;
            Some(watchdog)
        } else {
            None
        };

        info!(
            component = %Component::Agent,
            event = event_names::AGENT_STARTED,
            app_name = %config.app_name,
            session_id = %sessions.current_session_id(),
            exporting = uploader.is_some(),
            anr = watchdog.is_some(),
            "agent started"
        );

        Ok(Agent {
            config,
            lifecycle,
            sessions,
            pipeline,
            uploader,
            watchdog,
            state,
            clock,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Running telemetry agent.
pub struct Agent {
    config: AgentConfig,
    lifecycle: LifecycleBus,
    sessions: Arc<SessionManager>,
    pipeline: Arc<EventPipeline>,
    uploader: Option<Arc<RetryingUploader>>,
    watchdog: Option<AnrWatchdog>,
    state: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    stopped: AtomicBool,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Bus on which the host emits lifecycle signals.
    pub fn lifecycle(&self) -> &LifecycleBus {
        &self.lifecycle
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn pipeline(&self) -> &Arc<EventPipeline> {
        &self.pipeline
    }

    pub fn uploader(&self) -> Option<&Arc<RetryingUploader>> {
        self.uploader.as_ref()
    }

    pub fn is_exporting(&self) -> bool {
        self.uploader.is_some()
    }

    pub fn session_id(&self) -> SessionId {
        self.sessions.current_session_id()
    }

    pub fn current_session(&self) -> SessionRecord {
        self.sessions.current_session()
    }

    pub fn session_id_for(&self, timestamp: DateTime<Utc>) -> Option<SessionId> {
        self.sessions.session_id_for(timestamp)
    }

    pub fn publish(
        &self,
        metadata: EventMetadata,
        payload: EventPayload,
        completion: impl FnOnce(bool),
    ) {
        self.pipeline.publish(metadata, payload, completion);
    }

    pub fn publish_from(
        &self,
        source: &dyn EventSource,
        metadata: EventMetadata,
        payload: EventPayload,
    ) -> bool {
        self.pipeline.publish_from(source, metadata, payload)
    }

    /// Heartbeat handle for hosts that beat from their own main loop.
    /// `None` when ANR detection is disabled.
    pub fn heartbeat(&self) -> Option<Heartbeat> {
        self.watchdog.as_ref().map(AnrWatchdog::heartbeat)
    }

    /// Open a module cache in the agent's state store, bounded by the
    /// configured `cache_capacity` and `cache_max_lifetime_secs`.
    pub fn open_cache<T>(&self, name: &str) -> Result<PersistentCache<T>, AgentError>
    where
        T: Serialize + DeserializeOwned + Clone + PartialEq + Send,
    {
        if RESERVED_CACHE_NAMES.contains(&name) {
            return Err(AgentError::ReservedCacheName(name.to_string()));
        }
        Ok(PersistentCache::open(
            name,
            self.state.clone(),
            self.clock.clone(),
            CachePolicy::from_agent_config(&self.config),
        )?)
    }

    pub fn pending_uploads(&self) -> Vec<PendingRequest> {
        self.uploader
            .as_ref()
            .map(|u| u.pending())
            .unwrap_or_default()
    }

    pub fn entered_background(&self, at: DateTime<Utc>) {
        self.lifecycle.entered_background(at);
    }

    pub fn entered_foreground(&self) {
        self.lifecycle.entered_foreground();
    }

    pub fn will_terminate(&self) {
        self.lifecycle.will_terminate();
    }

    /// Stop every background thread. Persisted state is kept for the next
    /// run. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
        self.pipeline.stop();
        self.sessions.stop_refresh_job();
        if let Some(uploader) = &self.uploader {
            uploader.shutdown();
        }
        info!(
            component = %Component::Agent,
            event = event_names::AGENT_STOPPED,
            "agent stopped"
        );
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rk_cache::MemoryKeyValueStore;
    use rk_common::ManualClock;
    use rk_export::MemoryBlobStore;

    fn memory_builder(config: AgentConfig) -> AgentBuilder {
        Agent::builder(config).stores(
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(MemoryBlobStore::new()),
        )
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = AgentConfig {
            anr_threshold_secs: 20.0,
            ..AgentConfig::default()
        };
        assert!(matches!(
            memory_builder(config).build(),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_oversized_duration_is_rejected() {
        let config = AgentConfig {
            anr_enabled: false,
            max_session_length_secs: 1e20,
            ..AgentConfig::default()
        };
        assert!(matches!(
            memory_builder(config).build(),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_open_cache_applies_configured_bounds() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap());
        let agent = memory_builder(AgentConfig {
            anr_enabled: false,
            cache_capacity: Some(2),
            ..AgentConfig::default()
        })
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

        let cache = agent.open_cache::<u32>("breadcrumbs").unwrap();
        assert_eq!(cache.policy().capacity, Some(2));
        for (value, key) in [(1, "a"), (2, "b"), (3, "c")] {
            cache.update(value, key).unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        drop(cache);

        let reopened = agent.open_cache::<u32>("breadcrumbs").unwrap();
        assert_eq!(reopened.keys(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_open_cache_refuses_agent_keys() {
        let agent = memory_builder(AgentConfig {
            anr_enabled: false,
            ..AgentConfig::default()
        })
        .build()
        .unwrap();
        for name in RESERVED_CACHE_NAMES {
            assert!(matches!(
                agent.open_cache::<u32>(name),
                Err(AgentError::ReservedCacheName(_))
            ));
        }
    }

    #[test]
    fn test_without_endpoint_runs_noop() {
        let agent = memory_builder(AgentConfig {
            anr_enabled: false,
            ..AgentConfig::default()
        })
        .build()
        .unwrap();

        assert!(!agent.is_exporting());
        assert!(agent.heartbeat().is_none());
        let mut result = None;
        agent.publish(
            EventMetadata::new("app", "x", Utc::now()),
            EventPayload::Empty,
            |ok| result = Some(ok),
        );
        assert_eq!(result, Some(false));
        assert!(agent.pending_uploads().is_empty());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let agent = memory_builder(AgentConfig::default()).build().unwrap();
        assert!(agent.heartbeat().is_some());
        agent.shutdown();
        agent.shutdown();
        assert!(!agent.pipeline().is_pulsing());
    }

    #[test]
    fn test_will_terminate_closes_session() {
        let agent = memory_builder(AgentConfig {
            anr_enabled: false,
            ..AgentConfig::default()
        })
        .build()
        .unwrap();
        agent.will_terminate();
        assert!(agent.current_session().closed);
    }
}
