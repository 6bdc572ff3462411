//! Session identity and rotation.
//!
//! Exactly one session is active at a time. A session ends when:
//! - the app returns from a background stay longer than the session timeout
//!   (the new session is not linked to the old one)
//! - it outlives the max session length (the new session records the old
//!   one as its predecessor)
//! - the app is about to terminate (closed, not replaced)
//!
//! Records are persisted in the `sessions` cache so events created while a
//! previous session was active can still be attributed to it, and so a
//! session left open by a killed process is closed on the next start.

mod record;

pub use record::{RotationReason, SessionListener, SessionRecord};

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rk_cache::{CacheError, CachePolicy, KeyValueStore, PersistentCache};
use rk_common::{AgentConfig, SessionId, SharedClock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::jobs::{JobError, RepeatingJob};
use crate::lifecycle::{LifecycleObserver, LifecycleSignal};
use crate::logging::{event_names, Component};

/// Key of the session records in the key/value store.
pub const SESSIONS_CACHE_NAME: &str = "sessions";
/// Session records kept at most.
pub const SESSIONS_CAPACITY: usize = 100;
/// Name of the periodic refresh thread.
pub const REFRESH_THREAD_NAME: &str = "rk-session-refresh";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session store: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl From<SessionError> for rk_common::Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Cache(e) => e.into(),
            SessionError::Job(e) => rk_common::Error::Io(std::io::Error::other(e.to_string())),
        }
    }
}

/// Session timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub session_timeout: Duration,
    pub max_session_length: Duration,
    pub refresh_interval: Duration,
    /// Slack allowed for the refresh job when attributing timestamps.
    pub scheduler_leeway: Duration,
    pub retention_margin: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for SessionConfig {
    fn from(config: &AgentConfig) -> Self {
        let refresh_interval = config.session_refresh_interval();
        Self {
            session_timeout: config.session_timeout(),
            max_session_length: config.max_session_length(),
            refresh_interval,
            scheduler_leeway: refresh_interval / 10,
            retention_margin: config.session_retention_margin(),
        }
    }
}

impl SessionConfig {
    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::unbounded()
            .with_capacity(SESSIONS_CAPACITY)
            .with_max_lifetime(
                self.max_session_length
                    .checked_add(self.retention_margin)
                    .unwrap_or(Duration::MAX),
            )
    }

    /// How long after its start a session may still own a timestamp.
    fn attribution_window(&self) -> chrono::Duration {
        let window = self
            .max_session_length
            .checked_add(self.refresh_interval)
            .and_then(|d| d.checked_add(self.scheduler_leeway))
            .unwrap_or(Duration::MAX);
        chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
    }
}

struct SessionState {
    current: SessionRecord,
    entered_background: Option<DateTime<Utc>>,
    left_background: Option<DateTime<Utc>>,
}

/// Owner of the active session.
pub struct SessionManager {
    config: SessionConfig,
    records: PersistentCache<SessionRecord>,
    clock: SharedClock,
    rotation: Mutex<()>,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    refresh_job: Mutex<Option<RepeatingJob>>,
}

impl SessionManager {
    /// Restore stored records, close the one a previous run left open and
    /// start a fresh session.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
    ) -> Result<Self, SessionError> {
        let records: PersistentCache<SessionRecord> = PersistentCache::open(
            SESSIONS_CACHE_NAME,
            store,
            clock.clone(),
            config.cache_policy(),
        )?;

        let last = records
            .values()
            .into_iter()
            .max_by(|a, b| a.start.cmp(&b.start));
        if let Some(previous) = last.filter(|r| !r.closed) {
            info!(
                component = %Component::Session,
                event = event_names::SESSION_RESUMED_CLOSED,
                session_id = %previous.id,
                "closed session left open by previous run"
            );
            records.update(previous.closed(), previous.key())?;
        }

        let current = SessionRecord::open_at(clock.now());
        records.update(current.clone(), current.key())?;
        info!(
            component = %Component::Session,
            event = event_names::SESSION_CREATED,
            session_id = %current.id,
            "session created"
        );

        Ok(Self {
            config,
            records,
            clock,
            rotation: Mutex::new(()),
            state: Mutex::new(SessionState {
                current,
                entered_background: None,
                left_background: None,
            }),
            listeners: Mutex::new(Vec::new()),
            refresh_job: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn current_session_id(&self) -> SessionId {
        lock(&self.state).current.id.clone()
    }

    pub fn current_session(&self) -> SessionRecord {
        lock(&self.state).current.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Rotate if the background timeout or the max session length was hit.
    pub fn refresh(&self) -> Option<RotationReason> {
        let _rotation = lock(&self.rotation);
        let now = self.clock.now();

        let reason = {
            let mut state = lock(&self.state);
            if self.background_too_long(&state) {
                state.entered_background = None;
                state.left_background = None;
                Some(RotationReason::BackgroundTimeout)
            } else if self.session_too_long(&state.current, now) {
                Some(RotationReason::MaxLength)
            } else {
                None
            }
        };

        if let Some(reason) = reason {
            self.rotate_locked(reason, now);
        }
        reason
    }

    /// Replace the current session.
    pub fn rotate(&self, reason: RotationReason) -> SessionRecord {
        let _rotation = lock(&self.rotation);
        self.rotate_locked(reason, self.clock.now())
    }

    pub fn entered_background(&self, at: DateTime<Utc>) {
        let mut state = lock(&self.state);
        state.entered_background = Some(at);
        state.left_background = None;
    }

    /// Evaluate the background stay that just ended.
    pub fn entered_foreground(&self) {
        {
            let mut state = lock(&self.state);
            if state.entered_background.is_none() {
                return;
            }
            state.left_background = Some(self.clock.now());
        }
        self.refresh();
        let mut state = lock(&self.state);
        state.entered_background = None;
        state.left_background = None;
    }

    /// Close the current session and persist it before the process exits.
    pub fn will_terminate(&self) {
        let _rotation = lock(&self.rotation);
        let closed = {
            let mut state = lock(&self.state);
            state.current.closed = true;
            state.current.clone()
        };
        self.persist(&closed);
        info!(
            component = %Component::Session,
            event = event_names::SESSION_CLOSED,
            session_id = %closed.id,
            "session closed for termination"
        );
    }

    /// The session that was active at `timestamp`, if any is known.
    ///
    /// Picks the latest session that started before `timestamp` and accepts
    /// it only if `timestamp` falls within its max length plus refresh
    /// slack.
    pub fn session_id_for(&self, timestamp: DateTime<Utc>) -> Option<SessionId> {
        let mut records = self.records.values();
        let current = self.current_session();
        if !records.iter().any(|r| r.id == current.id) {
            records.push(current);
        }
        records.sort_by(|a, b| b.start.cmp(&a.start));

        let candidate = records.into_iter().find(|r| r.start < timestamp)?;
        let owned = candidate
            .start
            .checked_add_signed(self.config.attribution_window())
            .map_or(true, |end| end > timestamp);
        owned.then_some(candidate.id)
    }

    /// Stored records, newest first.
    pub fn records(&self) -> Vec<SessionRecord> {
        let mut records = self.records.values();
        records.sort_by(|a, b| b.start.cmp(&a.start));
        records
    }

    /// Run [`Self::refresh`] every refresh interval on a background thread.
    pub fn start_refresh_job(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut slot = lock(&self.refresh_job);
        if slot.as_ref().is_some_and(RepeatingJob::is_running) {
            return Ok(());
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let job = RepeatingJob::new(REFRESH_THREAD_NAME, self.config.refresh_interval, move || {
            if let Some(manager) = weak.upgrade() {
                manager.refresh();
            }
        });
        job.start()?;
        *slot = Some(job);
        Ok(())
    }

    pub fn stop_refresh_job(&self) {
        let job = lock(&self.refresh_job).take();
        if let Some(job) = job {
            job.stop();
        }
    }

    fn background_too_long(&self, state: &SessionState) -> bool {
        let (Some(entered), Some(left)) = (state.entered_background, state.left_background) else {
            return false;
        };
        (left - entered)
            .to_std()
            .is_ok_and(|stay| stay > self.config.session_timeout)
    }

    fn session_too_long(&self, session: &SessionRecord, now: DateTime<Utc>) -> bool {
        (now - session.start)
            .to_std()
            .is_ok_and(|age| age > self.config.max_session_length)
    }

    fn rotate_locked(&self, reason: RotationReason, now: DateTime<Utc>) -> SessionRecord {
        let listeners: Vec<Arc<dyn SessionListener>> = lock(&self.listeners).clone();
        let previous = self.current_session();
        for listener in &listeners {
            listener.session_will_reset(&previous);
        }

        let next = SessionRecord::open_at(now);
        {
            let mut state = lock(&self.state);
            state.current = next.clone();
        }
        self.persist(&previous.closed());
        self.persist(&next);

        info!(
            component = %Component::Session,
            event = event_names::SESSION_ROTATED,
            reason = %reason,
            previous_session_id = %previous.id,
            session_id = %next.id,
            "session rotated"
        );

        let previous_id = reason.links_previous().then_some(&previous.id);
        for listener in &listeners {
            listener.session_did_reset(&next, previous_id);
        }
        next
    }

    fn persist(&self, record: &SessionRecord) {
        match self.records.update(record.clone(), record.key()) {
            Ok(_) => debug!(
                component = %Component::Session,
                session_id = %record.id,
                closed = record.closed,
                "session record stored"
            ),
            Err(e) => warn!(
                component = %Component::Session,
                event = event_names::SESSION_PERSIST_FAILED,
                session_id = %record.id,
                error = %e,
                "failed to persist session record"
            ),
        }
    }
}

impl LifecycleObserver for SessionManager {
    fn on_lifecycle(&self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::EnteredBackground { at } => self.entered_background(at),
            LifecycleSignal::EnteredForeground => self.entered_foreground(),
            LifecycleSignal::WillTerminate => self.will_terminate(),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_refresh_job();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rk_cache::MemoryKeyValueStore;
    use rk_common::{Clock, ManualClock};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn manager_with(store: Arc<MemoryKeyValueStore>, clock: &ManualClock) -> SessionManager {
        SessionManager::new(SessionConfig::default(), store, Arc::new(clock.clone())).unwrap()
    }

    #[derive(Default)]
    struct Resets {
        will: Mutex<Vec<SessionId>>,
        did: Mutex<Vec<(SessionId, Option<SessionId>)>>,
    }

    impl SessionListener for Resets {
        fn session_will_reset(&self, current: &SessionRecord) {
            self.will.lock().unwrap().push(current.id.clone());
        }

        fn session_did_reset(&self, new: &SessionRecord, previous: Option<&SessionId>) {
            self.did
                .lock()
                .unwrap()
                .push((new.id.clone(), previous.cloned()));
        }
    }

    #[test]
    fn test_unbounded_lengths_do_not_overflow() {
        let clock = ManualClock::new(start());
        let config = SessionConfig {
            max_session_length: Duration::MAX,
            retention_margin: Duration::MAX,
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(
            config,
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(clock.clone()),
        )
        .unwrap();
        let id = manager.current_session_id();

        clock.advance(chrono::Duration::days(365 * 50));
        assert_eq!(manager.refresh(), None);
        assert_eq!(manager.session_id_for(clock.now()), Some(id));
    }

    #[test]
    fn test_new_creates_and_persists_session() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryKeyValueStore::new());
        let manager = manager_with(store, &clock);

        let current = manager.current_session();
        assert_eq!(current.start, start());
        assert!(!current.closed);
        assert_eq!(manager.records(), vec![current]);
    }

    #[test]
    fn test_restart_closes_previous_open_session() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryKeyValueStore::new());
        let first = manager_with(store.clone(), &clock).current_session_id();

        clock.advance(chrono::Duration::minutes(5));
        let manager = manager_with(store, &clock);

        let records = manager.records();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].id, first);
        assert!(!records[0].closed);
        assert_eq!(records[1].id, first);
        assert!(records[1].closed);
    }

    #[test]
    fn test_refresh_without_trigger_keeps_session() {
        let clock = ManualClock::new(start());
        let manager = manager_with(Arc::new(MemoryKeyValueStore::new()), &clock);
        let id = manager.current_session_id();

        clock.advance(chrono::Duration::minutes(59));
        assert_eq!(manager.refresh(), None);
        assert_eq!(manager.current_session_id(), id);
    }

    #[test]
    fn test_max_length_rotation_links_previous() {
        let clock = ManualClock::new(start());
        let manager = manager_with(Arc::new(MemoryKeyValueStore::new()), &clock);
        let resets = Arc::new(Resets::default());
        manager.add_listener(resets.clone());
        let first = manager.current_session_id();

        clock.advance(chrono::Duration::minutes(61));
        assert_eq!(manager.refresh(), Some(RotationReason::MaxLength));

        let second = manager.current_session_id();
        assert_ne!(first, second);
        assert_eq!(*resets.will.lock().unwrap(), vec![first.clone()]);
        assert_eq!(*resets.did.lock().unwrap(), vec![(second, Some(first))]);
    }

    #[test]
    fn test_background_timeout_rotation_has_no_predecessor() {
        let clock = ManualClock::new(start());
        let manager = manager_with(Arc::new(MemoryKeyValueStore::new()), &clock);
        let resets = Arc::new(Resets::default());
        manager.add_listener(resets.clone());
        let first = manager.current_session_id();

        manager.entered_background(clock.now());
        clock.advance(chrono::Duration::minutes(16));
        manager.entered_foreground();

        let second = manager.current_session_id();
        assert_ne!(first, second);
        assert_eq!(*resets.did.lock().unwrap(), vec![(second, None)]);
    }

    #[test]
    fn test_short_background_stay_keeps_session() {
        let clock = ManualClock::new(start());
        let manager = manager_with(Arc::new(MemoryKeyValueStore::new()), &clock);
        let first = manager.current_session_id();

        manager.entered_background(clock.now());
        clock.advance(chrono::Duration::minutes(14));
        manager.entered_foreground();
        assert_eq!(manager.current_session_id(), first);

        // The stay is forgotten once evaluated.
        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(manager.refresh(), None);
    }

    #[test]
    fn test_foreground_without_background_is_ignored() {
        let clock = ManualClock::new(start());
        let manager = manager_with(Arc::new(MemoryKeyValueStore::new()), &clock);
        let first = manager.current_session_id();
        clock.advance(chrono::Duration::minutes(30));
        manager.entered_foreground();
        assert_eq!(manager.current_session_id(), first);
    }

    #[test]
    fn test_will_terminate_closes_and_persists() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryKeyValueStore::new());
        let manager = manager_with(store.clone(), &clock);
        let id = manager.current_session_id();

        manager.on_lifecycle(LifecycleSignal::WillTerminate);
        assert!(manager.current_session().closed);

        let reopened: PersistentCache<SessionRecord> = PersistentCache::open(
            SESSIONS_CACHE_NAME,
            store,
            Arc::new(clock.clone()),
            CachePolicy::unbounded(),
        )
        .unwrap();
        assert!(reopened.value_for_key(id.as_str()).unwrap().closed);
    }

    #[test]
    fn test_session_id_for_attributes_timestamps() {
        let clock = ManualClock::new(start());
        let manager = manager_with(Arc::new(MemoryKeyValueStore::new()), &clock);
        let first = manager.current_session_id();

        clock.advance(chrono::Duration::minutes(30));
        let second = manager.rotate(RotationReason::MaxLength).id;

        // Before any session.
        assert_eq!(manager.session_id_for(start() - chrono::Duration::seconds(1)), None);
        // A session does not own its exact start instant.
        assert_eq!(manager.session_id_for(start()), None);
        assert_eq!(
            manager.session_id_for(start() + chrono::Duration::minutes(10)),
            Some(first)
        );
        assert_eq!(
            manager.session_id_for(start() + chrono::Duration::minutes(31)),
            Some(second.clone())
        );
        // Beyond max length plus refresh slack of the latest session.
        let late = start() + chrono::Duration::minutes(30 + 60) + chrono::Duration::seconds(2);
        assert_eq!(manager.session_id_for(late), None);
        let edge = start() + chrono::Duration::minutes(30 + 60) + chrono::Duration::seconds(1);
        assert_eq!(manager.session_id_for(edge), Some(second));
    }

    #[test]
    fn test_persist_failure_keeps_in_memory_session() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryKeyValueStore::new());
        let manager = manager_with(store.clone(), &clock);

        store.set_fail_writes(true);
        clock.advance(chrono::Duration::minutes(61));
        assert_eq!(manager.refresh(), Some(RotationReason::MaxLength));
        let current = manager.current_session_id();
        assert_eq!(
            manager.session_id_for(clock.now() + chrono::Duration::seconds(1)),
            Some(current)
        );
    }

    #[test]
    fn test_refresh_job_rotates_in_background() {
        let clock = ManualClock::new(start());
        let config = SessionConfig {
            refresh_interval: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let manager = Arc::new(
            SessionManager::new(
                config,
                Arc::new(MemoryKeyValueStore::new()),
                Arc::new(clock.clone()),
            )
            .unwrap(),
        );
        let first = manager.current_session_id();
        manager.start_refresh_job().unwrap();

        clock.advance(chrono::Duration::minutes(61));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.current_session_id() == first && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.stop_refresh_job();
        assert_ne!(manager.current_session_id(), first);
    }
}
