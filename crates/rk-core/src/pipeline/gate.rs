//! One `session.start` per session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use rk_cache::{CacheError, CachePolicy, KeyValueStore, PersistentCache};
use rk_common::{SessionId, SharedClock};
use tracing::warn;

use crate::logging::Component;

/// Key of the sent-ids set in the key/value store.
pub const SESSION_STARTS_CACHE_NAME: &str = "events.session_starts";
/// Sent ids remembered at most.
pub const SESSION_STARTS_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStartState {
    NotSent,
    Sending,
    Sent,
}

/// Tracks which sessions already had their start event handed off.
///
/// `Sending` lives in memory only; `Sent` is persisted so a restart does
/// not repeat a start event.
pub struct SessionStartGate {
    sending: Mutex<HashSet<SessionId>>,
    sent: PersistentCache<bool>,
}

impl SessionStartGate {
    pub fn open(store: Arc<dyn KeyValueStore>, clock: SharedClock) -> Result<Self, CacheError> {
        let sent = PersistentCache::open(
            SESSION_STARTS_CACHE_NAME,
            store,
            clock,
            CachePolicy::unbounded().with_capacity(SESSION_STARTS_CAPACITY),
        )?;
        Ok(Self {
            sending: Mutex::new(HashSet::new()),
            sent,
        })
    }

    pub fn state(&self, id: &SessionId) -> SessionStartState {
        let sending = self.lock_sending();
        if self.sent.value_for_key(id.as_str()).is_some() {
            SessionStartState::Sent
        } else if sending.contains(id) {
            SessionStartState::Sending
        } else {
            SessionStartState::NotSent
        }
    }

    /// `NotSent → Sending`. Returns `false` in any other state.
    pub fn try_begin(&self, id: &SessionId) -> bool {
        let mut sending = self.lock_sending();
        if self.sent.value_for_key(id.as_str()).is_some() || sending.contains(id) {
            return false;
        }
        sending.insert(id.clone());
        true
    }

    /// `Sending → Sent`.
    pub fn mark_sent(&self, id: &SessionId) {
        let mut sending = self.lock_sending();
        let stored = self
            .sent
            .update(true, id.as_str())
            .and_then(|_| self.sent.purge().map(|_| ()));
        if let Err(e) = stored {
            warn!(
                component = %Component::Pipeline,
                session_id = %id,
                error = %e,
                "failed to persist sent session start"
            );
        }
        sending.remove(id);
    }

    /// `Sending → NotSent`, allowing another attempt.
    pub fn revert(&self, id: &SessionId) {
        self.lock_sending().remove(id);
    }

    fn lock_sending(&self) -> MutexGuard<'_, HashSet<SessionId>> {
        match self.sending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_cache::MemoryKeyValueStore;
    use rk_common::system_clock;

    #[test]
    fn test_state_transitions() {
        let gate = SessionStartGate::open(Arc::new(MemoryKeyValueStore::new()), system_clock()).unwrap();
        let id = SessionId::new();

        assert_eq!(gate.state(&id), SessionStartState::NotSent);
        assert!(gate.try_begin(&id));
        assert_eq!(gate.state(&id), SessionStartState::Sending);
        assert!(!gate.try_begin(&id));

        gate.revert(&id);
        assert_eq!(gate.state(&id), SessionStartState::NotSent);

        assert!(gate.try_begin(&id));
        gate.mark_sent(&id);
        assert_eq!(gate.state(&id), SessionStartState::Sent);
        assert!(!gate.try_begin(&id));
    }

    #[test]
    fn test_sent_survives_reopen() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let id = SessionId::new();
        {
            let gate = SessionStartGate::open(store.clone(), system_clock()).unwrap();
            assert!(gate.try_begin(&id));
            gate.mark_sent(&id);
        }
        let gate = SessionStartGate::open(store, system_clock()).unwrap();
        assert_eq!(gate.state(&id), SessionStartState::Sent);
    }

    #[test]
    fn test_sent_ids_are_bounded() {
        let gate = SessionStartGate::open(Arc::new(MemoryKeyValueStore::new()), system_clock()).unwrap();
        for _ in 0..SESSION_STARTS_CAPACITY + 5 {
            let id = SessionId::new();
            assert!(gate.try_begin(&id));
            gate.mark_sent(&id);
        }
        assert_eq!(gate.sent.len(), SESSION_STARTS_CAPACITY);
    }
}
