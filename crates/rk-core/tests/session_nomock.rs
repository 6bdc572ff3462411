//! Session records on a real filesystem store, across simulated restarts.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rk_cache::{FsKeyValueStore, KeyValueStore};
use rk_common::{Clock, ManualClock, SessionId};
use rk_core::session::{SessionConfig, SessionManager};
use rk_core::{RotationReason, SessionListener, SessionRecord};
use tempfile::TempDir;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn open(dir: &TempDir, clock: &ManualClock) -> SessionManager {
    let store: Arc<dyn KeyValueStore> = Arc::new(FsKeyValueStore::open(dir.path()).unwrap());
    SessionManager::new(SessionConfig::default(), store, Arc::new(clock.clone())).unwrap()
}

#[derive(Default)]
struct Resets {
    did: Mutex<Vec<(SessionId, Option<SessionId>)>>,
}

impl SessionListener for Resets {
    fn session_did_reset(&self, new: &SessionRecord, previous: Option<&SessionId>) {
        self.did
            .lock()
            .unwrap()
            .push((new.id.clone(), previous.cloned()));
    }
}

#[test]
fn test_restart_closes_session_left_open() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(start());

    let first = open(&dir, &clock);
    let first_id = first.current_session_id();
    drop(first);

    clock.advance(Duration::minutes(10));
    let second = open(&dir, &clock);
    let second_id = second.current_session_id();
    assert_ne!(first_id, second_id);

    let records = second.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, second_id);
    assert!(!records[0].closed);
    assert_eq!(records[1].id, first_id);
    assert!(records[1].closed);
}

#[test]
fn test_terminated_session_stays_closed_after_restart() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(start());

    let first = open(&dir, &clock);
    first.will_terminate();
    drop(first);

    clock.advance(Duration::minutes(1));
    let second = open(&dir, &clock);
    let open_records: Vec<_> = second.records().into_iter().filter(|r| !r.closed).collect();
    assert_eq!(open_records.len(), 1);
    assert_eq!(open_records[0].id, second.current_session_id());
}

#[test]
fn test_attribution_across_restart() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(start());

    let first_id = open(&dir, &clock).current_session_id();
    clock.advance(Duration::minutes(20));
    let second = open(&dir, &clock);

    assert_eq!(second.session_id_for(start() + Duration::minutes(5)), Some(first_id));
    assert_eq!(
        second.session_id_for(start() + Duration::minutes(21)),
        Some(second.current_session_id())
    );
    assert_eq!(second.session_id_for(start() - Duration::seconds(1)), None);
}

#[test]
fn test_rotations_link_only_on_max_length() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(start());
    let manager = open(&dir, &clock);
    let resets = Arc::new(Resets::default());
    manager.add_listener(resets.clone());

    // Long background stay.
    manager.entered_background(clock.now());
    clock.advance(Duration::minutes(16));
    manager.entered_foreground();
    let after_background = manager.current_session_id();

    // Session outlives its max length.
    clock.advance(Duration::minutes(61));
    assert_eq!(manager.refresh(), Some(RotationReason::MaxLength));
    let after_max_length = manager.current_session_id();

    let did = resets.did.lock().unwrap();
    assert_eq!(
        *did,
        vec![
            (after_background.clone(), None),
            (after_max_length, Some(after_background)),
        ]
    );
    drop(did);

    // Three sessions written to disk, all but the current one closed.
    let reopened = open(&dir, &clock);
    let closed = reopened.records().into_iter().filter(|r| r.closed).count();
    assert_eq!(closed, 3);
}
