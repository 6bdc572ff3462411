//! Durable description of one queued upload.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of delivery attempts before an upload is dropped.
pub const DEFAULT_RETRY_CEILING: u32 = 5;

/// Delay before the next attempt, given how many attempts were already made.
///
/// | sent_count | delay  |
/// |------------|--------|
/// | 0          | none   |
/// | 1          | 1 min  |
/// | 2          | 10 min |
/// | 3          | 30 min |
/// | 4          | 1 h    |
/// | 5+         | 1 day  |
pub fn backoff_delay(sent_count: u32) -> chrono::Duration {
    match sent_count {
        0 => chrono::Duration::zero(),
        1 => chrono::Duration::minutes(1),
        2 => chrono::Duration::minutes(10),
        3 => chrono::Duration::minutes(30),
        4 => chrono::Duration::hours(1),
        _ => chrono::Duration::days(1),
    }
}

/// A pending upload: where it goes, which blob it sends and how often it
/// was tried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: Uuid,
    pub endpoint: String,
    /// Blob store key holding the request body.
    pub blob_key: String,
    pub sent_count: u32,
    /// Earliest time the current attempt may start.
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub timeout_secs: f64,
}

impl PendingRequest {
    /// Fresh request for the blob stored under `id`.
    pub fn new(
        id: Uuid,
        endpoint: impl Into<String>,
        timeout: Duration,
        headers: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            blob_key: id.to_string(),
            sent_count: 0,
            scheduled_at: now,
            headers,
            timeout_secs: timeout.as_secs_f64(),
        }
    }

    /// Whether another attempt is allowed under `ceiling`.
    pub fn should_send(&self, ceiling: u32) -> bool {
        self.sent_count <= ceiling
    }

    pub fn next_delay(&self) -> chrono::Duration {
        backoff_delay(self.sent_count)
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout_secs.is_finite() && self.timeout_secs > 0.0 {
            Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }

    /// The descriptor carried by the attempt started now: one more send
    /// counted and scheduled after the backoff for the current count.
    pub fn attempt(&self, now: DateTime<Utc>) -> PendingRequest {
        let mut next = self.clone();
        next.scheduled_at = now + self.next_delay();
        next.sent_count = self.sent_count.saturating_add(1);
        next
    }

    /// Whether an attempt scheduled at `scheduled_at` should have finished
    /// by `now`.
    pub fn is_stalled_at(&self, now: DateTime<Utc>) -> bool {
        attempt_deadline(self.scheduled_at, self.timeout()).is_some_and(|deadline| deadline < now)
    }
}

/// When an attempt starting at `begin` should have finished. `None` if that
/// lies beyond the representable range.
pub(crate) fn attempt_deadline(begin: DateTime<Utc>, timeout: Duration) -> Option<DateTime<Utc>> {
    let timeout = chrono::Duration::from_std(timeout).ok()?;
    begin.checked_add_signed(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sent_count: u32) -> PendingRequest {
        let mut r = PendingRequest::new(
            Uuid::new_v4(),
            "https://collector.example/v1/logs",
            Duration::from_secs(30),
            BTreeMap::new(),
            Utc::now(),
        );
        r.sent_count = sent_count;
        r
    }

    #[test]
    fn test_backoff_table() {
        assert_eq!(backoff_delay(0), chrono::Duration::zero());
        assert_eq!(backoff_delay(1), chrono::Duration::minutes(1));
        assert_eq!(backoff_delay(2), chrono::Duration::minutes(10));
        assert_eq!(backoff_delay(3), chrono::Duration::minutes(30));
        assert_eq!(backoff_delay(4), chrono::Duration::hours(1));
        assert_eq!(backoff_delay(5), chrono::Duration::days(1));
        assert_eq!(backoff_delay(42), chrono::Duration::days(1));
    }

    #[test]
    fn test_should_send_up_to_ceiling_inclusive() {
        assert!(request(0).should_send(5));
        assert!(request(5).should_send(5));
        assert!(!request(6).should_send(5));
    }

    #[test]
    fn test_attempt_increments_and_schedules() {
        let now = Utc::now();
        let first = request(0).attempt(now);
        assert_eq!(first.sent_count, 1);
        assert_eq!(first.scheduled_at, now);

        let second = first.attempt(now);
        assert_eq!(second.sent_count, 2);
        assert_eq!(second.scheduled_at, now + chrono::Duration::minutes(1));
    }

    #[test]
    fn test_blob_key_defaults_to_id() {
        let r = request(0);
        assert_eq!(r.blob_key, r.id.to_string());
    }

    #[test]
    fn test_stalled_after_timeout() {
        let mut r = request(1);
        let now = Utc::now();
        r.scheduled_at = now - chrono::Duration::seconds(31);
        assert!(r.is_stalled_at(now));
        r.scheduled_at = now - chrono::Duration::seconds(10);
        assert!(!r.is_stalled_at(now));
    }

    #[test]
    fn test_huge_timeout_never_stalls() {
        let mut r = request(1);
        r.timeout_secs = 1e30;
        assert_eq!(r.timeout(), Duration::MAX);
        assert!(!r.is_stalled_at(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn test_headers_default_when_missing() {
        let json = format!(
            r#"{{"id":"{}","endpoint":"https://c","blob_key":"b","sent_count":2,"scheduled_at":"2026-01-01T00:00:00Z","timeout_secs":30.0}}"#,
            Uuid::new_v4()
        );
        let r: PendingRequest = serde_json::from_str(&json).unwrap();
        assert!(r.headers.is_empty());
        assert_eq!(r.sent_count, 2);
    }
}
