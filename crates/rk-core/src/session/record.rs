use chrono::{DateTime, Utc};
use rk_common::SessionId;
use serde::{Deserialize, Serialize};

/// One session as persisted in the `sessions` cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub closed: bool,
}

impl SessionRecord {
    pub fn open_at(start: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            start,
            closed: false,
        }
    }

    /// Copy of this record marked closed.
    pub fn closed(&self) -> Self {
        Self {
            closed: true,
            ..self.clone()
        }
    }

    pub fn key(&self) -> &str {
        self.id.as_str()
    }
}

/// Why a session was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    /// The app stayed in the background longer than the session timeout.
    BackgroundTimeout,
    /// The session outlived the max session length.
    MaxLength,
}

impl RotationReason {
    /// Whether the new session is linked to the one it replaces.
    pub fn links_previous(self) -> bool {
        matches!(self, RotationReason::MaxLength)
    }
}

impl std::fmt::Display for RotationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationReason::BackgroundTimeout => write!(f, "background_timeout"),
            RotationReason::MaxLength => write!(f, "max_length"),
        }
    }
}

/// Observes session rotation.
///
/// Called on the rotating thread with the rotation lock held; a listener
/// must not rotate the session itself.
pub trait SessionListener: Send + Sync {
    fn session_will_reset(&self, _current: &SessionRecord) {}

    fn session_did_reset(&self, new: &SessionRecord, previous_session_id: Option<&SessionId>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_with_hex_id() {
        let record = SessionRecord::open_at(Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"].as_str().unwrap().len(), SessionId::LEN);
        assert_eq!(json["closed"], false);
    }

    #[test]
    fn test_missing_closed_defaults_to_open() {
        let json = r#"{"id":"0123456789abcdef0123456789abcdef","start":"2026-01-01T00:00:00Z"}"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        assert!(!record.closed);
        assert!(record.closed().closed);
    }

    #[test]
    fn test_only_max_length_links_previous() {
        assert!(RotationReason::MaxLength.links_previous());
        assert!(!RotationReason::BackgroundTimeout.links_previous());
    }
}
