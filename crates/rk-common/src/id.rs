//! Session and request identity types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Session ID: an opaque 32-character lowercase hex token.
///
/// Example: `7f3c0a52d1e84b4c9a8f0e6d2b1c3a49`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Length of a session token in characters.
    pub const LEN: usize = 32;

    /// Generate a new random session ID.
    pub fn new() -> Self {
        SessionId(Uuid::new_v4().simple().to_string())
    }

    /// Parse an existing session ID string.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != Self::LEN {
            return None;
        }
        if !s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return None;
        }
        Some(SessionId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading part of the token, used where a shorter correlation id is
    /// needed (e.g. per-session instance ids).
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
