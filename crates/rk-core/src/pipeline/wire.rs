//! Wire format of exported events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rk_common::SessionId;
use serde::{Deserialize, Serialize};

/// Scalar or array attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<AttributeValue>),
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<u64> for AttributeValue {
    fn from(v: u64) -> Self {
        AttributeValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Double(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(v: Vec<T>) -> Self {
        AttributeValue::Array(v.into_iter().map(Into::into).collect())
    }
}

/// What a module says about the data it publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMetadata {
    pub domain: String,
    pub name: String,
    /// When the event happened; selects the session it belongs to.
    pub timestamp: DateTime<Utc>,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Extra request headers for this event's upload.
    pub headers: BTreeMap<String, String>,
}

impl EventMetadata {
    pub fn new(
        domain: impl Into<String>,
        name: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
            timestamp,
            attributes: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Module data carried as the event body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EventPayload {
    #[default]
    Empty,
    Text(String),
    Json(serde_json::Value),
}

impl EventPayload {
    fn into_body(self) -> Option<serde_json::Value> {
        match self {
            EventPayload::Empty => None,
            EventPayload::Text(text) => Some(serde_json::Value::String(text)),
            EventPayload::Json(value) => Some(value),
        }
    }
}

/// Serialized form of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub domain: String,
    pub name: String,
    pub instrumentation_scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl WireEvent {
    pub fn new(
        domain: impl Into<String>,
        name: impl Into<String>,
        instrumentation_scope: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
            instrumentation_scope: instrumentation_scope.into(),
            session_id: None,
            timestamp,
            attributes: BTreeMap::new(),
            body: None,
        }
    }

    pub fn from_module(
        metadata: EventMetadata,
        payload: EventPayload,
        instrumentation_scope: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            domain: metadata.domain,
            name: metadata.name,
            instrumentation_scope: instrumentation_scope.into(),
            session_id,
            timestamp: metadata.timestamp,
            attributes: metadata.attributes,
            body: payload.into_body(),
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
