//! Named events that trigger workflow runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An immutable occurrence submitted to the engine.
///
/// Produced by the identity provider hooks, application code (connection
/// requests, stories) or by steps emitting follow-up events. Only the
/// snapshot stored on a run outlives dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name matched exactly against event triggers (e.g. "user.created").
    pub name: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// When the event happened, as reported by the producer.
    pub occurred_at: DateTime<Utc>,
    /// Optional producer-supplied deduplication key.
    ///
    /// Redelivery of an event with the same key resolves to the same run
    /// instead of creating a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Event {
    /// Create an event that occurred at `occurred_at`.
    pub fn new(name: impl Into<String>, data: Map<String, Value>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            data,
            occurred_at,
            idempotency_key: None,
        }
    }

    /// Build an event from a JSON value. Non-object payloads are wrapped
    /// under a `"value"` key.
    pub fn from_json(name: impl Into<String>, data: Value, occurred_at: DateTime<Utc>) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(name, data, occurred_at)
    }

    /// Attach a deduplication key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Look up a string field in the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}
