//! Job payload bag.
//!
//! Payloads are free-form JSON objects. A handful of keys are reserved for
//! caller identity metadata; they travel with the job but are operational data,
//! not job output, and must never leave the boundary through result payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Reserved key: the user the job acts on behalf of.
pub const USER_ID_KEY: &str = "userId";

/// Reserved key: who initiated the job (user, system, scheduler).
pub const INITIATED_BY_KEY: &str = "initiatedBy";

/// Reserved key: webhook to notify when the job finishes.
pub const WEBHOOK_URL_KEY: &str = "webhookUrl";

/// Keys stripped from return values before they are handed back to callers.
pub const IDENTITY_KEYS: [&str; 2] = [USER_ID_KEY, INITIATED_BY_KEY];

/// Key-value payload attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobData(Map<String, JsonValue>);

impl JobData {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from an arbitrary JSON value. Non-object values are rejected.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(map)),
            JsonValue::Null => Some(Self::new()),
            _ => None,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get_str(USER_ID_KEY)
    }

    pub fn initiated_by(&self) -> Option<&str> {
        self.get_str(INITIATED_BY_KEY)
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.get_str(WEBHOOK_URL_KEY)
    }

    pub fn with_user_id(self, user_id: impl Into<String>) -> Self {
        self.with(USER_ID_KEY, user_id.into())
    }

    pub fn with_initiated_by(self, initiated_by: impl Into<String>) -> Self {
        self.with(INITIATED_BY_KEY, initiated_by.into())
    }

    pub fn with_webhook_url(self, url: impl Into<String>) -> Self {
        self.with(WEBHOOK_URL_KEY, url.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

impl From<Map<String, JsonValue>> for JobData {
    fn from(value: Map<String, JsonValue>) -> Self {
        Self(value)
    }
}

/// Drop caller identity fields from a job's return value.
///
/// Only top-level keys of an object are considered; anything that is not an
/// object is returned untouched.
pub fn strip_identity(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(mut map) => {
            for key in IDENTITY_KEYS {
                map.remove(key);
            }
            JsonValue::Object(map)
        }
        other => other,
    }
}
