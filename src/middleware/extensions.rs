//! Request and response extensions shared with the authentication layer.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::ratelimit::DecisionRecord;

/// Credentials of an authenticated request, inserted by the authentication
/// layer as a request extension.
#[derive(Debug, Clone)]
pub struct Credentials(pub Value);

/// Marks a response as an authentication failure.
///
/// The rejected token is looked up first in `artifacts`, then in `error_data`.
#[derive(Debug, Clone, Default)]
pub struct AuthFailure {
    pub artifacts: Option<Value>,
    pub error_data: Option<Value>,
}

impl AuthFailure {
    /// A failure whose artifacts carry the rejected token under `field`.
    pub fn with_token(field: &str, token: impl Into<String>) -> Self {
        let mut artifacts = serde_json::Map::new();
        artifacts.insert(field.to_string(), Value::String(token.into()));
        Self {
            artifacts: Some(Value::Object(artifacts)),
            error_data: None,
        }
    }
}

/// The decision record of an in-flight request.
///
/// Inserted into request extensions by [`pre_auth`](super::pre_auth). Handlers
/// may extract it to read the quota computed for their request.
#[derive(Debug, Clone)]
pub struct RecordHandle(Arc<Mutex<DecisionRecord>>);

impl RecordHandle {
    pub fn new(record: DecisionRecord) -> Self {
        Self(Arc::new(Mutex::new(record)))
    }

    /// A copy of the current record.
    pub fn snapshot(&self) -> DecisionRecord {
        self.0.lock().clone()
    }

    /// Replace the record after a hook has updated its copy.
    pub fn replace(&self, record: DecisionRecord) {
        *self.0.lock() = record;
    }
}
