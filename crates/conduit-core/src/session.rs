// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-message processing context.
//!
//! A [`PipeLineSession`] lives for exactly one message. Any resource placed
//! into it is tracked by identity and closed exactly once when the session
//! ends, whether processing succeeded, failed or timed out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::forward::ExitState;
use crate::message::Message;

/// Key holding the message as it entered the pipeline.
pub const ORIGINAL_MESSAGE_KEY: &str = "originalMessage";
/// Key holding the message id.
pub const MESSAGE_ID_KEY: &str = "mid";
/// Key holding the correlation id.
pub const CORRELATION_ID_KEY: &str = "cid";
/// Key flagging a manual retry from the error storage.
pub const MANUAL_RETRY_KEY: &str = "__isManualRetry";
/// Key holding the time the message was received.
pub const TS_RECEIVED_KEY: &str = "tsReceived";
/// Key holding the time the message was sent by its originator.
pub const TS_SENT_KEY: &str = "tsSent";
/// Key holding the exit state of the pipeline run.
pub const EXIT_STATE_KEY: &str = "exitState";
/// Key holding the exit code of the pipeline run.
pub const EXIT_CODE_KEY: &str = "exitCode";

/// A resource that must be released when the session ends.
pub trait Closeable: Send + Sync {
    /// Release the resource. Errors are logged, never propagated.
    fn close(&self) -> anyhow::Result<()>;
}

/// A value stored in a session.
#[derive(Clone)]
pub enum SessionValue {
    /// A message payload.
    Message(Message),
    /// Structured data.
    Json(serde_json::Value),
    /// A resource the session closes on exit.
    Resource(Arc<dyn Closeable>),
}

impl fmt::Debug for SessionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(m) => write!(f, "{:?}", m),
            Self::Json(v) => write!(f, "{}", v),
            Self::Resource(_) => f.write_str("Resource(..)"),
        }
    }
}

impl From<Message> for SessionValue {
    fn from(message: Message) -> Self {
        SessionValue::Message(message)
    }
}

impl From<serde_json::Value> for SessionValue {
    fn from(value: serde_json::Value) -> Self {
        SessionValue::Json(value)
    }
}

impl From<&str> for SessionValue {
    fn from(value: &str) -> Self {
        SessionValue::Json(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for SessionValue {
    fn from(value: String) -> Self {
        SessionValue::Json(serde_json::Value::String(value))
    }
}

impl From<bool> for SessionValue {
    fn from(value: bool) -> Self {
        SessionValue::Json(serde_json::Value::Bool(value))
    }
}

impl From<i64> for SessionValue {
    fn from(value: i64) -> Self {
        SessionValue::Json(serde_json::Value::from(value))
    }
}

impl From<Arc<dyn Closeable>> for SessionValue {
    fn from(resource: Arc<dyn Closeable>) -> Self {
        SessionValue::Resource(resource)
    }
}

fn identity(resource: &Arc<dyn Closeable>) -> *const () {
    Arc::as_ptr(resource) as *const ()
}

/// Mutable key/value context scoped to one message.
#[derive(Default)]
pub struct PipeLineSession {
    values: HashMap<String, SessionValue>,
    closeables: Vec<(Arc<dyn Closeable>, String)>,
}

impl fmt::Debug for PipeLineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeLineSession")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .field("closeables", &self.closeables.len())
            .finish()
    }
}

impl PipeLineSession {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session carrying the message and correlation ids.
    pub fn with_ids(message_id: impl Into<String>, correlation_id: Option<String>) -> Self {
        let message_id = message_id.into();
        let mut session = Self::new();
        session.put(CORRELATION_ID_KEY, correlation_id.unwrap_or_else(|| message_id.clone()));
        session.put(MESSAGE_ID_KEY, message_id);
        session
    }

    /// Store a value. Resources are scheduled for closing on session exit.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<SessionValue>) {
        let key = key.into();
        let value = value.into();
        if let SessionValue::Resource(resource) = &value {
            self.schedule_close_on_session_exit(resource.clone(), format!("session key [{}]", key));
        }
        self.values.insert(key, value);
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<&SessionValue> {
        self.values.get(key)
    }

    /// Get a value as text: a string, a text message, or any other JSON value rendered.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            SessionValue::Json(serde_json::Value::String(s)) => Some(s.clone()),
            SessionValue::Json(v) => Some(v.to_string()),
            SessionValue::Message(m) => m.as_str().map(str::to_string),
            SessionValue::Resource(_) => None,
        }
    }

    /// Get a message value.
    pub fn get_message(&self, key: &str) -> Option<&Message> {
        match self.values.get(key)? {
            SessionValue::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Remove a value. A removed resource stays scheduled for closing.
    pub fn remove(&mut self, key: &str) -> Option<SessionValue> {
        self.values.remove(key)
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All keys currently present.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// The message id, if set.
    pub fn message_id(&self) -> Option<String> {
        self.get_string(MESSAGE_ID_KEY)
    }

    /// The correlation id, if set.
    pub fn correlation_id(&self) -> Option<String> {
        self.get_string(CORRELATION_ID_KEY)
    }

    /// Whether this session processes a manual retry.
    pub fn is_manual_retry(&self) -> bool {
        matches!(
            self.values.get(MANUAL_RETRY_KEY),
            Some(SessionValue::Json(serde_json::Value::Bool(true)))
        )
    }

    /// Record the time the message was received.
    pub fn set_received(&mut self, at: DateTime<Utc>) {
        self.put(TS_RECEIVED_KEY, at.to_rfc3339());
    }

    /// The time the message was received, if recorded.
    pub fn received(&self) -> Option<DateTime<Utc>> {
        self.get_string(TS_RECEIVED_KEY)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    /// Record the exit state and exit code of the run.
    pub fn set_exit_state(&mut self, state: ExitState, exit_code: i32) {
        self.put(EXIT_STATE_KEY, state.as_str());
        self.put(EXIT_CODE_KEY, i64::from(exit_code));
    }

    /// The exit state recorded for the run.
    pub fn exit_state(&self) -> Option<ExitState> {
        self.get_string(EXIT_STATE_KEY)
            .and_then(|s| s.parse().ok())
    }

    /// The exit code recorded for the run.
    pub fn exit_code(&self) -> Option<i32> {
        match self.values.get(EXIT_CODE_KEY)? {
            SessionValue::Json(v) => v.as_i64().and_then(|c| i32::try_from(c).ok()),
            _ => None,
        }
    }

    /// Track a resource so it is closed when the session ends.
    ///
    /// Scheduling the same resource twice keeps one entry.
    pub fn schedule_close_on_session_exit(
        &mut self,
        resource: Arc<dyn Closeable>,
        description: impl Into<String>,
    ) {
        if self.is_scheduled_for_close_on_exit(&resource) {
            return;
        }
        self.closeables.push((resource, description.into()));
    }

    /// Stop tracking a resource; the caller becomes responsible for closing it.
    pub fn unschedule_close_on_session_exit(&mut self, resource: &Arc<dyn Closeable>) {
        let id = identity(resource);
        self.closeables.retain(|(r, _)| identity(r) != id);
    }

    /// Whether a resource is tracked for closing.
    pub fn is_scheduled_for_close_on_exit(&self, resource: &Arc<dyn Closeable>) -> bool {
        let id = identity(resource);
        self.closeables.iter().any(|(r, _)| identity(r) == id)
    }

    /// Number of resources tracked for closing.
    pub fn scheduled_closeables(&self) -> usize {
        self.closeables.len()
    }

    /// Copy values into a parent session and hand over resource ownership.
    ///
    /// `keys` is a comma or semicolon separated list; `None` or `"*"` copies
    /// every key. Exit state and exit code are always copied. Resources that
    /// end up in the parent are no longer closed by this session.
    pub fn merge_to_parent_session(&mut self, keys: Option<&str>, parent: &mut PipeLineSession) {
        debug!(keys = ?keys, "Returning context to parent session");
        for key in [EXIT_CODE_KEY, EXIT_STATE_KEY] {
            if let Some(value) = self.values.get(key) {
                parent.put(key, value.clone());
            }
        }
        match keys {
            Some(list) if !list.is_empty() && list != "*" => {
                for key in list.split([',', ';']).map(str::trim).filter(|k| !k.is_empty()) {
                    if let Some(value) = self.values.get(key) {
                        parent.put(key, value.clone());
                    }
                }
            }
            Some(_) | None => {
                for (key, value) in &self.values {
                    parent.put(key.clone(), value.clone());
                }
            }
        }
        self.closeables
            .retain(|(r, _)| !parent.is_scheduled_for_close_on_exit(r));
    }

    /// Close every tracked resource exactly once.
    ///
    /// The tracking list is cleared before closing, so calling this again
    /// (or dropping the session afterwards) closes nothing twice.
    pub fn close(&mut self) {
        let closeables = std::mem::take(&mut self.closeables);
        if closeables.is_empty() {
            return;
        }
        debug!(count = closeables.len(), "Closing PipeLineSession resources");
        for (resource, description) in closeables {
            if let Err(e) = resource.close() {
                warn!(resource = %description, error = %e, "Failed to close session resource");
            }
        }
    }
}

impl Drop for PipeLineSession {
    fn drop(&mut self) {
        self.close();
    }
}
