// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable message storage.
//!
//! A [`MessageStorage`] is one slot of stored messages: the error storage of
//! a receiver, its message log, or one process-state slot of a
//! [`StorageListener`](crate::listener::StorageListener). Messages are kept
//! under a storage key and can be browsed by the time they were received.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryMessageStorage;
pub use self::sqlite::SqliteMessageStorage;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::StorageError;
use crate::message::Message;

/// A message as kept in a storage slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Key within the slot.
    pub storage_key: String,
    /// Message id assigned by the transport or the receiver.
    pub message_id: String,
    /// Correlation id, if any.
    pub correlation_id: Option<String>,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Free text, typically the error that put the message here.
    pub comments: Option<String>,
    /// Operator label.
    pub label: Option<String>,
    /// The raw payload.
    pub payload: Vec<u8>,
}

impl StoredMessage {
    /// A new stored message with a fresh storage key, received now.
    pub fn new(message_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            storage_key: Uuid::new_v4().to_string(),
            message_id: message_id.into(),
            correlation_id: None,
            received_at: Utc::now(),
            comments: None,
            label: None,
            payload: payload.into(),
        }
    }

    /// Capture `message` for storage. Consumes a stream payload.
    pub fn from_message(message_id: impl Into<String>, message: &Message) -> io::Result<Self> {
        Ok(Self::new(message_id, message.as_bytes()?))
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the comments.
    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    /// Set the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the time the message was received.
    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// The payload as a message: text when it is valid UTF-8, bytes otherwise.
    pub fn to_message(&self) -> Message {
        match std::str::from_utf8(&self.payload) {
            Ok(text) => Message::text(text),
            Err(_) => Message::binary(self.payload.clone()),
        }
    }
}

/// Sort order for [`BrowseFilter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Newest first (default).
    #[default]
    Desc,
    /// Oldest first.
    Asc,
}

/// Selection of stored messages by receive time.
#[derive(Debug, Clone, Default)]
pub struct BrowseFilter {
    /// Received at or after this time.
    pub start: Option<DateTime<Utc>>,
    /// Received before this time.
    pub end: Option<DateTime<Utc>>,
    /// Maximum number of messages returned.
    pub limit: Option<i64>,
    /// Number of matching messages skipped.
    pub offset: Option<i64>,
    /// Sort order by receive time.
    pub sort_order: SortOrder,
}

impl BrowseFilter {
    /// Oldest first, at most `limit` messages.
    pub fn oldest(limit: i64) -> Self {
        Self {
            limit: Some(limit),
            sort_order: SortOrder::Asc,
            ..Self::default()
        }
    }

    /// Whether `received_at` falls within the date range.
    pub fn matches(&self, received_at: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| received_at >= s) && self.end.is_none_or(|e| received_at < e)
    }
}

/// One slot of durably stored messages.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// Name of the slot.
    fn slot_id(&self) -> &str;

    /// Store a message under its storage key, replacing any previous one.
    /// Returns the storage key.
    async fn store_message(&self, message: &StoredMessage) -> Result<String, StorageError>;

    /// Retrieve a message.
    async fn get_message(&self, storage_key: &str) -> Result<Option<StoredMessage>, StorageError>;

    /// Remove a message. Returns whether it was present.
    async fn delete_message(&self, storage_key: &str) -> Result<bool, StorageError>;

    /// List messages by receive time.
    async fn browse(&self, filter: &BrowseFilter) -> Result<Vec<StoredMessage>, StorageError>;

    /// Number of stored messages.
    async fn count(&self) -> Result<i64, StorageError>;

    /// Whether a message with this message id is stored.
    async fn contains_message_id(&self, message_id: &str) -> Result<bool, StorageError>;

    /// Whether a message with this correlation id is stored.
    async fn contains_correlation_id(&self, correlation_id: &str) -> Result<bool, StorageError>;
}

/// Open the storage slot `slot_id` configured by `config`.
///
/// Uses the sqlite database at `storage_url` when one is set, in-memory
/// storage otherwise.
pub async fn open_message_storage(
    config: &Config,
    slot_id: &str,
) -> Result<Arc<dyn MessageStorage>, StorageError> {
    match config.storage_url.as_deref() {
        Some(url) => {
            debug!(slot = %slot_id, "Opening sqlite message storage");
            let storage = SqliteMessageStorage::connect(url, slot_id).await?;
            Ok(Arc::new(storage))
        }
        None => {
            debug!(slot = %slot_id, "Using in-memory message storage");
            Ok(Arc::new(InMemoryMessageStorage::new(slot_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_to_message_prefers_text() {
        let text = StoredMessage::new("m1", "hello");
        assert_eq!(text.to_message().as_str(), Some("hello"));

        let bytes = StoredMessage::new("m2", vec![0xff, 0xfe]);
        assert!(bytes.to_message().as_str().is_none());
        assert_eq!(bytes.to_message().as_bytes().unwrap(), vec![0xff, 0xfe]);
    }

    #[test]
    fn test_filter_range_is_half_open() {
        let now = Utc::now();
        let filter = BrowseFilter {
            start: Some(now),
            end: Some(now + Duration::seconds(10)),
            ..BrowseFilter::default()
        };
        assert!(filter.matches(now));
        assert!(!filter.matches(now + Duration::seconds(10)));
        assert!(!filter.matches(now - Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_open_defaults_to_memory() {
        let storage = open_message_storage(&Config::default(), "errors")
            .await
            .unwrap();
        assert_eq!(storage.slot_id(), "errors");
        assert_eq!(storage.count().await.unwrap(), 0);
    }
}
