// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory message storage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;

use super::{BrowseFilter, MessageStorage, SortOrder, StoredMessage};

/// Message storage held in process memory; lost on restart.
#[derive(Debug)]
pub struct InMemoryMessageStorage {
    slot_id: String,
    messages: RwLock<BTreeMap<String, StoredMessage>>,
}

impl InMemoryMessageStorage {
    /// Create an empty slot.
    pub fn new(slot_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            messages: RwLock::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl MessageStorage for InMemoryMessageStorage {
    fn slot_id(&self) -> &str {
        &self.slot_id
    }

    async fn store_message(&self, message: &StoredMessage) -> Result<String, StorageError> {
        let mut messages = self.messages.write().await;
        messages.insert(message.storage_key.clone(), message.clone());
        Ok(message.storage_key.clone())
    }

    async fn get_message(&self, storage_key: &str) -> Result<Option<StoredMessage>, StorageError> {
        Ok(self.messages.read().await.get(storage_key).cloned())
    }

    async fn delete_message(&self, storage_key: &str) -> Result<bool, StorageError> {
        Ok(self.messages.write().await.remove(storage_key).is_some())
    }

    async fn browse(&self, filter: &BrowseFilter) -> Result<Vec<StoredMessage>, StorageError> {
        let messages = self.messages.read().await;
        let mut selected: Vec<StoredMessage> = messages
            .values()
            .filter(|m| filter.matches(m.received_at))
            .cloned()
            .collect();
        selected.sort_by(|a, b| match filter.sort_order {
            SortOrder::Asc => a.received_at.cmp(&b.received_at),
            SortOrder::Desc => b.received_at.cmp(&a.received_at),
        });
        let offset = usize::try_from(filter.offset.unwrap_or(0)).unwrap_or(0);
        let limit = filter
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);
        Ok(selected.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> Result<i64, StorageError> {
        Ok(self.messages.read().await.len() as i64)
    }

    async fn contains_message_id(&self, message_id: &str) -> Result<bool, StorageError> {
        let messages = self.messages.read().await;
        Ok(messages.values().any(|m| m.message_id == message_id))
    }

    async fn contains_correlation_id(&self, correlation_id: &str) -> Result<bool, StorageError> {
        let messages = self.messages.read().await;
        Ok(messages
            .values()
            .any(|m| m.correlation_id.as_deref() == Some(correlation_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_store_get_delete() {
        let storage = InMemoryMessageStorage::new("log");
        let message = StoredMessage::new("m1", "payload")
            .with_correlation_id(Some("c1".to_string()));
        let key = storage.store_message(&message).await.unwrap();

        assert_eq!(storage.get_message(&key).await.unwrap(), Some(message));
        assert!(storage.contains_message_id("m1").await.unwrap());
        assert!(storage.contains_correlation_id("c1").await.unwrap());

        assert!(storage.delete_message(&key).await.unwrap());
        assert!(!storage.delete_message(&key).await.unwrap());
        assert!(storage.get_message(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_browse_orders_and_pages() {
        let storage = InMemoryMessageStorage::new("log");
        let base = Utc::now();
        for i in 0..5 {
            let message = StoredMessage::new(format!("m{}", i), "x")
                .with_received_at(base + Duration::seconds(i));
            storage.store_message(&message).await.unwrap();
        }

        let oldest = storage.browse(&BrowseFilter::oldest(2)).await.unwrap();
        let ids: Vec<_> = oldest.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1"]);

        let filter = BrowseFilter {
            start: Some(base + Duration::seconds(1)),
            end: Some(base + Duration::seconds(4)),
            offset: Some(1),
            ..BrowseFilter::default()
        };
        let page = storage.browse(&filter).await.unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }
}
