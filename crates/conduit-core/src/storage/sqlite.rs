// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed message storage.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::StorageError;
use crate::migrations;

use super::{BrowseFilter, MessageStorage, SortOrder, StoredMessage};

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    storage_key: String,
    message_id: String,
    correlation_id: Option<String>,
    received_at_ms: i64,
    comments: Option<String>,
    label: Option<String>,
    payload: Vec<u8>,
}

impl From<MessageRow> for StoredMessage {
    fn from(row: MessageRow) -> Self {
        StoredMessage {
            storage_key: row.storage_key,
            message_id: row.message_id,
            correlation_id: row.correlation_id,
            received_at: DateTime::<Utc>::from_timestamp_millis(row.received_at_ms)
                .unwrap_or_default(),
            comments: row.comments,
            label: row.label,
            payload: row.payload,
        }
    }
}

/// One slot in the `messages` table.
///
/// Several slots (and several adapters) can share one pool.
#[derive(Debug, Clone)]
pub struct SqliteMessageStorage {
    pool: SqlitePool,
    slot_id: String,
}

impl SqliteMessageStorage {
    /// Create a storage slot from an existing, migrated pool.
    pub fn new(pool: SqlitePool, slot_id: impl Into<String>) -> Self {
        Self {
            pool,
            slot_id: slot_id.into(),
        }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str, slot_id: impl Into<String>) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StorageError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;
        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| StorageError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;
        Ok(Self::new(pool, slot_id))
    }

    /// Create (if needed) and open the database file at `path`.
    pub async fn from_path(
        path: impl AsRef<Path>,
        slot_id: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, slot_id).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MessageStorage for SqliteMessageStorage {
    fn slot_id(&self) -> &str {
        &self.slot_id
    }

    async fn store_message(&self, message: &StoredMessage) -> Result<String, StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO messages
                (slot_id, storage_key, message_id, correlation_id, received_at_ms, comments, label, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.slot_id)
        .bind(&message.storage_key)
        .bind(&message.message_id)
        .bind(&message.correlation_id)
        .bind(message.received_at.timestamp_millis())
        .bind(&message.comments)
        .bind(&message.label)
        .bind(&message.payload)
        .execute(&self.pool)
        .await?;

        Ok(message.storage_key.clone())
    }

    async fn get_message(&self, storage_key: &str) -> Result<Option<StoredMessage>, StorageError> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT storage_key, message_id, correlation_id, received_at_ms, comments, label, payload
            FROM messages
            WHERE slot_id = ? AND storage_key = ?
            "#,
        )
        .bind(&self.slot_id)
        .bind(storage_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StoredMessage::from))
    }

    async fn delete_message(&self, storage_key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM messages WHERE slot_id = ? AND storage_key = ?")
            .bind(&self.slot_id)
            .bind(storage_key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn browse(&self, filter: &BrowseFilter) -> Result<Vec<StoredMessage>, StorageError> {
        let order = match filter.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            r#"
            SELECT storage_key, message_id, correlation_id, received_at_ms, comments, label, payload
            FROM messages
            WHERE slot_id = ?
              AND (? IS NULL OR received_at_ms >= ?)
              AND (? IS NULL OR received_at_ms < ?)
            ORDER BY received_at_ms {order}, storage_key {order}
            LIMIT ? OFFSET ?
            "#
        );
        let start = filter.start.map(|d| d.timestamp_millis());
        let end = filter.end.map(|d| d.timestamp_millis());

        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(&self.slot_id)
            .bind(start)
            .bind(start)
            .bind(end)
            .bind(end)
            .bind(filter.limit.unwrap_or(-1))
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(StoredMessage::from).collect())
    }

    async fn count(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE slot_id = ?")
            .bind(&self.slot_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn contains_message_id(&self, message_id: &str) -> Result<bool, StorageError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM messages WHERE slot_id = ? AND message_id = ? LIMIT 1")
                .bind(&self.slot_id)
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn contains_correlation_id(&self, correlation_id: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM messages WHERE slot_id = ? AND correlation_id = ? LIMIT 1",
        )
        .bind(&self.slot_id)
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    #[tokio::test]
    async fn test_store_and_get_round_trip() {
        let storage = SqliteMessageStorage::new(test_pool().await, "errors");
        let message = StoredMessage::new("m1", vec![1u8, 2, 3])
            .with_correlation_id(Some("c1".to_string()))
            .with_comments("Pipe [Send] failed")
            .with_label("urgent");
        let key = storage.store_message(&message).await.unwrap();

        let loaded = storage.get_message(&key).await.unwrap().unwrap();
        assert_eq!(loaded.payload, vec![1, 2, 3]);
        assert_eq!(loaded.comments.as_deref(), Some("Pipe [Send] failed"));
        assert_eq!(loaded.label.as_deref(), Some("urgent"));
        assert_eq!(
            loaded.received_at.timestamp_millis(),
            message.received_at.timestamp_millis()
        );

        assert!(storage.delete_message(&key).await.unwrap());
        assert!(storage.get_message(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slots_are_isolated() {
        let pool = test_pool().await;
        let available = SqliteMessageStorage::new(pool.clone(), "available");
        let done = SqliteMessageStorage::new(pool, "done");

        let message = StoredMessage::new("m1", "x");
        available.store_message(&message).await.unwrap();

        assert_eq!(available.count().await.unwrap(), 1);
        assert_eq!(done.count().await.unwrap(), 0);
        assert!(!done.contains_message_id("m1").await.unwrap());

        done.store_message(&message).await.unwrap();
        assert!(available.delete_message(&message.storage_key).await.unwrap());
        assert!(done.get_message(&message.storage_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_browse_by_date_range() {
        let storage = SqliteMessageStorage::new(test_pool().await, "log");
        let base = Utc::now();
        for i in 0..4 {
            let message = StoredMessage::new(format!("m{}", i), "x")
                .with_received_at(base + Duration::seconds(i));
            storage.store_message(&message).await.unwrap();
        }

        let filter = BrowseFilter {
            start: Some(base + Duration::seconds(1)),
            sort_order: SortOrder::Asc,
            limit: Some(2),
            ..BrowseFilter::default()
        };
        let ids: Vec<_> = storage
            .browse(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("conduit.db");
        let storage = SqliteMessageStorage::from_path(&path, "log").await.unwrap();
        storage
            .store_message(&StoredMessage::new("m1", "x"))
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(storage.count().await.unwrap(), 1);
    }
}
