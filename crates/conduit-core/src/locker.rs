// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutual exclusion for whole pipeline runs.
//!
//! A [`Locker`] serializes pipeline execution across every instance of an
//! adapter that shares the lock store. A run that cannot get the lock is
//! skipped by the pipeline, not retried.
//!
//! Temporary locks are released after the run. Permanent locks stay until
//! their retention expires, which makes a per-message lock key (using the
//! `{mid}` placeholder) a "process at most once" guard.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{ConfigurationError, LockError};
use crate::migrations;

/// Placeholder replaced by the message id in a lock's object id.
pub const MESSAGE_ID_PLACEHOLDER: &str = "{mid}";

/// Whether a lock is released after the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    /// Released when the run ends.
    #[default]
    Temporary,
    /// Kept until its retention expires.
    Permanent,
}

impl LockType {
    /// Single-letter code stored with the lock.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temporary => "T",
            Self::Permanent => "P",
        }
    }

    fn default_retention(&self) -> Duration {
        match self {
            Self::Temporary => Duration::from_secs(4 * 60 * 60),
            Self::Permanent => Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Settings shared by every locker implementation.
#[derive(Debug, Clone)]
pub struct LockSettings {
    object_id: String,
    lock_type: LockType,
    retention: Option<Duration>,
    num_retries: u32,
    retry_delay: Duration,
}

impl LockSettings {
    /// Lock on `object_id`, temporary, without retries.
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            lock_type: LockType::Temporary,
            retention: None,
            num_retries: 0,
            retry_delay: Duration::from_secs(10),
        }
    }

    /// Set the lock type.
    pub fn with_lock_type(mut self, lock_type: LockType) -> Self {
        self.lock_type = lock_type;
        self
    }

    /// Set how long a lock is kept when it is not released.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Retry a missed lock `num_retries` times, `delay` apart.
    pub fn with_retries(mut self, num_retries: u32, delay: Duration) -> Self {
        self.num_retries = num_retries;
        self.retry_delay = delay;
        self
    }

    /// The object id template.
    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// The lock type.
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// Retention, defaulting to 4 hours for temporary and 30 days for permanent locks.
    pub fn retention(&self) -> Duration {
        self.retention
            .unwrap_or_else(|| self.lock_type.default_retention())
    }

    /// The key locked for `message_id`.
    pub fn lock_key(&self, message_id: &str) -> String {
        self.object_id.replace(MESSAGE_ID_PLACEHOLDER, message_id)
    }

    /// Check the settings.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.object_id.trim().is_empty() {
            return Err(ConfigurationError::new("Locker: objectId must be specified"));
        }
        if self.retention().is_zero() {
            return Err(ConfigurationError::new(format!(
                "Locker [{}]: retention must be positive",
                self.object_id
            )));
        }
        Ok(())
    }
}

/// A lock store.
#[async_trait]
pub trait Locker: Send + Sync {
    /// The settings of this locker.
    fn settings(&self) -> &LockSettings;

    /// Validate settings. Called while the pipeline is configured.
    fn configure(&self) -> Result<(), ConfigurationError> {
        self.settings().validate()
    }

    /// Take `key` if nobody holds it. Expired locks count as free.
    async fn try_lock(&self, key: &str) -> Result<bool, LockError>;

    /// Remove `key`.
    async fn unlock(&self, key: &str) -> Result<(), LockError>;

    /// Acquire the lock for a run, retrying as configured.
    ///
    /// Returns the locked key, or `None` if the lock stayed taken.
    async fn acquire(&self, message_id: &str) -> Result<Option<String>, LockError> {
        let settings = self.settings();
        let key = settings.lock_key(message_id);
        for attempt in 0..=settings.num_retries {
            if attempt > 0 {
                trace!(key = %key, attempt, "Retrying lock");
                tokio::time::sleep(settings.retry_delay).await;
            }
            if self.try_lock(&key).await? {
                debug!(key = %key, "Acquired lock");
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Release a lock returned by [`acquire`](Self::acquire). Permanent locks are kept.
    async fn release(&self, key: &str) -> Result<(), LockError> {
        if self.settings().lock_type() == LockType::Permanent {
            return Ok(());
        }
        self.unlock(key).await?;
        debug!(key = %key, "Released lock");
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Locker local to this process.
#[derive(Debug)]
pub struct InMemoryLocker {
    settings: LockSettings,
    locks: Mutex<HashMap<String, Instant>>,
}

impl InMemoryLocker {
    /// Create a locker with the given settings.
    pub fn new(settings: LockSettings) -> Self {
        Self {
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    fn settings(&self) -> &LockSettings {
        &self.settings
    }

    async fn try_lock(&self, key: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|expires| *expires > now) {
            return Ok(false);
        }
        locks.insert(key.to_string(), now + self.settings.retention());
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(key);
        Ok(())
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// Locker backed by the `locks` table, shared by every process using the database.
#[derive(Debug, Clone)]
pub struct SqliteLocker {
    pool: SqlitePool,
    settings: LockSettings,
    owner: String,
}

impl SqliteLocker {
    /// Create a locker from an existing, migrated pool.
    pub fn new(pool: SqlitePool, settings: LockSettings) -> Self {
        Self {
            pool,
            settings,
            owner: Uuid::new_v4().to_string(),
        }
    }

    /// Open (and migrate) the database at `path`.
    pub async fn from_path(path: impl AsRef<Path>, settings: LockSettings) -> Result<Self, LockError> {
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| LockError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path.as_ref(), e),
            })?;
        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| LockError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;
        Ok(Self::new(pool, settings))
    }
}

#[async_trait]
impl Locker for SqliteLocker {
    fn settings(&self) -> &LockSettings {
        &self.settings
    }

    async fn try_lock(&self, key: &str) -> Result<bool, LockError> {
        let now = Utc::now().timestamp_millis();
        let retention = i64::try_from(self.settings.retention().as_millis()).unwrap_or(i64::MAX);

        sqlx::query("DELETE FROM locks WHERE object_id = ? AND expires_at_ms <= ?")
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO locks (object_id, lock_type, owner, created_at_ms, expires_at_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(key)
        .bind(self.settings.lock_type().as_str())
        .bind(&self.owner)
        .bind(now)
        .bind(now.saturating_add(retention))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, key: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM locks WHERE object_id = ? AND owner = ?")
            .bind(key)
            .bind(&self.owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
