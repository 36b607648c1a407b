// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result cache for whole pipeline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{ConfigurationError, LifecycleError};
use crate::message::Message;
use crate::result::PipeLineResult;

/// Cache of SUCCESS pipeline results keyed by input.
///
/// A hit replays the whole result, exit code included.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Validate settings. Called while the pipeline is configured.
    fn configure(&self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Called when the pipeline starts.
    async fn open(&self) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Called when the pipeline stops.
    async fn close(&self) {}

    /// Cache key for an input; `None` disables caching for it.
    ///
    /// The default uses the text of a repeatable input.
    fn key_for(&self, input: &Message) -> Option<String> {
        if !input.is_repeatable() || input.is_null() {
            return None;
        }
        input.as_string().ok()
    }

    /// Look up a cached result.
    async fn get(&self, key: &str) -> Option<PipeLineResult>;

    /// Store a result.
    async fn put(&self, key: &str, value: PipeLineResult);
}

struct Entry {
    value: PipeLineResult,
    stored_at: Instant,
}

/// Bounded in-process cache evicting the oldest entry first.
pub struct InMemoryResultCache {
    capacity: usize,
    time_to_live: Option<Duration>,
    state: Mutex<(HashMap<String, Entry>, VecDeque<String>)>,
}

impl InMemoryResultCache {
    /// Create a cache holding at most `capacity` results (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            time_to_live: None,
            state: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }

    /// Expire entries after `ttl`.
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).0.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0.clear();
        state.1.clear();
    }

    async fn get(&self, key: &str) -> Option<PipeLineResult> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (entries, order) = &mut *state;
        let expired = match entries.get(key) {
            Some(entry) => self
                .time_to_live
                .is_some_and(|ttl| entry.stored_at.elapsed() >= ttl),
            None => return None,
        };
        if expired {
            entries.remove(key);
            order.retain(|k| k != key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    async fn put(&self, key: &str, value: PipeLineResult) {
        if !value.result().is_repeatable() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (entries, order) = &mut *state;
        if entries.contains_key(key) {
            order.retain(|k| k != key);
        } else if entries.len() >= self.capacity
            && let Some(oldest) = order.pop_front()
        {
            entries.remove(&oldest);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        order.push_back(key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evicts_oldest() {
        let cache = InMemoryResultCache::new(2);
        cache.put("a", PipeLineResult::success(Message::text("1"))).await;
        cache.put("b", PipeLineResult::success(Message::text("2"))).await;
        cache.put("c", PipeLineResult::success(Message::text("3"))).await;

        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.get("c").await.unwrap().result().as_str(), Some("3"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = InMemoryResultCache::new(4).with_time_to_live(Duration::from_secs(5));
        cache.put("a", PipeLineResult::success(Message::text("1"))).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_streams_are_not_cached() {
        let cache = InMemoryResultCache::new(4);
        cache
            .put(
                "a",
                PipeLineResult::success(Message::stream(std::io::Cursor::new(b"x".to_vec()))),
            )
            .await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.key_for(&Message::null()).is_none());
        assert_eq!(cache.key_for(&Message::text("k")).as_deref(), Some("k"));
    }
}
