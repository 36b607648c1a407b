// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded rolling log of lifecycle and error messages.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a message keeper entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKeeperLevel {
    /// Informational.
    Info,
    /// Something an operator should look at.
    Warn,
    /// A failure.
    Error,
}

/// One entry in a [`MessageKeeper`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageKeeperEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// The message text.
    pub message: String,
    /// Severity.
    pub level: MessageKeeperLevel,
}

/// Keeps the most recent `capacity` messages, dropping the oldest.
#[derive(Debug)]
pub struct MessageKeeper {
    capacity: usize,
    entries: Mutex<VecDeque<MessageKeeperEntry>>,
}

impl MessageKeeper {
    /// Create a keeper holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a message.
    pub fn add(&self, message: impl Into<String>, level: MessageKeeperLevel) {
        let entry = MessageKeeperEntry {
            timestamp: Utc::now(),
            message: message.into(),
            level,
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of the entries, oldest first.
    pub fn entries(&self) -> Vec<MessageKeeperEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    /// The most recent entry.
    pub fn last(&self) -> Option<MessageKeeperEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.back().cloned()
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_oldest() {
        let keeper = MessageKeeper::new(2);
        keeper.add("one", MessageKeeperLevel::Info);
        keeper.add("two", MessageKeeperLevel::Warn);
        keeper.add("three", MessageKeeperLevel::Error);

        let messages: Vec<_> = keeper.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert_eq!(keeper.last().unwrap().level, MessageKeeperLevel::Error);
    }

    #[test]
    fn test_minimum_capacity() {
        let keeper = MessageKeeper::new(0);
        assert_eq!(keeper.capacity(), 1);
        keeper.add("a", MessageKeeperLevel::Info);
        keeper.add("b", MessageKeeperLevel::Info);
        assert_eq!(keeper.len(), 1);
    }
}
