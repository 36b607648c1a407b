// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle state of adapters and receivers.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle stage of a manageable component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Not running.
    Stopped,
    /// Start in progress.
    Starting,
    /// Running.
    Started,
    /// Stop in progress.
    Stopping,
    /// Failed; needs a reconfigure or a restart.
    Error,
    /// Start failed, cleanup in progress.
    ExceptionStarting,
    /// Stop failed, cleanup in progress.
    ExceptionStopping,
}

impl RunState {
    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Stopping => "Stopping",
            Self::Error => "Error",
            Self::ExceptionStarting => "Exception Starting",
            Self::ExceptionStopping => "Exception Stopping",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holder of one component's [`RunState`].
///
/// All transitions go through the watch channel's internal lock, so a
/// check-and-set is atomic with respect to concurrent transitions.
#[derive(Debug)]
pub struct RunStateManager {
    tx: watch::Sender<RunState>,
}

impl Default for RunStateManager {
    fn default() -> Self {
        Self::new(RunState::Stopped)
    }
}

impl RunStateManager {
    /// Create a manager in the given state.
    pub fn new(initial: RunState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current state.
    pub fn get(&self) -> RunState {
        *self.tx.borrow()
    }

    /// Unconditionally set the state.
    pub fn set(&self, state: RunState) {
        self.tx.send_replace(state);
    }

    /// Move from `expected` to `next`; returns whether the move happened.
    pub fn compare_and_set(&self, expected: RunState, next: RunState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == expected {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Apply `transition` to the current state under the lock.
    ///
    /// `transition` returns the new state, or `None` to leave it unchanged.
    /// Returns the state before the call.
    pub fn transition(&self, transition: impl FnOnce(RunState) -> Option<RunState>) -> RunState {
        let mut previous = RunState::Stopped;
        self.tx.send_if_modified(|state| {
            previous = *state;
            match transition(*state) {
                Some(next) if next != *state => {
                    *state = next;
                    true
                }
                _ => false,
            }
        });
        previous
    }

    /// Whether the current state is one of `states`.
    pub fn is_in_state(&self, states: &[RunState]) -> bool {
        states.contains(&self.get())
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&RunState) -> bool) -> RunState {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        match rx.wait_for(predicate).await {
            Ok(state) => *state,
            Err(_) => self.get(),
        }
    }
}
