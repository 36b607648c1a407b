// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable lifecycle of a received message.
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | `AVAILABLE` | `INPROCESS` | picked up by a listener |
//! | `INPROCESS` | `DONE` | processed successfully |
//! | `INPROCESS` | `ERROR` | processing failed |
//! | `INPROCESS` | `AVAILABLE` | the pick-up transaction rolled back |
//! | `ERROR` | `AVAILABLE` | operator retry |
//! | `ERROR` | `HOLD` | operator park |
//! | `HOLD` | `ERROR` | operator release |
//!
//! A receiver only supports the transitions whose source and target it
//! knows; a listener without a HOLD slot offers no park/unpark.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stage of a durably stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Waiting to be picked up.
    Available,
    /// Picked up, processing not finished.
    InProcess,
    /// Processed successfully.
    Done,
    /// Processing failed.
    Error,
    /// Parked by an operator.
    Hold,
}

impl ProcessState {
    /// Every state, in declaration order.
    pub const ALL: [ProcessState; 5] = [
        ProcessState::Available,
        ProcessState::InProcess,
        ProcessState::Done,
        ProcessState::Error,
        ProcessState::Hold,
    ];

    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::InProcess => "InProcess",
            Self::Done => "Done",
            Self::Error => "Error",
            Self::Hold => "Hold",
        }
    }

    /// Every state this one may move to, regardless of what a receiver knows.
    pub fn successors(&self) -> &'static [ProcessState] {
        match self {
            Self::Available => &[ProcessState::InProcess],
            Self::InProcess => &[
                ProcessState::Done,
                ProcessState::Error,
                ProcessState::Available,
            ],
            Self::Done => &[],
            Self::Error => &[ProcessState::Available, ProcessState::Hold],
            Self::Hold => &[ProcessState::Error],
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal-transition map for a set of known states.
///
/// Every known state gets an entry, possibly empty; transitions to states
/// outside `known` are dropped.
pub fn target_process_states(
    known: &BTreeSet<ProcessState>,
) -> BTreeMap<ProcessState, BTreeSet<ProcessState>> {
    known
        .iter()
        .map(|from| {
            let targets = from
                .successors()
                .iter()
                .copied()
                .filter(|to| known.contains(to))
                .collect();
            (*from, targets)
        })
        .collect()
}

/// Whether `from → to` is in the legal-transition map.
pub fn is_legal_transition(
    targets: &BTreeMap<ProcessState, BTreeSet<ProcessState>>,
    from: ProcessState,
    to: ProcessState,
) -> bool {
    targets.get(&from).is_some_and(|t| t.contains(&to))
}
