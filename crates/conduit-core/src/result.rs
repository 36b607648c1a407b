// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outcome carriers for one pipe hop and for one pipeline run.

use crate::forward::{ExitState, SUCCESS_FORWARD_NAME};
use crate::message::Message;

/// What a pipe produced and which of its forwards to follow next.
#[derive(Debug, Clone)]
pub struct PipeRunResult {
    forward_name: String,
    result: Message,
}

impl PipeRunResult {
    /// Follow the named forward with the given result.
    pub fn new(forward_name: impl Into<String>, result: Message) -> Self {
        Self {
            forward_name: forward_name.into(),
            result,
        }
    }

    /// Follow the `success` forward with the given result.
    pub fn success(result: Message) -> Self {
        Self::new(SUCCESS_FORWARD_NAME, result)
    }

    /// Name of the forward to follow.
    pub fn forward_name(&self) -> &str {
        &self.forward_name
    }

    /// Whether the pipe selected its `success` forward.
    pub fn is_successful(&self) -> bool {
        self.forward_name == SUCCESS_FORWARD_NAME
    }

    /// The produced message.
    pub fn result(&self) -> &Message {
        &self.result
    }

    /// Take the produced message.
    pub fn into_result(self) -> Message {
        self.result
    }
}

/// Outcome of a complete pipeline run.
#[derive(Debug, Clone)]
pub struct PipeLineResult {
    state: ExitState,
    exit_code: i32,
    result: Message,
}

impl Default for PipeLineResult {
    fn default() -> Self {
        Self {
            state: ExitState::Error,
            exit_code: 0,
            result: Message::null(),
        }
    }
}

impl PipeLineResult {
    /// Create a result.
    pub fn new(state: ExitState, exit_code: i32, result: Message) -> Self {
        Self {
            state,
            exit_code,
            result,
        }
    }

    /// A SUCCESS result with exit code 0.
    pub fn success(result: Message) -> Self {
        Self::new(ExitState::Success, 0, result)
    }

    /// An ERROR result with exit code 0.
    pub fn error(result: Message) -> Self {
        Self::new(ExitState::Error, 0, result)
    }

    /// Exit state of the run.
    pub fn state(&self) -> ExitState {
        self.state
    }

    /// Numeric status code of the exit reached.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// The result message.
    pub fn result(&self) -> &Message {
        &self.result
    }

    /// Replace the result message.
    pub fn set_result(&mut self, result: Message) {
        self.result = result;
    }

    /// Whether the run ended in a SUCCESS exit.
    pub fn is_successful(&self) -> bool {
        self.state == ExitState::Success
    }
}
