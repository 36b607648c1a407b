// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipeline edges and terminals.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of the forward a pipe follows when it completes normally.
pub const SUCCESS_FORWARD_NAME: &str = "success";

/// Name of the forward a pipe follows when it fails, if declared.
pub const EXCEPTION_FORWARD_NAME: &str = "exception";

/// Path of the exit synthesized when a pipeline declares none.
pub const DEFAULT_EXIT_PATH: &str = "READY";

/// A named, symbolic edge from a pipe to a pipe or an exit.
///
/// Resolved lazily by the pipeline at the moment it is followed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipeForward {
    name: String,
    path: String,
}

impl PipeForward {
    /// Create a forward.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Name by which the pipe selects this forward.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the pipe or exit this forward points to.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Result state of a finished pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitState {
    /// The message was handled.
    Success,
    /// Handling the message failed.
    Error,
    /// The message was refused.
    Rejected,
}

impl ExitState {
    /// Upper-case name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(format!("unknown exit state [{}]", other)),
        }
    }
}

/// Terminal node of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeLineExit {
    path: String,
    state: ExitState,
    exit_code: i32,
    empty_result: bool,
    skip_wrapping: bool,
    skip_validation: bool,
}

impl PipeLineExit {
    /// Create an exit with exit code 0.
    pub fn new(path: impl Into<String>, state: ExitState) -> Self {
        Self {
            path: path.into(),
            state,
            exit_code: 0,
            empty_result: false,
            skip_wrapping: false,
            skip_validation: false,
        }
    }

    /// The default `READY` success exit.
    pub fn ready() -> Self {
        Self::new(DEFAULT_EXIT_PATH, ExitState::Success)
    }

    /// Set the numeric status code reported for this exit.
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Discard the last pipe's result when this exit is reached.
    pub fn with_empty_result(mut self, empty: bool) -> Self {
        self.empty_result = empty;
        self
    }

    /// Bypass the output wrapper for this exit.
    pub fn with_skip_wrapping(mut self, skip: bool) -> Self {
        self.skip_wrapping = skip;
        self
    }

    /// Bypass the output validator for this exit.
    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    /// Name under which forwards reach this exit.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Result state of the run when this exit is reached.
    pub fn state(&self) -> ExitState {
        self.state
    }

    /// Numeric status code.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Whether the result is discarded.
    pub fn is_empty_result(&self) -> bool {
        self.empty_result
    }

    /// Whether output wrapping is skipped.
    pub fn skip_wrapping(&self) -> bool {
        self.skip_wrapping
    }

    /// Whether output validation is skipped.
    pub fn skip_validation(&self) -> bool {
        self.skip_validation
    }
}
