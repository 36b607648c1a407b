// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conduit-core.
//!
//! Each kind of failure the engine can raise has its own type. Wrapping
//! errors keep their cause available through `source()`, and [`explain`]
//! folds a whole cause chain into one human-readable message.

use std::error::Error as StdError;
use std::fmt;

use crate::run_state::RunState;

/// Boxed cause carried by the wrapping error types.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Walk an error's cause chain and concatenate every fragment into one message.
///
/// Fragments whose text is already part of the accumulated message are skipped,
/// so wrappers that repeat their cause do not produce duplicated output.
pub fn explain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let fragment = cause.to_string();
        if !fragment.is_empty() && !text.contains(&fragment) {
            if !text.is_empty() {
                text.push_str(": ");
            }
            text.push_str(&fragment);
        }
        current = cause.source();
    }
    text
}

fn source_of(source: &Option<BoxError>) -> Option<&(dyn StdError + 'static)> {
    source.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
}

// ============================================================================
// Configuration
// ============================================================================

/// Problem detected while wiring an adapter, pipeline, pipe or receiver.
///
/// Fatal to startup: an adapter whose configuration failed cannot be started.
#[derive(Debug)]
pub struct ConfigurationError {
    message: String,
    source: Option<BoxError>,
}

impl ConfigurationError {
    /// Create a configuration error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error wrapping a cause.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The message of this error, without its causes.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for ConfigurationError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        source_of(&self.source)
    }
}

// ============================================================================
// Pipe execution
// ============================================================================

/// Classification of a [`PipeRunError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRunErrorKind {
    /// The pipe itself failed.
    Failed,
    /// The pipe (or an outbound call it made) exceeded its deadline.
    Timeout,
    /// A forward could not be resolved to a pipe or an exit.
    Forward,
    /// A pipeline-level collaborator (lock, cache, transaction) failed.
    Pipeline,
}

/// Failure raised during one hop of a pipeline, carrying the offending pipe.
#[derive(Debug)]
pub struct PipeRunError {
    pipe: Option<String>,
    kind: PipeRunErrorKind,
    message: String,
    source: Option<BoxError>,
}

impl PipeRunError {
    /// A failure inside the named pipe.
    pub fn new(pipe: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pipe: Some(pipe.into()),
            kind: PipeRunErrorKind::Failed,
            message: message.into(),
            source: None,
        }
    }

    /// A failure inside the named pipe, wrapping a cause.
    pub fn with_source(
        pipe: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::new(pipe, message)
        }
    }

    /// A deadline was exceeded while running the named pipe.
    pub fn timeout(pipe: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: PipeRunErrorKind::Timeout,
            ..Self::new(pipe, message)
        }
    }

    /// Forward resolution failed for the named pipe.
    pub fn forward(pipe: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: PipeRunErrorKind::Forward,
            ..Self::new(pipe, message)
        }
    }

    /// A pipeline-level failure not attributable to a single pipe.
    pub fn pipeline(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self {
            pipe: None,
            kind: PipeRunErrorKind::Pipeline,
            message: message.into(),
            source,
        }
    }

    /// Name of the pipe in error, if any.
    pub fn pipe(&self) -> Option<&str> {
        self.pipe.as_deref()
    }

    /// Classification of this failure.
    pub fn kind(&self) -> PipeRunErrorKind {
        self.kind
    }

    /// The message of this error, without the pipe prefix or causes.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PipeRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pipe {
            Some(pipe) => write!(f, "Pipe [{}] {}", pipe, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl StdError for PipeRunError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        source_of(&self.source)
    }
}

// ============================================================================
// Listener, sender and lifecycle
// ============================================================================

/// Failure raised by a listener or by the receiver while handling a message.
#[derive(Debug)]
pub struct ListenerError {
    message: String,
    source: Option<BoxError>,
}

impl ListenerError {
    /// Create a listener error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a listener error wrapping a cause.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for ListenerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        source_of(&self.source)
    }
}

/// Failure of an outbound call made through a [`Sender`](crate::listener::Sender).
#[derive(Debug)]
pub struct SenderError {
    message: String,
    timeout: bool,
    source: Option<BoxError>,
}

impl SenderError {
    /// Create a sender error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timeout: false,
            source: None,
        }
    }

    /// Create a sender error signalling an exceeded deadline.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timeout: true,
            ..Self::new(message)
        }
    }

    /// Create a sender error wrapping a cause.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::new(message)
        }
    }

    /// Whether this error reports an exceeded deadline.
    pub fn is_timeout(&self) -> bool {
        self.timeout
    }
}

impl fmt::Display for SenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for SenderError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        source_of(&self.source)
    }
}

/// Failure while starting or stopping a managed component.
///
/// Moves the component to `ERROR`; never escapes a lifecycle task.
#[derive(Debug)]
pub struct LifecycleError {
    component: String,
    message: String,
    source: Option<BoxError>,
}

impl LifecycleError {
    /// Create a lifecycle error for the named component.
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a lifecycle error wrapping a cause.
    pub fn with_source(
        component: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::new(component, message)
        }
    }

    /// The component that failed.
    pub fn component(&self) -> &str {
        &self.component
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.component, self.message)
    }
}

impl StdError for LifecycleError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        source_of(&self.source)
    }
}

// ============================================================================
// Transactions, storage and locks
// ============================================================================

/// Errors raised by a [`TransactionManager`](crate::transaction::TransactionManager).
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum TransactionError {
    /// MANDATORY propagation without an active transaction.
    #[error("no existing transaction found for transaction marked with propagation 'mandatory'")]
    NoExistingTransaction,

    /// NEVER propagation with an active transaction.
    #[error("existing transaction found for transaction marked with propagation 'never'")]
    ExistingTransaction,

    /// The transaction outlived its timeout and was rolled back.
    #[error("transaction [{name}] timed out after {timeout_secs}s and has been rolled back")]
    TimedOut {
        /// Name of the transaction.
        name: String,
        /// The timeout that was exceeded.
        timeout_secs: u64,
    },

    /// Commit or rollback called twice for the same transaction.
    #[error("transaction [{name}] is already completed")]
    AlreadyCompleted {
        /// Name of the transaction.
        name: String,
    },
}

/// Errors raised by a [`MessageStorage`](crate::storage::MessageStorage).
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The database rejected an operation.
    #[error("storage error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// No message is stored under the given key.
    #[error("no message found with storage key [{key}]")]
    NotFound {
        /// The storage key that was not found.
        key: String,
    },
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

/// Errors raised by a [`Locker`](crate::locker::Locker).
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum LockError {
    /// The lock table could not be read or written.
    #[error("lock error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

// ============================================================================
// Message processing
// ============================================================================

/// Error returned by the strict message-processing entry points.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProcessingError {
    /// A pipe failed during one of the hops.
    PipeRun(PipeRunError),

    /// The adapter's run state does not accept traffic.
    ManagedState {
        /// Name of the adapter.
        adapter: String,
        /// The state the adapter was in.
        state: RunState,
    },

    /// The receiver or its listener failed.
    Listener(ListenerError),

    /// A transaction could not be started or finished.
    Transaction(TransactionError),

    /// Durable storage failed.
    Storage(StorageError),
}

impl ProcessingError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PipeRun(_) => "PIPE_RUN_ERROR",
            Self::ManagedState { .. } => "MANAGED_STATE_ERROR",
            Self::Listener(_) => "LISTENER_ERROR",
            Self::Transaction(_) => "TRANSACTION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// The pipe in error, when a pipe raised this error.
    pub fn pipe_in_error(&self) -> Option<&str> {
        match self {
            Self::PipeRun(e) => e.pipe(),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipeRun(e) => write!(f, "{}", e),
            Self::ManagedState { adapter, state } => write!(
                f,
                "Adapter [{}] in state [{}], cannot process message",
                adapter, state
            ),
            Self::Listener(e) => write!(f, "{}", e),
            Self::Transaction(e) => write!(f, "{}", e),
            Self::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl StdError for ProcessingError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::PipeRun(e) => e.source(),
            Self::Listener(e) => e.source(),
            Self::ManagedState { .. } | Self::Transaction(_) | Self::Storage(_) => None,
        }
    }
}

impl From<PipeRunError> for ProcessingError {
    fn from(err: PipeRunError) -> Self {
        ProcessingError::PipeRun(err)
    }
}

impl From<ListenerError> for ProcessingError {
    fn from(err: ListenerError) -> Self {
        ProcessingError::Listener(err)
    }
}

impl From<TransactionError> for ProcessingError {
    fn from(err: TransactionError) -> Self {
        ProcessingError::Transaction(err)
    }
}

impl From<StorageError> for ProcessingError {
    fn from(err: StorageError) -> Self {
        ProcessingError::Storage(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_error_codes() {
        let test_cases = vec![
            (
                ProcessingError::PipeRun(PipeRunError::new("p", "failed")),
                "PIPE_RUN_ERROR",
            ),
            (
                ProcessingError::ManagedState {
                    adapter: "a".to_string(),
                    state: RunState::Stopped,
                },
                "MANAGED_STATE_ERROR",
            ),
            (
                ProcessingError::Listener(ListenerError::new("x")),
                "LISTENER_ERROR",
            ),
            (
                ProcessingError::Transaction(TransactionError::NoExistingTransaction),
                "TRANSACTION_ERROR",
            ),
            (
                ProcessingError::Storage(StorageError::NotFound {
                    key: "k".to_string(),
                }),
                "STORAGE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "wrong code for {}", error);
        }
    }

    #[test]
    fn test_managed_state_display() {
        let err = ProcessingError::ManagedState {
            adapter: "orders".to_string(),
            state: RunState::Stopped,
        };
        assert_eq!(
            err.to_string(),
            "Adapter [orders] in state [Stopped], cannot process message"
        );
    }

    #[test]
    fn test_pipe_run_error_display_carries_pipe() {
        let err = PipeRunError::new("Transform", "could not parse input");
        assert_eq!(err.to_string(), "Pipe [Transform] could not parse input");
        assert_eq!(err.pipe(), Some("Transform"));
        assert_eq!(err.kind(), PipeRunErrorKind::Failed);

        let err = PipeRunError::pipeline("lock failed", None);
        assert_eq!(err.to_string(), "lock failed");
        assert_eq!(err.pipe(), None);
    }

    #[test]
    fn test_explain_concatenates_chain() {
        let inner = std::io::Error::other("connection refused");
        let middle = ListenerError::with_source("could not open queue", inner);
        let outer = PipeRunError::with_source("Send", "call failed", middle);

        assert_eq!(
            explain(&outer),
            "Pipe [Send] call failed: could not open queue: connection refused"
        );
    }

    #[test]
    fn test_explain_skips_repeated_fragments() {
        let inner = ConfigurationError::new("no Pipes in PipeLine");
        let outer =
            ConfigurationError::with_source("Adapter [a] no Pipes in PipeLine", inner);
        assert_eq!(explain(&outer), "Adapter [a] no Pipes in PipeLine");
    }

    #[test]
    fn test_processing_error_source_skips_wrapper() {
        let inner = std::io::Error::other("disk full");
        let err = ProcessingError::from(PipeRunError::with_source("Write", "failed", inner));
        assert_eq!(explain(&err), "Pipe [Write] failed: disk full");
        assert_eq!(err.pipe_in_error(), Some("Write"));
    }

    #[test]
    fn test_storage_error_from_sqlx() {
        let err = StorageError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::Database { .. }));
        assert!(err.to_string().contains("query"));
    }
}
