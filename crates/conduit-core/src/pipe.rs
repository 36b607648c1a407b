// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The processing step contract.
//!
//! A [`Pipe`] receives a message and the session, and answers with a
//! [`PipeRunResult`] naming the forward to follow. Optional capabilities
//! (size statistics, session variables consumed, sensitive-data masks) are
//! default methods a pipe overrides when it has them.
//!
//! A [`PipeDefinition`] wraps a pipe with the wiring the pipeline needs:
//! its forwards, its concurrency ceiling and its transaction boundary.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConfigurationError, LifecycleError, PipeRunError};
use crate::forward::PipeForward;
use crate::message::Message;
use crate::result::PipeRunResult;
use crate::session::PipeLineSession;
use crate::transaction::{TransactionAttribute, TransactionDefinition};

/// One step in a pipeline.
#[async_trait]
pub trait Pipe: Send + Sync {
    /// Name of the pipe, unique within its pipeline.
    fn name(&self) -> &str;

    /// Validate settings. Called once while the pipeline is configured.
    fn configure(&self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Acquire resources before the first message.
    async fn start(&self) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Release resources after the last message.
    async fn stop(&self) {}

    /// Process one message.
    async fn do_pipe(
        &self,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError>;

    /// Whether this pipe reads the given session key.
    ///
    /// A pipe reading `originalMessage` forces the pipeline to buffer the
    /// input, since it may be consumed again after the first pipe read it.
    fn consumes_session_variable(&self, key: &str) -> bool {
        let _ = key;
        false
    }

    /// Regex matching sensitive values this pipe may log.
    fn hide_regex(&self) -> Option<&str> {
        None
    }

    /// Whether the pipeline keeps message size statistics for this pipe.
    fn has_size_statistics(&self) -> bool {
        false
    }
}

/// Run `future` with a deadline, raising a timeout error for `pipe` when it
/// is exceeded. The inner future is dropped at the deadline.
pub async fn with_timeout<T, F>(pipe: &str, timeout: Duration, future: F) -> Result<T, PipeRunError>
where
    F: Future<Output = Result<T, PipeRunError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(PipeRunError::timeout(
            pipe,
            format!("exceeds timeout of [{}] ms, interrupted", timeout.as_millis()),
        )),
    }
}

/// A pipe together with its wiring.
#[derive(Clone)]
pub struct PipeDefinition {
    pipe: Arc<dyn Pipe>,
    forwards: Vec<PipeForward>,
    max_threads: usize,
    transaction: TransactionDefinition,
}

impl fmt::Debug for PipeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeDefinition")
            .field("name", &self.pipe.name())
            .field("forwards", &self.forwards)
            .field("max_threads", &self.max_threads)
            .field("transaction", &self.transaction)
            .finish()
    }
}

impl PipeDefinition {
    /// Wrap a pipe without forwards, concurrency limit or transaction.
    pub fn new(pipe: impl Pipe + 'static) -> Self {
        Self::from_arc(Arc::new(pipe))
    }

    /// Wrap a shared pipe.
    pub fn from_arc(pipe: Arc<dyn Pipe>) -> Self {
        Self {
            pipe,
            forwards: Vec::new(),
            max_threads: 0,
            transaction: TransactionDefinition::default(),
        }
    }

    /// Add a forward. A later forward with the same name replaces the earlier one.
    pub fn with_forward(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        let forward = PipeForward::new(name, path);
        self.forwards.retain(|f| f.name() != forward.name());
        self.forwards.push(forward);
        self
    }

    /// Limit concurrent invocations; 0 means unlimited.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Run each hop through this pipe under `attribute`.
    pub fn with_transaction_attribute(mut self, attribute: TransactionAttribute) -> Self {
        self.transaction = TransactionDefinition::new(attribute).with_timeout(self.transaction.timeout());
        self
    }

    /// Timeout for transactions this pipe starts.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction = self.transaction.with_timeout(Some(timeout));
        self
    }

    /// Name of the wrapped pipe.
    pub fn name(&self) -> &str {
        self.pipe.name()
    }

    /// The wrapped pipe.
    pub fn pipe(&self) -> &Arc<dyn Pipe> {
        &self.pipe
    }

    /// Forwards declared on this pipe.
    pub fn forwards(&self) -> &[PipeForward] {
        &self.forwards
    }

    /// Concurrency ceiling; 0 means unlimited.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Transaction boundary around each hop.
    pub fn transaction_definition(&self) -> &TransactionDefinition {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Pipe for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn do_pipe(
            &self,
            message: Message,
            _session: &mut PipeLineSession,
        ) -> Result<PipeRunResult, PipeRunError> {
            Ok(PipeRunResult::success(message))
        }
    }

    #[test]
    fn test_definition_replaces_forward_with_same_name() {
        let def = PipeDefinition::new(Echo)
            .with_forward("success", "A")
            .with_forward("success", "B")
            .with_forward("exception", "ERROR");
        assert_eq!(def.forwards().len(), 2);
        assert_eq!(def.forwards()[1].path(), "B");
        assert_eq!(def.name(), "Echo");
    }

    #[test]
    fn test_transaction_settings_combine() {
        let def = PipeDefinition::new(Echo)
            .with_transaction_timeout(Duration::from_secs(5))
            .with_transaction_attribute(TransactionAttribute::RequiresNew);
        assert_eq!(
            def.transaction_definition().attribute(),
            TransactionAttribute::RequiresNew
        );
        assert_eq!(
            def.transaction_definition().timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), PipeRunError> = with_timeout("Slow", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), crate::error::PipeRunErrorKind::Timeout);
        assert_eq!(err.pipe(), Some("Slow"));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout("Fast", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
