// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Receivers bridge a [`Listener`] to an [`Adapter`].
//!
//! A receiver owns the per-message bookkeeping around a pipeline run:
//!
//! - message and correlation ids (synthetic when the transport has none)
//! - redelivery counting, rejection after `max_retries`, duplicate checks
//!   against the DONE message log
//! - the receiver transaction and the process-state move to DONE or ERROR
//! - error storage and manual retries from it
//!
//! Pulling listeners get `num_threads` polling tasks; push listeners call
//! [`Receiver::process_raw_message`] from their own tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::Adapter;
use crate::config::Config;
use crate::error::{ConfigurationError, ListenerError, ProcessingError, explain};
use crate::forward::ExitState;
use crate::listener::{Listener, RawMessage, Sender};
use crate::message::Message;
use crate::process_state::{self, ProcessState};
use crate::result::PipeLineResult;
use crate::run_state::{RunState, RunStateManager};
use crate::session::{MANUAL_RETRY_KEY, PipeLineSession};
use crate::statistics::{
    CounterStatistic, ScalarValue, StatisticsAction, StatisticsIterationHandler, StatisticsKeeper,
};
use crate::storage::{MessageStorage, StoredMessage};
use crate::transaction::{
    self, LocalTransactionManager, Transaction, TransactionAttribute, TransactionDefinition,
    TransactionManager, TransactionOutcome, TransactionSynchronization,
};

/// Session key set when a message is seen more than once.
pub const RETRY_FLAG_SESSION_KEY: &str = "retry";

/// Prefix of ids generated for messages the transport did not identify.
pub const SYNTHETIC_MESSAGE_ID_PREFIX: &str = "synthetic-message-id-";

/// Comments stored with every message log entry.
const MESSAGE_LOG_COMMENTS: &str = "log";

const MAX_COMMENT_LEN: usize = 1000;
const PROCESS_RESULT_CACHE_SIZE: usize = 100;
const POLL_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(60);

// ============================================================================
// Settings
// ============================================================================

/// What a receiver does after a message failed with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Log and carry on with the next message.
    #[default]
    Continue,
    /// Stop the receiver.
    Close,
}

/// Which id identifies a duplicate in the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateCheck {
    #[default]
    MessageId,
    CorrelationId,
}

// ============================================================================
// Process result cache
// ============================================================================

/// What the receiver remembers about earlier deliveries of a message.
#[derive(Debug, Clone)]
pub struct ProcessResultCacheItem {
    /// Number of completed processing attempts.
    pub receive_count: u32,
    /// When the message was first received.
    pub received_at: DateTime<Utc>,
    /// Outcome of the last attempt.
    pub comments: String,
}

#[derive(Debug, Default)]
struct ProcessResultCache {
    items: HashMap<String, ProcessResultCacheItem>,
    order: VecDeque<String>,
}

impl ProcessResultCache {
    fn get(&self, message_id: &str) -> Option<ProcessResultCacheItem> {
        self.items.get(message_id).cloned()
    }

    fn record(
        &mut self,
        message_id: &str,
        comments: &str,
        received_at: DateTime<Utc>,
    ) -> ProcessResultCacheItem {
        if !self.items.contains_key(message_id) {
            if self.order.len() >= PROCESS_RESULT_CACHE_SIZE
                && let Some(oldest) = self.order.pop_front()
            {
                self.items.remove(&oldest);
            }
            self.order.push_back(message_id.to_string());
        }
        let item = self
            .items
            .entry(message_id.to_string())
            .or_insert_with(|| ProcessResultCacheItem {
                receive_count: 0,
                received_at,
                comments: String::new(),
            });
        item.receive_count += 1;
        item.comments = truncate_comments(comments);
        item.clone()
    }

    fn reset(&mut self, message_id: &str) {
        if let Some(item) = self.items.get_mut(message_id) {
            item.receive_count = 0;
        }
    }
}

fn truncate_comments(text: &str) -> String {
    match text.char_indices().nth(MAX_COMMENT_LEN) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn synthetic_message_id() -> String {
    format!("{}{}", SYNTHETIC_MESSAGE_ID_PREFIX, Uuid::new_v4())
}

/// Removes a message log entry when the receiver transaction rolls back.
struct DeleteOnRollback {
    storage: Arc<dyn MessageStorage>,
    storage_key: String,
}

#[async_trait]
impl TransactionSynchronization for DeleteOnRollback {
    async fn after_completion(&self, outcome: TransactionOutcome) {
        if outcome != TransactionOutcome::RolledBack {
            return;
        }
        if let Err(e) = self.storage.delete_message(&self.storage_key).await {
            warn!(key = %self.storage_key, error = %e, "Could not remove message log entry after rollback");
        }
    }
}

// ============================================================================
// Type-erased view
// ============================================================================

/// The receiver operations an [`Adapter`] and an administrative layer use,
/// independent of the listener's raw message type.
#[async_trait]
pub trait ManagedReceiver: Send + Sync {
    /// Receiver name.
    fn name(&self) -> &str;

    /// Bind this receiver to its adapter. Only the first call has effect.
    fn attach(&self, adapter: Weak<Adapter>);

    /// Validate settings and derive the known process states.
    fn configure(&self) -> Result<(), ConfigurationError>;

    /// Whether the last [`configure`](Self::configure) succeeded.
    fn configuration_succeeded(&self) -> bool;

    /// Open the listener and sender, then start polling.
    async fn start_running(&self);

    /// Ask the receiver to stop; it reaches STOPPED asynchronously.
    fn stop_running(&self);

    /// Current run state.
    fn run_state(&self) -> RunState;

    /// Whether messages are processed inside a receiver transaction.
    fn is_transacted(&self) -> bool;

    /// States this receiver can hold messages in.
    fn known_process_states(&self) -> BTreeSet<ProcessState>;

    /// Legal moves between [`known_process_states`](Self::known_process_states).
    fn target_process_states(&self) -> BTreeMap<ProcessState, BTreeSet<ProcessState>>;

    /// Browser over the messages in `state`.
    fn message_browser(&self, state: ProcessState) -> Option<Arc<dyn MessageStorage>>;

    /// Messages received.
    fn messages_received(&self) -> u64;

    /// Messages received again after an earlier attempt.
    fn messages_retried(&self) -> u64;

    /// Messages rejected after too many attempts.
    fn messages_rejected(&self) -> u64;

    /// Reprocess a message from the error storage.
    async fn retry_message(&self, storage_key: &str) -> Result<Message, ListenerError>;

    /// Export counters and the processing-duration statistic.
    fn iterate_statistics(
        &self,
        handler: &mut dyn StatisticsIterationHandler,
        action: StatisticsAction,
    );
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Receiver`].
pub struct ReceiverBuilder<M: Send + Sync + 'static> {
    name: String,
    listener: Arc<dyn Listener<M>>,
    sender: Option<Arc<dyn Sender>>,
    error_storage: Option<Arc<dyn MessageStorage>>,
    message_log: Option<Arc<dyn MessageStorage>>,
    transaction: TransactionDefinition,
    transaction_manager: Arc<dyn TransactionManager>,
    max_retries: i32,
    check_for_duplicates: Option<DuplicateCheck>,
    on_error: OnError,
    num_threads: usize,
    poll_interval: Duration,
}

impl<M: Send + Sync + 'static> ReceiverBuilder<M> {
    /// Route raw message results to `sender`.
    pub fn sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Store failed messages in `storage`.
    pub fn error_storage(mut self, storage: Arc<dyn MessageStorage>) -> Self {
        self.error_storage = Some(storage);
        self
    }

    /// Log every received message in `storage`.
    pub fn message_log(mut self, storage: Arc<dyn MessageStorage>) -> Self {
        self.message_log = Some(storage);
        self
    }

    /// Transaction attribute for each message; the timeout comes from the config.
    pub fn transaction_attribute(mut self, attribute: TransactionAttribute) -> Self {
        self.transaction = TransactionDefinition::new(attribute).with_timeout(self.transaction.timeout());
        self
    }

    /// Transaction timeout for each message.
    pub fn transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction = self.transaction.with_timeout(timeout);
        self
    }

    /// Manager used for receiver transactions.
    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = manager;
        self
    }

    /// Attempts before a message is rejected; negative means unlimited.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Skip messages already present in the DONE message log.
    pub fn check_for_duplicates(mut self, method: DuplicateCheck) -> Self {
        self.check_for_duplicates = Some(method);
        self
    }

    /// What to do after a failed message.
    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Number of polling tasks for a pulling listener.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    /// Sleep after a poll that returned nothing.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Build the receiver.
    pub fn build(self) -> Arc<Receiver<M>> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Receiver {
            name: self.name,
            listener: self.listener,
            sender: self.sender,
            error_storage: self.error_storage,
            message_log: self.message_log,
            transaction: self.transaction,
            transaction_manager: self.transaction_manager,
            max_retries: self.max_retries,
            check_for_duplicates: self.check_for_duplicates,
            on_error: self.on_error,
            num_threads: self.num_threads,
            poll_interval: self.poll_interval,
            run_state: RunStateManager::default(),
            adapter: OnceLock::new(),
            known_states: RwLock::new(BTreeSet::new()),
            configured: AtomicBool::new(false),
            process_results: Mutex::new(ProcessResultCache::default()),
            received: CounterStatistic::new(),
            retried: CounterStatistic::new(),
            rejected: CounterStatistic::new(),
            processing: Mutex::new(StatisticsKeeper::new("processing duration")),
            last_message: Mutex::new(None),
            shutdown,
            pollers: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Receives messages from one listener and hands them to the adapter.
pub struct Receiver<M: Send + Sync + 'static> {
    name: String,
    listener: Arc<dyn Listener<M>>,
    sender: Option<Arc<dyn Sender>>,
    error_storage: Option<Arc<dyn MessageStorage>>,
    message_log: Option<Arc<dyn MessageStorage>>,
    transaction: TransactionDefinition,
    transaction_manager: Arc<dyn TransactionManager>,
    max_retries: i32,
    check_for_duplicates: Option<DuplicateCheck>,
    on_error: OnError,
    num_threads: usize,
    poll_interval: Duration,

    run_state: RunStateManager,
    adapter: OnceLock<Weak<Adapter>>,
    known_states: RwLock<BTreeSet<ProcessState>>,
    configured: AtomicBool,
    process_results: Mutex<ProcessResultCache>,

    received: CounterStatistic,
    retried: CounterStatistic,
    rejected: CounterStatistic,
    processing: Mutex<StatisticsKeeper>,
    last_message: Mutex<Option<DateTime<Utc>>>,

    shutdown: watch::Sender<bool>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
    me: Weak<Self>,
}

impl<M: Send + Sync + 'static> std::fmt::Debug for Receiver<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("listener", &self.listener.name())
            .field("run_state", &self.run_state.get())
            .field("transaction", &self.transaction)
            .finish()
    }
}

/// Result of one pass through the adapter.
struct ProcessOutcome {
    result: Message,
    in_error: bool,
    error_message: String,
}

impl<M: Send + Sync + 'static> Receiver<M> {
    /// Start building a receiver named `name` over `listener`.
    ///
    /// `max_retries` and the transaction timeout default to `config`.
    pub fn builder(
        name: impl Into<String>,
        listener: Arc<dyn Listener<M>>,
        config: &Config,
    ) -> ReceiverBuilder<M> {
        ReceiverBuilder {
            name: name.into(),
            listener,
            sender: None,
            error_storage: None,
            message_log: None,
            transaction: TransactionDefinition::new(TransactionAttribute::Supports)
                .with_timeout(config.transaction_timeout),
            transaction_manager: Arc::new(LocalTransactionManager::new()),
            max_retries: config.receiver_max_retries,
            check_for_duplicates: None,
            on_error: OnError::default(),
            num_threads: 1,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// The listener.
    pub fn listener(&self) -> &Arc<dyn Listener<M>> {
        &self.listener
    }

    /// When the last message arrived.
    pub fn last_message_date(&self) -> Option<DateTime<Utc>> {
        *self.last_message.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// What the receiver remembers about `message_id`.
    pub fn cached_process_result(&self, message_id: &str) -> Option<ProcessResultCacheItem> {
        self.process_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_id)
    }

    /// Move a message between process states through the listener.
    ///
    /// Returns `None` when the listener keeps no process state or the move
    /// is not legal. Moving a message back to AVAILABLE forgets its
    /// delivery history.
    pub async fn change_process_state(
        &self,
        raw: &RawMessage<M>,
        to: ProcessState,
        reason: Option<&str>,
    ) -> Result<Option<RawMessage<M>>, ListenerError> {
        let Some(ps) = self.listener.as_process_state() else {
            return Ok(None);
        };
        if to == ProcessState::Available
            && let Some(id) = raw.id()
        {
            self.process_results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .reset(id);
        }
        ps.change_process_state(raw, to, reason).await
    }

    /// Process a message delivered by a push listener.
    pub async fn process_raw_message(&self, raw: &RawMessage<M>) -> Result<Message, ListenerError> {
        let state = self.run_state.get();
        if state != RunState::Started {
            return Err(ListenerError::new(format!(
                "receiver [{}] in state [{}], cannot process message",
                self.name, state
            )));
        }
        let outcome = self.process_raw(raw).await;
        if let Err(e) = &outcome {
            self.exception_thrown(e);
        }
        outcome
    }

    async fn process_raw(&self, raw: &RawMessage<M>) -> Result<Message, ListenerError> {
        let message = self.listener.extract_message(raw)?;
        let outcome = self
            .process_message_in_adapter(
                Some(raw),
                message,
                raw.id().map(str::to_string),
                raw.correlation_id().map(str::to_string),
                Utc::now(),
                false,
            )
            .await?;
        Ok(outcome.result)
    }

    fn adapter(&self) -> Result<Arc<Adapter>, ListenerError> {
        self.adapter
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ListenerError::new(format!("receiver [{}] has no adapter", self.name)))
    }

    fn exception_thrown(&self, error: &ListenerError) {
        match self.on_error {
            OnError::Continue => {
                error!(receiver = %self.name, error = %explain(error), "Error while processing message");
            }
            OnError::Close => {
                error!(receiver = %self.name, error = %explain(error), "Error while processing message, stopping receiver");
                self.stop_running();
            }
        }
    }

    // ========================================================================
    // Message processing
    // ========================================================================

    async fn process_message_in_adapter(
        &self,
        raw: Option<&RawMessage<M>>,
        mut message: Message,
        message_id: Option<String>,
        correlation_id: Option<String>,
        received_at: DateTime<Utc>,
        manual_retry: bool,
    ) -> Result<ProcessOutcome, ListenerError> {
        let started = Instant::now();
        *self.last_message.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        let adapter = self.adapter()?;

        let message_id = message_id.unwrap_or_else(synthetic_message_id);
        let correlation_id = correlation_id.unwrap_or_else(|| message_id.clone());
        let mut session = PipeLineSession::with_ids(&message_id, Some(correlation_id.clone()));
        session.set_received(received_at);
        if manual_retry {
            session.put(MANUAL_RETRY_KEY, true);
        }

        if self.error_storage.is_some() || self.message_log.is_some() {
            message.preserve().map_err(|e| {
                ListenerError::with_source(format!("could not preserve message [{}]", message_id), e)
            })?;
        }

        if self
            .check_message_history(
                raw,
                &message,
                &message_id,
                &correlation_id,
                &mut session,
                manual_retry,
            )
            .await?
        {
            return Ok(ProcessOutcome {
                result: Message::null(),
                in_error: false,
                error_message: String::new(),
            });
        }

        let mut tx = Transaction::begin(
            self.transaction_manager.clone(),
            &self.transaction,
            format!("receiver [{}]", self.name),
        )
        .await
        .map_err(|e| ListenerError::with_source("could not start receiver transaction", e))?;
        self.received.increment();
        debug!(receiver = %self.name, message_id = %message_id, correlation_id = %correlation_id, "Received message");

        let outcome = tx
            .scope(async {
                self.log_message(&message_id, &correlation_id, &message, received_at)
                    .await?;
                adapter
                    .process_message_with_exceptions(&message_id, message.clone(), &mut session)
                    .await
            })
            .await;

        let mut failure = None;
        let (mut result, mut error_message, in_error) = match outcome {
            Ok(result) => {
                let mut text = format!(
                    "exitState [{}], result [{}]",
                    result.state(),
                    truncate_comments(&result.result().to_string())
                );
                if result.exit_code() > 0 {
                    text.push_str(&format!(", exitcode [{}]", result.exit_code()));
                }
                let mut in_error = tx.is_rollback_only();
                if !in_error && !self.is_transacted() {
                    in_error = !result.is_successful();
                }
                (result, text, in_error)
            }
            Err(e) => {
                tx.set_rollback_only();
                let text = explain(&e);
                error!(receiver = %self.name, message_id = %message_id, error = %text, "Exception in message processing");
                let formatted = adapter.format_error_message(
                    "exception caught",
                    Some(&e),
                    Some(self.name.as_str()),
                    &message,
                    &message_id,
                    received_at,
                );
                failure = Some(ListenerError::with_source(text.clone(), e));
                (PipeLineResult::error(formatted), text, true)
            }
        };

        if failure.is_none()
            && let Some(sender) = &self.sender
        {
            match sender.send_message(result.result().clone(), &mut session).await {
                Ok(reply) => result.set_result(reply),
                Err(e) => {
                    warn!(receiver = %self.name, sender = %sender.name(), error = %e, "Could not send result");
                    error_message = format!("sender [{}] failed: {}", sender.name(), explain(&e));
                }
            }
        }

        self.record_process_result(&message_id, &error_message, received_at);
        let mut moved = None;
        if !self.is_transacted() && in_error && !manual_retry {
            moved = self
                .move_in_process_to_error(
                    raw,
                    &message,
                    &message_id,
                    &correlation_id,
                    received_at,
                    &error_message,
                )
                .await;
        }

        if let Err(e) = self
            .after_processing(
                raw,
                moved,
                &result,
                &session,
                in_error,
                &error_message,
                tx.is_rollback_only(),
            )
            .await
        {
            error!(receiver = %self.name, message_id = %message_id, error = %explain(&e), "Exception post processing message");
            tx.set_rollback_only();
            failure.get_or_insert(e);
        }

        self.finish_processing(started.elapsed());
        if let Err(e) = tx.complete().await {
            warn!(receiver = %self.name, message_id = %message_id, error = %e, "Could not complete receiver transaction");
            failure.get_or_insert(ListenerError::with_source(
                "could not complete receiver transaction",
                e,
            ));
        }
        info!(
            receiver = %self.name,
            message_id = %message_id,
            state = %result.state(),
            in_error = in_error,
            "Adapter {}",
            if in_error { "Error" } else { "Success" }
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(ProcessOutcome {
                result: result.result().clone(),
                in_error,
                error_message,
            }),
        }
    }

    async fn log_message(
        &self,
        message_id: &str,
        correlation_id: &str,
        message: &Message,
        received_at: DateTime<Utc>,
    ) -> Result<(), ProcessingError> {
        let Some(log) = &self.message_log else {
            return Ok(());
        };
        let stored = StoredMessage::from_message(message_id, message)
            .map_err(|e| ListenerError::with_source("could not read message for the message log", e))?
            .with_correlation_id(Some(correlation_id.to_string()))
            .with_received_at(received_at)
            .with_comments(MESSAGE_LOG_COMMENTS);
        let key = log.store_message(&stored).await?;
        if let Some(tx) = transaction::current().filter(|tx| !tx.is_completed()) {
            tx.register_synchronization(Arc::new(DeleteOnRollback {
                storage: log.clone(),
                storage_key: key,
            }));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn after_processing(
        &self,
        raw: Option<&RawMessage<M>>,
        mut moved: Option<RawMessage<M>>,
        result: &PipeLineResult,
        session: &PipeLineSession,
        in_error: bool,
        error_message: &str,
        rollback_only: bool,
    ) -> Result<(), ListenerError> {
        let Some(raw) = raw else {
            return Ok(());
        };
        // `moved` is set when the failure path already relocated the message.
        if moved.is_none()
            && let Some(ps) = self.listener.as_process_state()
            && !rollback_only
        {
            let target = if in_error && self.known_process_states().contains(&ProcessState::Error) {
                ProcessState::Error
            } else {
                ProcessState::Done
            };
            moved = ps
                .change_process_state(raw, target, in_error.then_some(error_message))
                .await?;
        }
        self.listener
            .after_message_processed(result, moved.as_ref().unwrap_or(raw), session)
            .await
    }

    /// Returns `true` when the message must not be processed.
    async fn check_message_history(
        &self,
        raw: Option<&RawMessage<M>>,
        message: &Message,
        message_id: &str,
        correlation_id: &str,
        session: &mut PipeLineSession,
        manual_retry: bool,
    ) -> Result<bool, ListenerError> {
        if manual_retry {
            session.put(RETRY_FLAG_SESSION_KEY, true);
            if self.is_duplicate(message_id, correlation_id).await? {
                session.set_exit_state(ExitState::Success, 304);
                return Ok(true);
            }
            return Ok(false);
        }

        let cached = self.cached_process_result(message_id);
        if let Some(item) = &cached {
            if item.receive_count > 1 {
                warn!(receiver = %self.name, message_id = %message_id, receive_count = item.receive_count, "Message received again");
                session.put(RETRY_FLAG_SESSION_KEY, true);
            }
            if self.max_retries >= 0 && item.receive_count >= self.max_retries as u32 {
                let comments = format!("too many redeliveries or retries; {}", item.comments);
                warn!(
                    receiver = %self.name,
                    message_id = %message_id,
                    receive_count = item.receive_count,
                    max_retries = self.max_retries,
                    "Rejecting message"
                );
                let moved = self
                    .move_in_process_to_error(
                        raw,
                        message,
                        message_id,
                        correlation_id,
                        item.received_at,
                        &comments,
                    )
                    .await;
                let result = PipeLineResult::new(
                    ExitState::Rejected,
                    500,
                    Message::text(format!("<error>{}</error>", escape_xml(&comments))),
                );
                if let Some(raw) = moved.as_ref().or(raw) {
                    self.listener
                        .after_message_processed(&result, raw, session)
                        .await?;
                }
                self.rejected.increment();
                session.set_exit_state(ExitState::Rejected, 500);
                return Ok(true);
            }
        }

        if self.is_duplicate(message_id, correlation_id).await? {
            session.set_exit_state(ExitState::Success, 304);
            return Ok(true);
        }
        if cached.is_some() {
            self.retried.increment();
        }
        Ok(false)
    }

    async fn is_duplicate(&self, message_id: &str, correlation_id: &str) -> Result<bool, ListenerError> {
        let Some(method) = self.check_for_duplicates else {
            return Ok(false);
        };
        let Some(log) = self.message_browser(ProcessState::Done) else {
            return Ok(false);
        };
        let found = match method {
            DuplicateCheck::MessageId => log.contains_message_id(message_id).await,
            DuplicateCheck::CorrelationId => log.contains_correlation_id(correlation_id).await,
        }
        .map_err(|e| ListenerError::with_source("could not check message log for duplicates", e))?;
        if found {
            warn!(
                receiver = %self.name,
                message_id = %message_id,
                correlation_id = %correlation_id,
                "Message already processed, skipping duplicate"
            );
        }
        Ok(found)
    }

    /// Put a failed message where an operator can find it.
    ///
    /// Returns the message as relocated by the listener, if it moved. A
    /// message in the listener's ERROR state is not copied to the error
    /// storage. Failures are logged, not raised: the message outcome is
    /// already decided.
    async fn move_in_process_to_error(
        &self,
        raw: Option<&RawMessage<M>>,
        message: &Message,
        message_id: &str,
        correlation_id: &str,
        received_at: DateTime<Utc>,
        comments: &str,
    ) -> Option<RawMessage<M>> {
        let comments = truncate_comments(comments);
        let mut moved = None;
        if let (Some(raw), Some(ps)) = (raw, self.listener.as_process_state()) {
            let known = self.known_process_states();
            let target = if known.contains(&ProcessState::Error) {
                ProcessState::Error
            } else {
                ProcessState::Done
            };
            match ps.change_process_state(raw, target, Some(&comments)).await {
                Ok(Some(raw)) if target == ProcessState::Error => return Some(raw),
                Ok(other) => moved = other,
                Err(e) => {
                    error!(receiver = %self.name, message_id = %message_id, error = %e, "Could not move message to {}", target);
                }
            }
        }

        let Some(storage) = &self.error_storage else {
            debug!(receiver = %self.name, message_id = %message_id, "No error storage, failed message is not kept");
            return moved;
        };
        let stored = match StoredMessage::from_message(message_id, message) {
            Ok(stored) => stored
                .with_correlation_id(Some(correlation_id.to_string()))
                .with_received_at(received_at)
                .with_comments(comments),
            Err(e) => {
                error!(receiver = %self.name, message_id = %message_id, error = %e, "Could not read failed message");
                return moved;
            }
        };
        match storage.store_message(&stored).await {
            Ok(key) => info!(receiver = %self.name, message_id = %message_id, key = %key, "Moved message to error storage"),
            Err(e) => error!(receiver = %self.name, message_id = %message_id, error = %e, "Could not store message in error storage"),
        }
        moved
    }

    fn record_process_result(&self, message_id: &str, comments: &str, received_at: DateTime<Utc>) {
        self.process_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(message_id, comments, received_at);
    }

    fn finish_processing(&self, elapsed: Duration) {
        self.processing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_value(elapsed.as_millis() as u64);
    }

    // ========================================================================
    // Polling
    // ========================================================================

    fn spawn_pollers(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let mut pollers = self.pollers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in 0..self.num_threads {
            let receiver = me.clone();
            let shutdown = self.shutdown.subscribe();
            pollers.push(tokio::spawn(receiver.poll_loop(worker, shutdown)));
        }
    }

    async fn poll_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(receiver = %self.name, worker = worker, "Polling started");
        let mut backoff = POLL_BACKOFF_INITIAL;
        loop {
            if *shutdown.borrow() || self.run_state.get() != RunState::Started {
                break;
            }
            let pause = match self.poll_once().await {
                Ok(true) => {
                    backoff = POLL_BACKOFF_INITIAL;
                    continue;
                }
                Ok(false) => self.poll_interval,
                Err(e) => {
                    self.exception_thrown(&e);
                    let pause = backoff;
                    backoff = (backoff * 2).min(POLL_BACKOFF_MAX);
                    pause
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!(receiver = %self.name, worker = worker, "Polling stopped");
    }

    /// Returns whether a message was processed.
    async fn poll_once(&self) -> Result<bool, ListenerError> {
        let Some(pulling) = self.listener.as_pulling() else {
            return Ok(false);
        };
        let mut tx = Transaction::begin(
            self.transaction_manager.clone(),
            &self.transaction,
            format!("receiver [{}] poll", self.name),
        )
        .await
        .map_err(|e| ListenerError::with_source("could not start poll transaction", e))?;

        let outcome = tx
            .scope(async {
                let Some(raw) = pulling.get_raw_message().await? else {
                    return Ok(false);
                };
                self.process_raw(&raw).await?;
                Ok::<_, ListenerError>(true)
            })
            .await;
        if outcome.is_err() {
            tx.set_rollback_only();
        }
        tx.complete()
            .await
            .map_err(|e| ListenerError::with_source("could not complete poll transaction", e))?;
        outcome
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn open_resources(&self) -> Result<(), ListenerError> {
        self.listener.open().await?;
        if let Some(sender) = &self.sender {
            sender.open().await.map_err(|e| {
                ListenerError::with_source(format!("could not open sender [{}]", sender.name()), e)
            })?;
        }
        Ok(())
    }

    async fn close_resources(&self) {
        self.listener.close().await;
        if let Some(sender) = &self.sender {
            sender.close().await;
        }
    }
}

#[async_trait]
impl<M: Send + Sync + 'static> ManagedReceiver for Receiver<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, adapter: Weak<Adapter>) {
        if self.adapter.set(adapter).is_err() {
            warn!(receiver = %self.name, "Receiver already attached to an adapter");
        }
    }

    fn configure(&self) -> Result<(), ConfigurationError> {
        self.configured.store(false, Ordering::SeqCst);
        if self.name.is_empty() {
            return Err(ConfigurationError::new("receiver has no name"));
        }
        self.listener.configure().map_err(|e| {
            ConfigurationError::with_source(
                format!(
                    "receiver [{}] could not configure listener [{}]",
                    self.name,
                    self.listener.name()
                ),
                e,
            )
        })?;

        let known = match self.listener.as_process_state() {
            Some(ps) => ps.known_process_states(),
            None => {
                let mut known = BTreeSet::new();
                if self.error_storage.is_some() {
                    known.insert(ProcessState::Error);
                }
                if self.message_log.is_some() {
                    known.insert(ProcessState::Done);
                }
                known
            }
        };
        if self.is_transacted()
            && self.error_storage.is_none()
            && !known.contains(&ProcessState::Error)
        {
            warn!(receiver = %self.name, "Transacted receiver has no error storage, rejected messages are lost");
        }
        debug!(receiver = %self.name, states = ?known, "Configured receiver");
        *self.known_states.write().unwrap_or_else(|e| e.into_inner()) = known;
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn configuration_succeeded(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    async fn start_running(&self) {
        let previous = self.run_state.transition(|state| {
            matches!(state, RunState::Stopped | RunState::Error).then_some(RunState::Starting)
        });
        if !matches!(previous, RunState::Stopped | RunState::Error) {
            warn!(receiver = %self.name, state = %previous, "Cannot start receiver");
            return;
        }
        if !self.configured.load(Ordering::SeqCst) {
            error!(receiver = %self.name, "Receiver is not configured");
            self.run_state.set(RunState::Error);
            return;
        }

        self.shutdown.send_replace(false);
        if let Err(e) = self.open_resources().await {
            error!(receiver = %self.name, error = %explain(&e), "Could not start receiver");
            self.run_state.set(RunState::ExceptionStarting);
            self.close_resources().await;
            self.run_state.set(RunState::Error);
            return;
        }
        self.run_state.set(RunState::Started);
        if self.listener.as_pulling().is_some() {
            self.spawn_pollers();
        }
        info!(receiver = %self.name, "Receiver started");
    }

    fn stop_running(&self) {
        let previous = self.run_state.transition(|state| {
            matches!(state, RunState::Started | RunState::ExceptionStarting)
                .then_some(RunState::Stopping)
        });
        if !matches!(previous, RunState::Started | RunState::ExceptionStarting) {
            debug!(receiver = %self.name, state = %previous, "Receiver not running, nothing to stop");
            return;
        }
        self.shutdown.send_replace(true);
        let Some(me) = self.me.upgrade() else {
            self.run_state.set(RunState::Stopped);
            return;
        };
        tokio::spawn(async move {
            let pollers = std::mem::take(&mut *me.pollers.lock().unwrap_or_else(|e| e.into_inner()));
            for poller in pollers {
                if let Err(e) = poller.await {
                    warn!(receiver = %me.name, error = %e, "Polling task ended abnormally");
                }
            }
            me.close_resources().await;
            me.run_state.set(RunState::Stopped);
            info!(receiver = %me.name, "Receiver stopped");
        });
    }

    fn run_state(&self) -> RunState {
        self.run_state.get()
    }

    fn is_transacted(&self) -> bool {
        self.transaction.attribute().is_transacted()
    }

    fn known_process_states(&self) -> BTreeSet<ProcessState> {
        self.known_states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn target_process_states(&self) -> BTreeMap<ProcessState, BTreeSet<ProcessState>> {
        match self.listener.as_process_state() {
            Some(ps) => ps.target_process_states(),
            None => process_state::target_process_states(&self.known_process_states()),
        }
    }

    fn message_browser(&self, state: ProcessState) -> Option<Arc<dyn MessageStorage>> {
        if let Some(browser) = self
            .listener
            .as_process_state()
            .and_then(|ps| ps.message_browser(state))
        {
            return Some(browser);
        }
        match state {
            ProcessState::Error => self.error_storage.clone(),
            ProcessState::Done => self.message_log.clone(),
            _ => None,
        }
    }

    fn messages_received(&self) -> u64 {
        self.received.value()
    }

    fn messages_retried(&self) -> u64 {
        self.retried.value()
    }

    fn messages_rejected(&self) -> u64 {
        self.rejected.value()
    }

    async fn retry_message(&self, storage_key: &str) -> Result<Message, ListenerError> {
        let Some(storage) = &self.error_storage else {
            return Err(ListenerError::new(format!(
                "receiver [{}] has no error storage, cannot retry message [{}]",
                self.name, storage_key
            )));
        };
        let stored = storage
            .get_message(storage_key)
            .await
            .map_err(|e| ListenerError::with_source("could not read message from error storage", e))?
            .ok_or_else(|| {
                ListenerError::new(format!(
                    "message [{}] not found in error storage of receiver [{}]",
                    storage_key, self.name
                ))
            })?;
        info!(receiver = %self.name, key = %storage_key, message_id = %stored.message_id, "Retrying message");

        let outcome = self
            .process_message_in_adapter(
                None,
                stored.to_message(),
                Some(stored.message_id.clone()),
                stored.correlation_id.clone(),
                stored.received_at,
                true,
            )
            .await;
        let failure = match outcome {
            Ok(outcome) if !outcome.in_error => {
                storage
                    .delete_message(storage_key)
                    .await
                    .map_err(|e| ListenerError::with_source("could not remove retried message", e))?;
                return Ok(outcome.result);
            }
            Ok(outcome) => ListenerError::new(outcome.error_message),
            Err(e) => e,
        };

        let comments = truncate_comments(&format!("after retry: {}", explain(&failure)));
        if let Err(e) = storage.store_message(&stored.with_comments(comments)).await {
            error!(receiver = %self.name, key = %storage_key, error = %e, "Could not update message after retry");
        }
        Err(failure)
    }

    fn iterate_statistics(
        &self,
        handler: &mut dyn StatisticsIterationHandler,
        action: StatisticsAction,
    ) {
        handler.open_group(&self.name, "receiver");
        handler.handle_scalar("state", ScalarValue::Text(self.run_state.get().to_string()));
        for (name, counter) in [
            ("messagesReceived", &self.received),
            ("messagesRetried", &self.retried),
            ("messagesRejected", &self.rejected),
        ] {
            handler.handle_scalar(name, ScalarValue::Integer(counter.value() as i64));
            handler.handle_scalar(
                &format!("{}ThisInterval", name),
                ScalarValue::Integer(counter.interval_value() as i64),
            );
            if action.marks_interval() {
                counter.mark();
            }
        }
        handler.handle_scalar("lastMessageDate", ScalarValue::Date(self.last_message_date()));
        {
            let mut processing = self.processing.lock().unwrap_or_else(|e| e.into_inner());
            handler.handle_statistics_keeper(&processing);
            match action {
                StatisticsAction::Reset => processing.reset(),
                StatisticsAction::MarkFull => processing.mark(),
                StatisticsAction::Summary | StatisticsAction::Full => {}
            }
        }
        handler.close_group();
    }
}
