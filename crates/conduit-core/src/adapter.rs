// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The adapter: one pipeline, its receivers, and their lifecycle.
//!
//! Lifecycle commands are asynchronous. [`Adapter::start_running`] and
//! [`Adapter::stop_running`] submit a task to the adapter's
//! [`TaskExecutor`] and return at once; callers watch
//! [`Adapter::run_state`] to see the outcome.
//!
//! ```text
//! STOPPED ──start──► STARTING ──pipeline started──► STARTED
//!    ▲                   │                             │
//!    │             pipeline failed                   stop
//!    │                   ▼                             ▼
//!    └──────────────── ERROR        STOPPED ◄── STOPPING (receivers stopped,
//!                                                         no messages in process)
//! ```

use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Instant;

use chrono::{DateTime, Local, Timelike, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use regex::Regex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::configuration::Configuration;
use crate::error::{ConfigurationError, ProcessingError, explain};
use crate::executor::{TaskExecutor, TokioTaskExecutor};
use crate::message::Message;
use crate::message_keeper::{MessageKeeper, MessageKeeperLevel};
use crate::pipeline::PipeLine;
use crate::receiver::ManagedReceiver;
use crate::result::PipeLineResult;
use crate::run_state::{RunState, RunStateManager};
use crate::session::PipeLineSession;
use crate::statistics::{
    JsonStatisticsHandler, ScalarValue, StatisticsAction, StatisticsIterationHandler,
    StatisticsKeeper,
};

/// `tracing` target of the per-message result log.
pub const MESSAGE_LOG_TARGET: &str = "conduit::msglog";

const ORIGINATOR: &str = concat!("conduit ", env!("CARGO_PKG_VERSION"));
const HOURS_PER_DAY: usize = 24;

// ============================================================================
// Error formatting
// ============================================================================

/// Everything known about a failure when it is turned into a result message.
#[derive(Debug, Clone, Copy)]
pub struct ErrorReport<'a> {
    /// Short description of what went wrong.
    pub text: &'a str,
    /// The underlying error, if there is one.
    pub error: Option<&'a (dyn StdError + 'static)>,
    /// Name of the component in error.
    pub location: Option<&'a str>,
    /// The input that was being processed.
    pub original: &'a Message,
    /// Id of that input.
    pub message_id: &'a str,
    /// When that input was received.
    pub received_at: DateTime<Utc>,
}

/// Renders an [`ErrorReport`] as the result of a failed run.
pub trait ErrorMessageFormatter: Send + Sync {
    /// Build the error result message.
    fn format(&self, report: &ErrorReport<'_>) -> anyhow::Result<Message>;
}

/// Formats errors as a JSON document.
///
/// ```json
/// {"errorMessage": {"timestamp": "...", "originator": "conduit 0.3.0",
///   "message": "...", "location": "...", "details": "...",
///   "originalMessage": {"messageId": "...", "receivedTime": "...", "message": "..."}}}
/// ```
#[derive(Debug, Default, Clone)]
pub struct JsonErrorMessageFormatter;

impl ErrorMessageFormatter for JsonErrorMessageFormatter {
    fn format(&self, report: &ErrorReport<'_>) -> anyhow::Result<Message> {
        let original = if report.original.is_repeatable() {
            report.original.as_string().ok()
        } else {
            None
        };
        let value = json!({
            "errorMessage": {
                "timestamp": Utc::now().to_rfc3339(),
                "originator": ORIGINATOR,
                "message": report.text,
                "location": report.location,
                "details": report.error.map(explain),
                "originalMessage": {
                    "messageId": report.message_id,
                    "receivedTime": report.received_at.to_rfc3339(),
                    "message": original,
                },
            }
        });
        Ok(Message::text(serde_json::to_string(&value)?))
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Messages started per hour of the day, for the last 24 hours.
#[derive(Debug, Clone, Default)]
pub struct HourBuckets {
    counts: [u64; HOURS_PER_DAY],
    last_hour: Option<usize>,
}

impl HourBuckets {
    /// Count a message started in `hour` (0..24).
    ///
    /// When the hour changed since the last message, the buckets of the
    /// hours in between, wrapping past midnight, are cleared first.
    pub fn record(&mut self, hour: usize) {
        let hour = hour % HOURS_PER_DAY;
        if let Some(last) = self.last_hour
            && last != hour
        {
            let mut h = (last + 1) % HOURS_PER_DAY;
            loop {
                self.counts[h] = 0;
                if h == hour {
                    break;
                }
                h = (h + 1) % HOURS_PER_DAY;
            }
        }
        self.last_hour = Some(hour);
        self.counts[hour] += 1;
    }

    /// Count per hour, index 0 is 00:00-00:59.
    pub fn counts(&self) -> [u64; HOURS_PER_DAY] {
        self.counts
    }
}

#[derive(Debug)]
struct MessageCounters {
    in_process: u64,
    processed: u64,
    processed_mark: u64,
    in_error: u64,
    in_error_mark: u64,
    duration: StatisticsKeeper,
    hours: HourBuckets,
    last_message: Option<DateTime<Utc>>,
    last_processing_ok: Option<bool>,
}

impl Default for MessageCounters {
    fn default() -> Self {
        Self {
            in_process: 0,
            processed: 0,
            processed_mark: 0,
            in_error: 0,
            in_error_mark: 0,
            duration: StatisticsKeeper::new("duration"),
            hours: HourBuckets::default(),
            last_message: None,
            last_processing_ok: None,
        }
    }
}

/// Counts one message as in process until dropped.
struct InProcessGuard<'a> {
    adapter: &'a Adapter,
    started: Instant,
    success: bool,
}

impl Drop for InProcessGuard<'_> {
    fn drop(&mut self) {
        {
            let mut counters = self.adapter.lock_counters();
            counters.in_process = counters.in_process.saturating_sub(1);
            counters.processed += 1;
            counters
                .duration
                .add_value(self.started.elapsed().as_millis() as u64);
            counters.last_processing_ok = Some(self.success);
        }
        self.adapter.idle.notify_waiters();
    }
}

#[derive(Debug, Clone)]
struct LastExitState {
    date: DateTime<Utc>,
    state: String,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Adapter`].
pub struct AdapterBuilder {
    name: String,
    description: Option<String>,
    config: Config,
    pipeline: PipeLine,
    receivers: Vec<Arc<dyn ManagedReceiver>>,
    executor: Arc<dyn TaskExecutor>,
    error_formatter: Arc<dyn ErrorMessageFormatter>,
    replace_null_message: bool,
}

impl AdapterBuilder {
    /// Free-text description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a receiver.
    pub fn receiver(mut self, receiver: Arc<dyn ManagedReceiver>) -> Self {
        self.receivers.push(receiver);
        self
    }

    /// Executor for lifecycle tasks.
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Formatter for error results.
    pub fn error_formatter(mut self, formatter: Arc<dyn ErrorMessageFormatter>) -> Self {
        self.error_formatter = formatter;
        self
    }

    /// Replace a null input with an empty text message.
    pub fn replace_null_message(mut self, replace: bool) -> Self {
        self.replace_null_message = replace;
        self
    }

    /// Build the adapter and attach its receivers.
    pub fn build(self) -> Arc<Adapter> {
        let mut pipeline = self.pipeline;
        pipeline.set_owner(self.name.clone());
        let adapter = Arc::new_cyclic(|me| Adapter {
            message_keeper: MessageKeeper::new(self.config.message_keeper_size),
            name: self.name,
            description: self.description,
            config: self.config,
            pipeline,
            receivers: self.receivers,
            executor: self.executor,
            error_formatter: self.error_formatter,
            replace_null_message: self.replace_null_message,
            run_state: RunStateManager::default(),
            configuration: OnceLock::new(),
            configuration_succeeded: AtomicBool::new(false),
            hide_regex: RwLock::new(None),
            counters: Mutex::new(MessageCounters::default()),
            idle: Notify::new(),
            last_exit_states: DashMap::new(),
            up_since: Utc::now(),
            me: me.clone(),
        });
        for receiver in &adapter.receivers {
            receiver.attach(Arc::downgrade(&adapter));
        }
        adapter
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// A pipeline together with the receivers that feed it.
pub struct Adapter {
    name: String,
    description: Option<String>,
    config: Config,
    pipeline: PipeLine,
    receivers: Vec<Arc<dyn ManagedReceiver>>,
    executor: Arc<dyn TaskExecutor>,
    error_formatter: Arc<dyn ErrorMessageFormatter>,
    replace_null_message: bool,

    run_state: RunStateManager,
    message_keeper: MessageKeeper,
    configuration: OnceLock<Weak<Configuration>>,
    configuration_succeeded: AtomicBool,
    hide_regex: RwLock<Option<Regex>>,

    counters: Mutex<MessageCounters>,
    idle: Notify,
    last_exit_states: DashMap<String, LastExitState>,
    up_since: DateTime<Utc>,
    me: Weak<Self>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("run_state", &self.run_state.get())
            .field("receivers", &self.receivers.len())
            .finish()
    }
}

impl Adapter {
    /// Start building an adapter named `name` around `pipeline`.
    pub fn builder(name: impl Into<String>, pipeline: PipeLine, config: &Config) -> AdapterBuilder {
        AdapterBuilder {
            name: name.into(),
            description: None,
            config: config.clone(),
            pipeline,
            receivers: Vec::new(),
            executor: Arc::new(TokioTaskExecutor::new()),
            error_formatter: Arc::new(JsonErrorMessageFormatter),
            replace_null_message: false,
        }
    }

    /// Adapter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-text description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Engine settings.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The pipeline.
    pub fn pipeline(&self) -> &PipeLine {
        &self.pipeline
    }

    /// The receivers, in configuration order.
    pub fn receivers(&self) -> &[Arc<dyn ManagedReceiver>] {
        &self.receivers
    }

    /// Receiver by name.
    pub fn receiver(&self, name: &str) -> Option<&Arc<dyn ManagedReceiver>> {
        self.receivers.iter().find(|r| r.name() == name)
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.run_state.get()
    }

    /// Wait until the run state satisfies `predicate`.
    pub async fn wait_for_state(&self, predicate: impl FnMut(&RunState) -> bool) -> RunState {
        self.run_state.wait_for(predicate).await
    }

    /// Rolling log of lifecycle and error messages.
    pub fn message_keeper(&self) -> &MessageKeeper {
        &self.message_keeper
    }

    /// Whether the last [`configure`](Self::configure) succeeded.
    pub fn is_configuration_succeeded(&self) -> bool {
        self.configuration_succeeded.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_configuration(&self, configuration: Weak<Configuration>) {
        if self.configuration.set(configuration).is_err() {
            warn!(adapter = %self.name, "Adapter already registered with a configuration");
        }
    }

    fn is_unload_in_progress_or_done(&self) -> bool {
        self.configuration
            .get()
            .and_then(Weak::upgrade)
            .is_some_and(|c| c.is_unload_in_progress_or_done())
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Configure the pipeline and every receiver, each only until it succeeds.
    ///
    /// All receivers are configured even when one fails; the first failure
    /// is returned. A successful configure moves an ERROR adapter back to
    /// STOPPED.
    pub fn configure(&self) -> Result<(), ConfigurationError> {
        self.configuration_succeeded.store(false, Ordering::SeqCst);
        if self.name.contains('/') {
            return Err(ConfigurationError::new(format!(
                "adapter name [{}] must not contain '/'",
                self.name
            )));
        }
        if !self.pipeline.is_configured() {
            match self.pipeline.configure() {
                Ok(()) => {
                    for warning in self.pipeline.configuration_warnings() {
                        self.keep(MessageKeeperLevel::Warn, warning);
                    }
                    self.keep(MessageKeeperLevel::Info, "pipeline successfully configured");
                }
                Err(e) => {
                    self.keep(
                        MessageKeeperLevel::Error,
                        format!("error initializing pipeline, {}", e),
                    );
                    return Err(e);
                }
            }
        }

        let mut first_error = None;
        for receiver in &self.receivers {
            if receiver.configuration_succeeded() {
                continue;
            }
            info!(adapter = %self.name, receiver = %receiver.name(), "Initializing receiver");
            match receiver.configure() {
                Ok(()) => self.keep(
                    MessageKeeperLevel::Info,
                    format!("receiver [{}] successfully configured", receiver.name()),
                ),
                Err(e) => {
                    self.keep(
                        MessageKeeperLevel::Error,
                        format!("error initializing receiver [{}]: {}", receiver.name(), e),
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let hide_regex = match self.composed_hide_regex() {
            Some(pattern) => Some(Regex::new(&pattern).map_err(|e| {
                ConfigurationError::with_source(
                    format!("adapter [{}] has an invalid hide regex [{}]", self.name, pattern),
                    e,
                )
            })?),
            None => None,
        };
        *self.hide_regex.write().unwrap_or_else(|e| e.into_inner()) = hide_regex;

        if self.run_state.compare_and_set(RunState::Error, RunState::Stopped) {
            debug!(adapter = %self.name, "Reset adapter from Error to Stopped after configure");
        }
        self.configuration_succeeded.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// All distinct pipe hide regexes combined as `(a)|(b)`.
    pub fn composed_hide_regex(&self) -> Option<String> {
        let mut patterns: Vec<String> = Vec::new();
        for pattern in self.pipeline.hide_regexes() {
            if !pattern.is_empty() && !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }
        if patterns.is_empty() {
            return None;
        }
        Some(
            patterns
                .iter()
                .map(|p| format!("({})", p))
                .collect::<Vec<_>>()
                .join("|"),
        )
    }

    /// Mask every character matched by the hide regex with `*`.
    pub fn hide_sensitive(&self, text: &str) -> String {
        let guard = self.hide_regex.read().unwrap_or_else(|e| e.into_inner());
        let Some(regex) = guard.as_ref() else {
            return text.to_string();
        };
        regex
            .replace_all(text, |caps: &regex::Captures<'_>| "*".repeat(caps[0].chars().count()))
            .into_owned()
    }

    fn keep(&self, level: MessageKeeperLevel, message: impl Into<String>) {
        let message = self.hide_sensitive(&message.into());
        match level {
            MessageKeeperLevel::Info => info!(adapter = %self.name, "{}", message),
            MessageKeeperLevel::Warn => warn!(adapter = %self.name, "{}", message),
            MessageKeeperLevel::Error => error!(adapter = %self.name, "{}", message),
        }
        self.message_keeper.add(message, level);
    }

    // ========================================================================
    // Message processing
    // ========================================================================

    /// Run a message through the pipeline; never fails.
    ///
    /// Any failure becomes an ERROR result carrying the formatted error.
    pub async fn process_message(
        &self,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> PipeLineResult {
        let received_at = Utc::now();
        let original = message.clone();
        match self
            .process_message_with_exceptions(message_id, message, session)
            .await
        {
            Ok(result) => {
                self.log_to_message_log("Pipeline Success", result.result());
                result
            }
            Err(e) => {
                let (text, location) = match &e {
                    ProcessingError::PipeRun(pre) => {
                        ("error during pipeline processing".to_string(), pre.pipe())
                    }
                    ProcessingError::ManagedState { .. } => {
                        ("illegal state".to_string(), Some(self.name.as_str()))
                    }
                    other => (format!("Illegal exception [{}]", other.error_code()), None),
                };
                let formatted = self.format_error_message(
                    &text,
                    Some(&e),
                    location,
                    &original,
                    message_id,
                    received_at,
                );
                let result = PipeLineResult::error(formatted);
                self.log_to_message_log("Pipeline Error", result.result());
                result
            }
        }
    }

    /// Run a message through the pipeline, returning failures as errors.
    ///
    /// Rejected with [`ProcessingError::ManagedState`] unless the adapter is
    /// STARTED or STOPPING. The in-process counter covers the pipeline run
    /// on every exit path, including cancellation.
    #[instrument(skip(self, message, session), fields(adapter = %self.name))]
    pub async fn process_message_with_exceptions(
        &self,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, ProcessingError> {
        let state = self.run_state.get();
        if !matches!(state, RunState::Started | RunState::Stopping) {
            return Err(ProcessingError::ManagedState {
                adapter: self.name.clone(),
                state,
            });
        }

        let mut guard = self.begin_processing();
        info!(adapter = %self.name, message_id = %message_id, "Adapter received message");

        let message = if message.is_null() && self.replace_null_message {
            debug!(adapter = %self.name, message_id = %message_id, "Replacing null message by empty message");
            Message::text("")
        } else {
            message
        };

        match self.pipeline.process(message_id, message, session).await {
            Ok(result) => {
                guard.success = true;
                debug!(
                    adapter = %self.name,
                    message_id = %message_id,
                    exit_state = %result.state(),
                    exit_code = result.exit_code(),
                    duration_ms = guard.started.elapsed().as_millis() as u64,
                    "Pipeline finished"
                );
                Ok(result)
            }
            Err(e) => {
                self.lock_counters().in_error += 1;
                let e = ProcessingError::from(e);
                self.keep(
                    MessageKeeperLevel::Warn,
                    format!("error processing message with messageId [{}]: {}", message_id, e),
                );
                Err(e)
            }
        }
    }

    /// Format an error result through the configured formatter.
    ///
    /// Falls back to `text` when the formatter fails. The formatted message
    /// is passed through [`hide_sensitive`](Self::hide_sensitive).
    pub fn format_error_message(
        &self,
        text: &str,
        error: Option<&(dyn StdError + 'static)>,
        location: Option<&str>,
        original: &Message,
        message_id: &str,
        received_at: DateTime<Utc>,
    ) -> Message {
        let report = ErrorReport {
            text,
            error,
            location,
            original,
            message_id,
            received_at,
        };
        match self.error_formatter.format(&report) {
            Ok(message) => match message.as_str() {
                Some(formatted) => Message::text(self.hide_sensitive(formatted)),
                None => message,
            },
            Err(e) => {
                self.keep(
                    MessageKeeperLevel::Error,
                    format!(
                        "got error while formatting errormessage, original errorMessage [{}] from [{}]: {}",
                        text,
                        location.unwrap_or("unknown"),
                        e
                    ),
                );
                Message::text(self.hide_sensitive(text))
            }
        }
    }

    fn log_to_message_log(&self, label: &str, data: &Message) {
        let size = data.size().map_or(-1, |s| s as i64);
        if self.config.msg_log_hidden {
            info!(target: MESSAGE_LOG_TARGET, adapter = %self.name, size, "{}", label);
        } else {
            let contents = self.hide_sensitive(&data.to_string());
            info!(target: MESSAGE_LOG_TARGET, adapter = %self.name, size, contents = %contents, "{}", label);
        }
    }

    fn lock_counters(&self) -> std::sync::MutexGuard<'_, MessageCounters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_processing(&self) -> InProcessGuard<'_> {
        let now = Utc::now();
        {
            let mut counters = self.lock_counters();
            counters.in_process += 1;
            counters.last_message = Some(now);
            counters
                .hours
                .record(now.with_timezone(&Local).hour() as usize);
        }
        InProcessGuard {
            adapter: self,
            started: Instant::now(),
            success: false,
        }
    }

    /// Messages currently in the pipeline.
    pub fn num_of_messages_in_process(&self) -> u64 {
        self.lock_counters().in_process
    }

    /// Messages that finished the pipeline, successfully or not.
    pub fn num_of_messages_processed(&self) -> u64 {
        self.lock_counters().processed
    }

    /// Messages whose pipeline run failed with an error.
    pub fn num_of_messages_in_error(&self) -> u64 {
        self.lock_counters().in_error
    }

    /// Messages started per hour of the day.
    pub fn messages_by_hour(&self) -> [u64; HOURS_PER_DAY] {
        self.lock_counters().hours.counts()
    }

    /// When the last message arrived.
    pub fn last_message_date(&self) -> Option<DateTime<Utc>> {
        self.lock_counters().last_message
    }

    /// Remember the exit state of a pipe, such as `timeout`.
    pub fn set_last_exit_state(&self, pipe: &str, date: DateTime<Utc>, state: &str) {
        self.last_exit_states.insert(
            pipe.to_string(),
            LastExitState {
                date,
                state: state.to_string(),
            },
        );
    }

    /// When `pipe` last exited with `timeout`, if that was its last exit.
    pub fn last_exit_is_timeout_date(&self, pipe: &str) -> Option<DateTime<Utc>> {
        self.last_exit_states
            .get(pipe)
            .filter(|s| s.state == "timeout")
            .map(|s| s.date)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the pipeline and the receivers in the background.
    ///
    /// No-op while starting, started or stopping.
    pub fn start_running(&self) {
        let state = self.run_state.get();
        if matches!(
            state,
            RunState::Starting
                | RunState::ExceptionStarting
                | RunState::Started
                | RunState::Stopping
                | RunState::ExceptionStopping
        ) {
            self.keep(
                MessageKeeperLevel::Warn,
                format!("adapter is in state [{}], ignoring start command", state),
            );
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.executor.execute(
            &format!("start adapter [{}]", self.name),
            async move { me.run_start().await }.boxed(),
        );
    }

    async fn run_start(&self) {
        if !self.is_configuration_succeeded() {
            self.keep(
                MessageKeeperLevel::Error,
                "configuration did not succeed, adapter cannot be started",
            );
            return;
        }
        if self.is_unload_in_progress_or_done() {
            self.keep(
                MessageKeeperLevel::Error,
                "configuration unload in progress or done, adapter cannot be started",
            );
            return;
        }
        if !self
            .run_state
            .compare_and_set(RunState::Stopped, RunState::Starting)
        {
            self.keep(
                MessageKeeperLevel::Warn,
                format!(
                    "adapter is in state [{}], cannot be started",
                    self.run_state.get()
                ),
            );
            return;
        }

        self.keep(MessageKeeperLevel::Info, "starting adapter");
        if let Err(e) = self.pipeline.start().await {
            self.keep(
                MessageKeeperLevel::Error,
                format!("could not start pipeline: {}", explain(&e)),
            );
            self.run_state.set(RunState::Error);
            return;
        }
        self.run_state.set(RunState::Started);
        self.keep(MessageKeeperLevel::Info, "adapter up and running");

        for receiver in &self.receivers {
            receiver.start_running().await;
            if receiver.run_state() == RunState::Error {
                self.keep(
                    MessageKeeperLevel::Warn,
                    format!("receiver [{}] could not be started", receiver.name()),
                );
            }
        }
    }

    /// Stop the receivers, drain in-process messages and stop the pipeline,
    /// in the background.
    ///
    /// Ignored while starting, stopping or stopped.
    pub fn stop_running(&self) {
        let previous = self.run_state.transition(|state| match state {
            RunState::Starting | RunState::Stopping | RunState::Stopped => None,
            _ => Some(RunState::Stopping),
        });
        if matches!(
            previous,
            RunState::Starting | RunState::Stopping | RunState::Stopped
        ) {
            self.keep(
                MessageKeeperLevel::Warn,
                format!("adapter is in state [{}], ignoring stop command", previous),
            );
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.executor.execute(
            &format!("stop adapter [{}]", self.name),
            async move { me.run_stop().await }.boxed(),
        );
    }

    async fn run_stop(&self) {
        self.keep(MessageKeeperLevel::Info, "stopping adapter");
        for receiver in &self.receivers {
            receiver.stop_running();
        }
        self.wait_for_receivers().await;
        self.wait_for_no_messages_in_process().await;
        self.pipeline.stop().await;
        self.run_state.set(RunState::Stopped);
        self.keep(MessageKeeperLevel::Info, "adapter stopped");
    }

    async fn wait_for_receivers(&self) {
        let mut pause = self.config.stop_poll_initial;
        loop {
            let waiting: Vec<&str> = self
                .receivers
                .iter()
                .filter(|r| !matches!(r.run_state(), RunState::Stopped | RunState::Error))
                .map(|r| r.name())
                .collect();
            if waiting.is_empty() {
                return;
            }
            debug!(adapter = %self.name, receivers = ?waiting, "Waiting for receivers to stop");
            // A receiver that was still starting missed the first stop command.
            for receiver in &self.receivers {
                if receiver.run_state() == RunState::Started {
                    receiver.stop_running();
                }
            }
            tokio::time::sleep(pause).await;
            pause = (pause * 2).min(self.config.stop_poll_max);
        }
    }

    async fn wait_for_no_messages_in_process(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let in_process = self.num_of_messages_in_process();
            if in_process == 0 {
                return;
            }
            debug!(adapter = %self.name, in_process, "Waiting for messages in process");
            notified.await;
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Export adapter, receiver and pipe statistics.
    pub fn iterate_statistics(
        &self,
        handler: &mut dyn StatisticsIterationHandler,
        action: StatisticsAction,
    ) {
        handler.open_group(&self.name, "adapter");
        handler.handle_scalar("upSince", ScalarValue::Date(Some(self.up_since)));
        handler.handle_scalar("state", ScalarValue::Text(self.run_state.get().to_string()));
        {
            let mut counters = self.lock_counters();
            handler.handle_scalar("lastMessageDate", ScalarValue::Date(counters.last_message));
            if let Some(ok) = counters.last_processing_ok {
                let state = if ok { "OK" } else { "ERROR" };
                handler.handle_scalar("lastMessageProcessingState", ScalarValue::Text(state.into()));
            }
            handler.handle_scalar("messagesInProcess", ScalarValue::Integer(counters.in_process as i64));
            handler.handle_scalar("messagesProcessed", ScalarValue::Integer(counters.processed as i64));
            handler.handle_scalar("messagesInError", ScalarValue::Integer(counters.in_error as i64));
            handler.handle_scalar(
                "messagesProcessedThisInterval",
                ScalarValue::Integer(counters.processed.saturating_sub(counters.processed_mark) as i64),
            );
            handler.handle_scalar(
                "messagesInErrorThisInterval",
                ScalarValue::Integer(counters.in_error.saturating_sub(counters.in_error_mark) as i64),
            );
            handler.handle_statistics_keeper(&counters.duration);

            if action.includes_groups() {
                handler.open_group("messagesStartProcessingByHour", "hours");
                for (hour, count) in counters.hours.counts().iter().enumerate() {
                    handler.handle_scalar(&format!("{:02}:00", hour), ScalarValue::Integer(*count as i64));
                }
                handler.close_group();
            }

            if action.marks_interval() {
                counters.processed_mark = counters.processed;
                counters.in_error_mark = counters.in_error;
            }
            match action {
                StatisticsAction::Reset => counters.duration.reset(),
                StatisticsAction::MarkFull => counters.duration.mark(),
                StatisticsAction::Summary | StatisticsAction::Full => {}
            }
        }

        if action.includes_groups() {
            handler.open_group("receivers", "receivers");
            for receiver in &self.receivers {
                receiver.iterate_statistics(handler, action);
            }
            handler.close_group();
            self.pipeline.iterate_statistics(handler, action);
        }
        handler.close_group();
    }

    /// Statistics as a JSON tree.
    pub fn statistics_json(&self, action: StatisticsAction) -> Value {
        let mut handler = JsonStatisticsHandler::new();
        self.iterate_statistics(&mut handler, action);
        handler.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_buckets_clear_skipped_hours() {
        let mut buckets = HourBuckets::default();
        buckets.record(3);
        buckets.record(3);
        buckets.record(5);
        let counts = buckets.counts();
        assert_eq!(counts[3], 2);
        assert_eq!(counts[4], 0);
        assert_eq!(counts[5], 1);
    }

    #[test]
    fn test_hour_buckets_wrap_past_midnight() {
        let mut buckets = HourBuckets::default();
        for hour in 0..24 {
            buckets.record(hour);
        }
        // From 23 back to 22 wraps through midnight: 0..=22 start over.
        buckets.record(22);
        assert_eq!(buckets.counts()[0], 0);
        assert_eq!(buckets.counts()[23], 1);

        buckets.record(1);
        let counts = buckets.counts();
        assert_eq!(counts[22], 1);
        assert_eq!(counts[23], 0);
        assert_eq!(counts[0], 0);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[2], 0);
    }

    #[test]
    fn test_hour_buckets_same_hour_accumulates() {
        let mut buckets = HourBuckets::default();
        buckets.record(10);
        buckets.record(10);
        buckets.record(34);
        assert_eq!(buckets.counts()[10], 3);
    }

    #[tokio::test]
    async fn test_start_ignored_in_transitional_states() {
        for state in [
            RunState::Starting,
            RunState::ExceptionStarting,
            RunState::Started,
            RunState::Stopping,
            RunState::ExceptionStopping,
        ] {
            let adapter = Adapter::builder("busy", PipeLine::new(), &Config::default()).build();
            adapter.run_state.set(state);

            adapter.start_running();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;

            assert_eq!(adapter.run_state(), state);
            let last = adapter.message_keeper().last().unwrap();
            assert_eq!(last.level, MessageKeeperLevel::Warn);
            assert!(
                last.message.contains("ignoring start command"),
                "state {}: {}",
                state,
                last.message
            );
        }
    }

    #[test]
    fn test_json_formatter_report() {
        let original = Message::text("<order/>");
        let error = std::io::Error::other("disk full");
        let report = ErrorReport {
            text: "exception caught",
            error: Some(&error),
            location: Some("Store"),
            original: &original,
            message_id: "m1",
            received_at: Utc::now(),
        };
        let message = JsonErrorMessageFormatter.format(&report).unwrap();
        let value: Value = serde_json::from_str(message.as_str().unwrap()).unwrap();
        let body = &value["errorMessage"];
        assert_eq!(body["message"], "exception caught");
        assert_eq!(body["location"], "Store");
        assert_eq!(body["details"], "disk full");
        assert_eq!(body["originalMessage"]["messageId"], "m1");
        assert_eq!(body["originalMessage"]["message"], "<order/>");
    }
}
