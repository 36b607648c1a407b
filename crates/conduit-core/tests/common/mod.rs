// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for conduit-core integration tests.
//!
//! Provides small pipes with observable behavior, a push listener over
//! plain strings, and helpers for driving adapters through their lifecycle.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use conduit_core::error::{ConfigurationError, LifecycleError, ListenerError, PipeRunError};
use conduit_core::listener::{Listener, RawMessage};
use conduit_core::pipe::{Pipe, PipeDefinition};
use conduit_core::result::PipeRunResult;
use conduit_core::run_state::RunState;
use conduit_core::session::PipeLineSession;
use conduit_core::{Adapter, Config, ManagedReceiver, Message, PipeLine};

/// How long a test waits for an asynchronous condition.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine settings with short stop polls.
pub fn test_config() -> Config {
    Config {
        stop_poll_initial: Duration::from_millis(5),
        stop_poll_max: Duration::from_millis(50),
        msg_log_hidden: false,
        ..Config::default()
    }
}

/// A pipeline of the given pipes, in order.
pub fn pipeline_of(definitions: Vec<PipeDefinition>) -> PipeLine {
    let mut pipeline = PipeLine::new();
    for definition in definitions {
        pipeline.add_pipe(definition).expect("add pipe");
    }
    pipeline
}

/// Poll `condition` until it holds, panicking after [`WAIT_LIMIT`].
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let wait = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(WAIT_LIMIT, wait).await.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

/// Wait for the adapter to reach `state`.
pub async fn wait_for_state(adapter: &Adapter, state: RunState) {
    let reached = tokio::time::timeout(WAIT_LIMIT, adapter.wait_for_state(|s| *s == state)).await;
    if reached.is_err() {
        panic!(
            "adapter [{}] did not reach [{}], still [{}]",
            adapter.name(),
            state,
            adapter.run_state()
        );
    }
}

/// Configure and start the adapter, waiting until it runs.
pub async fn start(adapter: &Arc<Adapter>) {
    adapter.configure().expect("configure adapter");
    adapter.start_running();
    wait_for_state(adapter, RunState::Started).await;
    for receiver in adapter.receivers() {
        let receiver = receiver.clone();
        eventually("receiver to start", || {
            let receiver = receiver.clone();
            async move { receiver.run_state() == RunState::Started }
        })
        .await;
    }
}

/// Stop the adapter and wait until it is stopped.
pub async fn stop(adapter: &Arc<Adapter>) {
    adapter.stop_running();
    wait_for_state(adapter, RunState::Stopped).await;
}

// ============================================================================
// Pipes
// ============================================================================

/// Passes the message on unchanged.
pub struct Echo(pub &'static str);

#[async_trait]
impl Pipe for Echo {
    fn name(&self) -> &str {
        self.0
    }

    async fn do_pipe(
        &self,
        message: Message,
        _session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        Ok(PipeRunResult::success(message))
    }
}

/// Appends its name to the text message.
pub struct Append(pub &'static str);

#[async_trait]
impl Pipe for Append {
    fn name(&self) -> &str {
        self.0
    }

    async fn do_pipe(
        &self,
        message: Message,
        _session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        let text = message
            .as_string()
            .map_err(|e| PipeRunError::with_source(self.0, "unreadable message", e))?;
        Ok(PipeRunResult::success(Message::text(format!("{}{}", text, self.0))))
    }
}

/// Fails while the switch is on.
pub struct Switchable {
    pub name: &'static str,
    pub failing: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
}

impl Switchable {
    pub fn new(name: &'static str, failing: bool) -> Self {
        Self {
            name,
            failing: Arc::new(AtomicBool::new(failing)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Pipe for Switchable {
    fn name(&self) -> &str {
        self.name
    }

    async fn do_pipe(
        &self,
        message: Message,
        _session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PipeRunError::new(self.name, "switched to failing"));
        }
        Ok(PipeRunResult::success(message))
    }
}

/// Holds each message until a permit is released.
pub struct Gate {
    pub permits: Arc<Semaphore>,
}

impl Gate {
    pub fn closed() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }
}

#[async_trait]
impl Pipe for Gate {
    fn name(&self) -> &str {
        "Gate"
    }

    async fn do_pipe(
        &self,
        message: Message,
        _session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PipeRunError::with_source("Gate", "gate closed for good", e))?;
        permit.forget();
        Ok(PipeRunResult::success(message))
    }
}

/// Tracks how many calls overlap.
#[derive(Default)]
pub struct Overlap {
    pub current: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Pipe for Overlap {
    fn name(&self) -> &str {
        "Overlap"
    }

    async fn do_pipe(
        &self,
        message: Message,
        _session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(PipeRunResult::success(message))
    }
}

/// Records the message id and retry flag of every call.
#[derive(Default)]
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<(String, bool)>>>,
}

#[async_trait]
impl Pipe for Recorder {
    fn name(&self) -> &str {
        "Recorder"
    }

    async fn do_pipe(
        &self,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        let id = session.message_id().unwrap_or_default();
        let retry = session.contains_key(conduit_core::receiver::RETRY_FLAG_SESSION_KEY);
        self.seen.lock().unwrap().push((id, retry));
        Ok(PipeRunResult::success(message))
    }
}

/// Refuses to start.
pub struct Unstartable;

#[async_trait]
impl Pipe for Unstartable {
    fn name(&self) -> &str {
        "Unstartable"
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        Err(LifecycleError::new("Unstartable", "backend unreachable"))
    }

    async fn do_pipe(
        &self,
        message: Message,
        _session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        Ok(PipeRunResult::success(message))
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// A push listener whose raw messages are plain strings.
#[derive(Default)]
pub struct TextListener {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub configured: AtomicUsize,
    pub refuse_configure: AtomicBool,
}

#[async_trait]
impl Listener<String> for TextListener {
    fn name(&self) -> &str {
        "text"
    }

    fn configure(&self) -> Result<(), ConfigurationError> {
        self.configured.fetch_add(1, Ordering::SeqCst);
        if self.refuse_configure.load(Ordering::SeqCst) {
            return Err(ConfigurationError::new("text listener refused configuration"));
        }
        Ok(())
    }

    async fn open(&self) -> Result<(), ListenerError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn extract_message(&self, raw: &RawMessage<String>) -> Result<Message, ListenerError> {
        Ok(Message::text(raw.payload().clone()))
    }
}
