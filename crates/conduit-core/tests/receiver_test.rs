// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Receivers: message ids, duplicates, retries, process states and storage.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;

use common::*;
use conduit_core::error::SenderError;
use conduit_core::forward::{ExitState, PipeLineExit};
use conduit_core::listener::{Listener, RawMessage, Sender, StorageListener};
use conduit_core::pipe::PipeDefinition;
use conduit_core::process_state::ProcessState;
use conduit_core::receiver::{DuplicateCheck, OnError, SYNTHETIC_MESSAGE_ID_PREFIX};
use conduit_core::run_state::RunState;
use conduit_core::session::PipeLineSession;
use conduit_core::storage::sqlite::SqliteMessageStorage;
use conduit_core::storage::{BrowseFilter, InMemoryMessageStorage, MessageStorage, StoredMessage};
use conduit_core::transaction::TransactionAttribute;
use conduit_core::{Adapter, ManagedReceiver, Message, PipeLine, Receiver};

fn slot(name: &str) -> Arc<dyn MessageStorage> {
    Arc::new(InMemoryMessageStorage::new(name))
}

/// A pipeline whose only pipe routes failures to a FAILED error exit.
fn failing_pipeline(pipe: Switchable) -> PipeLine {
    let mut pipeline = PipeLine::new();
    pipeline
        .add_pipe(PipeDefinition::new(pipe).with_forward("exception", "FAILED"))
        .unwrap();
    pipeline.add_exit(PipeLineExit::ready());
    pipeline.add_exit(PipeLineExit::new("FAILED", ExitState::Error).with_exit_code(500));
    pipeline
}

fn storage_listener(states: &[ProcessState]) -> Arc<StorageListener> {
    let mut listener = StorageListener::new("queue", slot("available"));
    for state in states {
        listener = listener.with_slot(*state, slot(state.as_str()));
    }
    Arc::new(listener)
}

fn as_listener(listener: &Arc<StorageListener>) -> Arc<dyn Listener<StoredMessage>> {
    listener.clone()
}

async fn put_available(listener: &StorageListener, id: &str) -> StoredMessage {
    let message = StoredMessage::new(id, format!("payload of {}", id));
    listener
        .slot(ProcessState::Available)
        .unwrap()
        .store_message(&message)
        .await
        .unwrap();
    message
}

async fn count(storage: &Arc<dyn MessageStorage>) -> i64 {
    storage.count().await.unwrap()
}

async fn wait_for_count(what: &str, storage: &Arc<dyn MessageStorage>, expected: i64) {
    let storage = storage.clone();
    eventually(what, || {
        let storage = storage.clone();
        async move { storage.count().await.unwrap() == expected }
    })
    .await;
}

/// Acknowledges every result with a fixed reply.
struct Acknowledge;

#[async_trait]
impl Sender for Acknowledge {
    fn name(&self) -> &str {
        "ack"
    }

    async fn send_message(
        &self,
        message: Message,
        _session: &mut PipeLineSession,
    ) -> Result<Message, SenderError> {
        let text = message
            .as_string()
            .map_err(|e| SenderError::with_source("unreadable result", e))?;
        Ok(Message::text(format!("ack:{}", text)))
    }
}

// ============================================================================
// Push receivers
// ============================================================================

#[tokio::test]
async fn test_push_message_gets_synthetic_id() {
    init_tracing();
    let recorder = Recorder::default();
    let seen = recorder.seen.clone();
    let listener: Arc<dyn Listener<String>> = Arc::new(TextListener::default());
    let receiver = Receiver::builder("push", listener, &test_config()).build();
    let adapter = Adapter::builder(
        "inbound",
        pipeline_of(vec![PipeDefinition::new(recorder)]),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    start(&adapter).await;

    let reply = receiver
        .process_raw_message(&RawMessage::new("hello".to_string()))
        .await
        .unwrap();
    assert_eq!(reply.as_str(), Some("hello"));
    receiver
        .process_raw_message(&RawMessage::new("again".to_string()).with_id("order-1"))
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert!(seen[0].0.starts_with(SYNTHETIC_MESSAGE_ID_PREFIX));
    assert_eq!(seen[1], ("order-1".to_string(), false));
    assert_eq!(receiver.messages_received(), 2);
    assert!(receiver.last_message_date().is_some());

    stop(&adapter).await;
}

#[tokio::test]
async fn test_stopped_receiver_refuses_messages() {
    let listener: Arc<dyn Listener<String>> = Arc::new(TextListener::default());
    let receiver = Receiver::builder("push", listener, &test_config()).build();
    let _adapter = Adapter::builder(
        "inbound",
        pipeline_of(vec![PipeDefinition::new(Echo("A"))]),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();

    let err = receiver
        .process_raw_message(&RawMessage::new("x".to_string()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot process message"));
    assert_eq!(receiver.messages_received(), 0);
}

#[tokio::test]
async fn test_sender_reply_becomes_result() {
    let listener: Arc<dyn Listener<String>> = Arc::new(TextListener::default());
    let receiver = Receiver::builder("push", listener, &test_config())
        .sender(Arc::new(Acknowledge))
        .build();
    let adapter = Adapter::builder(
        "inbound",
        pipeline_of(vec![PipeDefinition::new(Append("!"))]),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    start(&adapter).await;

    let reply = receiver
        .process_raw_message(&RawMessage::new("hi".to_string()))
        .await
        .unwrap();
    assert_eq!(reply.as_str(), Some("ack:hi!"));

    stop(&adapter).await;
}

#[tokio::test]
async fn test_duplicate_message_is_skipped() {
    let pipe = Switchable::new("Count", false);
    let calls = pipe.calls.clone();
    let message_log = slot("log");
    let listener: Arc<dyn Listener<String>> = Arc::new(TextListener::default());
    let receiver = Receiver::builder("push", listener, &test_config())
        .message_log(message_log.clone())
        .check_for_duplicates(DuplicateCheck::MessageId)
        .max_retries(5)
        .build();
    let adapter = Adapter::builder(
        "dedup",
        pipeline_of(vec![PipeDefinition::new(pipe)]),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    start(&adapter).await;
    assert!(receiver.known_process_states().contains(&ProcessState::Done));

    let raw = RawMessage::new("order".to_string()).with_id("m1");
    let first = receiver.process_raw_message(&raw).await.unwrap();
    assert_eq!(first.as_str(), Some("order"));
    let second = receiver.process_raw_message(&raw).await.unwrap();
    assert!(second.is_null());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(count(&message_log).await, 1);
    assert_eq!(receiver.messages_received(), 1);

    stop(&adapter).await;
}

#[tokio::test]
async fn test_failed_message_kept_and_retried() {
    let pipe = Switchable::new("Flaky", true);
    let failing = pipe.failing.clone();
    let error_storage = slot("errors");
    let listener: Arc<dyn Listener<String>> = Arc::new(TextListener::default());
    let receiver = Receiver::builder("push", listener, &test_config())
        .error_storage(error_storage.clone())
        .build();
    let adapter = Adapter::builder("retrying", failing_pipeline(pipe), &test_config())
        .receiver(receiver.clone())
        .build();
    start(&adapter).await;

    receiver
        .process_raw_message(&RawMessage::new("order".to_string()).with_id("m1"))
        .await
        .unwrap();
    let stored = error_storage
        .browse(&BrowseFilter::oldest(10))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message_id, "m1");
    assert!(stored[0].comments.as_deref().unwrap().starts_with("exitState [ERROR]"));
    let key = stored[0].storage_key.clone();

    // Still failing: the message stays, annotated.
    assert!(receiver.retry_message(&key).await.is_err());
    let kept = error_storage.get_message(&key).await.unwrap().unwrap();
    assert!(kept.comments.as_deref().unwrap().starts_with("after retry: "));
    assert_eq!(count(&error_storage).await, 1);

    failing.store(false, Ordering::SeqCst);
    let reply = receiver.retry_message(&key).await.unwrap();
    assert_eq!(reply.as_str(), Some("order"));
    assert_eq!(count(&error_storage).await, 0);
    assert!(receiver.retry_message(&key).await.is_err());

    stop(&adapter).await;
}

#[tokio::test]
async fn test_close_on_error_stops_receiver() {
    let text_listener = Arc::new(TextListener::default());
    let listener: Arc<dyn Listener<String>> = text_listener.clone();
    let receiver = Receiver::builder("push", listener, &test_config())
        .on_error(OnError::Close)
        .build();
    let adapter = Adapter::builder(
        "closing",
        pipeline_of(vec![PipeDefinition::new(Switchable::new("Fail", true))]),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    start(&adapter).await;

    assert!(
        receiver
            .process_raw_message(&RawMessage::new("x".to_string()))
            .await
            .is_err()
    );
    let closing = receiver.clone();
    eventually("receiver to stop itself", || {
        let receiver = closing.clone();
        async move { receiver.run_state() == RunState::Stopped }
    })
    .await;
    assert_eq!(text_listener.closed.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.run_state(), RunState::Started);

    stop(&adapter).await;
}

// ============================================================================
// Polling receivers
// ============================================================================

#[tokio::test]
async fn test_polled_messages_end_in_done() {
    let listener = storage_listener(&[ProcessState::InProcess, ProcessState::Done, ProcessState::Error]);
    for id in ["m1", "m2", "m3"] {
        put_available(&listener, id).await;
    }
    let receiver = Receiver::builder("poller", as_listener(&listener), &test_config())
        .poll_interval(Duration::from_millis(10))
        .build();
    let adapter = Adapter::builder(
        "polling",
        pipeline_of(vec![PipeDefinition::new(Echo("A"))]),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    start(&adapter).await;

    let done = listener.slot(ProcessState::Done).unwrap().clone();
    wait_for_count("messages to be done", &done, 3).await;
    assert_eq!(count(listener.slot(ProcessState::Available).unwrap()).await, 0);
    assert_eq!(count(listener.slot(ProcessState::InProcess).unwrap()).await, 0);
    assert_eq!(receiver.messages_received(), 3);
    assert_eq!(adapter.num_of_messages_processed(), 3);

    stop(&adapter).await;
    assert_eq!(receiver.run_state(), RunState::Stopped);
}

#[tokio::test]
async fn test_polled_failure_moves_to_error() {
    let listener = storage_listener(&[ProcessState::InProcess, ProcessState::Done, ProcessState::Error]);
    put_available(&listener, "m1").await;
    let receiver = Receiver::builder("poller", as_listener(&listener), &test_config())
        .poll_interval(Duration::from_millis(10))
        .build();
    let adapter = Adapter::builder(
        "polling",
        failing_pipeline(Switchable::new("Fail", true)),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    start(&adapter).await;

    let errors = listener.slot(ProcessState::Error).unwrap().clone();
    wait_for_count("message to fail", &errors, 1).await;
    let failed = errors.browse(&BrowseFilter::oldest(1)).await.unwrap();
    assert!(failed[0].comments.as_deref().unwrap().contains("exitcode [500]"));
    assert_eq!(count(listener.slot(ProcessState::Done).unwrap()).await, 0);
    assert_eq!(count(listener.slot(ProcessState::InProcess).unwrap()).await, 0);

    stop(&adapter).await;
}

#[tokio::test]
async fn test_failure_in_error_state_is_not_copied_to_error_storage() {
    let listener = storage_listener(&[ProcessState::InProcess, ProcessState::Done, ProcessState::Error]);
    put_available(&listener, "m1").await;
    let error_storage = slot("errors");
    let receiver = Receiver::builder("poller", as_listener(&listener), &test_config())
        .error_storage(error_storage.clone())
        .poll_interval(Duration::from_millis(10))
        .build();
    let adapter = Adapter::builder(
        "polling",
        failing_pipeline(Switchable::new("Fail", true)),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    start(&adapter).await;

    let errors = listener.slot(ProcessState::Error).unwrap().clone();
    wait_for_count("message to fail", &errors, 1).await;
    eventually("message to be processed", || {
        let adapter = adapter.clone();
        async move { adapter.num_of_messages_processed() == 1 }
    })
    .await;
    stop(&adapter).await;

    let failed = errors.browse(&BrowseFilter::oldest(10)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].comments.as_deref().unwrap().starts_with("exitState [ERROR]"));
    assert_eq!(count(&error_storage).await, 0);
    assert_eq!(count(listener.slot(ProcessState::InProcess).unwrap()).await, 0);
    assert_eq!(count(listener.slot(ProcessState::Done).unwrap()).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_pollers_process_each_message_once() {
    let listener = storage_listener(&[ProcessState::InProcess, ProcessState::Done, ProcessState::Error]);
    let total = 30;
    for i in 0..total {
        put_available(&listener, &format!("m{}", i)).await;
    }
    let recorder = Recorder::default();
    let seen = recorder.seen.clone();
    let receiver = Receiver::builder("poller", as_listener(&listener), &test_config())
        .num_threads(4)
        .poll_interval(Duration::from_millis(5))
        .build();
    let adapter = Adapter::builder(
        "parallel",
        pipeline_of(vec![PipeDefinition::new(recorder)]),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    start(&adapter).await;

    let done = listener.slot(ProcessState::Done).unwrap().clone();
    wait_for_count("messages to be done", &done, total).await;
    stop(&adapter).await;

    assert_eq!(count(listener.slot(ProcessState::Available).unwrap()).await, 0);
    assert_eq!(count(listener.slot(ProcessState::InProcess).unwrap()).await, 0);
    assert_eq!(count(listener.slot(ProcessState::Error).unwrap()).await, 0);
    assert_eq!(count(&done).await, total);

    let mut ids: Vec<String> = seen.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len() as i64, total);
    assert_eq!(receiver.messages_received() as i64, total);
    assert_eq!(adapter.num_of_messages_processed() as i64, total);
}

#[tokio::test]
async fn test_transacted_receiver_rejects_after_max_retries() {
    let listener = storage_listener(&[ProcessState::InProcess, ProcessState::Done, ProcessState::Error]);
    put_available(&listener, "m1").await;
    let pipe = Switchable::new("Fail", true);
    let calls = pipe.calls.clone();
    let receiver = Receiver::builder("poller", as_listener(&listener), &test_config())
        .transaction_attribute(TransactionAttribute::Required)
        .max_retries(2)
        .poll_interval(Duration::from_millis(10))
        .build();
    let adapter = Adapter::builder("transacted", failing_pipeline(pipe), &test_config())
        .receiver(receiver.clone())
        .build();
    start(&adapter).await;
    assert!(receiver.is_transacted());

    let errors = listener.slot(ProcessState::Error).unwrap().clone();
    wait_for_count("message to be rejected", &errors, 1).await;
    let rejected = errors.browse(&BrowseFilter::oldest(1)).await.unwrap();
    assert!(
        rejected[0]
            .comments
            .as_deref()
            .unwrap()
            .starts_with("too many redeliveries or retries")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(receiver.messages_received(), 2);
    assert_eq!(receiver.messages_retried(), 1);
    assert_eq!(receiver.messages_rejected(), 1);
    assert_eq!(receiver.cached_process_result("m1").unwrap().receive_count, 2);
    assert_eq!(count(listener.slot(ProcessState::Available).unwrap()).await, 0);

    stop(&adapter).await;
}

#[tokio::test]
async fn test_process_state_changes_through_receiver() {
    let listener = storage_listener(&[ProcessState::Error]);
    let receiver = Receiver::builder("poller", as_listener(&listener), &test_config()).build();
    let _adapter = Adapter::builder(
        "states",
        pipeline_of(vec![PipeDefinition::new(Echo("A"))]),
        &test_config(),
    )
    .receiver(receiver.clone())
    .build();
    receiver.configure().unwrap();

    let known = receiver.known_process_states();
    assert!(known.contains(&ProcessState::Available));
    assert!(known.contains(&ProcessState::Error));
    let targets = receiver.target_process_states();
    assert!(!targets[&ProcessState::Error].contains(&ProcessState::Hold));
    assert!(targets[&ProcessState::Error].contains(&ProcessState::Available));

    let failed = StoredMessage::new("m1", "payload");
    listener
        .slot(ProcessState::Error)
        .unwrap()
        .store_message(&failed)
        .await
        .unwrap();
    let raw = RawMessage::new(failed.clone()).with_id("m1");

    let parked = receiver
        .change_process_state(&raw, ProcessState::Hold, Some("park"))
        .await
        .unwrap();
    assert!(parked.is_none());

    let moved = receiver
        .change_process_state(&raw, ProcessState::Available, Some("operator retry"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.payload().comments.as_deref(), Some("operator retry"));
    assert_eq!(count(listener.slot(ProcessState::Available).unwrap()).await, 1);
    assert_eq!(count(listener.slot(ProcessState::Error).unwrap()).await, 0);
}

#[tokio::test]
async fn test_polling_over_sqlite_storage() {
    let dir = tempfile::tempdir().unwrap();
    let available = SqliteMessageStorage::from_path(dir.path().join("conduit.db"), "available")
        .await
        .unwrap();
    let pool = available.pool().clone();
    let done: Arc<dyn MessageStorage> = Arc::new(SqliteMessageStorage::new(pool.clone(), "done"));
    let in_process: Arc<dyn MessageStorage> =
        Arc::new(SqliteMessageStorage::new(pool, "in-process"));
    let available: Arc<dyn MessageStorage> = Arc::new(available);

    available
        .store_message(&StoredMessage::new("m1", "<order/>").with_correlation_id(Some("c1".into())))
        .await
        .unwrap();
    let listener = Arc::new(
        StorageListener::new("queue", available.clone())
            .with_slot(ProcessState::InProcess, in_process.clone())
            .with_slot(ProcessState::Done, done.clone()),
    );
    let recorder = Recorder::default();
    let seen = recorder.seen.clone();
    let receiver = Receiver::builder("poller", as_listener(&listener), &test_config())
        .poll_interval(Duration::from_millis(10))
        .build();
    let adapter = Adapter::builder(
        "durable",
        pipeline_of(vec![PipeDefinition::new(recorder)]),
        &test_config(),
    )
    .receiver(receiver)
    .build();
    start(&adapter).await;

    wait_for_count("message to be done", &done, 1).await;
    assert_eq!(count(&available).await, 0);
    assert_eq!(count(&in_process).await, 0);
    assert!(done.contains_correlation_id("c1").await.unwrap());
    assert_eq!(seen.lock().unwrap()[0].0, "m1");

    stop(&adapter).await;
}
