// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter lifecycle, counters and message processing.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

use common::*;
use conduit_core::error::PipeRunError;
use conduit_core::forward::ExitState;
use conduit_core::listener::Listener;
use conduit_core::message_keeper::MessageKeeperLevel;
use conduit_core::pipe::{Pipe, PipeDefinition};
use conduit_core::result::PipeRunResult;
use conduit_core::run_state::RunState;
use conduit_core::session::PipeLineSession;
use conduit_core::statistics::StatisticsAction;
use conduit_core::{Adapter, Message, ProcessingError, Receiver};

fn adapter_with(name: &str, definitions: Vec<PipeDefinition>) -> Arc<Adapter> {
    Adapter::builder(name, pipeline_of(definitions), &test_config()).build()
}

/// Fails with a message carrying a credential.
struct Leaky;

#[async_trait]
impl Pipe for Leaky {
    fn name(&self) -> &str {
        "Leaky"
    }

    fn hide_regex(&self) -> Option<&str> {
        Some("secret[0-9]+")
    }

    async fn do_pipe(
        &self,
        _message: Message,
        _session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        Err(PipeRunError::new("Leaky", "token secret42 rejected"))
    }
}

#[tokio::test]
async fn test_stopped_adapter_answers_with_error_result() {
    init_tracing();
    let adapter = adapter_with("orders", vec![PipeDefinition::new(Echo("A"))]);
    adapter.configure().unwrap();

    let result = adapter
        .process_message("m1", Message::text("x"), &mut PipeLineSession::new())
        .await;
    assert_eq!(result.state(), ExitState::Error);
    let body: Value = serde_json::from_str(result.result().as_str().unwrap()).unwrap();
    assert_eq!(body["errorMessage"]["message"], "illegal state");
    assert_eq!(body["errorMessage"]["location"], "orders");

    let err = adapter
        .process_message_with_exceptions("m1", Message::text("x"), &mut PipeLineSession::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessingError::ManagedState {
            state: RunState::Stopped,
            ..
        }
    ));
    assert_eq!(adapter.num_of_messages_processed(), 0);
}

#[tokio::test]
async fn test_pipes_run_in_order_to_ready_exit() {
    let adapter = adapter_with(
        "chain",
        vec![
            PipeDefinition::new(Append("A")),
            PipeDefinition::new(Append("B")),
        ],
    );
    start(&adapter).await;

    let result = adapter
        .process_message("m1", Message::text("x"), &mut PipeLineSession::new())
        .await;
    assert_eq!(result.state(), ExitState::Success);
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.result().as_str(), Some("xAB"));

    stop(&adapter).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_messages_keep_counters_consistent() {
    let adapter = adapter_with("busy", vec![PipeDefinition::new(Overlap::default())]);
    start(&adapter).await;

    let runs = (0..20).map(|i| {
        let adapter = adapter.clone();
        async move {
            adapter
                .process_message(
                    &format!("m{}", i),
                    Message::text("x"),
                    &mut PipeLineSession::new(),
                )
                .await
        }
    });
    let results = join_all(runs).await;

    assert!(results.iter().all(|r| r.is_successful()));
    assert_eq!(adapter.num_of_messages_in_process(), 0);
    assert_eq!(adapter.num_of_messages_processed(), 20);
    assert_eq!(adapter.num_of_messages_in_error(), 0);
    assert_eq!(adapter.messages_by_hour().iter().sum::<u64>(), 20);
    assert!(adapter.last_message_date().is_some());

    stop(&adapter).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_threads_bounds_pipe_concurrency() {
    let overlap = Overlap::default();
    let peak = overlap.peak.clone();
    let adapter = adapter_with(
        "bounded",
        vec![PipeDefinition::new(overlap).with_max_threads(2)],
    );
    start(&adapter).await;

    let runs = (0..8).map(|i| {
        let adapter = adapter.clone();
        async move {
            adapter
                .process_message(
                    &format!("m{}", i),
                    Message::text("x"),
                    &mut PipeLineSession::new(),
                )
                .await
        }
    });
    join_all(runs).await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(adapter.num_of_messages_processed(), 8);

    stop(&adapter).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_messages_in_process() {
    let gate = Gate::closed();
    let permits = gate.permits.clone();
    let adapter = adapter_with("draining", vec![PipeDefinition::new(gate)]);
    start(&adapter).await;

    let running = {
        let adapter = adapter.clone();
        tokio::spawn(async move {
            adapter
                .process_message("m1", Message::text("held"), &mut PipeLineSession::new())
                .await
        })
    };
    eventually("message to enter the pipeline", || {
        let adapter = adapter.clone();
        async move { adapter.num_of_messages_in_process() == 1 }
    })
    .await;

    adapter.stop_running();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(adapter.run_state(), RunState::Stopping);

    permits.add_permits(1);
    wait_for_state(&adapter, RunState::Stopped).await;
    let result = running.await.unwrap();
    assert_eq!(result.result().as_str(), Some("held"));
    assert_eq!(adapter.num_of_messages_in_process(), 0);
}

#[tokio::test]
async fn test_start_is_ignored_while_running() {
    let adapter = adapter_with("twice", vec![PipeDefinition::new(Echo("A"))]);
    start(&adapter).await;

    adapter.start_running();
    assert_eq!(adapter.run_state(), RunState::Started);
    let last = adapter.message_keeper().last().unwrap();
    assert_eq!(last.level, MessageKeeperLevel::Warn);
    assert!(last.message.contains("ignoring start command"));

    stop(&adapter).await;
    adapter.stop_running();
    assert_eq!(adapter.run_state(), RunState::Stopped);
}

#[tokio::test]
async fn test_start_without_configuration_is_refused() {
    let adapter = adapter_with("raw", vec![PipeDefinition::new(Echo("A"))]);
    adapter.start_running();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(adapter.run_state(), RunState::Stopped);
    let last = adapter.message_keeper().last().unwrap();
    assert_eq!(last.level, MessageKeeperLevel::Error);
}

#[tokio::test]
async fn test_failed_receiver_configure_blocks_start_until_reconfigured() {
    let steady = Arc::new(TextListener::default());
    let flaky = Arc::new(TextListener::default());
    flaky.refuse_configure.store(true, Ordering::SeqCst);
    let steady_listener: Arc<dyn Listener<String>> = steady.clone();
    let flaky_listener: Arc<dyn Listener<String>> = flaky.clone();
    let adapter = Adapter::builder(
        "inbound",
        pipeline_of(vec![PipeDefinition::new(Echo("A"))]),
        &test_config(),
    )
    .receiver(Receiver::builder("steady", steady_listener, &test_config()).build())
    .receiver(Receiver::builder("flaky", flaky_listener, &test_config()).build())
    .build();

    assert!(adapter.configure().is_err());
    assert!(!adapter.is_configuration_succeeded());
    adapter.start_running();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(adapter.run_state(), RunState::Stopped);
    let last = adapter.message_keeper().last().unwrap();
    assert_eq!(last.level, MessageKeeperLevel::Error);
    assert!(last.message.contains("configuration did not succeed"));

    // Still failing: the flag stays down on every attempt.
    assert!(adapter.configure().is_err());
    assert!(!adapter.is_configuration_succeeded());

    flaky.refuse_configure.store(false, Ordering::SeqCst);
    adapter.configure().unwrap();
    assert!(adapter.is_configuration_succeeded());
    assert_eq!(steady.configured.load(Ordering::SeqCst), 1);
    assert_eq!(flaky.configured.load(Ordering::SeqCst), 3);

    start(&adapter).await;
    stop(&adapter).await;
}

#[tokio::test]
async fn test_pipeline_start_failure_and_recovery() {
    let adapter = adapter_with("broken", vec![PipeDefinition::new(Unstartable)]);
    adapter.configure().unwrap();
    adapter.start_running();
    wait_for_state(&adapter, RunState::Error).await;

    adapter.configure().unwrap();
    assert_eq!(adapter.run_state(), RunState::Stopped);
}

#[test]
fn test_adapter_name_must_not_contain_slash() {
    let adapter = adapter_with("a/b", vec![PipeDefinition::new(Echo("A"))]);
    assert!(adapter.configure().is_err());
    assert!(!adapter.is_configuration_succeeded());
}

#[tokio::test]
async fn test_pipe_failure_is_counted_and_formatted() {
    let adapter = adapter_with(
        "failing",
        vec![PipeDefinition::new(Switchable::new("Fail", true))],
    );
    start(&adapter).await;

    let result = adapter
        .process_message("m1", Message::text("<order/>"), &mut PipeLineSession::new())
        .await;
    assert_eq!(result.state(), ExitState::Error);
    let body: Value = serde_json::from_str(result.result().as_str().unwrap()).unwrap();
    assert_eq!(body["errorMessage"]["message"], "error during pipeline processing");
    assert_eq!(body["errorMessage"]["location"], "Fail");
    assert_eq!(body["errorMessage"]["originalMessage"]["messageId"], "m1");
    assert_eq!(body["errorMessage"]["originalMessage"]["message"], "<order/>");

    assert_eq!(adapter.num_of_messages_processed(), 1);
    assert_eq!(adapter.num_of_messages_in_error(), 1);
    assert_eq!(adapter.num_of_messages_in_process(), 0);

    stop(&adapter).await;
}

#[tokio::test]
async fn test_error_results_hide_sensitive_text() {
    let adapter = adapter_with("hiding", vec![PipeDefinition::new(Leaky)]);
    start(&adapter).await;
    assert_eq!(adapter.composed_hide_regex().as_deref(), Some("(secret[0-9]+)"));

    let result = adapter
        .process_message("m1", Message::text("x"), &mut PipeLineSession::new())
        .await;
    let text = result.result().as_str().unwrap();
    assert!(!text.contains("secret42"));
    assert!(text.contains("token ******** rejected"));
    assert!(
        adapter
            .message_keeper()
            .entries()
            .iter()
            .all(|e| !e.message.contains("secret42"))
    );

    stop(&adapter).await;
}

#[tokio::test]
async fn test_null_message_replaced_when_enabled() {
    let adapter = Adapter::builder(
        "nulls",
        pipeline_of(vec![PipeDefinition::new(Append("A"))]),
        &test_config(),
    )
    .replace_null_message(true)
    .build();
    start(&adapter).await;

    let result = adapter
        .process_message("m1", Message::null(), &mut PipeLineSession::new())
        .await;
    assert_eq!(result.result().as_str(), Some("A"));

    stop(&adapter).await;
}

#[tokio::test]
async fn test_statistics_export() {
    let adapter = adapter_with("stats", vec![PipeDefinition::new(Echo("A"))]);
    start(&adapter).await;
    for id in ["m1", "m2"] {
        adapter
            .process_message(id, Message::text("x"), &mut PipeLineSession::new())
            .await;
    }

    let value = adapter.statistics_json(StatisticsAction::MarkFull);
    let stats = &value["stats"];
    assert_eq!(stats["type"], "adapter");
    assert_eq!(stats["state"], "Started");
    assert_eq!(stats["messagesProcessed"], 2);
    assert_eq!(stats["messagesProcessedThisInterval"], 2);
    assert_eq!(stats["lastMessageProcessingState"], "OK");
    assert_eq!(stats["messagesStartProcessingByHour"]["type"], "hours");

    let value = adapter.statistics_json(StatisticsAction::Summary);
    assert_eq!(value["stats"]["messagesProcessedThisInterval"], 0);
    assert!(value["stats"].get("messagesStartProcessingByHour").is_none());

    stop(&adapter).await;
}
