// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution strategies layered around a pipeline run and around each hop.
//!
//! A run goes through the pipeline processors, outermost first:
//! transaction, locker, cache, then the core hop loop. Every hop goes
//! through the pipe processors: exception forward, transaction, limiting,
//! then the core pipe call. Each processor holds the next one, so extra
//! layers (tracing, auditing) can be added with
//! [`PipeLine::layer_pipeline_processor`] and
//! [`PipeLine::layer_pipe_processor`] without touching the pipeline.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::error::{PipeRunError, explain};
use crate::forward::{EXCEPTION_FORWARD_NAME, ExitState, PipeForward};
use crate::message::Message;
use crate::pipeline::{ConfiguredPipe, ForwardTarget, Graph, PipeLine};
use crate::result::{PipeLineResult, PipeRunResult};
use crate::session::PipeLineSession;
use crate::transaction::{Transaction, TransactionAttribute};

/// Strategy executing a whole pipeline run.
#[async_trait]
pub trait PipeLineProcessor: Send + Sync {
    /// Run `message` through `pipeline`.
    async fn process_pipeline(
        &self,
        pipeline: &PipeLine,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, PipeRunError>;
}

/// Strategy executing one hop.
#[async_trait]
pub trait PipeProcessor: Send + Sync {
    /// Run `message` through `pipe`.
    async fn process_pipe(
        &self,
        pipeline: &PipeLine,
        pipe: &ConfiguredPipe,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError>;
}

/// Transaction, locker, cache and core pipeline processors, outermost first.
pub fn default_pipeline_processor() -> Arc<dyn PipeLineProcessor> {
    let core: Arc<dyn PipeLineProcessor> = Arc::new(CorePipeLineProcessor);
    let cache = Arc::new(CachePipeLineProcessor::new(core));
    let locker = Arc::new(LockerPipeLineProcessor::new(cache));
    Arc::new(TransactionalPipeLineProcessor::new(locker))
}

/// Exception forward, transaction, limiting and core pipe processors, outermost first.
pub fn default_pipe_processor() -> Arc<dyn PipeProcessor> {
    let core: Arc<dyn PipeProcessor> = Arc::new(CorePipeProcessor);
    let limiting = Arc::new(LimitingPipeProcessor::new(core));
    let transactional = Arc::new(TransactionalPipeProcessor::new(limiting));
    Arc::new(ExceptionForwardPipeProcessor::new(transactional))
}

// ============================================================================
// Pipeline processors
// ============================================================================

/// Follows forwards from the first pipe until an exit is reached.
#[derive(Debug, Default)]
pub struct CorePipeLineProcessor;

fn follow(
    graph: &Graph,
    pipe: &ConfiguredPipe,
    result: &PipeRunResult,
) -> Result<ForwardTarget, PipeRunError> {
    let name = result.forward_name();
    match pipe.forward(name) {
        Some(forward) => graph.resolve(pipe.name(), Some(forward)),
        None => {
            // A forward name may directly name a pipe or an exit.
            let implicit = PipeForward::new(name, name);
            graph.resolve(pipe.name(), Some(&implicit)).map_err(|_| {
                PipeRunError::forward(
                    pipe.name(),
                    format!("cannot find forward or pipe named [{}]", name),
                )
            })
        }
    }
}

#[async_trait]
impl PipeLineProcessor for CorePipeLineProcessor {
    async fn process_pipeline(
        &self,
        pipeline: &PipeLine,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, PipeRunError> {
        let graph = pipeline.graph()?;
        let mut message = message;
        let mut target = ForwardTarget::Pipe(graph.first_pipe.clone());

        for special in [&graph.input_wrapper, &graph.input_validator]
            .into_iter()
            .flatten()
        {
            let result = pipeline.run_pipe(special, message, session).await?;
            if !result.is_successful() {
                target = follow(&graph, special, &result)?;
                message = result.into_result();
                break;
            }
            message = result.into_result();
        }

        let mut output_checked = false;
        let exit = loop {
            match target {
                ForwardTarget::Pipe(pipe) => {
                    let result = pipeline.run_pipe(&pipe, message, session).await?;
                    target = follow(&graph, &pipe, &result)?;
                    message = result.into_result();
                }
                ForwardTarget::Exit(exit) => {
                    if exit.state() == ExitState::Success && !output_checked {
                        output_checked = true;
                        let checks = [
                            (&graph.output_validator, exit.skip_validation()),
                            (&graph.output_wrapper, exit.skip_wrapping()),
                        ];
                        let mut rerouted = None;
                        for (special, skip) in checks {
                            let Some(special) = special.as_ref().filter(|_| !skip) else {
                                continue;
                            };
                            let result = pipeline.run_pipe(special, message, session).await?;
                            if !result.is_successful() {
                                rerouted = Some(follow(&graph, special, &result)?);
                                message = result.into_result();
                                break;
                            }
                            message = result.into_result();
                        }
                        if let Some(next) = rerouted {
                            target = next;
                            continue;
                        }
                    }
                    break exit;
                }
            }
        };

        if exit.is_empty_result() {
            message = Message::null();
        }
        session.set_exit_state(exit.state(), exit.exit_code());
        debug!(
            owner = %pipeline.owner(),
            message_id = %message_id,
            exit = %exit.path(),
            state = %exit.state(),
            "PipeLine reached exit"
        );
        Ok(PipeLineResult::new(exit.state(), exit.exit_code(), message))
    }
}

/// Runs the pipeline under its transaction boundary.
///
/// A result other than SUCCESS, or an error, marks the transaction
/// rollback-only: a created transaction is rolled back, a joined one is
/// left for its creator to roll back.
pub struct TransactionalPipeLineProcessor {
    next: Arc<dyn PipeLineProcessor>,
}

impl TransactionalPipeLineProcessor {
    /// Wrap `next`.
    pub fn new(next: Arc<dyn PipeLineProcessor>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl PipeLineProcessor for TransactionalPipeLineProcessor {
    async fn process_pipeline(
        &self,
        pipeline: &PipeLine,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, PipeRunError> {
        let mut tx = Transaction::begin(
            pipeline.transaction_manager().clone(),
            pipeline.transaction_definition(),
            format!("{} [{}]", pipeline.owner(), message_id),
        )
        .await
        .map_err(|e| {
            PipeRunError::pipeline(
                format!("{}: could not obtain transaction", pipeline.owner()),
                Some(Box::new(e)),
            )
        })?;

        let result = tx
            .scope(
                self.next
                    .process_pipeline(pipeline, message_id, message, session),
            )
            .await;

        if !matches!(&result, Ok(r) if r.state() == ExitState::Success) {
            tx.set_rollback_only();
        }

        match (tx.complete().await, result) {
            (Ok(()), result) => result,
            (Err(e), Ok(_)) => Err(PipeRunError::pipeline(
                format!("{}: could not complete transaction", pipeline.owner()),
                Some(Box::new(e)),
            )),
            (Err(e), Err(err)) => {
                warn!(
                    owner = %pipeline.owner(),
                    message_id = %message_id,
                    error = %e,
                    "Could not complete transaction after pipeline failure"
                );
                Err(err)
            }
        }
    }
}

/// Serializes runs through the pipeline's locker.
///
/// A run that cannot obtain the lock is skipped and reported as SUCCESS.
pub struct LockerPipeLineProcessor {
    next: Arc<dyn PipeLineProcessor>,
}

impl LockerPipeLineProcessor {
    /// Wrap `next`.
    pub fn new(next: Arc<dyn PipeLineProcessor>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl PipeLineProcessor for LockerPipeLineProcessor {
    async fn process_pipeline(
        &self,
        pipeline: &PipeLine,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, PipeRunError> {
        let Some(locker) = pipeline.locker() else {
            return self
                .next
                .process_pipeline(pipeline, message_id, message, session)
                .await;
        };

        let key = locker.acquire(message_id).await.map_err(|e| {
            PipeRunError::pipeline(
                format!(
                    "{}: error while trying to obtain lock [{}]",
                    pipeline.owner(),
                    locker.settings().object_id()
                ),
                Some(Box::new(e)),
            )
        })?;

        let Some(key) = key else {
            warn!(
                owner = %pipeline.owner(),
                message_id = %message_id,
                object_id = %locker.settings().object_id(),
                "Could not obtain lock, skipping message"
            );
            session.set_exit_state(ExitState::Success, 0);
            return Ok(PipeLineResult::success(Message::null()));
        };

        let result = self
            .next
            .process_pipeline(pipeline, message_id, message, session)
            .await;
        if let Err(e) = locker.release(&key).await {
            warn!(owner = %pipeline.owner(), key = %key, error = %e, "Could not release lock");
        }
        result
    }
}

/// Returns cached results for identical inputs.
pub struct CachePipeLineProcessor {
    next: Arc<dyn PipeLineProcessor>,
}

impl CachePipeLineProcessor {
    /// Wrap `next`.
    pub fn new(next: Arc<dyn PipeLineProcessor>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl PipeLineProcessor for CachePipeLineProcessor {
    async fn process_pipeline(
        &self,
        pipeline: &PipeLine,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, PipeRunError> {
        let Some(cache) = pipeline.cache() else {
            return self
                .next
                .process_pipeline(pipeline, message_id, message, session)
                .await;
        };

        let key = cache.key_for(&message);
        if let Some(key) = &key
            && let Some(hit) = cache.get(key).await
        {
            debug!(owner = %pipeline.owner(), message_id = %message_id, "Returning cached result");
            session.set_exit_state(hit.state(), hit.exit_code());
            return Ok(hit);
        }

        let result = self
            .next
            .process_pipeline(pipeline, message_id, message, session)
            .await?;
        if result.is_successful()
            && let Some(key) = key
        {
            cache.put(&key, result.clone()).await;
        }
        Ok(result)
    }
}

// ============================================================================
// Pipe processors
// ============================================================================

/// Calls the pipe and records its duration.
#[derive(Debug, Default)]
pub struct CorePipeProcessor;

#[async_trait]
impl PipeProcessor for CorePipeProcessor {
    async fn process_pipe(
        &self,
        pipeline: &PipeLine,
        pipe: &ConfiguredPipe,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        trace!(owner = %pipeline.owner(), pipe = %pipe.name(), "Executing pipe");
        let started = Instant::now();
        let result = pipe.pipe().do_pipe(message, session).await;
        pipeline.record_duration(pipe.name(), started.elapsed());

        let result = result?;
        if pipe.pipe().has_size_statistics()
            && let Some(size) = result.result().size()
        {
            pipeline.record_size(pipe.name(), size);
        }
        trace!(
            owner = %pipeline.owner(),
            pipe = %pipe.name(),
            forward = %result.forward_name(),
            "Pipe returned"
        );
        Ok(result)
    }
}

/// Enforces a pipe's concurrency ceiling.
pub struct LimitingPipeProcessor {
    next: Arc<dyn PipeProcessor>,
}

impl LimitingPipeProcessor {
    /// Wrap `next`.
    pub fn new(next: Arc<dyn PipeProcessor>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl PipeProcessor for LimitingPipeProcessor {
    async fn process_pipe(
        &self,
        pipeline: &PipeLine,
        pipe: &ConfiguredPipe,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        let Some(limiter) = pipe.limiter() else {
            return self.next.process_pipe(pipeline, pipe, message, session).await;
        };
        let started = Instant::now();
        let _permit = limiter.acquire().await.map_err(|e| {
            PipeRunError::with_source(pipe.name(), "could not obtain execution permit", e)
        })?;
        pipeline.record_wait(pipe.name(), started.elapsed());
        self.next.process_pipe(pipeline, pipe, message, session).await
    }
}

/// Runs a hop under the pipe's own transaction boundary.
pub struct TransactionalPipeProcessor {
    next: Arc<dyn PipeProcessor>,
}

impl TransactionalPipeProcessor {
    /// Wrap `next`.
    pub fn new(next: Arc<dyn PipeProcessor>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl PipeProcessor for TransactionalPipeProcessor {
    async fn process_pipe(
        &self,
        pipeline: &PipeLine,
        pipe: &ConfiguredPipe,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        let definition = pipe.transaction_definition();
        if definition.attribute() == TransactionAttribute::Supports && definition.timeout().is_none() {
            return self.next.process_pipe(pipeline, pipe, message, session).await;
        }

        let mut tx = Transaction::begin(
            pipeline.transaction_manager().clone(),
            definition,
            format!("pipe [{}]", pipe.name()),
        )
        .await
        .map_err(|e| PipeRunError::with_source(pipe.name(), "could not obtain transaction", e))?;

        let result = tx
            .scope(self.next.process_pipe(pipeline, pipe, message, session))
            .await;
        if result.is_err() {
            tx.set_rollback_only();
        }

        match (tx.complete().await, result) {
            (Ok(()), result) => result,
            (Err(e), Ok(_)) => Err(PipeRunError::with_source(
                pipe.name(),
                "could not complete transaction",
                e,
            )),
            (Err(e), Err(err)) => {
                warn!(pipe = %pipe.name(), error = %e, "Could not complete transaction after pipe failure");
                Err(err)
            }
        }
    }
}

/// Turns a pipe failure into its `exception` forward, when it has one.
pub struct ExceptionForwardPipeProcessor {
    next: Arc<dyn PipeProcessor>,
}

impl ExceptionForwardPipeProcessor {
    /// Wrap `next`.
    pub fn new(next: Arc<dyn PipeProcessor>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl PipeProcessor for ExceptionForwardPipeProcessor {
    async fn process_pipe(
        &self,
        pipeline: &PipeLine,
        pipe: &ConfiguredPipe,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        match self.next.process_pipe(pipeline, pipe, message, session).await {
            Err(e) if pipe.forward(EXCEPTION_FORWARD_NAME).is_some() => {
                let text = explain(&e);
                warn!(
                    owner = %pipeline.owner(),
                    pipe = %pipe.name(),
                    error = %text,
                    "Pipe failed, following exception forward"
                );
                Ok(PipeRunResult::new(EXCEPTION_FORWARD_NAME, Message::text(text)))
            }
            other => other,
        }
    }
}
