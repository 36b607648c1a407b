// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The processing graph of an adapter.
//!
//! A [`PipeLine`] is assembled from [`PipeDefinition`]s, exits and global
//! forwards, then frozen by [`PipeLine::configure`] into an immutable graph.
//! Configuring:
//!
//! 1. adds the `READY` success exit when no exit is declared;
//! 2. wires a `success` forward for every pipe lacking one, to the next
//!    pipe or, for the last pipe, to the first success exit;
//! 3. merges global forwards into every pipe;
//! 4. configures validators, wrappers and the locker;
//! 5. decides whether the input must be buffered because some pipe reads
//!    the original message again;
//! 6. fails when there are no pipes or `firstPipe` names no pipe.
//!
//! [`PipeLine::process`] hands the message to the pipeline processor
//! chain, which follows forwards hop by hop until an exit is reached.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::error::{ConfigurationError, LifecycleError, PipeRunError};
use crate::forward::{ExitState, PipeForward, PipeLineExit, SUCCESS_FORWARD_NAME};
use crate::locker::Locker;
use crate::message::Message;
use crate::pipe::{Pipe, PipeDefinition};
use crate::processor::{self, PipeLineProcessor, PipeProcessor};
use crate::result::{PipeLineResult, PipeRunResult};
use crate::session::{ORIGINAL_MESSAGE_KEY, PipeLineSession};
use crate::statistics::{ScalarValue, StatisticsAction, StatisticsIterationHandler, StatisticsKeeper};
use crate::transaction::{LocalTransactionManager, TransactionDefinition, TransactionManager};

/// Name under which the input validator is registered.
pub const INPUT_VALIDATOR_NAME: &str = "- pipeline inputValidator";
/// Name under which the output validator is registered.
pub const OUTPUT_VALIDATOR_NAME: &str = "- pipeline outputValidator";
/// Name under which the input wrapper is registered.
pub const INPUT_WRAPPER_NAME: &str = "- pipeline inputWrapper";
/// Name under which the output wrapper is registered.
pub const OUTPUT_WRAPPER_NAME: &str = "- pipeline outputWrapper";

/// Where a forward leads.
#[derive(Clone)]
pub enum ForwardTarget {
    /// The run ends at this exit.
    Exit(PipeLineExit),
    /// The run continues with this pipe.
    Pipe(Arc<ConfiguredPipe>),
}

impl fmt::Debug for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit(exit) => f.debug_tuple("Exit").field(exit).finish(),
            Self::Pipe(pipe) => f.debug_tuple("Pipe").field(&pipe.name()).finish(),
        }
    }
}

/// A pipe as wired into a configured graph.
pub struct ConfiguredPipe {
    name: String,
    pipe: Arc<dyn Pipe>,
    forwards: HashMap<String, PipeForward>,
    max_threads: usize,
    limiter: Option<Arc<Semaphore>>,
    transaction: TransactionDefinition,
}

impl fmt::Debug for ConfiguredPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredPipe")
            .field("name", &self.name)
            .field("forwards", &self.forwards)
            .field("max_threads", &self.max_threads)
            .finish()
    }
}

impl ConfiguredPipe {
    fn new(name: String, definition: &PipeDefinition) -> Self {
        let max_threads = definition.max_threads();
        Self {
            name,
            pipe: definition.pipe().clone(),
            forwards: definition
                .forwards()
                .iter()
                .map(|f| (f.name().to_string(), f.clone()))
                .collect(),
            max_threads,
            limiter: (max_threads > 0).then(|| Arc::new(Semaphore::new(max_threads))),
            transaction: definition.transaction_definition().clone(),
        }
    }

    /// Name in the graph. Validators and wrappers carry a reserved name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pipe implementation.
    pub fn pipe(&self) -> &Arc<dyn Pipe> {
        &self.pipe
    }

    /// Look up a forward by name.
    pub fn forward(&self, name: &str) -> Option<&PipeForward> {
        self.forwards.get(name)
    }

    /// All forwards, including merged global forwards.
    pub fn forwards(&self) -> impl Iterator<Item = &PipeForward> {
        self.forwards.values()
    }

    /// Concurrency ceiling; 0 means unlimited.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Semaphore enforcing the concurrency ceiling.
    pub fn limiter(&self) -> Option<&Arc<Semaphore>> {
        self.limiter.as_ref()
    }

    /// Number of invocations that may still start without waiting.
    pub fn available_permits(&self) -> Option<usize> {
        self.limiter.as_ref().map(|s| s.available_permits())
    }

    /// Transaction boundary around each hop.
    pub fn transaction_definition(&self) -> &TransactionDefinition {
        &self.transaction
    }
}

/// The frozen graph produced by [`PipeLine::configure`].
pub(crate) struct Graph {
    pub(crate) pipes: Vec<Arc<ConfiguredPipe>>,
    pipes_by_name: HashMap<String, Arc<ConfiguredPipe>>,
    exits: Vec<PipeLineExit>,
    exits_by_path: HashMap<String, PipeLineExit>,
    pub(crate) first_pipe: Arc<ConfiguredPipe>,
    pub(crate) input_wrapper: Option<Arc<ConfiguredPipe>>,
    pub(crate) input_validator: Option<Arc<ConfiguredPipe>>,
    pub(crate) output_validator: Option<Arc<ConfiguredPipe>>,
    pub(crate) output_wrapper: Option<Arc<ConfiguredPipe>>,
    consumed_multiple_times: bool,
    warnings: Vec<String>,
}

impl Graph {
    fn special_pipes(&self) -> impl Iterator<Item = &Arc<ConfiguredPipe>> {
        [
            &self.input_wrapper,
            &self.input_validator,
            &self.output_validator,
            &self.output_wrapper,
        ]
        .into_iter()
        .flatten()
    }

    pub(crate) fn resolve(
        &self,
        pipe_name: &str,
        forward: Option<&PipeForward>,
    ) -> Result<ForwardTarget, PipeRunError> {
        let Some(forward) = forward else {
            return Err(PipeRunError::forward(
                pipe_name,
                format!("got a null forward from pipe [{}]", pipe_name),
            ));
        };
        let path = forward.path();
        if path.is_empty() {
            return Err(PipeRunError::forward(
                pipe_name,
                format!(
                    "got a forward [{}] with a path that equals null or has a zero-length value from pipe [{}]",
                    forward.name(),
                    pipe_name
                ),
            ));
        }
        if let Some(exit) = self.exits_by_path.get(path) {
            return Ok(ForwardTarget::Exit(exit.clone()));
        }
        if let Some(pipe) = self.pipes_by_name.get(path) {
            return Ok(ForwardTarget::Pipe(pipe.clone()));
        }
        Err(PipeRunError::forward(
            pipe_name,
            format!(
                "Target to execute [{}] is not defined as a Pipe or an Exit.",
                path
            ),
        ))
    }
}

/// An ordered, branching sequence of pipes.
pub struct PipeLine {
    owner: String,
    definitions: Vec<PipeDefinition>,
    global_forwards: Vec<PipeForward>,
    exits: Vec<PipeLineExit>,
    first_pipe: Option<String>,
    input_validator: Option<PipeDefinition>,
    output_validator: Option<PipeDefinition>,
    input_wrapper: Option<PipeDefinition>,
    output_wrapper: Option<PipeDefinition>,
    locker: Option<Arc<dyn Locker>>,
    cache: Option<Arc<dyn ResultCache>>,
    transform_null_message: Option<String>,
    transaction: TransactionDefinition,
    transaction_manager: Arc<dyn TransactionManager>,
    pipeline_processor: Arc<dyn PipeLineProcessor>,
    pipe_processor: Arc<dyn PipeProcessor>,
    graph: RwLock<Option<Arc<Graph>>>,
    durations: DashMap<String, StatisticsKeeper>,
    waits: DashMap<String, StatisticsKeeper>,
    sizes: DashMap<String, StatisticsKeeper>,
}

impl fmt::Debug for PipeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeLine")
            .field("owner", &self.owner)
            .field("pipes", &self.definitions.iter().map(|d| d.name()).collect::<Vec<_>>())
            .field("exits", &self.exits)
            .field("first_pipe", &self.first_pipe)
            .field("transaction", &self.transaction)
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl Default for PipeLine {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeLine {
    /// Create an empty pipeline with the default processor chains.
    pub fn new() -> Self {
        Self {
            owner: "PipeLine".to_string(),
            definitions: Vec::new(),
            global_forwards: Vec::new(),
            exits: Vec::new(),
            first_pipe: None,
            input_validator: None,
            output_validator: None,
            input_wrapper: None,
            output_wrapper: None,
            locker: None,
            cache: None,
            transform_null_message: None,
            transaction: TransactionDefinition::default(),
            transaction_manager: Arc::new(LocalTransactionManager::new()),
            pipeline_processor: processor::default_pipeline_processor(),
            pipe_processor: processor::default_pipe_processor(),
            graph: RwLock::new(None),
            durations: DashMap::new(),
            waits: DashMap::new(),
            sizes: DashMap::new(),
        }
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    /// Add a pipe. Names must be non-empty and unique.
    pub fn add_pipe(&mut self, definition: PipeDefinition) -> Result<(), ConfigurationError> {
        let name = definition.name().to_string();
        if name.trim().is_empty() {
            return Err(ConfigurationError::new(format!(
                "{}: pipe to be added has no name, pipe index [{}]",
                self.owner,
                self.definitions.len()
            )));
        }
        if self.definitions.iter().any(|d| d.name() == name) {
            return Err(ConfigurationError::new(format!(
                "{}: pipe [{}] defined more then once",
                self.owner, name
            )));
        }
        debug!(owner = %self.owner, pipe = %name, "Added pipe");
        self.definitions.push(definition);
        Ok(())
    }

    /// Add a forward available to every pipe that does not declare it.
    pub fn add_global_forward(&mut self, name: impl Into<String>, path: impl Into<String>) {
        let forward = PipeForward::new(name, path);
        self.global_forwards.retain(|f| f.name() != forward.name());
        self.global_forwards.push(forward);
    }

    /// Add an exit.
    pub fn add_exit(&mut self, exit: PipeLineExit) {
        self.exits.push(exit);
    }

    /// Name the pipe each run starts with; defaults to the first added pipe.
    pub fn set_first_pipe(&mut self, name: impl Into<String>) {
        self.first_pipe = Some(name.into());
    }

    /// Validate the input before the first pipe.
    pub fn set_input_validator(&mut self, definition: PipeDefinition) {
        self.input_validator = Some(definition);
    }

    /// Validate the output when a success exit is reached.
    pub fn set_output_validator(&mut self, definition: PipeDefinition) {
        self.output_validator = Some(definition);
    }

    /// Unwrap the input before validation.
    pub fn set_input_wrapper(&mut self, definition: PipeDefinition) {
        self.input_wrapper = Some(definition);
    }

    /// Wrap the output after validation.
    pub fn set_output_wrapper(&mut self, definition: PipeDefinition) {
        self.output_wrapper = Some(definition);
    }

    /// Serialize runs through a lock.
    pub fn set_locker(&mut self, locker: Arc<dyn Locker>) {
        self.locker = Some(locker);
    }

    /// Cache the results of successful runs.
    pub fn set_cache(&mut self, cache: Arc<dyn ResultCache>) {
        self.cache = Some(cache);
    }

    /// Replace an empty input with this text.
    pub fn set_transform_null_message(&mut self, text: impl Into<String>) {
        self.transform_null_message = Some(text.into());
    }

    /// Run the whole pipeline under this transaction boundary.
    pub fn set_transaction(&mut self, definition: TransactionDefinition) {
        self.transaction = definition;
    }

    /// Use this manager for pipeline and pipe transactions.
    pub fn set_transaction_manager(&mut self, manager: Arc<dyn TransactionManager>) {
        self.transaction_manager = manager;
    }

    /// Name used in log and error messages, normally the adapter name.
    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.owner = owner.into();
    }

    /// Wrap the pipeline processor chain, for tracing or extra boundaries.
    pub fn layer_pipeline_processor(
        &mut self,
        layer: impl FnOnce(Arc<dyn PipeLineProcessor>) -> Arc<dyn PipeLineProcessor>,
    ) {
        self.pipeline_processor = layer(self.pipeline_processor.clone());
    }

    /// Wrap the pipe processor chain, applied around every hop.
    pub fn layer_pipe_processor(
        &mut self,
        layer: impl FnOnce(Arc<dyn PipeProcessor>) -> Arc<dyn PipeProcessor>,
    ) {
        self.pipe_processor = layer(self.pipe_processor.clone());
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Validate and freeze the graph. May be called again to rebuild it.
    pub fn configure(&self) -> Result<(), ConfigurationError> {
        if self.definitions.is_empty() {
            return Err(ConfigurationError::new("no Pipes in PipeLine"));
        }
        let mut warnings = Vec::new();

        let mut exits = self.exits.clone();
        if exits.is_empty() {
            exits.push(PipeLineExit::ready());
        }
        let mut exits_by_path = HashMap::new();
        let mut exit_codes = HashSet::new();
        for exit in &exits {
            if exits_by_path.insert(exit.path().to_string(), exit.clone()).is_some() {
                warnings.push(format!("exit [{}] is defined more than once", exit.path()));
            }
            if exit.exit_code() > 0 && !exit_codes.insert(exit.exit_code()) {
                warnings.push(format!(
                    "exit code [{}] is used by more than one exit",
                    exit.exit_code()
                ));
            }
        }
        let success_exit = exits
            .iter()
            .find(|e| e.state() == ExitState::Success)
            .or_else(|| exits.first())
            .map(|e| e.path().to_string())
            .unwrap_or_default();

        let mut pipes = Vec::with_capacity(self.definitions.len());
        for (i, definition) in self.definitions.iter().enumerate() {
            definition.pipe().configure().map_err(|e| {
                ConfigurationError::with_source(
                    format!("Pipe [{}] could not be configured", definition.name()),
                    e,
                )
            })?;
            let mut configured = ConfiguredPipe::new(definition.name().to_string(), definition);
            if !configured.forwards.contains_key(SUCCESS_FORWARD_NAME) {
                let path = match self.definitions.get(i + 1) {
                    Some(next) => next.name().to_string(),
                    None => success_exit.clone(),
                };
                debug!(pipe = %configured.name, path = %path, "Wired success forward");
                configured
                    .forwards
                    .insert(SUCCESS_FORWARD_NAME.to_string(), PipeForward::new(SUCCESS_FORWARD_NAME, path));
            }
            self.merge_global_forwards(&mut configured);
            pipes.push(configured);
        }

        let pipe_names: HashSet<&str> = pipes.iter().map(|p| p.name()).collect();
        for pipe in &pipes {
            for forward in pipe.forwards() {
                let path = forward.path();
                if !exits_by_path.contains_key(path) && !pipe_names.contains(path) {
                    warnings.push(format!(
                        "pipe [{}] has a forward [{}] of which the pipe to execute [{}] is not defined",
                        pipe.name(),
                        forward.name(),
                        path
                    ));
                }
            }
        }

        let first_name = self
            .first_pipe
            .clone()
            .unwrap_or_else(|| pipes[0].name().to_string());

        let pipes: Vec<Arc<ConfiguredPipe>> = pipes.into_iter().map(Arc::new).collect();
        let pipes_by_name: HashMap<String, Arc<ConfiguredPipe>> = pipes
            .iter()
            .map(|p| (p.name().to_string(), p.clone()))
            .collect();
        let first_pipe = pipes_by_name.get(&first_name).cloned().ok_or_else(|| {
            ConfigurationError::new(format!("no pipe found for firstPipe [{}]", first_name))
        })?;

        let input_wrapper =
            self.configure_special(&self.input_wrapper, INPUT_WRAPPER_NAME, &first_name)?;
        let input_validator =
            self.configure_special(&self.input_validator, INPUT_VALIDATOR_NAME, &first_name)?;
        let output_validator =
            self.configure_special(&self.output_validator, OUTPUT_VALIDATOR_NAME, &success_exit)?;
        let output_wrapper =
            self.configure_special(&self.output_wrapper, OUTPUT_WRAPPER_NAME, &success_exit)?;

        if let Some(locker) = &self.locker {
            locker.configure()?;
        }
        if let Some(cache) = &self.cache {
            cache.configure()?;
        }

        let mut graph = Graph {
            pipes,
            pipes_by_name,
            exits,
            exits_by_path,
            first_pipe,
            input_wrapper,
            input_validator,
            output_validator,
            output_wrapper,
            consumed_multiple_times: false,
            warnings,
        };
        let consumed_multiple_times = graph
            .pipes
            .iter()
            .chain(graph.special_pipes())
            .any(|p| p.pipe().consumes_session_variable(ORIGINAL_MESSAGE_KEY));
        graph.consumed_multiple_times = consumed_multiple_times;

        for warning in &graph.warnings {
            warn!(owner = %self.owner, "{}", warning);
        }
        info!(
            owner = %self.owner,
            pipes = graph.pipes.len(),
            exits = graph.exits.len(),
            first_pipe = %graph.first_pipe.name(),
            buffer_input = graph.consumed_multiple_times,
            "PipeLine configured"
        );

        let mut slot = self.graph.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(graph));
        Ok(())
    }

    fn merge_global_forwards(&self, pipe: &mut ConfiguredPipe) {
        for forward in &self.global_forwards {
            pipe.forwards
                .entry(forward.name().to_string())
                .or_insert_with(|| forward.clone());
        }
    }

    fn configure_special(
        &self,
        definition: &Option<PipeDefinition>,
        name: &str,
        success_path: &str,
    ) -> Result<Option<Arc<ConfiguredPipe>>, ConfigurationError> {
        let Some(definition) = definition else {
            return Ok(None);
        };
        definition.pipe().configure().map_err(|e| {
            ConfigurationError::with_source(format!("{} could not be configured", name), e)
        })?;
        let mut configured = ConfiguredPipe::new(name.to_string(), definition);
        configured
            .forwards
            .entry(SUCCESS_FORWARD_NAME.to_string())
            .or_insert_with(|| PipeForward::new(SUCCESS_FORWARD_NAME, success_path));
        self.merge_global_forwards(&mut configured);
        Ok(Some(Arc::new(configured)))
    }

    pub(crate) fn graph(&self) -> Result<Arc<Graph>, PipeRunError> {
        let slot = self.graph.read().unwrap_or_else(|e| e.into_inner());
        slot.clone().ok_or_else(|| {
            PipeRunError::pipeline(format!("{} is not configured", self.owner), None)
        })
    }

    /// Whether [`configure`](Self::configure) succeeded.
    pub fn is_configured(&self) -> bool {
        self.graph.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Name used in log and error messages.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Configured pipes in registration order.
    pub fn pipes(&self) -> Vec<Arc<ConfiguredPipe>> {
        self.graph().map(|g| g.pipes.clone()).unwrap_or_default()
    }

    /// A configured pipe by name.
    pub fn pipe(&self, name: &str) -> Option<Arc<ConfiguredPipe>> {
        self.graph().ok()?.pipes_by_name.get(name).cloned()
    }

    /// Configured exits, including the synthesized `READY` exit.
    pub fn exits(&self) -> Vec<PipeLineExit> {
        self.graph().map(|g| g.exits.clone()).unwrap_or_default()
    }

    /// Name of the pipe each run starts with.
    pub fn first_pipe(&self) -> Option<String> {
        self.graph().ok().map(|g| g.first_pipe.name().to_string())
    }

    /// Warnings raised by the last configure.
    pub fn configuration_warnings(&self) -> Vec<String> {
        self.graph().map(|g| g.warnings.clone()).unwrap_or_default()
    }

    /// Whether the input is buffered because it is read more than once.
    pub fn is_input_buffered(&self) -> bool {
        self.graph().is_ok_and(|g| g.consumed_multiple_times)
    }

    /// Sensitive-data masks declared by the pipes.
    pub fn hide_regexes(&self) -> Vec<String> {
        self.definitions
            .iter()
            .chain(self.special_definitions())
            .filter_map(|d| d.pipe().hide_regex())
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn special_definitions(&self) -> impl Iterator<Item = &PipeDefinition> {
        [
            &self.input_wrapper,
            &self.input_validator,
            &self.output_validator,
            &self.output_wrapper,
        ]
        .into_iter()
        .flatten()
    }

    /// The pipeline transaction boundary.
    pub fn transaction_definition(&self) -> &TransactionDefinition {
        &self.transaction
    }

    /// The transaction manager.
    pub fn transaction_manager(&self) -> &Arc<dyn TransactionManager> {
        &self.transaction_manager
    }

    /// The locker, if any.
    pub fn locker(&self) -> Option<&Arc<dyn Locker>> {
        self.locker.as_ref()
    }

    /// The result cache, if any.
    pub fn cache(&self) -> Option<&Arc<dyn ResultCache>> {
        self.cache.as_ref()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Resolve a forward of `pipe_name` to an exit or a pipe.
    ///
    /// Fails when the forward is absent, has an empty path, or names
    /// neither an exit nor a pipe. Exits win over pipes of the same name.
    pub fn resolve_forward(
        &self,
        pipe_name: &str,
        forward: Option<&PipeForward>,
    ) -> Result<ForwardTarget, PipeRunError> {
        self.graph()?.resolve(pipe_name, forward)
    }

    /// Run a message through the pipeline.
    ///
    /// An empty input is replaced by the transform-null-message text when
    /// one is set; otherwise an input read more than once is buffered. The
    /// input is stored in the session under `originalMessage`.
    pub async fn process(
        &self,
        message_id: &str,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeLineResult, PipeRunError> {
        let graph = self.graph()?;
        let mut message = message;
        if message.is_empty()
            && let Some(text) = &self.transform_null_message
        {
            debug!(owner = %self.owner, message_id = %message_id, "Replacing empty input");
            message = Message::text(text.as_str());
        } else if graph.consumed_multiple_times {
            message.preserve().map_err(|e| {
                PipeRunError::pipeline("could not preserve input message", Some(Box::new(e)))
            })?;
        }
        session.put(ORIGINAL_MESSAGE_KEY, message.clone());
        self.pipeline_processor
            .process_pipeline(self, message_id, message, session)
            .await
    }

    /// Run one hop through the pipe processor chain.
    pub async fn run_pipe(
        &self,
        pipe: &ConfiguredPipe,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<PipeRunResult, PipeRunError> {
        self.pipe_processor
            .process_pipe(self, pipe, message, session)
            .await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the cache, validators, wrappers and pipes, in that order.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let graph = self
            .graph()
            .map_err(|e| LifecycleError::with_source(&self.owner, "cannot start", e))?;
        if let Some(cache) = &self.cache {
            cache.open().await?;
        }
        for pipe in self.lifecycle_order(&graph) {
            debug!(owner = %self.owner, pipe = %pipe.name(), "Starting pipe");
            pipe.pipe().start().await.map_err(|e| {
                LifecycleError::with_source(
                    &self.owner,
                    format!("could not start pipe [{}]", pipe.name()),
                    e,
                )
            })?;
        }
        info!(owner = %self.owner, "PipeLine started");
        Ok(())
    }

    /// Stop validators, wrappers and pipes in start order, then close the cache.
    pub async fn stop(&self) {
        if let Ok(graph) = self.graph() {
            for pipe in self.lifecycle_order(&graph) {
                debug!(owner = %self.owner, pipe = %pipe.name(), "Stopping pipe");
                pipe.pipe().stop().await;
            }
        }
        if let Some(cache) = &self.cache {
            cache.close().await;
        }
        info!(owner = %self.owner, "PipeLine stopped");
    }

    fn lifecycle_order(&self, graph: &Graph) -> Vec<Arc<ConfiguredPipe>> {
        graph
            .special_pipes()
            .chain(graph.pipes.iter())
            .cloned()
            .collect()
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub(crate) fn record_duration(&self, pipe: &str, elapsed: Duration) {
        self.durations
            .entry(pipe.to_string())
            .or_insert_with(|| StatisticsKeeper::new("duration"))
            .add_value(elapsed.as_millis() as u64);
    }

    pub(crate) fn record_wait(&self, pipe: &str, elapsed: Duration) {
        self.waits
            .entry(pipe.to_string())
            .or_insert_with(|| StatisticsKeeper::new("wait"))
            .add_value(elapsed.as_millis() as u64);
    }

    pub(crate) fn record_size(&self, pipe: &str, size: usize) {
        self.sizes
            .entry(pipe.to_string())
            .or_insert_with(|| StatisticsKeeper::new("size"))
            .add_value(size as u64);
    }

    /// Duration statistics of a pipe.
    pub fn pipe_duration(&self, pipe: &str) -> Option<StatisticsKeeper> {
        self.durations.get(pipe).map(|k| k.clone())
    }

    /// Concurrency-wait statistics of a pipe.
    pub fn pipe_wait(&self, pipe: &str) -> Option<StatisticsKeeper> {
        self.waits.get(pipe).map(|k| k.clone())
    }

    /// Export per-pipe statistics.
    pub fn iterate_statistics(
        &self,
        handler: &mut dyn StatisticsIterationHandler,
        action: StatisticsAction,
    ) {
        handler.open_group("pipeStatistics", "pipes");
        let names: Vec<String> = match self.graph() {
            Ok(graph) => self
                .lifecycle_order(&graph)
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
            Err(_) => Vec::new(),
        };
        for name in &names {
            handler.open_group(name, "pipe");
            for map in [&self.durations, &self.waits, &self.sizes] {
                if let Some(mut keeper) = map.get_mut(name) {
                    handler.handle_statistics_keeper(&keeper);
                    match action {
                        StatisticsAction::Reset => keeper.reset(),
                        StatisticsAction::MarkFull => keeper.mark(),
                        StatisticsAction::Summary | StatisticsAction::Full => {}
                    }
                }
            }
            if let Some(pipe) = self.pipe(name)
                && let Some(available) = pipe.available_permits()
            {
                handler.handle_scalar("maxThreads", ScalarValue::Integer(pipe.max_threads() as i64));
                handler.handle_scalar("availableThreads", ScalarValue::Integer(available as i64));
            }
            handler.close_group();
        }
        handler.close_group();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Pipe for Named {
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

    fn pipeline_of(names: &[&'static str]) -> PipeLine {
        let mut pipeline = PipeLine::new();
        for name in names {
            pipeline.add_pipe(PipeDefinition::new(Named(name))).unwrap();
        }
        pipeline
    }

    #[test]
    fn test_empty_pipeline_fails() {
        let err = PipeLine::new().configure().unwrap_err();
        assert_eq!(err.to_string(), "no Pipes in PipeLine");
    }

    #[test]
    fn test_duplicate_pipe_rejected() {
        let mut pipeline = pipeline_of(&["A"]);
        let err = pipeline.add_pipe(PipeDefinition::new(Named("A"))).unwrap_err();
        assert!(err.to_string().contains("defined more then once"));
        assert!(pipeline.add_pipe(PipeDefinition::new(Named(""))).is_err());
    }

    #[test]
    fn test_unknown_first_pipe_fails() {
        let mut pipeline = pipeline_of(&["A"]);
        pipeline.set_first_pipe("Z");
        let err = pipeline.configure().unwrap_err();
        assert_eq!(err.to_string(), "no pipe found for firstPipe [Z]");
    }

    #[test]
    fn test_success_forwards_are_wired() {
        let pipeline = pipeline_of(&["A", "B"]);
        pipeline.configure().unwrap();

        assert_eq!(pipeline.exits(), vec![PipeLineExit::ready()]);
        let a = pipeline.pipe("A").unwrap();
        assert_eq!(a.forward(SUCCESS_FORWARD_NAME).unwrap().path(), "B");
        let b = pipeline.pipe("B").unwrap();
        assert_eq!(b.forward(SUCCESS_FORWARD_NAME).unwrap().path(), "READY");
        assert!(pipeline.configuration_warnings().is_empty());
    }

    #[test]
    fn test_last_pipe_wires_to_first_success_exit() {
        let mut pipeline = pipeline_of(&["A"]);
        pipeline.add_exit(PipeLineExit::new("FAILED", ExitState::Error).with_exit_code(500));
        pipeline.add_exit(PipeLineExit::new("OK", ExitState::Success).with_exit_code(200));
        pipeline.configure().unwrap();

        let a = pipeline.pipe("A").unwrap();
        assert_eq!(a.forward(SUCCESS_FORWARD_NAME).unwrap().path(), "OK");
    }

    #[test]
    fn test_global_forwards_and_warnings() {
        let mut pipeline = PipeLine::new();
        pipeline
            .add_pipe(PipeDefinition::new(Named("A")).with_forward("failure", "Nowhere"))
            .unwrap();
        pipeline.add_global_forward("exception", "READY");
        pipeline.add_exit(PipeLineExit::ready());
        pipeline.add_exit(PipeLineExit::new("READY", ExitState::Success));
        pipeline.configure().unwrap();

        let a = pipeline.pipe("A").unwrap();
        assert_eq!(a.forward("exception").unwrap().path(), "READY");
        let warnings = pipeline.configuration_warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("[Nowhere]")));
        assert!(warnings.iter().any(|w| w.contains("more than once")));
    }

    #[test]
    fn test_resolve_forward() {
        let mut pipeline = pipeline_of(&["A", "B"]);
        pipeline.add_exit(PipeLineExit::ready());
        pipeline.configure().unwrap();

        let empty = PipeForward::new("success", "");
        let err = pipeline.resolve_forward("A", Some(&empty)).unwrap_err();
        assert!(err.to_string().contains("zero-length"));

        let to_pipe = PipeForward::new("success", "B");
        assert!(matches!(
            pipeline.resolve_forward("A", Some(&to_pipe)).unwrap(),
            ForwardTarget::Pipe(p) if p.name() == "B"
        ));

        let to_exit = PipeForward::new("success", "READY");
        assert!(matches!(
            pipeline.resolve_forward("B", Some(&to_exit)).unwrap(),
            ForwardTarget::Exit(e) if e.state() == ExitState::Success
        ));

        let unknown = PipeForward::new("success", "C");
        let err = pipeline.resolve_forward("B", Some(&unknown)).unwrap_err();
        assert!(err.to_string().contains("is not defined as a Pipe or an Exit"));

        assert!(pipeline.resolve_forward("B", None).is_err());
    }

    #[test]
    fn test_max_threads_creates_limiter() {
        let mut pipeline = PipeLine::new();
        pipeline
            .add_pipe(PipeDefinition::new(Named("A")).with_max_threads(2))
            .unwrap();
        pipeline.configure().unwrap();
        assert_eq!(pipeline.pipe("A").unwrap().available_permits(), Some(2));
    }
}
