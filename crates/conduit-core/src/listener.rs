// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message sources and reply channels used by receivers.
//!
//! A [`Listener`] produces raw messages of a transport-specific type `M`.
//! Optional capabilities are discovered through the `as_*` methods rather
//! than through a type hierarchy:
//!
//! - [`PullingListener`]: the receiver polls it for the next message.
//! - [`HasProcessState`]: the listener tracks each message's
//!   [`ProcessState`] itself and can move it between states.
//!
//! [`StorageListener`] is a pulling, process-state listener over one
//! [`MessageStorage`] slot per state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::error::{ConfigurationError, ListenerError, SenderError};
use crate::message::Message;
use crate::process_state::{self, ProcessState};
use crate::result::PipeLineResult;
use crate::session::PipeLineSession;
use crate::storage::{BrowseFilter, MessageStorage, StoredMessage};
use crate::transaction::{self, TransactionOutcome, TransactionSynchronization};

// ============================================================================
// Raw messages
// ============================================================================

/// A transport message together with the ids the transport supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage<M> {
    id: Option<String>,
    correlation_id: Option<String>,
    payload: M,
}

impl<M> RawMessage<M> {
    /// Wrap a payload without ids.
    pub fn new(payload: M) -> Self {
        Self {
            id: None,
            correlation_id: None,
            payload,
        }
    }

    /// Set the message id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into()).filter(|id: &String| !id.is_empty());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into()).filter(|id: &String| !id.is_empty());
        self
    }

    /// Message id, when the transport supplied one.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Correlation id, when the transport supplied one.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The transport payload.
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// Take the transport payload.
    pub fn into_payload(self) -> M {
        self.payload
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A source of raw messages.
#[async_trait]
pub trait Listener<M: Send + Sync + 'static>: Send + Sync {
    /// Name used in log and error messages.
    fn name(&self) -> &str;

    /// Validate settings.
    fn configure(&self) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Acquire transport resources.
    async fn open(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Release transport resources.
    async fn close(&self) {}

    /// Convert a raw message into the pipeline input.
    fn extract_message(&self, raw: &RawMessage<M>) -> Result<Message, ListenerError>;

    /// Called once per message after processing, before the transaction completes.
    async fn after_message_processed(
        &self,
        _result: &PipeLineResult,
        _raw: &RawMessage<M>,
        _session: &PipeLineSession,
    ) -> Result<(), ListenerError> {
        Ok(())
    }

    /// This listener as a pulling listener, if it is one.
    fn as_pulling(&self) -> Option<&dyn PullingListener<M>> {
        None
    }

    /// This listener as a process-state listener, if it is one.
    fn as_process_state(&self) -> Option<&dyn HasProcessState<M>> {
        None
    }
}

/// A listener the receiver polls.
#[async_trait]
pub trait PullingListener<M: Send + Sync + 'static>: Listener<M> {
    /// Fetch the next message, `None` when nothing is waiting.
    ///
    /// Called inside the receiver's transaction, so a pick-up can be
    /// undone when that transaction rolls back.
    async fn get_raw_message(&self) -> Result<Option<RawMessage<M>>, ListenerError>;
}

/// A listener that keeps each message's [`ProcessState`] itself.
#[async_trait]
pub trait HasProcessState<M: Send + Sync + 'static>: Send + Sync {
    /// The states this listener can hold messages in.
    fn known_process_states(&self) -> BTreeSet<ProcessState>;

    /// Legal moves between the known states.
    fn target_process_states(&self) -> BTreeMap<ProcessState, BTreeSet<ProcessState>> {
        process_state::target_process_states(&self.known_process_states())
    }

    /// Move a message to `to`.
    ///
    /// Returns the moved message, or `None` when the message was not found
    /// or the move is not legal; the message then stays where it was.
    async fn change_process_state(
        &self,
        raw: &RawMessage<M>,
        to: ProcessState,
        reason: Option<&str>,
    ) -> Result<Option<RawMessage<M>>, ListenerError>;

    /// Browser over the messages in `state`.
    fn message_browser(&self, _state: ProcessState) -> Option<Arc<dyn MessageStorage>> {
        None
    }
}

/// Outbound channel a receiver hands each result to.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Name used in log and error messages.
    fn name(&self) -> &str;

    /// Acquire resources.
    async fn open(&self) -> Result<(), SenderError> {
        Ok(())
    }

    /// Release resources.
    async fn close(&self) {}

    /// Send `message`, returning the reply.
    async fn send_message(
        &self,
        message: Message,
        session: &mut PipeLineSession,
    ) -> Result<Message, SenderError>;
}

// ============================================================================
// Storage listener
// ============================================================================

/// Pulling listener over one storage slot per process state.
///
/// An AVAILABLE slot is mandatory. Picking a message up moves it to the
/// INPROCESS slot (or removes it when there is none). When the pick-up
/// happened inside a transaction that later rolls back, the message
/// returns to AVAILABLE.
pub struct StorageListener {
    name: String,
    slots: BTreeMap<ProcessState, Arc<dyn MessageStorage>>,
}

impl std::fmt::Debug for StorageListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageListener")
            .field("name", &self.name)
            .field("states", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StorageListener {
    /// Create a listener reading from `available`.
    pub fn new(name: impl Into<String>, available: Arc<dyn MessageStorage>) -> Self {
        let mut slots = BTreeMap::new();
        slots.insert(ProcessState::Available, available);
        Self {
            name: name.into(),
            slots,
        }
    }

    /// Add the slot for `state`.
    pub fn with_slot(mut self, state: ProcessState, storage: Arc<dyn MessageStorage>) -> Self {
        self.slots.insert(state, storage);
        self
    }

    /// The slot for `state`, if configured.
    pub fn slot(&self, state: ProcessState) -> Option<&Arc<dyn MessageStorage>> {
        self.slots.get(&state)
    }

    /// Locate the state a stored message is currently in.
    pub async fn locate(&self, storage_key: &str) -> Result<Option<ProcessState>, ListenerError> {
        for (state, storage) in &self.slots {
            if storage.get_message(storage_key).await.map_err(storage_error)?.is_some() {
                return Ok(Some(*state));
            }
        }
        Ok(None)
    }

    fn rollback_restorer(&self, message: StoredMessage) -> Arc<dyn TransactionSynchronization> {
        Arc::new(RestoreOnRollback {
            listener: self.name.clone(),
            slots: self.slots.clone(),
            message,
        })
    }
}

fn storage_error(e: crate::error::StorageError) -> ListenerError {
    ListenerError::with_source("storage failure", e)
}

/// Returns a picked-up message to AVAILABLE when its transaction rolls back.
struct RestoreOnRollback {
    listener: String,
    slots: BTreeMap<ProcessState, Arc<dyn MessageStorage>>,
    message: StoredMessage,
}

#[async_trait]
impl TransactionSynchronization for RestoreOnRollback {
    async fn after_completion(&self, outcome: TransactionOutcome) {
        if outcome != TransactionOutcome::RolledBack {
            return;
        }
        for (state, storage) in &self.slots {
            if *state == ProcessState::Available {
                continue;
            }
            if let Err(e) = storage.delete_message(&self.message.storage_key).await {
                warn!(listener = %self.listener, state = %state, error = %e, "Could not remove message while rolling back");
            }
        }
        let Some(available) = self.slots.get(&ProcessState::Available) else {
            return;
        };
        match available.store_message(&self.message).await {
            Ok(_) => info!(
                listener = %self.listener,
                message_id = %self.message.message_id,
                "Transaction rolled back, message returned to Available"
            ),
            Err(e) => warn!(
                listener = %self.listener,
                message_id = %self.message.message_id,
                error = %e,
                "Could not return message to Available"
            ),
        }
    }
}

#[async_trait]
impl Listener<StoredMessage> for StorageListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self) -> Result<(), ConfigurationError> {
        for (state, storage) in &self.slots {
            let shared = self
                .slots
                .iter()
                .any(|(other, s)| other != state && Arc::ptr_eq(s, storage));
            if shared {
                return Err(ConfigurationError::new(format!(
                    "listener [{}] uses the same storage for more than one state",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn extract_message(&self, raw: &RawMessage<StoredMessage>) -> Result<Message, ListenerError> {
        Ok(raw.payload().to_message())
    }

    async fn after_message_processed(
        &self,
        _result: &PipeLineResult,
        raw: &RawMessage<StoredMessage>,
        _session: &PipeLineSession,
    ) -> Result<(), ListenerError> {
        // A message still INPROCESS had no legal target; finish it here.
        if let Some(in_process) = self.slots.get(&ProcessState::InProcess)
            && in_process
                .delete_message(&raw.payload().storage_key)
                .await
                .map_err(storage_error)?
        {
            debug!(listener = %self.name, key = %raw.payload().storage_key, "Removed processed message from InProcess");
        }
        Ok(())
    }

    fn as_pulling(&self) -> Option<&dyn PullingListener<StoredMessage>> {
        Some(self)
    }

    fn as_process_state(&self) -> Option<&dyn HasProcessState<StoredMessage>> {
        Some(self)
    }
}

#[async_trait]
impl PullingListener<StoredMessage> for StorageListener {
    async fn get_raw_message(&self) -> Result<Option<RawMessage<StoredMessage>>, ListenerError> {
        let Some(available) = self.slots.get(&ProcessState::Available) else {
            return Ok(None);
        };
        let message = loop {
            let Some(candidate) = available
                .browse(&BrowseFilter::oldest(1))
                .await
                .map_err(storage_error)?
                .into_iter()
                .next()
            else {
                return Ok(None);
            };
            // Whoever deletes the entry from AVAILABLE owns it.
            if available
                .delete_message(&candidate.storage_key)
                .await
                .map_err(storage_error)?
            {
                break candidate;
            }
            trace!(listener = %self.name, key = %candidate.storage_key, "Message claimed by another poller");
        };

        if let Some(in_process) = self.slots.get(&ProcessState::InProcess)
            && let Err(e) = in_process.store_message(&message).await
        {
            if let Err(restore) = available.store_message(&message).await {
                warn!(listener = %self.name, key = %message.storage_key, error = %restore, "Could not return message to Available");
            }
            return Err(storage_error(e));
        }

        if let Some(tx) = transaction::current().filter(|tx| !tx.is_completed()) {
            tx.register_synchronization(self.rollback_restorer(message.clone()));
        }
        debug!(listener = %self.name, message_id = %message.message_id, "Picked up message");

        let mut raw = RawMessage::new(message.clone()).with_id(message.message_id.clone());
        if let Some(cid) = &message.correlation_id {
            raw = raw.with_correlation_id(cid.clone());
        }
        Ok(Some(raw))
    }
}

#[async_trait]
impl HasProcessState<StoredMessage> for StorageListener {
    fn known_process_states(&self) -> BTreeSet<ProcessState> {
        self.slots.keys().copied().collect()
    }

    async fn change_process_state(
        &self,
        raw: &RawMessage<StoredMessage>,
        to: ProcessState,
        reason: Option<&str>,
    ) -> Result<Option<RawMessage<StoredMessage>>, ListenerError> {
        let key = &raw.payload().storage_key;
        let Some(from) = self.locate(key).await? else {
            warn!(listener = %self.name, key = %key, "Message not found, cannot change process state");
            return Ok(None);
        };
        if !process_state::is_legal_transition(&self.target_process_states(), from, to) {
            warn!(
                listener = %self.name,
                key = %key,
                from = %from,
                to = %to,
                "Illegal process state change requested"
            );
            return Ok(None);
        }
        let (Some(source), Some(target)) = (self.slots.get(&from), self.slots.get(&to)) else {
            return Ok(None);
        };

        let Some(mut stored) = source.get_message(key).await.map_err(storage_error)? else {
            return Ok(None);
        };
        if let Some(reason) = reason {
            stored = stored.with_comments(reason);
        }
        target.store_message(&stored).await.map_err(storage_error)?;
        source.delete_message(key).await.map_err(storage_error)?;
        debug!(listener = %self.name, key = %key, from = %from, to = %to, "Changed process state");

        let mut moved = RawMessage::new(stored.clone()).with_id(stored.message_id.clone());
        if let Some(cid) = &stored.correlation_id {
            moved = moved.with_correlation_id(cid.clone());
        }
        Ok(Some(moved))
    }

    fn message_browser(&self, state: ProcessState) -> Option<Arc<dyn MessageStorage>> {
        self.slots.get(&state).cloned()
    }
}
