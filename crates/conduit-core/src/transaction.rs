// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction boundaries.
//!
//! Pipelines, pipes and receivers each declare a [`TransactionAttribute`].
//! Before running, they open a [`Transaction`], which asks the
//! [`TransactionManager`] to start, join, suspend or reject a transaction
//! depending on whether one is active in the current task.
//!
//! The active transaction is carried in a task-local slot that
//! [`Transaction::scope`] sets for the duration of a future. Only the
//! creator of a transaction finalizes it: [`Transaction::complete`] on a
//! joined transaction leaves the outcome to whoever created it, so a
//! participant can only vote by marking it rollback-only.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::TransactionError;

tokio::task_local! {
    static CURRENT_TRANSACTION: Option<Arc<TransactionState>>;
}

/// The transaction active in the current task, if any.
pub fn current() -> Option<Arc<TransactionState>> {
    CURRENT_TRANSACTION.try_with(|tx| tx.clone()).ok().flatten()
}

/// Whether a transaction is active in the current task.
pub fn is_transaction_active() -> bool {
    current().is_some_and(|tx| !tx.is_completed())
}

// ============================================================================
// Definitions
// ============================================================================

/// Transaction propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionAttribute {
    /// Join the active transaction or start one.
    Required,
    /// Always start a new transaction, suspending the active one.
    RequiresNew,
    /// Join the active transaction; fail without one.
    Mandatory,
    /// Run outside any transaction, suspending the active one.
    NotSupported,
    /// Join the active transaction if there is one.
    #[default]
    Supports,
    /// Run outside any transaction; fail if one is active.
    Never,
}

impl TransactionAttribute {
    /// Whether this attribute guarantees a transaction while running.
    pub fn is_transacted(&self) -> bool {
        matches!(self, Self::Required | Self::RequiresNew | Self::Mandatory)
    }

    /// Upper-case name of this attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "REQUIRED",
            Self::RequiresNew => "REQUIRESNEW",
            Self::Mandatory => "MANDATORY",
            Self::NotSupported => "NOTSUPPORTED",
            Self::Supports => "SUPPORTS",
            Self::Never => "NEVER",
        }
    }
}

impl fmt::Display for TransactionAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionAttribute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace(['_', ' '], "").as_str() {
            "REQUIRED" => Ok(Self::Required),
            "REQUIRESNEW" => Ok(Self::RequiresNew),
            "MANDATORY" => Ok(Self::Mandatory),
            "NOTSUPPORTED" => Ok(Self::NotSupported),
            "SUPPORTS" => Ok(Self::Supports),
            "NEVER" => Ok(Self::Never),
            other => Err(format!("unknown transaction attribute [{}]", other)),
        }
    }
}

/// Propagation policy plus an optional timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionDefinition {
    attribute: TransactionAttribute,
    timeout: Option<Duration>,
}

impl TransactionDefinition {
    /// Create a definition without a timeout.
    pub fn new(attribute: TransactionAttribute) -> Self {
        Self {
            attribute,
            timeout: None,
        }
    }

    /// Set the timeout applied to transactions started under this definition.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The propagation policy.
    pub fn attribute(&self) -> TransactionAttribute {
        self.attribute
    }

    /// The timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

// ============================================================================
// Transaction state
// ============================================================================

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

/// Callback invoked when a transaction finishes.
///
/// Resources that are not transactional themselves use this to undo or
/// confirm work they did inside the transaction.
#[async_trait]
pub trait TransactionSynchronization: Send + Sync {
    /// Called once, after commit or rollback.
    async fn after_completion(&self, outcome: TransactionOutcome);
}

/// Shared state of one physical transaction.
pub struct TransactionState {
    id: Uuid,
    name: String,
    rollback_only: AtomicBool,
    completed: AtomicBool,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    synchronizations: Mutex<Vec<Arc<dyn TransactionSynchronization>>>,
}

impl fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("rollback_only", &self.is_rollback_only())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl TransactionState {
    fn new(name: String, timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            rollback_only: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    /// Unique id of this transaction.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name given by the creator.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark this transaction so that its creator rolls it back.
    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    /// Whether the transaction will be rolled back.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// Whether commit or rollback already happened.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Whether the timeout has been exceeded.
    pub fn is_timed_out(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Register a callback run after this transaction completes.
    pub fn register_synchronization(&self, synchronization: Arc<dyn TransactionSynchronization>) {
        let mut syncs = self
            .synchronizations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        syncs.push(synchronization);
    }

    fn mark_completed(&self) -> Result<(), TransactionError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(TransactionError::AlreadyCompleted {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn run_synchronizations(&self, outcome: TransactionOutcome) {
        let syncs = {
            let mut guard = self
                .synchronizations
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for sync in syncs {
            sync.after_completion(outcome).await;
        }
    }
}

/// What [`TransactionManager::get_transaction`] decided.
#[derive(Debug)]
pub struct TransactionStatus {
    transaction: Option<Arc<TransactionState>>,
    new_transaction: bool,
    suspended: Option<Arc<TransactionState>>,
    local_rollback_only: AtomicBool,
}

impl TransactionStatus {
    /// Status for a transaction created by the caller.
    pub fn created(
        transaction: Arc<TransactionState>,
        suspended: Option<Arc<TransactionState>>,
    ) -> Self {
        Self {
            transaction: Some(transaction),
            new_transaction: true,
            suspended,
            local_rollback_only: AtomicBool::new(false),
        }
    }

    /// Status for a caller participating in an existing transaction.
    pub fn joined(transaction: Arc<TransactionState>) -> Self {
        Self {
            transaction: Some(transaction),
            new_transaction: false,
            suspended: None,
            local_rollback_only: AtomicBool::new(false),
        }
    }

    /// Status for running without a transaction.
    pub fn without_transaction(suspended: Option<Arc<TransactionState>>) -> Self {
        Self {
            transaction: None,
            new_transaction: false,
            suspended,
            local_rollback_only: AtomicBool::new(false),
        }
    }

    /// The transaction in effect, if any.
    pub fn transaction(&self) -> Option<&Arc<TransactionState>> {
        self.transaction.as_ref()
    }

    /// Whether the caller created the transaction in effect.
    pub fn is_new_transaction(&self) -> bool {
        self.new_transaction
    }

    /// The transaction suspended for the duration of this one.
    pub fn suspended(&self) -> Option<&Arc<TransactionState>> {
        self.suspended.as_ref()
    }

    /// Mark for rollback. Without a transaction the mark stays local.
    pub fn set_rollback_only(&self) {
        match &self.transaction {
            Some(tx) => tx.set_rollback_only(),
            None => self.local_rollback_only.store(true, Ordering::SeqCst),
        }
    }

    /// Whether the transaction in effect (or this status) is marked for rollback.
    pub fn is_rollback_only(&self) -> bool {
        match &self.transaction {
            Some(tx) => tx.is_rollback_only(),
            None => self.local_rollback_only.load(Ordering::SeqCst),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Platform transaction manager.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Start, join, suspend or reject according to `definition` and the
    /// transaction active in the current task.
    async fn get_transaction(
        &self,
        definition: &TransactionDefinition,
        name: &str,
    ) -> Result<TransactionStatus, TransactionError>;

    /// Commit a transaction created through `status`; rolls back instead
    /// when it is marked rollback-only or timed out.
    async fn commit(&self, status: &TransactionStatus) -> Result<(), TransactionError>;

    /// Roll back a transaction created through `status`, or mark a joined
    /// one rollback-only.
    async fn rollback(&self, status: &TransactionStatus) -> Result<(), TransactionError>;
}

/// In-process transaction manager.
///
/// Coordinates transaction boundaries and synchronizations for resources
/// that enlist through [`TransactionSynchronization`].
#[derive(Debug, Default, Clone)]
pub struct LocalTransactionManager {
    default_timeout: Option<Duration>,
}

impl LocalTransactionManager {
    /// Create a manager without a default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `timeout` to transactions whose definition has none.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn start(&self, definition: &TransactionDefinition, name: &str) -> Arc<TransactionState> {
        let timeout = definition.timeout().or(self.default_timeout);
        let tx = Arc::new(TransactionState::new(name.to_string(), timeout));
        debug!(transaction = %tx.id(), name = %name, "Started transaction");
        tx
    }
}

#[async_trait]
impl TransactionManager for LocalTransactionManager {
    async fn get_transaction(
        &self,
        definition: &TransactionDefinition,
        name: &str,
    ) -> Result<TransactionStatus, TransactionError> {
        let existing = current().filter(|tx| !tx.is_completed());
        let status = match (definition.attribute(), existing) {
            (
                TransactionAttribute::Required
                | TransactionAttribute::Mandatory
                | TransactionAttribute::Supports,
                Some(tx),
            ) => {
                trace!(transaction = %tx.id(), name = %name, "Joining existing transaction");
                TransactionStatus::joined(tx)
            }
            (TransactionAttribute::Required | TransactionAttribute::RequiresNew, None) => {
                TransactionStatus::created(self.start(definition, name), None)
            }
            (TransactionAttribute::RequiresNew, Some(parent)) => {
                debug!(suspended = %parent.id(), name = %name, "Suspending transaction");
                TransactionStatus::created(self.start(definition, name), Some(parent))
            }
            (TransactionAttribute::Mandatory, None) => {
                return Err(TransactionError::NoExistingTransaction);
            }
            (TransactionAttribute::NotSupported, Some(parent)) => {
                debug!(suspended = %parent.id(), name = %name, "Suspending transaction");
                TransactionStatus::without_transaction(Some(parent))
            }
            (TransactionAttribute::Never, Some(_)) => {
                return Err(TransactionError::ExistingTransaction);
            }
            (
                TransactionAttribute::NotSupported
                | TransactionAttribute::Supports
                | TransactionAttribute::Never,
                None,
            ) => TransactionStatus::without_transaction(None),
        };
        Ok(status)
    }

    async fn commit(&self, status: &TransactionStatus) -> Result<(), TransactionError> {
        let Some(tx) = status.transaction().filter(|_| status.is_new_transaction()) else {
            return Ok(());
        };
        if tx.is_timed_out() {
            tx.mark_completed()?;
            warn!(transaction = %tx.id(), name = %tx.name(), "Transaction timed out, rolling back");
            tx.run_synchronizations(TransactionOutcome::RolledBack).await;
            return Err(TransactionError::TimedOut {
                name: tx.name().to_string(),
                timeout_secs: tx.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            });
        }
        if tx.is_rollback_only() {
            return self.rollback(status).await;
        }
        tx.mark_completed()?;
        debug!(transaction = %tx.id(), name = %tx.name(), "Committed transaction");
        tx.run_synchronizations(TransactionOutcome::Committed).await;
        Ok(())
    }

    async fn rollback(&self, status: &TransactionStatus) -> Result<(), TransactionError> {
        let Some(tx) = status.transaction() else {
            return Ok(());
        };
        if !status.is_new_transaction() {
            tx.set_rollback_only();
            return Ok(());
        }
        tx.mark_completed()?;
        debug!(transaction = %tx.id(), name = %tx.name(), "Rolled back transaction");
        tx.run_synchronizations(TransactionOutcome::RolledBack).await;
        Ok(())
    }
}

// ============================================================================
// Wrapper
// ============================================================================

/// One participant's view of a transaction boundary.
///
/// Records whether the participant created the transaction or joined one,
/// and finalizes only what it created.
pub struct Transaction {
    manager: Arc<dyn TransactionManager>,
    status: TransactionStatus,
    description: String,
    completed: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("description", &self.description)
            .field("status", &self.status)
            .field("completed", &self.completed)
            .finish()
    }
}

impl Transaction {
    /// Open a boundary according to `definition`.
    pub async fn begin(
        manager: Arc<dyn TransactionManager>,
        definition: &TransactionDefinition,
        description: impl Into<String>,
    ) -> Result<Self, TransactionError> {
        let description = description.into();
        let was_active = is_transaction_active();
        let status = manager.get_transaction(definition, &description).await?;
        trace!(
            description = %description,
            attribute = %definition.attribute(),
            was_active,
            new_transaction = status.is_new_transaction(),
            "Opened transaction boundary"
        );
        Ok(Self {
            manager,
            status,
            description,
            completed: false,
        })
    }

    /// Whether this participant created the transaction.
    pub fn is_new(&self) -> bool {
        self.status.is_new_transaction()
    }

    /// The transaction in effect, if any.
    pub fn transaction(&self) -> Option<&Arc<TransactionState>> {
        self.status.transaction()
    }

    /// Mark the transaction in effect for rollback.
    pub fn set_rollback_only(&self) {
        self.status.set_rollback_only();
    }

    /// Whether the transaction in effect is marked for rollback.
    pub fn is_rollback_only(&self) -> bool {
        self.status.is_rollback_only()
    }

    /// Whether [`complete`](Self::complete) has run.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Run `future` with this boundary's transaction as the current one.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT_TRANSACTION
            .scope(self.status.transaction().cloned(), future)
            .await
    }

    /// Finish the boundary.
    ///
    /// A created transaction is rolled back when marked rollback-only and
    /// committed otherwise. A joined transaction is left to its creator.
    pub async fn complete(&mut self) -> Result<(), TransactionError> {
        if self.completed {
            return Err(TransactionError::AlreadyCompleted {
                name: self.description.clone(),
            });
        }
        self.completed = true;
        if !self.is_new() {
            trace!(description = %self.description, "Leaving joined transaction to its creator");
            return Ok(());
        }
        if self.is_rollback_only() {
            self.manager.rollback(&self.status).await
        } else {
            self.manager.commit(&self.status).await
        }
    }

    /// Commit, or roll back when marked rollback-only.
    pub async fn commit(mut self) -> Result<(), TransactionError> {
        self.complete().await
    }

    /// Roll back a created transaction, or mark a joined one rollback-only.
    pub async fn rollback(mut self) -> Result<(), TransactionError> {
        self.set_rollback_only();
        self.complete().await
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.completed && self.is_new() {
            warn!(description = %self.description, "Transaction dropped without completion");
        }
    }
}
