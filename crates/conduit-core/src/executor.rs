// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool for lifecycle tasks.

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

/// Runs fire-and-forget background tasks such as adapter start and stop.
pub trait TaskExecutor: Send + Sync {
    /// Submit `task`; returns immediately.
    fn execute(&self, name: &str, task: BoxFuture<'static, ()>);
}

/// Spawns each task on the current tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioTaskExecutor {
    handle: Option<tokio::runtime::Handle>,
}

impl TokioTaskExecutor {
    /// Spawn on the runtime that calls [`execute`](TaskExecutor::execute).
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn on `handle`, for callers outside a runtime.
    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) -> JoinHandle<()> {
        match &self.handle {
            Some(handle) => handle.spawn(task),
            None => tokio::spawn(task),
        }
    }
}

impl TaskExecutor for TokioTaskExecutor {
    fn execute(&self, name: &str, task: BoxFuture<'static, ()>) {
        tracing::trace!(task = %name, "Submitting task");
        drop(self.spawn(task));
    }
}
