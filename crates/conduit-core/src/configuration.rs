// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The unit of loading and unloading: a named set of adapters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::{info, warn};

use crate::adapter::Adapter;
use crate::config::Config;
use crate::error::ConfigurationError;
use crate::run_state::RunState;

/// A set of adapters loaded and unloaded together.
pub struct Configuration {
    name: String,
    config: Config,
    adapters: RwLock<Vec<Arc<Adapter>>>,
    unloading: AtomicBool,
    me: Weak<Self>,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("name", &self.name)
            .field("adapters", &self.adapter_names())
            .field("unloading", &self.is_unload_in_progress_or_done())
            .finish()
    }
}

impl Configuration {
    /// Create an empty configuration.
    pub fn new(name: impl Into<String>, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            config,
            adapters: RwLock::new(Vec::new()),
            unloading: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Configuration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine settings shared by the adapters.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register an adapter; names must be unique.
    pub fn register_adapter(&self, adapter: Arc<Adapter>) -> Result<(), ConfigurationError> {
        if self.is_unload_in_progress_or_done() {
            return Err(ConfigurationError::new(format!(
                "configuration [{}] is unloading, cannot register adapter [{}]",
                self.name,
                adapter.name()
            )));
        }
        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        if adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(ConfigurationError::new(format!(
                "adapter [{}] already registered in configuration [{}]",
                adapter.name(),
                self.name
            )));
        }
        adapter.attach_configuration(self.me.clone());
        adapters.push(adapter);
        Ok(())
    }

    /// Adapter by name.
    pub fn adapter(&self, name: &str) -> Option<Arc<Adapter>> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// Registered adapters, in registration order.
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn adapter_names(&self) -> Vec<String> {
        self.adapters()
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    /// Configure every adapter; the first failure is returned after all ran.
    pub fn configure(&self) -> Result<(), ConfigurationError> {
        let mut first_error = None;
        for adapter in self.adapters() {
            if let Err(e) = adapter.configure() {
                warn!(configuration = %self.name, adapter = %adapter.name(), error = %e, "Adapter configuration failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Start every successfully configured adapter.
    pub fn start_adapters(&self) {
        for adapter in self.adapters() {
            if adapter.is_configuration_succeeded() {
                adapter.start_running();
            } else {
                warn!(configuration = %self.name, adapter = %adapter.name(), "Not starting adapter, configuration did not succeed");
            }
        }
    }

    /// Ask every adapter to stop.
    pub fn stop_adapters(&self) {
        for adapter in self.adapters() {
            adapter.stop_running();
        }
    }

    /// Whether [`unload`](Self::unload) has been called.
    pub fn is_unload_in_progress_or_done(&self) -> bool {
        self.unloading.load(Ordering::SeqCst)
    }

    /// Stop all adapters, wait for them, and drop them.
    pub async fn unload(&self) {
        if self.unloading.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(configuration = %self.name, "Unloading configuration");
        self.stop_adapters();
        for adapter in self.adapters() {
            // A stop command is ignored while starting; repeat it once started.
            let state = adapter
                .wait_for_state(|s| !matches!(s, RunState::Starting | RunState::ExceptionStarting))
                .await;
            if matches!(state, RunState::Started) {
                adapter.stop_running();
            }
            let state = adapter
                .wait_for_state(|s| matches!(s, RunState::Stopped | RunState::Error))
                .await;
            info!(configuration = %self.name, adapter = %adapter.name(), state = %state, "Adapter unloaded");
        }
        self.adapters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
