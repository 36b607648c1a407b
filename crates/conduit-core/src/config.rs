// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine settings loaded from environment variables.

use std::time::Duration;

/// Conduit engine configuration.
///
/// Passed explicitly to [`Configuration`](crate::configuration::Configuration),
/// adapters and receivers; nothing reads the environment after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of entries each adapter's message keeper retains
    pub message_keeper_size: usize,
    /// Log message sizes instead of message contents
    pub msg_log_hidden: bool,
    /// First sleep while waiting for receivers to stop
    pub stop_poll_initial: Duration,
    /// Upper bound for the receiver stop backoff
    pub stop_poll_max: Duration,
    /// Default transaction timeout, `None` for no timeout
    pub transaction_timeout: Option<Duration>,
    /// Default number of retries before a receiver rejects a message
    pub receiver_max_retries: i32,
    /// SQLite URL for durable message storage, in-memory storage when absent
    pub storage_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            message_keeper_size: 10,
            msg_log_hidden: true,
            stop_poll_initial: Duration::from_millis(25),
            stop_poll_max: Duration::from_millis(1000),
            transaction_timeout: None,
            receiver_max_retries: 1,
            storage_url: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All optional (with defaults):
    /// - `CONDUIT_MESSAGE_KEEPER_SIZE`: message keeper capacity (default: 10)
    /// - `CONDUIT_MSG_LOG_HIDDEN`: hide message contents in logs (default: true)
    /// - `CONDUIT_STOP_POLL_INITIAL_MS`: first receiver stop poll (default: 25)
    /// - `CONDUIT_STOP_POLL_MAX_MS`: maximum receiver stop poll (default: 1000)
    /// - `CONDUIT_TRANSACTION_TIMEOUT_SECS`: transaction timeout, 0 = none (default: 0)
    /// - `CONDUIT_RECEIVER_MAX_RETRIES`: receiver retries, negative = infinite (default: 1)
    /// - `CONDUIT_STORAGE_URL`: SQLite URL for message storage (default: in-memory)
    pub fn from_env() -> Result<Self, ConfigError> {
        let message_keeper_size: usize = std::env::var("CONDUIT_MESSAGE_KEEPER_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CONDUIT_MESSAGE_KEEPER_SIZE", "must be a positive integer")
            })?;
        if message_keeper_size == 0 {
            return Err(ConfigError::Invalid(
                "CONDUIT_MESSAGE_KEEPER_SIZE",
                "must be at least 1",
            ));
        }

        let msg_log_hidden: bool = std::env::var("CONDUIT_MSG_LOG_HIDDEN")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("CONDUIT_MSG_LOG_HIDDEN", "must be true or false"))?;

        let stop_poll_initial_ms: u64 = std::env::var("CONDUIT_STOP_POLL_INITIAL_MS")
            .unwrap_or_else(|_| "25".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CONDUIT_STOP_POLL_INITIAL_MS", "must be a positive integer")
            })?;

        let stop_poll_max_ms: u64 = std::env::var("CONDUIT_STOP_POLL_MAX_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CONDUIT_STOP_POLL_MAX_MS", "must be a positive integer")
            })?;
        if stop_poll_max_ms < stop_poll_initial_ms {
            return Err(ConfigError::Invalid(
                "CONDUIT_STOP_POLL_MAX_MS",
                "must not be smaller than CONDUIT_STOP_POLL_INITIAL_MS",
            ));
        }

        let transaction_timeout_secs: u64 = std::env::var("CONDUIT_TRANSACTION_TIMEOUT_SECS")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "CONDUIT_TRANSACTION_TIMEOUT_SECS",
                    "must be a non-negative integer",
                )
            })?;

        let receiver_max_retries: i32 = std::env::var("CONDUIT_RECEIVER_MAX_RETRIES")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("CONDUIT_RECEIVER_MAX_RETRIES", "must be an integer"))?;

        let storage_url = std::env::var("CONDUIT_STORAGE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        Ok(Self {
            message_keeper_size,
            msg_log_hidden,
            stop_poll_initial: Duration::from_millis(stop_poll_initial_ms),
            stop_poll_max: Duration::from_millis(stop_poll_max_ms),
            transaction_timeout: (transaction_timeout_secs > 0)
                .then(|| Duration::from_secs(transaction_timeout_secs)),
            receiver_max_retries,
            storage_url,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
