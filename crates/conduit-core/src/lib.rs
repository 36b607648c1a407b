// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conduit Core - Integration Message Processing Engine
//!
//! This crate runs messages received from transports through configured
//! pipelines of pipes, with transaction boundaries, retries and a durable
//! process state per message.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   raw message   ┌──────────────┐  process_message  ┌──────────────┐
//! │   Listener   │────────────────►│   Receiver   │──────────────────►│   Adapter    │
//! │ (transport)  │                 │ retries, ids │                   │ counters,    │
//! └──────────────┘                 │ process state│                   │ lifecycle    │
//!                                  └──────┬───────┘                   └──────┬───────┘
//!                                         │                                  │
//!                                         ▼                                  ▼
//!                                  ┌──────────────┐                   ┌──────────────┐
//!                                  │   Storage    │                   │   PipeLine   │
//!                                  │ error / log  │                   │ pipe → pipe  │
//!                                  └──────────────┘                   │ → exit       │
//!                                                                     └──────────────┘
//! ```
//!
//! # Transaction Attributes
//!
//! | Attribute | Transaction active | No transaction active |
//! |-----------|--------------------|-----------------------|
//! | `REQUIRED` | join | create |
//! | `REQUIRESNEW` | suspend, create | create |
//! | `MANDATORY` | join | error |
//! | `NOTSUPPORTED` | suspend, run without | run without |
//! | `SUPPORTS` | join | run without |
//! | `NEVER` | error | run without |
//!
//! Only the participant that created a transaction commits or rolls it
//! back; a participant that joined one can only mark it rollback-only.
//!
//! # Process States
//!
//! ```text
//! AVAILABLE ──pick up──► INPROCESS ──success──► DONE
//!     ▲                      │
//!     │ retry                │ failure
//!     │                      ▼
//!     └──────────────────  ERROR ◄──release── HOLD
//!                            └──────park──────►
//! ```
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CONDUIT_MESSAGE_KEEPER_SIZE` | `10` | Message keeper entries per adapter |
//! | `CONDUIT_MSG_LOG_HIDDEN` | `true` | Log result sizes instead of contents |
//! | `CONDUIT_STOP_POLL_INITIAL_MS` | `25` | First wait for receivers to stop |
//! | `CONDUIT_STOP_POLL_MAX_MS` | `1000` | Longest wait for receivers to stop |
//! | `CONDUIT_TRANSACTION_TIMEOUT_SECS` | `0` | Default transaction timeout, 0 = none |
//! | `CONDUIT_RECEIVER_MAX_RETRIES` | `1` | Attempts before a receiver rejects a message |
//! | `CONDUIT_STORAGE_URL` | - | SQLite URL for message storage |

/// The adapter: pipeline, receivers, counters and lifecycle.
pub mod adapter;

/// Result caches for whole pipeline runs.
pub mod cache;

/// Engine settings loaded from environment variables.
pub mod config;

/// Named sets of adapters loaded and unloaded together.
pub mod configuration;

/// Error types.
pub mod error;

/// Background task execution for lifecycle commands.
pub mod executor;

/// Forwards, exits and exit states.
pub mod forward;

/// Listeners, senders and the storage-backed listener.
pub mod listener;

/// Mutual exclusion across pipeline runs.
pub mod locker;

/// Message payloads.
pub mod message;

/// Bounded rolling log of lifecycle messages.
pub mod message_keeper;

/// Embedded SQL migrations.
pub mod migrations;

/// The pipe contract and pipe definitions.
pub mod pipe;

/// Pipeline assembly, configuration and execution.
pub mod pipeline;

/// Durable message process states.
pub mod process_state;

/// Layered pipeline and pipe processors.
pub mod processor;

/// Receivers: ids, retries, duplicates and process state per message.
pub mod receiver;

/// Pipe and pipeline results.
pub mod result;

/// Component run states.
pub mod run_state;

/// Per-message session state.
pub mod session;

/// Counters, duration statistics and their export.
pub mod statistics;

/// Message storage.
pub mod storage;

/// Transaction boundaries.
pub mod transaction;

pub use adapter::Adapter;
pub use config::Config;
pub use configuration::Configuration;
pub use error::{ConfigurationError, PipeRunError, ProcessingError};
pub use message::Message;
pub use pipeline::PipeLine;
pub use receiver::{ManagedReceiver, Receiver};
