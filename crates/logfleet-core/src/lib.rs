// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Logfleet Core - Agent Fleet Orchestration Engine
//!
//! This crate deploys, starts, stops, scales and reconfigures many
//! independent log-shipping agent instances spread across remote machines,
//! each reachable only over SSH, while keeping a durable, crash-recoverable
//! record of what was asked and what actually happened.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Request Layer (external)                          │
//! │                 (REST controllers, CLI - out of scope)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            FleetService                                  │
//! │      (validate, resolve process → instances, delegate, audit)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                  │                     │
//!        │ scale            │ lifecycle           │ config
//!        ▼                  ▼                     ▼
//! ┌──────────────┐  ┌────────────────┐   ┌────────────────┐
//! │ ScalingEngine│─►│  Orchestrator  │◄──│   ConfigSync   │
//! │ (rows, paths)│  │ (tasks, steps, │   │ (backfill,     │
//! └──────────────┘  │  transitions)  │   │  validation)   │
//!                   └───────┬────────┘   └────────────────┘
//!                           │ commands
//!                           ▼
//!                   ┌────────────────┐        ┌──────────────────┐
//!                   │ RemoteChannel  │───────►│ Remote machines  │
//!                   │ (SSH, opaque)  │  exec/ │ (agent processes)│
//!                   └────────────────┘  files └──────────────────┘
//!                           │
//!                           ▼
//!                   ┌────────────────┐
//!                   │  PostgreSQL /  │
//!                   │    SQLite      │
//!                   └────────────────┘
//! ```
//!
//! # Instance State Machine
//!
//! | State | Meaning |
//! |-------|---------|
//! | `not_started` | Provisioned (or stopped); process not running |
//! | `initializing` | Directories/config being created remotely |
//! | `initialize_failed` | Provisioning failed; re-initialize to recover |
//! | `starting` | Process launching, liveness unverified |
//! | `running` | Process alive with a recorded pid |
//! | `start_failed` | Launch or verification failed |
//! | `stopping` | Termination signalled, waiting for exit |
//! | `stop_failed` | Graceful stop timed out; force-stop recovers |
//!
//! Force-stop is legal from every state and always settles in `not_started`
//! with the pid cleared; when the remote process's death cannot be confirmed
//! the ledger step says so and the API reports it distinctly.
//!
//! # Concurrency Model
//!
//! Batch operations fan out one tokio task per instance and fan back in to a
//! per-instance outcome vector. Within one instance, a per-instance lock and
//! the single-in-flight-task rule serialize everything; across instances
//! there is no ordering and no shared mutable state beyond the
//! (machine, deploy path) uniqueness constraint, which is reserved
//! atomically with instance-row creation.
//!
//! # Ledger Semantics
//!
//! Every operation is a task; every remote sub-action an ordered step with
//! its own timestamps and status. A task completes only when all its steps
//! completed, and fails the moment a step fails (later steps are not
//! attempted). Ledger rows survive instance and process deletion; only the
//! administrative purge removes them.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `LOGFLEET_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `LOGFLEET_DEPLOY_BASE_DIR` | No | `logfleet` | Base dir for generated deploy paths |
//! | `LOGFLEET_AGENT_PACKAGE` | No | - | Agent tarball uploaded during initialize |
//! | `LOGFLEET_STOP_TIMEOUT_SECS` | No | `360` | Graceful stop wait |
//! | `LOGFLEET_FORCE_STOP_TIMEOUT_SECS` | No | `180` | Force-stop confirmation wait |
//! | `LOGFLEET_POLL_INTERVAL_SECS` | No | `3` | Remote liveness poll interval |
//! | `LOGFLEET_VERIFY_ATTEMPTS` | No | `5` | Post-launch verification attempts |
//!
//! # Modules
//!
//! - [`channel`]: remote command channel abstraction and machine directory
//! - [`command`]: command builder translating operations into remote actions
//! - [`config`]: configuration from environment variables
//! - [`config_sync`]: default backfill and configuration mutation guards
//! - [`deploy`]: the deployment orchestrator
//! - [`error`]: error taxonomy
//! - [`ledger`]: durable task/step ledger
//! - [`migrations`]: embedded database migrations
//! - [`monitor`]: background liveness reconciliation
//! - [`persistence`]: persistence trait with PostgreSQL/SQLite backends
//! - [`scale`]: scaling engine
//! - [`service`]: the library facade consumed by the request layer
//! - [`state`]: the instance lifecycle state machine

#![deny(missing_docs)]

/// Remote command channel abstraction and machine directory.
pub mod channel;

/// Command builder: operations to ordered remote actions.
pub mod command;

/// Configuration from environment variables.
pub mod config;

/// Default backfill and configuration mutation guards.
pub mod config_sync;

/// Deployment orchestrator: tasks, steps, transitions, fan-out.
pub mod deploy;

/// Error taxonomy for fleet operations.
pub mod error;

/// Durable task/step ledger.
pub mod ledger;

/// Embedded database migrations.
pub mod migrations;

/// Background liveness reconciliation worker.
pub mod monitor;

/// Persistence trait and PostgreSQL/SQLite backends.
pub mod persistence;

/// Scaling engine: instance rows and path reservations.
pub mod scale;

/// Library facade consumed by the request layer.
pub mod service;

/// Instance lifecycle state machine.
pub mod state;
