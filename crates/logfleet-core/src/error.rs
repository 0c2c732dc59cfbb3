// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for logfleet-core.
//!
//! Four families matter to callers:
//!
//! - **validation** errors (`Validation`, `InvalidInstanceState`,
//!   `PathConflict`, `TaskInFlight`, the `*NotFound` variants) are raised
//!   before any remote action and block the requested change entirely;
//! - **remote execution** errors (`Channel`, `Execution`) are recorded as a
//!   failed step/task and a failed instance state, and require an explicit
//!   retry or force-stop;
//! - **infrastructure** errors (`Database`, `Config`, `Json`) bubble up
//!   unchanged;
//! - best-effort cleanup failures are logged by the orchestrator and never
//!   surface through this type.

use thiserror::Error;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::state::{InstanceState, OperationKind};

/// Result type using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core errors raised by fleet operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote command channel failure (connect, auth, exec, transfer).
    #[error("remote channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A remote step ran but did not achieve its goal.
    #[error("remote execution failed: {0}")]
    Execution(String),

    /// Request rejected before any remote action.
    #[error("validation error: {0}")]
    Validation(String),

    /// The instance is not in a legal precondition state for the operation.
    #[error(
        "instance {instance_id} cannot {operation}: state is '{current}', requires one of {}",
        .required.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
    )]
    InvalidInstanceState {
        /// The instance whose state was checked.
        instance_id: i64,
        /// The operation that was requested.
        operation: OperationKind,
        /// The persisted state at validation time.
        current: InstanceState,
        /// States the operation may legally begin from.
        required: &'static [InstanceState],
    },

    /// Another task is already in flight for the instance.
    #[error("instance {instance_id} already has task {task_id} in flight")]
    TaskInFlight {
        /// The instance the new task was aimed at.
        instance_id: i64,
        /// The open task blocking it.
        task_id: String,
    },

    /// The (machine, deploy path) pair is already reserved by an instance.
    #[error("deploy path '{deploy_path}' on machine {machine_id} is already occupied by instance {instance_id}")]
    PathConflict {
        /// Target machine.
        machine_id: i64,
        /// Colliding absolute deploy path.
        deploy_path: String,
        /// The instance holding the reservation.
        instance_id: i64,
    },

    /// Process row not found.
    #[error("process {0} not found")]
    ProcessNotFound(i64),

    /// Instance row not found.
    #[error("instance {0} not found")]
    InstanceNotFound(i64),

    /// No connection parameters known for the machine.
    #[error("machine {0} not found")]
    MachineNotFound(i64),

    /// Task row not found.
    #[error("task {0} not found")]
    TaskNotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors raised before any remote action was attempted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::InvalidInstanceState { .. }
                | Error::TaskInFlight { .. }
                | Error::PathConflict { .. }
                | Error::ProcessNotFound(_)
                | Error::InstanceNotFound(_)
                | Error::MachineNotFound(_)
                | Error::TaskNotFound(_)
        )
    }
}
