// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle state machine.
//!
//! Every deployed agent instance is always in exactly one of eight states:
//!
//! ```text
//!                ┌─────────────┐
//!     ┌──────────│ NOT_STARTED │◄─────────────┐
//!     │          └──────┬──────┘              │
//! initialize            │ start               │ stop
//!     │                 ▼                     │
//!     ▼          ┌──────────┐          ┌──────┴───┐
//! ┌──────────────┐│ STARTING │─────────►│ STOPPING │
//! │ INITIALIZING ││          │ RUNNING  └──────┬───┘
//! └──────┬───────┘└────┬─────┘    │            │
//!        │             │          │            ▼
//!        ▼             ▼          │      ┌─────────────┐
//! ┌──────────────────┐┌──────────────┐   │ STOP_FAILED │
//! │ INITIALIZE_FAILED││ START_FAILED │   └─────────────┘
//! └──────────────────┘└──────────────┘
//! ```
//!
//! Transitions are guarded: each operation names the states it may begin
//! from, a transitional state held while remote work is in flight, and the
//! success/failure states applied when the work settles. Force-stop is the
//! one escape hatch: it is legal from any state and always lands in
//! `not_started`.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle state of one deployed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Provisioned (or stopped); the process is not running.
    NotStarted,
    /// Initialize is in flight: directories and config files being created.
    Initializing,
    /// Initialize failed; re-initialize to recover.
    InitializeFailed,
    /// Start is in flight: process launching, liveness not yet verified.
    Starting,
    /// The agent process is running with a recorded pid.
    Running,
    /// Start failed; retry start or force-stop to recover.
    StartFailed,
    /// Stop is in flight: termination signalled, waiting for exit.
    Stopping,
    /// Graceful stop timed out or errored; force-stop is the recovery path.
    StopFailed,
}

impl InstanceState {
    /// All states, in declaration order.
    pub const ALL: [InstanceState; 8] = [
        InstanceState::NotStarted,
        InstanceState::Initializing,
        InstanceState::InitializeFailed,
        InstanceState::Starting,
        InstanceState::Running,
        InstanceState::StartFailed,
        InstanceState::Stopping,
        InstanceState::StopFailed,
    ];

    /// Database string code for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::NotStarted => "not_started",
            InstanceState::Initializing => "initializing",
            InstanceState::InitializeFailed => "initialize_failed",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::StartFailed => "start_failed",
            InstanceState::Stopping => "stopping",
            InstanceState::StopFailed => "stop_failed",
        }
    }

    /// Parse a database string code.
    pub fn parse(s: &str) -> Option<InstanceState> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Running family: the process is (or may be) alive on the machine.
    pub fn is_running_family(self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Starting)
    }

    /// States in which the recorded pid must be cleared.
    ///
    /// A pid is recorded only on entry to `running`; it is cleared the moment
    /// the instance leaves the running family or settles back to idle.
    pub fn clears_pid(self) -> bool {
        matches!(
            self,
            InstanceState::NotStarted | InstanceState::Stopping | InstanceState::StopFailed
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of lifecycle operation issued against an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Provision the deploy directory and configuration files.
    Initialize,
    /// Launch the agent process and verify liveness.
    Start,
    /// Gracefully stop the agent process.
    Stop,
    /// Unconditionally terminate, from any state.
    ForceStop,
    /// Stop then start as one task.
    Restart,
    /// Write caller-supplied configuration content to the machine.
    UpdateConfig,
    /// Re-write the authoritative database configuration to the machine.
    RefreshConfig,
    /// Initialize driven by a scale-out of an existing process.
    ScaleOutInit,
}

impl OperationKind {
    /// Database string code for this operation kind.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Initialize => "initialize",
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::ForceStop => "force_stop",
            OperationKind::Restart => "restart",
            OperationKind::UpdateConfig => "update_config",
            OperationKind::RefreshConfig => "refresh_config",
            OperationKind::ScaleOutInit => "scale_out_init",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States an instance moves through while an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    /// State held while remote work is in flight.
    pub transitional: InstanceState,
    /// State applied when every step succeeds.
    pub success: InstanceState,
    /// State applied when a step fails or errors.
    pub failure: InstanceState,
}

/// States from which `kind` may legally begin.
///
/// Configuration operations do not move the state machine; they are legal
/// from the idle and failed-terminal states only, never under a running (or
/// transitioning) agent. An instance whose initialize failed has no deploy
/// directory to write into, so it must be re-initialized first.
pub fn allowed_from(kind: OperationKind) -> &'static [InstanceState] {
    match kind {
        OperationKind::Initialize | OperationKind::ScaleOutInit => {
            &[InstanceState::NotStarted, InstanceState::InitializeFailed]
        }
        OperationKind::Start => &[InstanceState::NotStarted, InstanceState::StartFailed],
        OperationKind::Stop => &[InstanceState::Running, InstanceState::StopFailed],
        OperationKind::ForceStop => &InstanceState::ALL,
        OperationKind::Restart => &[InstanceState::Running, InstanceState::StopFailed],
        OperationKind::UpdateConfig | OperationKind::RefreshConfig => &[
            InstanceState::NotStarted,
            InstanceState::StartFailed,
            InstanceState::StopFailed,
        ],
    }
}

/// The transition plan for `kind`, or `None` for operations that leave the
/// state machine untouched (configuration writes).
pub fn transition_plan(kind: OperationKind) -> Option<TransitionPlan> {
    match kind {
        OperationKind::Initialize | OperationKind::ScaleOutInit => Some(TransitionPlan {
            transitional: InstanceState::Initializing,
            success: InstanceState::NotStarted,
            failure: InstanceState::InitializeFailed,
        }),
        OperationKind::Start => Some(TransitionPlan {
            transitional: InstanceState::Starting,
            success: InstanceState::Running,
            failure: InstanceState::StartFailed,
        }),
        OperationKind::Stop => Some(TransitionPlan {
            transitional: InstanceState::Stopping,
            success: InstanceState::NotStarted,
            failure: InstanceState::StopFailed,
        }),
        // Force-stop exists to break out of any stuck state: both outcomes
        // settle to not_started.
        OperationKind::ForceStop => Some(TransitionPlan {
            transitional: InstanceState::Stopping,
            success: InstanceState::NotStarted,
            failure: InstanceState::NotStarted,
        }),
        // Restart composes the stop plan and the start plan in sequence; the
        // orchestrator drives each phase so failure states stay accurate.
        OperationKind::Restart => None,
        OperationKind::UpdateConfig | OperationKind::RefreshConfig => None,
    }
}

/// Assert that `current` is a legal precondition state for `kind`.
pub fn ensure_allowed(
    instance_id: i64,
    current: InstanceState,
    kind: OperationKind,
) -> Result<(), Error> {
    let allowed = allowed_from(kind);
    if allowed.contains(&current) {
        return Ok(());
    }
    Err(Error::InvalidInstanceState {
        instance_id,
        operation: kind,
        current,
        required: allowed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codec_round_trips() {
        for state in InstanceState::ALL {
            assert_eq!(InstanceState::parse(state.as_str()), Some(state));
        }
        assert_eq!(InstanceState::parse("bogus"), None);
    }

    #[test]
    fn start_only_from_idle_or_start_failed() {
        assert!(ensure_allowed(1, InstanceState::NotStarted, OperationKind::Start).is_ok());
        assert!(ensure_allowed(1, InstanceState::StartFailed, OperationKind::Start).is_ok());
        for state in [
            InstanceState::Running,
            InstanceState::Starting,
            InstanceState::Stopping,
            InstanceState::StopFailed,
            InstanceState::Initializing,
            InstanceState::InitializeFailed,
        ] {
            assert!(ensure_allowed(1, state, OperationKind::Start).is_err());
        }
    }

    #[test]
    fn stop_only_from_running_or_stop_failed() {
        assert!(ensure_allowed(1, InstanceState::Running, OperationKind::Stop).is_ok());
        assert!(ensure_allowed(1, InstanceState::StopFailed, OperationKind::Stop).is_ok());
        assert!(ensure_allowed(1, InstanceState::NotStarted, OperationKind::Stop).is_err());
    }

    #[test]
    fn force_stop_from_every_state() {
        for state in InstanceState::ALL {
            assert!(ensure_allowed(1, state, OperationKind::ForceStop).is_ok());
        }
        let plan = transition_plan(OperationKind::ForceStop).unwrap();
        assert_eq!(plan.success, InstanceState::NotStarted);
        assert_eq!(plan.failure, InstanceState::NotStarted);
    }

    #[test]
    fn config_ops_rejected_under_running_agent() {
        for kind in [OperationKind::UpdateConfig, OperationKind::RefreshConfig] {
            assert!(ensure_allowed(1, InstanceState::Running, kind).is_err());
            assert!(ensure_allowed(1, InstanceState::Initializing, kind).is_err());
            assert!(ensure_allowed(1, InstanceState::InitializeFailed, kind).is_err());
            assert!(ensure_allowed(1, InstanceState::NotStarted, kind).is_ok());
            assert!(transition_plan(kind).is_none());
        }
    }

    #[test]
    fn invalid_state_error_names_current_and_required() {
        let err = ensure_allowed(7, InstanceState::Running, OperationKind::Start).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("running"), "message was: {msg}");
        assert!(msg.contains("not_started"), "message was: {msg}");
    }

    #[test]
    fn pid_cleared_on_exit_from_running() {
        assert!(InstanceState::NotStarted.clears_pid());
        assert!(InstanceState::Stopping.clears_pid());
        assert!(InstanceState::StopFailed.clears_pid());
        assert!(!InstanceState::Running.clears_pid());
        assert!(!InstanceState::Starting.clears_pid());
    }
}
