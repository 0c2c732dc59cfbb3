// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment orchestrator.
//!
//! Executes lifecycle operations against batches of instances: one unit of
//! concurrent work per instance, fanned out as tokio tasks and fanned back in
//! to a per-instance outcome vector. Within one instance, steps run strictly
//! in sequence under a per-instance lock and a single in-flight ledger task;
//! across instances nothing is ordered and nothing needs to be.
//!
//! The orchestrator is the sole writer of task/step rows and the sole driver
//! of instance state transitions. A failure on one instance is isolated: it
//! lands that instance in a failed state with a failed task, and the rest of
//! the batch proceeds untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, instrument, warn};

use crate::channel::{MachineDirectory, MachineProfile, RemoteChannel};
use crate::command::{
    AgentCommand, CommandContext, ConfigUpdate, DeleteDirectory, FORCE_STOP_UNCONFIRMED_NOTE,
    build_commands,
};
use crate::config::FleetSettings;
use crate::error::Error;
use crate::ledger::Ledger;
use crate::persistence::{InstanceRecord, Persistence, ProcessRecord};
use crate::state::{self, InstanceState, OperationKind};

/// How a force-stop settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceStopOutcome {
    /// The process was confirmed dead.
    Confirmed,
    /// Termination was signalled but the process's death could not be
    /// confirmed. The instance is still `not_started`; the ambiguity is
    /// recorded on the ledger step.
    Unconfirmed,
}

/// Result of one instance's share of a batch operation.
#[derive(Debug)]
pub struct InstanceOutcome {
    /// The instance operated on.
    pub instance_id: i64,
    /// Ledger task created for the operation, if validation passed.
    pub task_id: Option<String>,
    /// Present for force-stop operations.
    pub force_stop: Option<ForceStopOutcome>,
    /// The instance's own result; never influenced by its batch peers.
    pub result: Result<(), Error>,
}

/// Aggregated result of a batch operation.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Per-instance outcomes, in dispatch order.
    pub outcomes: Vec<InstanceOutcome>,
}

impl BatchOutcome {
    /// True when every instance succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// True when no instance could be processed at all.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.result.is_err())
    }

    /// Outcome for one instance, if it was part of the batch.
    pub fn outcome_for(&self, instance_id: i64) -> Option<&InstanceOutcome> {
        self.outcomes.iter().find(|o| o.instance_id == instance_id)
    }
}

/// Handle on an in-flight asynchronous directory cleanup.
///
/// Directory deletion is eventually consistent: callers that need the result
/// (process deletion, scale-in) await it with a bound, and a slow remote
/// never blocks database cleanup indefinitely.
pub struct DirectoryCleanup {
    handle: tokio::task::JoinHandle<bool>,
}

impl DirectoryCleanup {
    /// Wait up to `timeout` for the cleanup to finish.
    ///
    /// Returns `Some(all_deleted)` when it finished in time, `None` when it
    /// is still running (the deletion keeps going in the background).
    pub async fn wait(self, timeout: Duration) -> Option<bool> {
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(all_deleted)) => Some(all_deleted),
            Ok(Err(_)) => Some(false),
            Err(_) => None,
        }
    }
}

/// Registry of per-instance locks serializing operations on one instance.
///
/// The single-in-flight-task rule is also enforced in the ledger; the lock
/// closes the window between reading the current state and beginning the
/// task, so two racing operations cannot both pass validation.
#[derive(Default)]
struct InstanceLocks {
    inner: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceLocks {
    fn for_instance(&self, instance_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(instance_id).or_default())
    }
}

struct PhaseOutcome {
    pid: Option<i64>,
    unconfirmed: bool,
}

/// The engine executing lifecycle operations against remote machines.
///
/// Cheap to clone; clones share the lock registry and collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    channel: Arc<dyn RemoteChannel>,
    machines: Arc<dyn MachineDirectory>,
    ledger: Ledger,
    settings: Arc<FleetSettings>,
    locks: Arc<InstanceLocks>,
}

impl Orchestrator {
    /// Create an orchestrator over the given collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        channel: Arc<dyn RemoteChannel>,
        machines: Arc<dyn MachineDirectory>,
        settings: Arc<FleetSettings>,
    ) -> Self {
        let ledger = Ledger::new(Arc::clone(&persistence));
        Self {
            persistence,
            channel,
            machines,
            ledger,
            settings,
            locks: Arc::new(InstanceLocks::default()),
        }
    }

    /// The ledger this orchestrator writes to.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Provision deploy directories and configuration for a batch of
    /// freshly created instances.
    pub async fn initialize_instances(
        &self,
        instances: &[InstanceRecord],
        process: &ProcessRecord,
    ) -> BatchOutcome {
        self.dispatch(instances, Some(process), OperationKind::Initialize, None)
            .await
    }

    /// Initialize driven by a scale-out; identical steps, distinct task kind.
    pub async fn initialize_scaled_instances(
        &self,
        instances: &[InstanceRecord],
        process: &ProcessRecord,
    ) -> BatchOutcome {
        self.dispatch(instances, Some(process), OperationKind::ScaleOutInit, None)
            .await
    }

    /// Launch and verify the agent process on each instance.
    pub async fn start_instances(
        &self,
        instances: &[InstanceRecord],
        process: &ProcessRecord,
    ) -> BatchOutcome {
        self.dispatch(instances, Some(process), OperationKind::Start, None)
            .await
    }

    /// Gracefully stop the agent process on each instance.
    pub async fn stop_instances(&self, instances: &[InstanceRecord]) -> BatchOutcome {
        self.dispatch(instances, None, OperationKind::Stop, None).await
    }

    /// Unconditionally terminate the agent process on each instance.
    pub async fn force_stop_instances(
        &self,
        instances: &[InstanceRecord],
    ) -> BatchOutcome {
        self.dispatch(instances, None, OperationKind::ForceStop, None)
            .await
    }

    /// Write caller-supplied configuration content to each instance.
    ///
    /// Callers validate the config-mutable precondition for the whole batch
    /// first; each instance is re-validated here before any remote action.
    pub async fn update_instances_config(
        &self,
        instances: &[InstanceRecord],
        update: &ConfigUpdate,
    ) -> BatchOutcome {
        self.dispatch(
            instances,
            None,
            OperationKind::UpdateConfig,
            Some(update.clone()),
        )
        .await
    }

    /// Re-write the authoritative database configuration to each instance.
    pub async fn refresh_instances_config(
        &self,
        instances: &[InstanceRecord],
        process: &ProcessRecord,
    ) -> BatchOutcome {
        self.dispatch(instances, Some(process), OperationKind::RefreshConfig, None)
            .await
    }

    /// Stop then start one instance under a single task.
    pub async fn restart_instance(&self, instance_id: i64) -> InstanceOutcome {
        self.execute_instance(instance_id, None, OperationKind::Restart, None)
            .await
    }

    /// Fan out best-effort deploy directory deletion across instances.
    ///
    /// Runs detached from the ledger: cleanup failures are logged, never
    /// escalated, and must not block database bookkeeping.
    pub fn delete_instances_directory(&self, instances: Vec<InstanceRecord>) -> DirectoryCleanup {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let deletions = instances
                .iter()
                .map(|instance| this.delete_one_directory(instance));
            join_all(deletions).await.into_iter().all(|ok| ok)
        });
        DirectoryCleanup { handle }
    }

    async fn delete_one_directory(&self, instance: &InstanceRecord) -> bool {
        let machine = match self.machines.machine(instance.machine_id).await {
            Ok(machine) => machine,
            Err(e) => {
                warn!(instance_id = instance.id, error = %e, "directory cleanup: machine lookup failed");
                return false;
            }
        };
        let ctx = CommandContext {
            channel: self.channel.as_ref(),
            machine: &machine,
            instance_id: instance.id,
            deploy_path: &instance.deploy_path,
            recorded_pid: instance.pid,
            settings: &self.settings,
        };
        let command = DeleteDirectory;
        if command.already_done(&ctx).await {
            return true;
        }
        match command.run(&ctx).await {
            Ok(_) => {
                info!(instance_id = instance.id, path = %instance.deploy_path, "deploy directory removed");
                true
            }
            Err(e) => {
                warn!(instance_id = instance.id, path = %instance.deploy_path, error = %e,
                      "directory cleanup failed; database cleanup proceeds");
                false
            }
        }
    }

    async fn dispatch(
        &self,
        instances: &[InstanceRecord],
        process: Option<&ProcessRecord>,
        kind: OperationKind,
        update: Option<ConfigUpdate>,
    ) -> BatchOutcome {
        let handles: Vec<_> = instances
            .iter()
            .map(|instance| {
                let this = self.clone();
                let process = process.cloned();
                let update = update.clone();
                let instance_id = instance.id;
                (
                    instance_id,
                    tokio::spawn(async move {
                        this.execute_instance(instance_id, process, kind, update).await
                    }),
                )
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (instance_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => InstanceOutcome {
                    instance_id,
                    task_id: None,
                    force_stop: None,
                    result: Err(Error::Other(format!("dispatch task panicked: {e}"))),
                },
            };
            outcomes.push(outcome);
        }
        BatchOutcome { outcomes }
    }

    #[instrument(skip(self, process, update))]
    async fn execute_instance(
        &self,
        instance_id: i64,
        process: Option<ProcessRecord>,
        kind: OperationKind,
        update: Option<ConfigUpdate>,
    ) -> InstanceOutcome {
        let lock = self.locks.for_instance(instance_id);
        let _guard = lock.lock_owned().await;

        match self
            .execute_locked(instance_id, process, kind, update.as_ref())
            .await
        {
            Ok((task_id, force_stop)) => InstanceOutcome {
                instance_id,
                task_id: Some(task_id),
                force_stop,
                result: Ok(()),
            },
            Err((task_id, e)) => {
                if e.is_validation() {
                    info!(instance_id, error = %e, "operation rejected");
                } else {
                    warn!(instance_id, error = %e, "operation failed");
                }
                InstanceOutcome {
                    instance_id,
                    task_id,
                    force_stop: None,
                    result: Err(e),
                }
            }
        }
    }

    /// Runs one operation with the instance lock held. Returns the error
    /// together with the task id, when a task got far enough to exist.
    async fn execute_locked(
        &self,
        instance_id: i64,
        process: Option<ProcessRecord>,
        kind: OperationKind,
        update: Option<&ConfigUpdate>,
    ) -> Result<(String, Option<ForceStopOutcome>), (Option<String>, Error)> {
        // Validation phase: everything here fails before any remote action
        // and before a task exists.
        let instance = self
            .persistence
            .get_instance(instance_id)
            .await
            .map_err(|e| (None, e))?
            .ok_or((None, Error::InstanceNotFound(instance_id)))?;
        let current = instance.lifecycle_state().map_err(|e| (None, e))?;
        state::ensure_allowed(instance_id, current, kind).map_err(|e| (None, e))?;

        let process = match process {
            Some(process) => process,
            None => self
                .persistence
                .get_process(instance.process_id)
                .await
                .map_err(|e| (None, e))?
                .ok_or((None, Error::ProcessNotFound(instance.process_id)))?,
        };
        let machine = self
            .machines
            .machine(instance.machine_id)
            .await
            .map_err(|e| (None, e))?;

        let task = self
            .ledger
            .begin_task(instance.id, instance.process_id, kind)
            .await
            .map_err(|e| (None, e))?;
        let task_id = task.id.clone();
        self.ledger
            .start_task(&task_id)
            .await
            .map_err(|e| (Some(task_id.clone()), e))?;

        let result = match kind {
            OperationKind::Restart => self.run_restart(&task_id, &instance, &process, &machine).await,
            _ => {
                self.run_transition(&task_id, kind, &instance, &process, update, &machine)
                    .await
            }
        };

        match result {
            Ok(phase) => {
                self.ledger
                    .complete_task(&task_id)
                    .await
                    .map_err(|e| (Some(task_id.clone()), e))?;
                let force_stop = (kind == OperationKind::ForceStop).then(|| {
                    if phase.unconfirmed {
                        ForceStopOutcome::Unconfirmed
                    } else {
                        ForceStopOutcome::Confirmed
                    }
                });
                Ok((task_id, force_stop))
            }
            Err(e) => {
                if let Err(ledger_err) = self.ledger.fail_task(&task_id, &e.to_string()).await {
                    warn!(task_id, error = %ledger_err, "failed to record task failure");
                }
                Err((Some(task_id), e))
            }
        }
    }

    /// Bracket one operation phase with its state transitions: transitional
    /// state before remote work, success/failure state after, pid recorded
    /// only on entry to `running`.
    async fn run_transition(
        &self,
        task_id: &str,
        kind: OperationKind,
        instance: &InstanceRecord,
        process: &ProcessRecord,
        update: Option<&ConfigUpdate>,
        machine: &MachineProfile,
    ) -> Result<PhaseOutcome, Error> {
        let plan = state::transition_plan(kind);
        if let Some(plan) = &plan {
            self.persistence
                .update_instance_state(instance.id, plan.transitional)
                .await?;
        }

        let commands = build_commands(kind, instance, process, update, &self.settings);
        let result = self.run_commands(task_id, &commands, instance, machine).await;

        if let Some(plan) = &plan {
            let next = if result.is_ok() { plan.success } else { plan.failure };
            self.persistence.update_instance_state(instance.id, next).await?;
            if next == InstanceState::Running
                && let Ok(phase) = &result
                && let Some(pid) = phase.pid
            {
                self.persistence
                    .update_instance_pid(instance.id, Some(pid))
                    .await?;
            }
            info!(
                instance_id = instance.id,
                %kind,
                state = %next,
                success = result.is_ok(),
                "operation settled"
            );
        }
        result
    }

    /// Restart: the stop plan then the start plan, sequentially, under one
    /// task. Each phase applies its own transitions so a failure lands in
    /// the accurate failed state (`stop_failed` vs `start_failed`).
    async fn run_restart(
        &self,
        task_id: &str,
        instance: &InstanceRecord,
        process: &ProcessRecord,
        machine: &MachineProfile,
    ) -> Result<PhaseOutcome, Error> {
        self.run_transition(task_id, OperationKind::Stop, instance, process, None, machine)
            .await?;

        // Re-read: the stop phase cleared the pid and moved the state.
        let refreshed = self
            .persistence
            .get_instance(instance.id)
            .await?
            .ok_or(Error::InstanceNotFound(instance.id))?;
        self.run_transition(task_id, OperationKind::Start, &refreshed, process, None, machine)
            .await
    }

    async fn run_commands(
        &self,
        task_id: &str,
        commands: &[Box<dyn AgentCommand>],
        instance: &InstanceRecord,
        machine: &MachineProfile,
    ) -> Result<PhaseOutcome, Error> {
        let ctx = CommandContext {
            channel: self.channel.as_ref(),
            machine,
            instance_id: instance.id,
            deploy_path: &instance.deploy_path,
            recorded_pid: instance.pid,
            settings: &self.settings,
        };
        let mut phase = PhaseOutcome {
            pid: None,
            unconfirmed: false,
        };

        for command in commands {
            let step = self.ledger.record_step(task_id, command.step_name()).await?;
            if command.already_done(&ctx).await {
                self.ledger
                    .complete_step(step.id, Some("already satisfied"))
                    .await?;
                continue;
            }
            match command.run(&ctx).await {
                Ok(outcome) => {
                    if outcome.pid.is_some() {
                        phase.pid = outcome.pid;
                    }
                    if outcome.note.as_deref() == Some(FORCE_STOP_UNCONFIRMED_NOTE) {
                        phase.unconfirmed = true;
                    }
                    self.ledger
                        .complete_step(step.id, outcome.note.as_deref())
                        .await?;
                }
                Err(e) => {
                    // Remaining steps are not attempted; the ledger shows
                    // exactly how far execution got.
                    self.ledger.fail_step(step.id, &e.to_string()).await?;
                    return Err(e);
                }
            }
        }
        Ok(phase)
    }
}
