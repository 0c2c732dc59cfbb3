// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Library facade consumed by the request layer.
//!
//! [`FleetService`] wires the persistence layer, the remote channel, the
//! machine directory, the orchestrator, the config sync service, and the
//! scaling engine together, and exposes the process-level and per-instance
//! operation contracts. It validates requests, resolves processes to their
//! instances, and delegates; the orchestrator owns all remote execution and
//! state transitions.

use std::sync::Arc;

use tracing::{info, warn};

use crate::channel::{MachineDirectory, RemoteChannel, validate_connection};
use crate::command::ConfigUpdate;
use crate::config::FleetSettings;
use crate::config_sync::ConfigSync;
use crate::deploy::{BatchOutcome, ForceStopOutcome, InstanceOutcome, Orchestrator};
use crate::error::Error;
use crate::ledger::{Ledger, TaskDetail};
use crate::persistence::{
    InstanceRecord, NewProcess, Persistence, ProcessRecord, TaskRecord,
};
use crate::scale::ScalingEngine;
use crate::state::InstanceState;

/// Request to create a process with its first instances.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Unique process name.
    pub name: String,
    /// Log module the process feeds.
    pub module_id: i64,
    /// Machines to deploy the first instances on.
    pub machine_ids: Vec<i64>,
    /// Explicit deploy path, or `None` for generated defaults.
    pub deploy_path: Option<String>,
    /// Pipeline configuration document.
    pub pipeline_config: String,
    /// JVM options; backfilled with defaults when absent.
    pub jvm_options: Option<String>,
    /// Agent settings; backfilled with defaults when absent.
    pub agent_settings: Option<String>,
}

/// Request to scale a process out or in.
#[derive(Debug, Clone, Default)]
pub struct ScaleRequest {
    /// Machines to add instances on.
    pub add_machine_ids: Vec<i64>,
    /// Instances to remove.
    pub remove_instance_ids: Vec<i64>,
    /// Explicit deploy path for added instances.
    pub deploy_path: Option<String>,
    /// Allow removing running instances (stopping them first).
    pub force: bool,
}

/// The fleet orchestration core's public surface.
pub struct FleetService {
    persistence: Arc<dyn Persistence>,
    channel: Arc<dyn RemoteChannel>,
    machines: Arc<dyn MachineDirectory>,
    orchestrator: Orchestrator,
    config_sync: ConfigSync,
    scaling: ScalingEngine,
    settings: Arc<FleetSettings>,
}

impl FleetService {
    /// Wire up the core over its external collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        channel: Arc<dyn RemoteChannel>,
        machines: Arc<dyn MachineDirectory>,
        settings: FleetSettings,
    ) -> Self {
        let settings = Arc::new(settings);
        let orchestrator = Orchestrator::new(
            Arc::clone(&persistence),
            Arc::clone(&channel),
            Arc::clone(&machines),
            Arc::clone(&settings),
        );
        let config_sync = ConfigSync::new(
            Arc::clone(&persistence),
            Arc::clone(&channel),
            Arc::clone(&machines),
            Arc::clone(&settings),
        );
        let scaling = ScalingEngine::new(
            Arc::clone(&persistence),
            Arc::clone(&channel),
            Arc::clone(&machines),
            orchestrator.clone(),
            Arc::clone(&settings),
        );
        Self {
            persistence,
            channel,
            machines,
            orchestrator,
            config_sync,
            scaling,
            settings,
        }
    }

    /// The orchestrator driving remote execution.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// The task/step ledger.
    pub fn ledger(&self) -> &Ledger {
        self.orchestrator.ledger()
    }

    // ------------------------------------------------------------------
    // Process-level operations
    // ------------------------------------------------------------------

    /// Create a process with one instance per requested machine.
    ///
    /// Instance rows are created atomically; remote initialization is fired
    /// and forgotten, and missing JVM/agent-settings defaults are backfilled
    /// in the background. The returned instances are `not_started` (or
    /// still `initializing`) until that work settles.
    pub async fn create_process(
        &self,
        spec: ProcessSpec,
        actor: &str,
    ) -> Result<(ProcessRecord, Vec<InstanceRecord>), Error> {
        if spec.machine_ids.is_empty() {
            return Err(Error::Validation(
                "at least one machine is required".to_string(),
            ));
        }
        if spec.pipeline_config.trim().is_empty() {
            return Err(Error::Validation(
                "pipeline configuration must not be empty".to_string(),
            ));
        }
        if self
            .persistence
            .find_process_by_name(&spec.name)
            .await?
            .is_some()
        {
            return Err(Error::Validation(format!(
                "a process named '{}' already exists",
                spec.name
            )));
        }

        let need_jvm_backfill = spec.jvm_options.is_none();
        let need_settings_backfill = spec.agent_settings.is_none();

        let process = self
            .persistence
            .insert_process(&NewProcess {
                name: spec.name.clone(),
                module_id: spec.module_id,
                pipeline_config: spec.pipeline_config.clone(),
                jvm_options: spec.jvm_options.clone(),
                agent_settings: spec.agent_settings.clone(),
                actor: actor.to_string(),
            })
            .await?;

        let instances = match self
            .scaling
            .provision_instances(&process, &spec.machine_ids, spec.deploy_path.as_deref())
            .await
        {
            Ok(instances) => instances,
            Err(e) => {
                // Creation is all-or-nothing: a provisioning failure takes
                // the fresh process row back out.
                if let Err(cleanup) = self.persistence.delete_process(process.id).await {
                    warn!(process_id = process.id, error = %cleanup, "failed to remove process after provisioning error");
                }
                return Err(e);
            }
        };

        // Fire-and-forget: provisioning the machines continues in the
        // background while the caller gets its rows back.
        let orchestrator = self.orchestrator.clone();
        let init_process = process.clone();
        let init_instances = instances.clone();
        tokio::spawn(async move {
            let outcome = orchestrator
                .initialize_instances(&init_instances, &init_process)
                .await;
            if !outcome.all_succeeded() {
                warn!(
                    process_id = init_process.id,
                    "initialization finished with failures"
                );
            }
        });

        if need_jvm_backfill || need_settings_backfill {
            self.config_sync
                .spawn_backfill(process.id, need_jvm_backfill, need_settings_backfill);
        }

        info!(process_id = process.id, instances = instances.len(), "process created");
        Ok((process, instances))
    }

    /// Delete a process: directories (bounded wait), then instance rows,
    /// then the process row. Task history for the instances is retained.
    pub async fn delete_process(&self, process_id: i64) -> Result<(), Error> {
        let process = self.require_process(process_id).await?;
        let instances = self.persistence.instances_for_process(process_id).await?;

        let running = instances
            .iter()
            .filter(|i| {
                i.lifecycle_state()
                    .map(|s| s.is_running_family())
                    .unwrap_or(false)
            })
            .count();
        if running > 0 {
            return Err(Error::Validation(format!(
                "process {process_id} has {running} running instance(s); stop them before deleting"
            )));
        }

        if !instances.is_empty() {
            let cleanup = self
                .orchestrator
                .delete_instances_directory(instances.clone());
            match cleanup
                .wait(self.settings().directory_delete_timeout)
                .await
            {
                Some(true) => {}
                Some(false) => warn!(
                    process_id,
                    "some deploy directories survived; database cleanup proceeds"
                ),
                None => warn!(
                    process_id,
                    "directory removal still running; database cleanup proceeds"
                ),
            }
            for instance in &instances {
                self.persistence.delete_instance(instance.id).await?;
            }
        }

        self.persistence.delete_process(process.id).await?;
        info!(process_id, "process deleted; ledger history retained");
        Ok(())
    }

    /// Start every startable instance of a process.
    pub async fn start_process(&self, process_id: i64) -> Result<BatchOutcome, Error> {
        let process = self.require_process(process_id).await?;
        let startable = self
            .instances_in_states(
                process_id,
                &[InstanceState::NotStarted, InstanceState::StartFailed],
            )
            .await?;
        if startable.is_empty() {
            return Err(Error::Validation(format!(
                "process {process_id} has no startable instances"
            )));
        }
        Ok(self.orchestrator.start_instances(&startable, &process).await)
    }

    /// Stop every stoppable instance of a process.
    pub async fn stop_process(&self, process_id: i64) -> Result<BatchOutcome, Error> {
        self.require_process(process_id).await?;
        let stoppable = self
            .instances_in_states(
                process_id,
                &[InstanceState::Running, InstanceState::StopFailed],
            )
            .await?;
        if stoppable.is_empty() {
            return Err(Error::Validation(format!(
                "process {process_id} has no stoppable instances"
            )));
        }
        Ok(self.orchestrator.stop_instances(&stoppable).await)
    }

    /// Force-stop every instance of a process.
    pub async fn force_stop_process(&self, process_id: i64) -> Result<BatchOutcome, Error> {
        self.require_process(process_id).await?;
        let instances = self.persistence.instances_for_process(process_id).await?;
        if instances.is_empty() {
            return Err(Error::Validation(format!(
                "process {process_id} has no instances"
            )));
        }
        Ok(self.orchestrator.force_stop_instances(&instances).await)
    }

    /// Update configuration content for a process and push it to the
    /// targeted instances (all instances when `targets` is `None`).
    ///
    /// Refused as a validation error — database and machines untouched —
    /// while any targeted instance is running or transitioning.
    pub async fn update_config(
        &self,
        process_id: i64,
        update: ConfigUpdate,
        targets: Option<Vec<i64>>,
        actor: &str,
    ) -> Result<BatchOutcome, Error> {
        if update.is_empty() {
            return Err(Error::Validation(
                "at least one configuration document must be provided".to_string(),
            ));
        }
        self.require_process(process_id).await?;

        let target_instances = self
            .config_sync
            .ensure_config_mutable(process_id, targets.as_deref())
            .await?;

        // Authoritative copy first, snapshots second, machines last.
        self.persistence
            .update_process_config(
                process_id,
                update.pipeline_config.as_deref(),
                update.jvm_options.as_deref(),
                update.agent_settings.as_deref(),
                actor,
            )
            .await?;
        self.config_sync
            .propagate_to_instances(process_id, &update)
            .await?;

        Ok(self
            .orchestrator
            .update_instances_config(&target_instances, &update)
            .await)
    }

    /// Re-write the authoritative configuration to the targeted instances
    /// and verify the remote content matches the database content.
    pub async fn refresh_config(
        &self,
        process_id: i64,
        targets: Option<Vec<i64>>,
    ) -> Result<BatchOutcome, Error> {
        let process = self.require_process(process_id).await?;
        if process.pipeline_config.trim().is_empty() {
            return Err(Error::Validation(format!(
                "process {process_id} has no pipeline configuration to refresh"
            )));
        }
        let target_instances = self
            .config_sync
            .ensure_config_mutable(process_id, targets.as_deref())
            .await?;
        Ok(self
            .orchestrator
            .refresh_instances_config(&target_instances, &process)
            .await)
    }

    /// Scale a process out (add machines) or in (remove instances).
    pub async fn scale_process(
        &self,
        process_id: i64,
        request: ScaleRequest,
    ) -> Result<Vec<InstanceRecord>, Error> {
        let process = self.require_process(process_id).await?;
        let out = !request.add_machine_ids.is_empty();
        let in_ = !request.remove_instance_ids.is_empty();
        match (out, in_) {
            (true, false) => {
                self.scaling
                    .scale_out(
                        &process,
                        &request.add_machine_ids,
                        request.deploy_path.as_deref(),
                    )
                    .await
            }
            (false, true) => {
                self.scaling
                    .scale_in(&process, &request.remove_instance_ids, request.force)
                    .await?;
                Ok(Vec::new())
            }
            _ => Err(Error::Validation(
                "a scale request must either add machines or remove instances".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Per-instance operations
    // ------------------------------------------------------------------

    /// Start one instance, re-validating its state precondition.
    pub async fn start_instance(&self, instance_id: i64) -> Result<InstanceOutcome, Error> {
        let instance = self.require_instance(instance_id).await?;
        let process = self.require_process(instance.process_id).await?;
        let machine = self.machines.machine(instance.machine_id).await?;
        validate_connection(self.channel.as_ref(), &machine).await?;

        let batch = self
            .orchestrator
            .start_instances(std::slice::from_ref(&instance), &process)
            .await;
        Self::single_outcome(batch)
    }

    /// Gracefully stop one instance.
    pub async fn stop_instance(&self, instance_id: i64) -> Result<InstanceOutcome, Error> {
        let instance = self.require_instance(instance_id).await?;
        let batch = self
            .orchestrator
            .stop_instances(std::slice::from_ref(&instance))
            .await;
        Self::single_outcome(batch)
    }

    /// Force-stop one instance; legal from any state.
    pub async fn force_stop_instance(&self, instance_id: i64) -> Result<ForceStopOutcome, Error> {
        let instance = self.require_instance(instance_id).await?;
        let batch = self
            .orchestrator
            .force_stop_instances(std::slice::from_ref(&instance))
            .await;
        let outcome = Self::single_outcome(batch)?;
        Ok(outcome.force_stop.unwrap_or(ForceStopOutcome::Confirmed))
    }

    /// Re-provision one instance's directory and configuration.
    pub async fn reinitialize_instance(&self, instance_id: i64) -> Result<InstanceOutcome, Error> {
        let instance = self.require_instance(instance_id).await?;
        let process = self.require_process(instance.process_id).await?;
        let batch = self
            .orchestrator
            .initialize_instances(std::slice::from_ref(&instance), &process)
            .await;
        Self::single_outcome(batch)
    }

    /// Stop then start one instance under a single task.
    pub async fn restart_instance(&self, instance_id: i64) -> Result<InstanceOutcome, Error> {
        self.require_instance(instance_id).await?;
        let outcome = self.orchestrator.restart_instance(instance_id).await;
        let InstanceOutcome {
            instance_id,
            task_id,
            force_stop,
            result,
        } = outcome;
        result?;
        Ok(InstanceOutcome {
            instance_id,
            task_id,
            force_stop,
            result: Ok(()),
        })
    }

    // ------------------------------------------------------------------
    // Queries and administrative cleanup
    // ------------------------------------------------------------------

    /// A process by id.
    pub async fn get_process(&self, process_id: i64) -> Result<ProcessRecord, Error> {
        self.require_process(process_id).await
    }

    /// All instances of a process.
    pub async fn process_instances(&self, process_id: i64) -> Result<Vec<InstanceRecord>, Error> {
        self.require_process(process_id).await?;
        self.persistence.instances_for_process(process_id).await
    }

    /// A task with its ordered steps and counts.
    pub async fn task_detail(&self, task_id: &str) -> Result<TaskDetail, Error> {
        self.ledger().task_detail(task_id).await
    }

    /// Every task ever recorded for an instance, even a deleted one.
    pub async fn instance_history(&self, instance_id: i64) -> Result<Vec<TaskRecord>, Error> {
        self.ledger().instance_history(instance_id).await
    }

    /// Administrative ledger cleanup for one instance.
    pub async fn purge_instance_history(&self, instance_id: i64) -> Result<u64, Error> {
        self.ledger().purge_instance_history(instance_id).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    async fn require_process(&self, process_id: i64) -> Result<ProcessRecord, Error> {
        self.persistence
            .get_process(process_id)
            .await?
            .ok_or(Error::ProcessNotFound(process_id))
    }

    async fn require_instance(&self, instance_id: i64) -> Result<InstanceRecord, Error> {
        self.persistence
            .get_instance(instance_id)
            .await?
            .ok_or(Error::InstanceNotFound(instance_id))
    }

    async fn instances_in_states(
        &self,
        process_id: i64,
        states: &[InstanceState],
    ) -> Result<Vec<InstanceRecord>, Error> {
        let instances = self.persistence.instances_for_process(process_id).await?;
        Ok(instances
            .into_iter()
            .filter(|i| {
                i.lifecycle_state()
                    .map(|s| states.contains(&s))
                    .unwrap_or(false)
            })
            .collect())
    }

    fn single_outcome(mut batch: BatchOutcome) -> Result<InstanceOutcome, Error> {
        let outcome = batch
            .outcomes
            .pop()
            .ok_or_else(|| Error::Other("empty batch outcome".to_string()))?;
        let InstanceOutcome {
            instance_id,
            task_id,
            force_stop,
            result,
        } = outcome;
        result?;
        Ok(InstanceOutcome {
            instance_id,
            task_id,
            force_stop,
            result: Ok(()),
        })
    }
}
