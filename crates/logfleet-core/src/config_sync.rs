// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration sync service.
//!
//! Two jobs: backfill missing process-level defaults asynchronously after
//! creation, and guard explicit configuration updates/refreshes with the
//! states in which configuration may be mutated at all.
//!
//! The actual file writes go through the command builder and orchestrator;
//! this module owns the database side (process row, per-instance snapshots)
//! and the validation rules.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::{MachineDirectory, RemoteChannel};
use crate::command::{ConfigUpdate, agent_settings_file, jvm_options_file};
use crate::config::FleetSettings;
use crate::error::Error;
use crate::persistence::{InstanceRecord, Persistence};
use crate::state::{self, InstanceState, OperationKind};

/// JVM options applied when a process is created without any.
pub const DEFAULT_JVM_OPTIONS: &str = "-Xms1g\n-Xmx1g\n-XX:+UseG1GC\n-XX:+HeapDumpOnOutOfMemoryError\n";

/// Agent settings applied when a process is created without any.
pub const DEFAULT_AGENT_SETTINGS: &str =
    "pipeline.workers: 2\npipeline.batch.size: 125\nqueue.type: memory\nlog.level: info\n";

/// Actor recorded on rows mutated by the backfill worker.
const BACKFILL_ACTOR: &str = "system";

/// Reconciles process-level configuration with machines and the database.
#[derive(Clone)]
pub struct ConfigSync {
    persistence: Arc<dyn Persistence>,
    channel: Arc<dyn RemoteChannel>,
    machines: Arc<dyn MachineDirectory>,
    settings: Arc<FleetSettings>,
}

impl ConfigSync {
    /// Create a config sync service over the given collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        channel: Arc<dyn RemoteChannel>,
        machines: Arc<dyn MachineDirectory>,
        settings: Arc<FleetSettings>,
    ) -> Self {
        Self {
            persistence,
            channel,
            machines,
            settings,
        }
    }

    /// Backfill missing JVM options / agent settings for a process without
    /// blocking the caller.
    ///
    /// Waits (bounded) for the process's instances to finish initializing,
    /// reads the defaults the installed agent package ships from the first
    /// successfully initialized instance, and falls back to built-in
    /// defaults when no instance can serve them. The resolved documents are
    /// written to the process row and propagated to every instance snapshot.
    pub fn spawn_backfill(
        &self,
        process_id: i64,
        need_jvm_options: bool,
        need_agent_settings: bool,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this
                .run_backfill(process_id, need_jvm_options, need_agent_settings)
                .await
            {
                warn!(process_id, error = %e, "configuration backfill failed");
            }
        })
    }

    async fn run_backfill(
        &self,
        process_id: i64,
        need_jvm_options: bool,
        need_agent_settings: bool,
    ) -> Result<(), Error> {
        if !need_jvm_options && !need_agent_settings {
            return Ok(());
        }

        let source = self.wait_for_initialized_instance(process_id).await;

        let jvm_options = if need_jvm_options {
            Some(match &source {
                Some(instance) => self
                    .read_remote_default(instance, &jvm_options_file(&instance.deploy_path))
                    .await
                    .unwrap_or_else(|| DEFAULT_JVM_OPTIONS.to_string()),
                None => DEFAULT_JVM_OPTIONS.to_string(),
            })
        } else {
            None
        };
        let agent_settings = if need_agent_settings {
            Some(match &source {
                Some(instance) => self
                    .read_remote_default(instance, &agent_settings_file(&instance.deploy_path))
                    .await
                    .unwrap_or_else(|| DEFAULT_AGENT_SETTINGS.to_string()),
                None => DEFAULT_AGENT_SETTINGS.to_string(),
            })
        } else {
            None
        };

        self.persistence
            .update_process_config(
                process_id,
                None,
                jvm_options.as_deref(),
                agent_settings.as_deref(),
                BACKFILL_ACTOR,
            )
            .await?;

        // Propagate to instances created before the backfill resolved.
        for instance in self.persistence.instances_for_process(process_id).await? {
            self.persistence
                .update_instance_config(
                    instance.id,
                    None,
                    jvm_options.as_deref(),
                    agent_settings.as_deref(),
                )
                .await?;
        }

        info!(
            process_id,
            backfilled_jvm = need_jvm_options,
            backfilled_settings = need_agent_settings,
            "configuration defaults backfilled"
        );
        Ok(())
    }

    /// Wait (bounded) until every instance of the process has an initialize
    /// attempt on the ledger that reached a terminal status, then pick a
    /// successfully initialized instance.
    ///
    /// The ledger is the signal here, not the state column: freshly created
    /// rows sit in `not_started` before initialization has even begun, and
    /// the backfill must not read a machine nothing was written to yet.
    async fn wait_for_initialized_instance(&self, process_id: i64) -> Option<InstanceRecord> {
        let deadline = tokio::time::Instant::now() + self.settings.backfill_timeout;
        loop {
            match self.settled_source_instance(process_id).await {
                Ok(Some(source)) => return Some(source),
                Ok(None) => {}
                Err(e) => debug!(process_id, error = %e, "backfill poll failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    process_id,
                    "timed out waiting for instances to initialize; using built-in defaults"
                );
                return None;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn settled_source_instance(
        &self,
        process_id: i64,
    ) -> Result<Option<InstanceRecord>, Error> {
        let instances = self.persistence.instances_for_process(process_id).await?;
        if instances.is_empty() {
            return Ok(None);
        }
        for instance in &instances {
            let attempted = self
                .persistence
                .tasks_for_instance(instance.id)
                .await?
                .iter()
                .any(|t| {
                    (t.kind == "initialize" || t.kind == "scale_out_init")
                        && (t.status == "completed" || t.status == "failed")
                });
            if !attempted {
                return Ok(None);
            }
        }
        Ok(instances
            .into_iter()
            .find(|i| i.state == InstanceState::NotStarted.as_str()))
    }

    async fn read_remote_default(&self, instance: &InstanceRecord, path: &str) -> Option<String> {
        let machine = match self.machines.machine(instance.machine_id).await {
            Ok(machine) => machine,
            Err(e) => {
                debug!(instance_id = instance.id, error = %e, "backfill machine lookup failed");
                return None;
            }
        };
        match self.channel.read_file(&machine, path).await {
            Ok(bytes) if !bytes.is_empty() => String::from_utf8(bytes).ok(),
            Ok(_) => None,
            Err(e) => {
                debug!(instance_id = instance.id, path, error = %e, "no remote default to sync");
                None
            }
        }
    }

    /// Validate that configuration may be mutated for the targeted instances
    /// and return them.
    ///
    /// `targets` of `None` means every instance of the process. Instances in
    /// a running or transitioning state refuse configuration mutation as a
    /// business error, before any database or remote write.
    pub async fn ensure_config_mutable(
        &self,
        process_id: i64,
        targets: Option<&[i64]>,
    ) -> Result<Vec<InstanceRecord>, Error> {
        let instances = match targets {
            None => self.persistence.instances_for_process(process_id).await?,
            Some(ids) => {
                let mut resolved = Vec::with_capacity(ids.len());
                for &id in ids {
                    let instance = self
                        .persistence
                        .get_instance(id)
                        .await?
                        .ok_or(Error::InstanceNotFound(id))?;
                    if instance.process_id != process_id {
                        return Err(Error::Validation(format!(
                            "instance {id} does not belong to process {process_id}"
                        )));
                    }
                    resolved.push(instance);
                }
                resolved
            }
        };

        for instance in &instances {
            let current = instance.lifecycle_state()?;
            state::ensure_allowed(instance.id, current, OperationKind::UpdateConfig)?;
        }
        Ok(instances)
    }

    /// Write the provided documents into every instance snapshot of the
    /// process.
    ///
    /// Snapshots record the configuration each instance is *supposed* to
    /// run; the remote files may lag until the next update/refresh reaches
    /// that instance.
    pub async fn propagate_to_instances(
        &self,
        process_id: i64,
        update: &ConfigUpdate,
    ) -> Result<(), Error> {
        for instance in self.persistence.instances_for_process(process_id).await? {
            self.persistence
                .update_instance_config(
                    instance.id,
                    update.pipeline_config.as_deref(),
                    update.jvm_options.as_deref(),
                    update.agent_settings.as_deref(),
                )
                .await?;
        }
        Ok(())
    }
}
