// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scaling engine: adds instances to a process or removes them.
//!
//! Scale-out is all-or-nothing up front: every resolved (machine, path) pair
//! is checked for collisions before a single row or remote action exists,
//! and the batch insert sits behind the unique constraint so concurrent
//! scale-outs cannot slip past each other. Remote provisioning is delegated
//! back to the deployment orchestrator.
//!
//! Scale-in never leaves a process with zero instances, refuses running
//! instances unless forced, and always retains ledger history.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::{MachineDirectory, MachineProfile, RemoteChannel, validate_connection};
use crate::config::FleetSettings;
use crate::deploy::Orchestrator;
use crate::error::Error;
use crate::persistence::{InstanceRecord, NewInstance, Persistence, ProcessRecord};

/// Adds and removes instances of a process.
pub struct ScalingEngine {
    persistence: Arc<dyn Persistence>,
    channel: Arc<dyn RemoteChannel>,
    machines: Arc<dyn MachineDirectory>,
    orchestrator: Orchestrator,
    settings: Arc<FleetSettings>,
}

impl ScalingEngine {
    /// Create a scaling engine over the given collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        channel: Arc<dyn RemoteChannel>,
        machines: Arc<dyn MachineDirectory>,
        orchestrator: Orchestrator,
        settings: Arc<FleetSettings>,
    ) -> Self {
        Self {
            persistence,
            channel,
            machines,
            orchestrator,
            settings,
        }
    }

    /// Resolve a deploy path for an instance on `machine`.
    ///
    /// An explicit path is used verbatim. Generated defaults are unique per
    /// machine: the base directory (resolved under the remote user's home
    /// when relative) plus a fresh suffix.
    pub fn resolve_deploy_path(&self, machine: &MachineProfile, explicit: Option<&str>) -> String {
        if let Some(path) = explicit
            && !path.trim().is_empty()
        {
            return path.trim().to_string();
        }
        let base = &self.settings.deploy_base_dir;
        let base = if base.starts_with('/') {
            base.clone()
        } else {
            format!("/home/{}/{}", machine.username, base)
        };
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{base}/agent-{suffix}")
    }

    /// Validate machines, resolve deploy paths, and create instance rows for
    /// a batch of target machines — all-or-nothing.
    ///
    /// No remote provisioning happens here; callers hand the created rows to
    /// the orchestrator.
    pub async fn provision_instances(
        &self,
        process: &ProcessRecord,
        machine_ids: &[i64],
        deploy_path: Option<&str>,
    ) -> Result<Vec<InstanceRecord>, Error> {
        if machine_ids.is_empty() {
            return Err(Error::Validation(
                "at least one target machine is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for &id in machine_ids {
            if !seen.insert(id) {
                return Err(Error::Validation(format!(
                    "machine {id} is listed more than once"
                )));
            }
        }

        // Resolve and connection-check every machine before touching the
        // database: a detectable, avoidable conflict must not produce a
        // partial scale-out.
        let mut rows = Vec::with_capacity(machine_ids.len());
        for &machine_id in machine_ids {
            let machine = self.machines.machine(machine_id).await?;
            validate_connection(self.channel.as_ref(), &machine).await?;

            let path = self.resolve_deploy_path(&machine, deploy_path);
            if let Some(holder) = self
                .persistence
                .find_instance_by_machine_and_path(machine_id, &path)
                .await?
            {
                return Err(Error::PathConflict {
                    machine_id,
                    deploy_path: path,
                    instance_id: holder.id,
                });
            }
            rows.push(NewInstance {
                process_id: process.id,
                machine_id,
                deploy_path: path,
            });
        }

        // The insert is transactional and the unique constraint backs the
        // pre-check, so a concurrent scale-out racing us still cannot create
        // a colliding row.
        let created = self.persistence.create_instances(&rows).await?;
        info!(
            process_id = process.id,
            count = created.len(),
            "instances provisioned"
        );
        Ok(created)
    }

    /// Add instances of `process` on the given machines and kick off their
    /// remote initialization in the background.
    pub async fn scale_out(
        &self,
        process: &ProcessRecord,
        machine_ids: &[i64],
        deploy_path: Option<&str>,
    ) -> Result<Vec<InstanceRecord>, Error> {
        let created = self
            .provision_instances(process, machine_ids, deploy_path)
            .await?;

        let orchestrator = self.orchestrator.clone();
        let process = process.clone();
        let instances = created.clone();
        tokio::spawn(async move {
            let outcome = orchestrator
                .initialize_scaled_instances(&instances, &process)
                .await;
            if !outcome.all_succeeded() {
                warn!(
                    process_id = process.id,
                    "scale-out initialization finished with failures"
                );
            }
        });

        Ok(created)
    }

    /// Remove the given instances from `process`.
    ///
    /// Rejected outright — with no side effects — when it would remove the
    /// last instance, or (non-forced) when any target is in a running-family
    /// state. Forced scale-in stops running targets first (best-effort,
    /// bounded), then removes directories and rows. Ledger history stays.
    pub async fn scale_in(
        &self,
        process: &ProcessRecord,
        instance_ids: &[i64],
        force: bool,
    ) -> Result<(), Error> {
        if instance_ids.is_empty() {
            return Err(Error::Validation(
                "at least one instance to remove is required".to_string(),
            ));
        }

        let all = self.persistence.instances_for_process(process.id).await?;
        if all.len() <= instance_ids.len() {
            return Err(Error::Validation(format!(
                "a process must retain at least one instance: {} exist, cannot remove {}",
                all.len(),
                instance_ids.len()
            )));
        }

        let mut targets = Vec::with_capacity(instance_ids.len());
        for &id in instance_ids {
            let instance = all
                .iter()
                .find(|i| i.id == id)
                .cloned()
                .ok_or(Error::InstanceNotFound(id))?;
            targets.push(instance);
        }

        let running: Vec<InstanceRecord> = targets
            .iter()
            .filter(|i| {
                i.lifecycle_state()
                    .map(|s| s.is_running_family())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if !force && !running.is_empty() {
            return Err(Error::Validation(format!(
                "{} targeted instance(s) are running; stop them first or force the scale-in",
                running.len()
            )));
        }

        if !running.is_empty() {
            info!(
                process_id = process.id,
                count = running.len(),
                "forced scale-in: stopping running instances"
            );
            let stop = self.orchestrator.stop_instances(&running).await;
            for outcome in &stop.outcomes {
                if outcome.result.is_err() {
                    // Graceful stop did not take; force the way out so the
                    // row removal below never strands a live process.
                    let still_running: Vec<InstanceRecord> = running
                        .iter()
                        .filter(|i| i.id == outcome.instance_id)
                        .cloned()
                        .collect();
                    self.orchestrator.force_stop_instances(&still_running).await;
                }
            }
        }

        let cleanup = self
            .orchestrator
            .delete_instances_directory(targets.clone());
        match cleanup.wait(self.settings.directory_delete_timeout).await {
            Some(true) => {}
            Some(false) => warn!(
                process_id = process.id,
                "some deploy directories could not be removed; continuing with row cleanup"
            ),
            None => warn!(
                process_id = process.id,
                "directory removal still running; continuing with row cleanup"
            ),
        }

        for instance in &targets {
            self.persistence.delete_instance(instance.id).await?;
            info!(
                process_id = process.id,
                instance_id = instance.id,
                "instance removed; ledger history retained"
            );
        }
        Ok(())
    }
}
