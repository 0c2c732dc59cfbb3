// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting dead agent processes.
//!
//! Instances recorded as running whose process no longer exists on the
//! machine are moved to `start_failed` with their pid cleared. This keeps
//! the persisted state close enough to reality to drive safe retries when:
//! - the agent crashes between operator actions
//! - the process is killed out-of-band on the machine
//! - a machine reboots
//!
//! The monitor only reconciles drift it can prove; a machine it cannot reach
//! is left alone rather than guessed at.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::channel::{MachineDirectory, RemoteChannel};
use crate::error::Error;
use crate::persistence::{InstanceRecord, Persistence};
use crate::state::InstanceState;

/// Configuration for the fleet monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often to sweep the running instances.
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Background worker reconciling recorded state with remote reality.
pub struct FleetMonitor {
    persistence: Arc<dyn Persistence>,
    channel: Arc<dyn RemoteChannel>,
    machines: Arc<dyn MachineDirectory>,
    config: MonitorConfig,
    shutdown: Arc<Notify>,
}

impl FleetMonitor {
    /// Create a monitor over the given collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        channel: Arc<dyn RemoteChannel>,
        machines: Arc<dyn MachineDirectory>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            persistence,
            channel,
            machines,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop the monitor loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Spawn the monitor loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.config.poll_interval, "fleet monitor started");
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        info!("fleet monitor stopping");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "monitor sweep failed");
                        }
                    }
                }
            }
        })
    }

    /// One reconciliation pass over all running instances.
    pub async fn sweep(&self) -> Result<(), Error> {
        for instance in self.persistence.running_instances().await? {
            match self.probe(&instance).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        instance_id = instance.id,
                        pid = ?instance.pid,
                        "recorded running but process is gone; marking start_failed"
                    );
                    self.persistence
                        .update_instance_state(instance.id, InstanceState::StartFailed)
                        .await?;
                    self.persistence
                        .update_instance_pid(instance.id, None)
                        .await?;
                }
                Err(e) => {
                    // Unreachable machine: no verdict, no state change.
                    debug!(instance_id = instance.id, error = %e, "liveness probe inconclusive");
                }
            }
        }
        Ok(())
    }

    async fn probe(&self, instance: &InstanceRecord) -> Result<bool, Error> {
        let Some(pid) = instance.pid else {
            // Running without a pid is drift by definition.
            return Ok(false);
        };
        let machine = self.machines.machine(instance.machine_id).await?;
        let output = self
            .channel
            .exec(&machine, &format!("ps -p {pid} > /dev/null 2>&1; echo $?"))
            .await?;
        Ok(output.stdout.trim() == "0")
    }
}
