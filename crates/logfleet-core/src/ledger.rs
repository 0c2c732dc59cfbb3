// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable task/step ledger.
//!
//! Every lifecycle operation issued against an instance is recorded as a
//! task; every remote sub-action as an ordered step. Steps are recorded at
//! the moment they begin executing and never reordered. At most one
//! non-terminal task may exist per instance.
//!
//! Ledger rows deliberately outlive the instances they describe: deleting an
//! instance (or its process) removes the live resource, not the record that
//! it existed. [`Ledger::purge_instance_history`] is the only deletion path.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Error;
use crate::persistence::{Persistence, StepRecord, StepStatus, TaskRecord, TaskStatus};
use crate::state::OperationKind;

/// Durable record keeper for lifecycle operations.
#[derive(Clone)]
pub struct Ledger {
    persistence: Arc<dyn Persistence>,
}

/// A task with its ordered steps and summary counts.
#[derive(Debug, Clone)]
pub struct TaskDetail {
    /// The task row.
    pub task: TaskRecord,
    /// Steps in execution order.
    pub steps: Vec<StepRecord>,
    /// Number of steps that completed.
    pub completed_steps: usize,
    /// Number of steps that failed.
    pub failed_steps: usize,
}

impl Ledger {
    /// Create a ledger over the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Accept a new operation for an instance.
    ///
    /// Fails with [`Error::TaskInFlight`] when a non-terminal task already
    /// exists for the instance: one task per instance at a time is the core
    /// device keeping concurrent operations from racing on shared state.
    pub async fn begin_task(
        &self,
        instance_id: i64,
        process_id: i64,
        kind: OperationKind,
    ) -> Result<TaskRecord, Error> {
        if let Some(open) = self.persistence.find_open_task(instance_id).await? {
            return Err(Error::TaskInFlight {
                instance_id,
                task_id: open.id,
            });
        }

        let task = TaskRecord {
            id: Uuid::new_v4().to_string(),
            instance_id,
            process_id,
            kind: kind.as_str().to_string(),
            status: TaskStatus::Pending.as_str().to_string(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        self.persistence.insert_task(&task).await?;

        info!(task_id = %task.id, instance_id, %kind, "task accepted");
        Ok(task)
    }

    /// Mark a task as executing; stamps its start time.
    pub async fn start_task(&self, task_id: &str) -> Result<(), Error> {
        self.persistence
            .update_task_status(task_id, TaskStatus::Running, None)
            .await
    }

    /// Record the next step of a task as it begins executing.
    pub async fn record_step(&self, task_id: &str, name: &str) -> Result<StepRecord, Error> {
        let step = self.persistence.insert_step(task_id, name).await?;
        debug!(task_id, seq = step.seq, name, "step started");
        Ok(step)
    }

    /// Mark a step as completed, optionally with a detail note (e.g. the
    /// ambiguity note on an unconfirmed force-stop).
    pub async fn complete_step(&self, step_id: i64, detail: Option<&str>) -> Result<(), Error> {
        self.persistence
            .update_step_status(step_id, StepStatus::Completed, detail)
            .await
    }

    /// Mark a step as failed with its error detail.
    pub async fn fail_step(&self, step_id: i64, detail: &str) -> Result<(), Error> {
        self.persistence
            .update_step_status(step_id, StepStatus::Failed, Some(detail))
            .await
    }

    /// Mark a task as completed; stamps its end time.
    pub async fn complete_task(&self, task_id: &str) -> Result<(), Error> {
        info!(task_id, "task completed");
        self.persistence
            .update_task_status(task_id, TaskStatus::Completed, None)
            .await
    }

    /// Mark a task as failed with an error summary; stamps its end time.
    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<(), Error> {
        info!(task_id, error, "task failed");
        self.persistence
            .update_task_status(task_id, TaskStatus::Failed, Some(error))
            .await
    }

    /// A task with its steps and summary counts, for operator inspection.
    pub async fn task_detail(&self, task_id: &str) -> Result<TaskDetail, Error> {
        let task = self
            .persistence
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let steps = self.persistence.steps_for_task(task_id).await?;
        let completed_steps = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed.as_str())
            .count();
        let failed_steps = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed.as_str())
            .count();
        Ok(TaskDetail {
            task,
            steps,
            completed_steps,
            failed_steps,
        })
    }

    /// Every task ever recorded for an instance, newest first. Works for
    /// instances that no longer exist.
    pub async fn instance_history(&self, instance_id: i64) -> Result<Vec<TaskRecord>, Error> {
        self.persistence.tasks_for_instance(instance_id).await
    }

    /// Administrative cleanup: erase all ledger history for an instance.
    pub async fn purge_instance_history(&self, instance_id: i64) -> Result<u64, Error> {
        let purged = self.persistence.purge_tasks_for_instance(instance_id).await?;
        info!(instance_id, purged, "ledger history purged");
        Ok(purged)
    }
}
