// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for logfleet-core.
//!
//! This module defines the persistence abstraction and backend
//! implementations. The orchestrator is the sole writer of task/step rows and
//! instance states; everything here is a narrow, transactional primitive.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::state::InstanceState;

/// Process record from the persistence layer.
///
/// A process is the named logical unit of log shipping; its configuration
/// documents are the authoritative source instances are synced from.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessRecord {
    /// Database primary key.
    pub id: i64,
    /// Unique process name.
    pub name: String,
    /// Log module this process feeds (resolved by an external collaborator).
    pub module_id: i64,
    /// Pipeline configuration document.
    pub pipeline_config: String,
    /// JVM options document; backfilled asynchronously when absent.
    pub jvm_options: Option<String>,
    /// Agent settings document; backfilled asynchronously when absent.
    pub agent_settings: Option<String>,
    /// Actor that created the process.
    pub created_by: String,
    /// Actor that last mutated the process.
    pub updated_by: String,
    /// When the process was created.
    pub created_at: DateTime<Utc>,
    /// When the process was last mutated.
    pub updated_at: DateTime<Utc>,
}

/// Instance record: one deployment of a process on one machine at one path.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning process.
    pub process_id: i64,
    /// Target machine.
    pub machine_id: i64,
    /// Absolute deploy path; (machine_id, deploy_path) is unique fleet-wide.
    pub deploy_path: String,
    /// Current lifecycle state code.
    pub state: String,
    /// Last known OS pid; present only while the instance is running.
    pub pid: Option<i64>,
    /// Instance-level pipeline config override; shadows the process value.
    pub pipeline_config: Option<String>,
    /// Instance-level JVM options override.
    pub jvm_options: Option<String>,
    /// Instance-level agent settings override.
    pub agent_settings: Option<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Decode the persisted state code.
    pub fn lifecycle_state(&self) -> Result<InstanceState, Error> {
        InstanceState::parse(&self.state).ok_or_else(|| {
            Error::Other(format!(
                "instance {} has unknown state '{}'",
                self.id, self.state
            ))
        })
    }
}

/// Task record: one attempted lifecycle operation against an instance.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRecord {
    /// Task id (UUID string).
    pub id: String,
    /// Instance the task targets. Not a foreign key: ledger history outlives
    /// the instance.
    pub instance_id: i64,
    /// Process the instance belonged to when the task was created.
    pub process_id: i64,
    /// Operation kind code; immutable after creation.
    pub kind: String,
    /// Overall status code (pending/running/completed/failed).
    pub status: String,
    /// Error summary when the task failed.
    pub error: Option<String>,
    /// When the operation was accepted.
    pub created_at: DateTime<Utc>,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Step record: one ordered sub-action of a task.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning task.
    pub task_id: String,
    /// Position within the task, starting at 1.
    pub seq: i32,
    /// Human-readable step name.
    pub name: String,
    /// Status code (running/completed/failed).
    pub status: String,
    /// Failure detail, or an ambiguity note on a completed step.
    pub error_detail: Option<String>,
    /// When the step was recorded (execution began).
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Overall status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Accepted, not yet executing.
    Pending,
    /// Steps are executing.
    Running,
    /// Every step reached a terminal success state.
    Completed,
    /// A step failed; remaining steps were not attempted.
    Failed,
}

impl TaskStatus {
    /// Database string code for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// True for completed/failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Status of one task step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Step is executing. Steps are recorded at execution time, so this is
    /// also the initial status.
    Running,
    /// Step succeeded.
    Completed,
    /// Step failed with a detail message.
    Failed,
}

impl StepStatus {
    /// Database string code for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    /// True for completed/failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// Fields for inserting a new process row.
#[derive(Debug, Clone)]
pub struct NewProcess {
    /// Unique process name.
    pub name: String,
    /// Log module the process feeds.
    pub module_id: i64,
    /// Pipeline configuration document.
    pub pipeline_config: String,
    /// JVM options document, if supplied at creation.
    pub jvm_options: Option<String>,
    /// Agent settings document, if supplied at creation.
    pub agent_settings: Option<String>,
    /// Actor identity for audit columns.
    pub actor: String,
}

/// Fields for inserting a new instance row.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Owning process.
    pub process_id: i64,
    /// Target machine.
    pub machine_id: i64,
    /// Resolved absolute deploy path.
    pub deploy_path: String,
}

/// Persistence interface used by the fleet core.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------

    /// Insert a process row and return it.
    async fn insert_process(&self, new: &NewProcess) -> Result<ProcessRecord, Error>;

    /// Fetch a process by id.
    async fn get_process(&self, id: i64) -> Result<Option<ProcessRecord>, Error>;

    /// Fetch a process by unique name.
    async fn find_process_by_name(&self, name: &str) -> Result<Option<ProcessRecord>, Error>;

    /// Update the process-level configuration documents that are present.
    async fn update_process_config(
        &self,
        id: i64,
        pipeline_config: Option<&str>,
        jvm_options: Option<&str>,
        agent_settings: Option<&str>,
        updated_by: &str,
    ) -> Result<(), Error>;

    /// Delete a process row. Instances must already be gone.
    async fn delete_process(&self, id: i64) -> Result<(), Error>;

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Insert a batch of instance rows in one transaction.
    ///
    /// All-or-nothing: a (machine_id, deploy_path) collision rolls the whole
    /// batch back and surfaces as [`Error::PathConflict`]. The unique
    /// constraint makes the reservation atomic even against concurrent
    /// scale-outs that passed their pre-checks.
    async fn create_instances(&self, rows: &[NewInstance]) -> Result<Vec<InstanceRecord>, Error>;

    /// Fetch an instance by id.
    async fn get_instance(&self, id: i64) -> Result<Option<InstanceRecord>, Error>;

    /// All instances of a process.
    async fn instances_for_process(&self, process_id: i64) -> Result<Vec<InstanceRecord>, Error>;

    /// Find the instance occupying a (machine, deploy path) pair, if any.
    async fn find_instance_by_machine_and_path(
        &self,
        machine_id: i64,
        deploy_path: &str,
    ) -> Result<Option<InstanceRecord>, Error>;

    /// All instances currently recorded as running (for the fleet monitor).
    async fn running_instances(&self) -> Result<Vec<InstanceRecord>, Error>;

    /// Persist a lifecycle state; clears the pid when the new state demands it.
    async fn update_instance_state(&self, id: i64, state: InstanceState) -> Result<(), Error>;

    /// Record or clear the instance's OS pid.
    async fn update_instance_pid(&self, id: i64, pid: Option<i64>) -> Result<(), Error>;

    /// Update the instance-level configuration snapshot fields that are present.
    async fn update_instance_config(
        &self,
        id: i64,
        pipeline_config: Option<&str>,
        jvm_options: Option<&str>,
        agent_settings: Option<&str>,
    ) -> Result<(), Error>;

    /// Delete an instance row, releasing its path reservation. Ledger rows
    /// for the instance are retained.
    async fn delete_instance(&self, id: i64) -> Result<(), Error>;

    // ------------------------------------------------------------------
    // Tasks and steps
    // ------------------------------------------------------------------

    /// Insert a task row.
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), Error>;

    /// Fetch a task by id.
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, Error>;

    /// The non-terminal task for an instance, if one exists.
    async fn find_open_task(&self, instance_id: i64) -> Result<Option<TaskRecord>, Error>;

    /// Update a task's status, stamping `started_at` on the first transition
    /// to running and `ended_at` on the first terminal transition.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), Error>;

    /// All tasks ever recorded for an instance, newest first.
    async fn tasks_for_instance(&self, instance_id: i64) -> Result<Vec<TaskRecord>, Error>;

    /// Append a step to a task with the next sequence index; the step starts
    /// in `running` with its start timestamp set.
    async fn insert_step(&self, task_id: &str, name: &str) -> Result<StepRecord, Error>;

    /// Update a step's status, stamping `ended_at` on terminal transitions.
    async fn update_step_status(
        &self,
        step_id: i64,
        status: StepStatus,
        detail: Option<&str>,
    ) -> Result<(), Error>;

    /// Steps of a task in sequence order.
    async fn steps_for_task(&self, task_id: &str) -> Result<Vec<StepRecord>, Error>;

    /// Administrative cleanup: delete all ledger rows for an instance.
    ///
    /// This is the only path that removes task/step history. Returns the
    /// number of tasks removed.
    async fn purge_tasks_for_instance(&self, instance_id: i64) -> Result<u64, Error>;
}
