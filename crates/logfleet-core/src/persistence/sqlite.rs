// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::Error;
use crate::state::InstanceState;

use super::{
    InstanceRecord, NewInstance, NewProcess, Persistence, ProcessRecord, StepRecord, StepStatus,
    TaskRecord, TaskStatus,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// with sensible defaults, and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Other(format!("failed to create directory {parent:?}: {e}")))?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| Error::Other(format!("failed to run migrations: {e}")))?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_process(&self, new: &NewProcess) -> Result<ProcessRecord, Error> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, ProcessRecord>(
            r#"
            INSERT INTO processes (name, module_id, pipeline_config, jvm_options, agent_settings,
                                   created_by, updated_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(new.module_id)
        .bind(&new.pipeline_config)
        .bind(&new.jvm_options)
        .bind(&new.agent_settings)
        .bind(&new.actor)
        .bind(&new.actor)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_process(&self, id: i64) -> Result<Option<ProcessRecord>, Error> {
        let record =
            sqlx::query_as::<_, ProcessRecord>("SELECT * FROM processes WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn find_process_by_name(&self, name: &str) -> Result<Option<ProcessRecord>, Error> {
        let record =
            sqlx::query_as::<_, ProcessRecord>("SELECT * FROM processes WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn update_process_config(
        &self,
        id: i64,
        pipeline_config: Option<&str>,
        jvm_options: Option<&str>,
        agent_settings: Option<&str>,
        updated_by: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE processes
            SET pipeline_config = COALESCE(?, pipeline_config),
                jvm_options = COALESCE(?, jvm_options),
                agent_settings = COALESCE(?, agent_settings),
                updated_by = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(pipeline_config)
        .bind(jvm_options)
        .bind(agent_settings)
        .bind(updated_by)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_process(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM processes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_instances(&self, rows: &[NewInstance]) -> Result<Vec<InstanceRecord>, Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(rows.len());

        for row in rows {
            let result = sqlx::query_as::<_, InstanceRecord>(
                r#"
                INSERT INTO instances (process_id, machine_id, deploy_path, state,
                                       created_at, updated_at)
                VALUES (?, ?, ?, 'not_started', ?, ?)
                RETURNING *
                "#,
            )
            .bind(row.process_id)
            .bind(row.machine_id)
            .bind(&row.deploy_path)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await;

            match result {
                Ok(record) => created.push(record),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    tx.rollback().await?;
                    let holder = self
                        .find_instance_by_machine_and_path(row.machine_id, &row.deploy_path)
                        .await?;
                    return Err(Error::PathConflict {
                        machine_id: row.machine_id,
                        deploy_path: row.deploy_path.clone(),
                        instance_id: holder.map(|i| i.id).unwrap_or_default(),
                    });
                }
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_instance(&self, id: i64) -> Result<Option<InstanceRecord>, Error> {
        let record =
            sqlx::query_as::<_, InstanceRecord>("SELECT * FROM instances WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn instances_for_process(&self, process_id: i64) -> Result<Vec<InstanceRecord>, Error> {
        let records = sqlx::query_as::<_, InstanceRecord>(
            "SELECT * FROM instances WHERE process_id = ? ORDER BY id",
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn find_instance_by_machine_and_path(
        &self,
        machine_id: i64,
        deploy_path: &str,
    ) -> Result<Option<InstanceRecord>, Error> {
        let record = sqlx::query_as::<_, InstanceRecord>(
            "SELECT * FROM instances WHERE machine_id = ? AND deploy_path = ?",
        )
        .bind(machine_id)
        .bind(deploy_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn running_instances(&self) -> Result<Vec<InstanceRecord>, Error> {
        let records = sqlx::query_as::<_, InstanceRecord>(
            "SELECT * FROM instances WHERE state = 'running' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn update_instance_state(&self, id: i64, state: InstanceState) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE instances
            SET state = ?,
                pid = CASE WHEN ? THEN NULL ELSE pid END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(state.clears_pid())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_instance_pid(&self, id: i64, pid: Option<i64>) -> Result<(), Error> {
        sqlx::query("UPDATE instances SET pid = ?, updated_at = ? WHERE id = ?")
            .bind(pid)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_instance_config(
        &self,
        id: i64,
        pipeline_config: Option<&str>,
        jvm_options: Option<&str>,
        agent_settings: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE instances
            SET pipeline_config = COALESCE(?, pipeline_config),
                jvm_options = COALESCE(?, jvm_options),
                agent_settings = COALESCE(?, agent_settings),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(pipeline_config)
        .bind(jvm_options)
        .bind(agent_settings)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_instance(&self, id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, instance_id, process_id, kind, status, error,
                               created_at, started_at, ended_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task.instance_id)
        .bind(task.process_id)
        .bind(&task.kind)
        .bind(&task.status)
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, Error> {
        let record = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn find_open_task(&self, instance_id: i64) -> Result<Option<TaskRecord>, Error> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT * FROM tasks
            WHERE instance_id = ? AND status IN ('pending', 'running')
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), Error> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                error = COALESCE(?, error),
                started_at = CASE WHEN ? AND started_at IS NULL THEN ? ELSE started_at END,
                ended_at = CASE WHEN ? AND ended_at IS NULL THEN ? ELSE ended_at END
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(status == TaskStatus::Running)
        .bind(now)
        .bind(status.is_terminal())
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tasks_for_instance(&self, instance_id: i64) -> Result<Vec<TaskRecord>, Error> {
        let records = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks WHERE instance_id = ? ORDER BY created_at DESC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn insert_step(&self, task_id: &str, name: &str) -> Result<StepRecord, Error> {
        let record = sqlx::query_as::<_, StepRecord>(
            r#"
            INSERT INTO task_steps (task_id, seq, name, status, started_at)
            VALUES (?,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_steps WHERE task_id = ?),
                    ?, 'running', ?)
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(task_id)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn update_step_status(
        &self,
        step_id: i64,
        status: StepStatus,
        detail: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE task_steps
            SET status = ?,
                error_detail = COALESCE(?, error_detail),
                ended_at = CASE WHEN ? AND ended_at IS NULL THEN ? ELSE ended_at END
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(detail)
        .bind(status.is_terminal())
        .bind(Utc::now())
        .bind(step_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn steps_for_task(&self, task_id: &str) -> Result<Vec<StepRecord>, Error> {
        let records = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM task_steps WHERE task_id = ? ORDER BY seq",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn purge_tasks_for_instance(&self, instance_id: i64) -> Result<u64, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM task_steps WHERE task_id IN (SELECT id FROM tasks WHERE instance_id = ?)",
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM tasks WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }
}
