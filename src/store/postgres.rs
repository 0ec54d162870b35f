//! Postgres-backed [`super::Store`].
//!
//! The atomic claim uses a `SELECT ... FOR UPDATE SKIP LOCKED` CTE, narrowed to the single
//! `pending -> running` transition this scheduler needs; lease recovery of expired `running`
//! rows is the Reaper's job, not folded into the claim query.

use super::Store;
use crate::entity_ids::{ExecutionId, TaskId};
use crate::error::{Result, SchedulerError};
use crate::model::{
    ExecutionStatus, ListExecutionsFilter, ListTasksFilter, ScheduledTask, TaskExecution, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::time::Duration;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: TaskId,
    name: String,
    description: Option<String>,
    agent_id: String,
    schedule: String,
    timezone: String,
    prompt: String,
    config: Json<crate::config::TaskConfig>,
    status: TaskStatus,
    next_run_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    last_execution_id: Option<ExecutionId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    metadata: Option<Value>,
}

impl From<TaskRow> for ScheduledTask {
    fn from(row: TaskRow) -> Self {
        ScheduledTask {
            id: row.id,
            name: row.name,
            description: row.description,
            agent_id: row.agent_id,
            schedule: row.schedule,
            timezone: row.timezone,
            prompt: row.prompt,
            config: row.config.0,
            status: row.status,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            last_execution_id: row.last_execution_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            metadata: row.metadata,
        }
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    id: ExecutionId,
    task_id: TaskId,
    status: ExecutionStatus,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    session_id: Option<String>,
    prompt: String,
    response: Option<String>,
    error: Option<String>,
    attempt_number: i32,
    worker_id: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    duration_ns: Option<i64>,
    metadata: Option<Value>,
}

impl From<ExecutionRow> for TaskExecution {
    fn from(row: ExecutionRow) -> Self {
        TaskExecution {
            id: row.id,
            task_id: row.task_id,
            status: row.status,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            session_id: row.session_id,
            prompt: row.prompt,
            response: row.response,
            error: row.error,
            attempt_number: row.attempt_number,
            worker_id: row.worker_id,
            locked_at: row.locked_at,
            locked_until: row.locked_until,
            duration_ns: row.duration_ns,
            metadata: row.metadata,
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM scheduled_tasks
            WHERE status = 'active' AND next_run_at <= $1
            ORDER BY next_run_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_running_executions(&self, task_id: TaskId) -> Result<Vec<TaskExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM task_executions WHERE task_id = $1 AND status = 'running'",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_execution(&self, execution: TaskExecution) -> Result<TaskExecution> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO task_executions (
                id, task_id, status, scheduled_at, started_at, finished_at, session_id,
                prompt, response, error, attempt_number, worker_id, locked_at, locked_until,
                duration_ns, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING *
            "#,
        )
        .bind(execution.id)
        .bind(execution.task_id)
        .bind(execution.status)
        .bind(execution.scheduled_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.session_id)
        .bind(execution.prompt)
        .bind(execution.response)
        .bind(execution.error)
        .bind(execution.attempt_number)
        .bind(execution.worker_id)
        .bind(execution.locked_at)
        .bind(execution.locked_until)
        .bind(execution.duration_ns)
        .bind(execution.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn update_task(&self, task: ScheduledTask) -> Result<ScheduledTask> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE scheduled_tasks SET
                name = $2, description = $3, agent_id = $4, schedule = $5, timezone = $6,
                prompt = $7, config = $8, status = $9, next_run_at = $10, last_run_at = $11,
                last_execution_id = $12, updated_at = NOW(), metadata = $13
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(task.id)
        .bind(task.name)
        .bind(task.description)
        .bind(task.agent_id)
        .bind(task.schedule)
        .bind(task.timezone)
        .bind(task.prompt)
        .bind(Json(task.config))
        .bind(task.status)
        .bind(task.next_run_at)
        .bind(task.last_run_at)
        .bind(task.last_execution_id)
        .bind(task.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn acquire_execution(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<TaskExecution>> {
        let lock_ms = lock_duration.as_millis() as i64;
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            WITH next_execution AS (
                SELECT id FROM task_executions
                WHERE status = 'pending' AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE task_executions
            SET status = 'running',
                worker_id = $1,
                locked_at = NOW(),
                locked_until = NOW() + ($2 || ' milliseconds')::INTERVAL,
                started_at = NOW()
            WHERE id IN (SELECT id FROM next_execution)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(lock_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn complete_execution(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        response: Option<String>,
        error: Option<String>,
    ) -> Result<TaskExecution> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE task_executions SET
                status = $2,
                finished_at = NOW(),
                response = $3,
                error = $4,
                worker_id = NULL,
                locked_at = NULL,
                locked_until = NULL,
                duration_ns = CASE
                    WHEN started_at IS NULL THEN NULL
                    ELSE (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000000000)::BIGINT
                END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(response)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SchedulerError::ExecutionNotFound(id))?;
        Ok(row.into())
    }

    async fn cleanup_stale_executions(&self, timeout: Duration) -> Result<u64> {
        let timeout_ms = timeout.as_millis() as i64;
        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'timed_out', finished_at = NOW(), error = 'execution timed out'
            WHERE status = 'running'
              AND started_at < NOW() - ($1 || ' milliseconds')::INTERVAL
            "#,
        )
        .bind(timeout_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<ScheduledTask>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM scheduled_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn create_task(&self, task: ScheduledTask) -> Result<ScheduledTask> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            INSERT INTO scheduled_tasks (
                id, name, description, agent_id, schedule, timezone, prompt, config, status,
                next_run_at, last_run_at, last_execution_id, created_at, updated_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(task.id)
        .bind(task.name)
        .bind(task.description)
        .bind(task.agent_id)
        .bind(task.schedule)
        .bind(task.timezone)
        .bind(task.prompt)
        .bind(Json(task.config))
        .bind(task.status)
        .bind(task.next_run_at)
        .bind(task.last_run_at)
        .bind(task.last_execution_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_tasks(&self, filter: ListTasksFilter) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM scheduled_tasks
            WHERE ($1::task_status IS NULL OR status = $1)
              AND ($2::text IS NULL OR agent_id = $2)
            ORDER BY created_at ASC
            LIMIT COALESCE($3, 100)
            OFFSET COALESCE($4, 0)
            "#,
        )
        .bind(filter.status)
        .bind(filter.agent_id)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<TaskExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM task_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn update_execution(&self, execution: TaskExecution) -> Result<TaskExecution> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE task_executions SET
                status = $2, scheduled_at = $3, started_at = $4, finished_at = $5,
                session_id = $6, prompt = $7, response = $8, error = $9, attempt_number = $10,
                worker_id = $11, locked_at = $12, locked_until = $13, duration_ns = $14,
                metadata = $15
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(execution.id)
        .bind(execution.status)
        .bind(execution.scheduled_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.session_id)
        .bind(execution.prompt)
        .bind(execution.response)
        .bind(execution.error)
        .bind(execution.attempt_number)
        .bind(execution.worker_id)
        .bind(execution.locked_at)
        .bind(execution.locked_until)
        .bind(execution.duration_ns)
        .bind(execution.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn list_executions(&self, filter: ListExecutionsFilter) -> Result<Vec<TaskExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM task_executions
            WHERE ($1::uuid IS NULL OR task_id = $1)
              AND ($2::execution_status IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR scheduled_at >= $3)
              AND ($4::timestamptz IS NULL OR scheduled_at <= $4)
            ORDER BY scheduled_at ASC
            LIMIT COALESCE($5, 100)
            OFFSET COALESCE($6, 0)
            "#,
        )
        .bind(filter.task_id)
        .bind(filter.status)
        .bind(filter.scheduled_after)
        .bind(filter.scheduled_before)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
