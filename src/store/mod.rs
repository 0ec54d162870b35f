//! The [`Store`] trait: the sole rendezvous between the Poll, Claim, and Reaper loops.
//!
//! The atomic claim follows a `FOR UPDATE SKIP LOCKED` CTE over a standard CRUD shape,
//! generalised to the two-entity (task/execution) model this scheduler needs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::entity_ids::{ExecutionId, TaskId};
use crate::error::Result;
use crate::model::{ExecutionStatus, ListExecutionsFilter, ListTasksFilter, ScheduledTask, TaskExecution};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Atomic and CRUD primitives the Poll Loop, Claim Loop, Runner, and Reaper depend on.
/// Implementations must provide the atomicity guarantees described per-method; the reference
/// Postgres implementation does so with `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction.
#[async_trait]
pub trait Store: Send + Sync {
    /// Tasks with `status = active` and `next_run_at <= now`, oldest due first, capped at `limit`.
    async fn get_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledTask>>;

    /// All `running` executions belonging to `task_id`.
    async fn get_running_executions(&self, task_id: TaskId) -> Result<Vec<TaskExecution>>;

    async fn create_execution(&self, execution: TaskExecution) -> Result<TaskExecution>;

    async fn update_task(&self, task: ScheduledTask) -> Result<ScheduledTask>;

    /// The atomic claim: select the oldest (by `scheduled_at`) `pending` execution not already
    /// locked by another worker, mark it `running` under `worker_id` for `lock_duration`, and
    /// return it. Returns `Ok(None)` when no candidate exists. Two concurrent callers must never
    /// receive the same row.
    async fn acquire_execution(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<TaskExecution>>;

    /// Rewrites a leased execution to a terminal state, clearing the lease fields.
    async fn complete_execution(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        response: Option<String>,
        error: Option<String>,
    ) -> Result<TaskExecution>;

    /// Single-statement rewrite of every `running` execution whose `started_at` is older than
    /// `now - timeout` to `timed_out`. Returns the number of rows affected.
    async fn cleanup_stale_executions(&self, timeout: Duration) -> Result<u64>;

    async fn get_task(&self, id: TaskId) -> Result<Option<ScheduledTask>>;
    async fn create_task(&self, task: ScheduledTask) -> Result<ScheduledTask>;
    async fn delete_task(&self, id: TaskId) -> Result<()>;
    async fn list_tasks(&self, filter: ListTasksFilter) -> Result<Vec<ScheduledTask>>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<TaskExecution>>;
    async fn update_execution(&self, execution: TaskExecution) -> Result<TaskExecution>;
    async fn list_executions(&self, filter: ListExecutionsFilter) -> Result<Vec<TaskExecution>>;
}
