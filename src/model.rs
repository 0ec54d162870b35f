//! Core data model: [`ScheduledTask`] and [`TaskExecution`].

use crate::config::TaskConfig;
use crate::entity_ids::{ExecutionId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Active,
    Paused,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses are never rewritten again by the core except by the Reaper
    /// transitioning a stale `Running` row to `TimedOut`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
        )
    }
}

/// A user-defined task with a schedule. See the module docs for lifecycle rules.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduledTask {
    #[builder(default = TaskId::new())]
    pub id: TaskId,

    pub name: String,

    #[builder(default, setter(strip_option, into))]
    pub description: Option<String>,

    pub agent_id: String,

    /// Cron expression, descriptor keyword, or one-shot form (`@at <RFC3339>`, `@once`).
    /// Never mutated by the core after creation.
    pub schedule: String,

    /// IANA zone name; empty means UTC.
    #[builder(default)]
    pub timezone: String,

    pub prompt: String,

    #[builder(default)]
    pub config: TaskConfig,

    #[builder(default)]
    pub status: TaskStatus,

    pub next_run_at: DateTime<Utc>,

    #[builder(default)]
    pub last_run_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub last_execution_id: Option<ExecutionId>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,

    #[builder(default)]
    pub metadata: Option<Value>,
}

impl ScheduledTask {
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

/// One materialised fire of a [`ScheduledTask`].
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskExecution {
    #[builder(default = ExecutionId::new())]
    pub id: ExecutionId,

    pub task_id: TaskId,

    #[builder(default)]
    pub status: ExecutionStatus,

    pub scheduled_at: DateTime<Utc>,

    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option, into))]
    pub session_id: Option<String>,

    pub prompt: String,

    #[builder(default, setter(strip_option, into))]
    pub response: Option<String>,

    #[builder(default, setter(strip_option, into))]
    pub error: Option<String>,

    #[builder(default = 1)]
    pub attempt_number: i32,

    #[builder(default, setter(strip_option, into))]
    pub worker_id: Option<String>,

    #[builder(default)]
    pub locked_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub locked_until: Option<DateTime<Utc>>,

    /// `finished_at - started_at` in nanoseconds, written by the Store's `complete_execution`
    /// primitive at the moment a terminal status is recorded. `None` until then.
    #[builder(default)]
    pub duration_ns: Option<i64>,

    #[builder(default)]
    pub metadata: Option<Value>,
}

impl TaskExecution {
    /// `finished_at - started_at`. Prefers the persisted `duration_ns` column; falls back to
    /// recomputing from the timestamps for executions built in memory (tests, retries) that
    /// haven't round-tripped through a Store yet.
    pub fn duration(&self) -> Option<Duration> {
        if let Some(nanos) = self.duration_ns {
            return Some(Duration::from_nanos(nanos.max(0) as u64));
        }
        let started = self.started_at?;
        let finished = self.finished_at?;
        (finished - started).to_std().ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Filters accepted by [`crate::store::Store::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct ListTasksFilter {
    pub status: Option<TaskStatus>,
    pub agent_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Filters accepted by [`crate::store::Store::list_executions`].
#[derive(Debug, Clone, Default)]
pub struct ListExecutionsFilter {
    pub task_id: Option<TaskId>,
    pub status: Option<ExecutionStatus>,
    pub scheduled_after: Option<DateTime<Utc>>,
    pub scheduled_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> ScheduledTask {
        ScheduledTask::builder()
            .name("nightly digest")
            .agent_id("agent-1")
            .schedule("0 0 * * *")
            .prompt("summarize today")
            .next_run_at(Utc::now())
            .build()
    }

    #[test]
    fn new_task_defaults_to_active_with_default_config() {
        let task = sample_task();
        assert!(task.is_active());
        assert_eq!(task.config.max_retries, 0);
    }

    #[test]
    fn execution_duration_is_none_until_both_timestamps_are_set() {
        let exec = TaskExecution::builder()
            .task_id(TaskId::new())
            .scheduled_at(Utc::now())
            .prompt("x")
            .build();
        assert!(exec.duration().is_none());
    }

    #[test]
    fn execution_duration_computed_once_terminal() {
        let now = Utc::now();
        let exec = TaskExecution::builder()
            .task_id(TaskId::new())
            .scheduled_at(now)
            .started_at(now)
            .finished_at(now + chrono::Duration::seconds(5))
            .prompt("x")
            .status(ExecutionStatus::Succeeded)
            .build();
        assert_eq!(exec.duration(), Some(Duration::from_secs(5)));
        assert!(exec.is_terminal());
    }

    #[test]
    fn terminal_statuses_match_glossary() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
