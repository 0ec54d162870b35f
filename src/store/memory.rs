//! In-memory [`super::Store`] used by unit and end-to-end tests, grounded in
//! `kernel::jobs::manager::TestJobManager`'s `RwLock<HashMap<Uuid, Job>>` pattern.

use super::Store;
use crate::entity_ids::{ExecutionId, TaskId};
use crate::error::{Result, SchedulerError};
use crate::model::{
    ExecutionStatus, ListExecutionsFilter, ListTasksFilter, ScheduledTask, TaskExecution, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, ScheduledTask>>,
    executions: RwLock<HashMap<ExecutionId, TaskExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledTask>> {
        let tasks = self.tasks.read().unwrap();
        let mut due: Vec<ScheduledTask> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Active && t.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.next_run_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn get_running_executions(&self, task_id: TaskId) -> Result<Vec<TaskExecution>> {
        let executions = self.executions.read().unwrap();
        Ok(executions
            .values()
            .filter(|e| e.task_id == task_id && e.status == ExecutionStatus::Running)
            .cloned()
            .collect())
    }

    async fn create_execution(&self, execution: TaskExecution) -> Result<TaskExecution> {
        let mut executions = self.executions.write().unwrap();
        executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn update_task(&self, task: ScheduledTask) -> Result<ScheduledTask> {
        let mut tasks = self.tasks.write().unwrap();
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn acquire_execution(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<TaskExecution>> {
        let now = Utc::now();
        let mut executions = self.executions.write().unwrap();
        let candidate_id = executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Pending
                    && e.locked_until.map(|l| l < now).unwrap_or(true)
            })
            .min_by_key(|e| e.scheduled_at)
            .map(|e| e.id);

        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let execution = executions.get_mut(&id).expect("candidate id came from this map");
        execution.status = ExecutionStatus::Running;
        execution.worker_id = Some(worker_id.to_string());
        execution.locked_at = Some(now);
        execution.locked_until = Some(now + chrono::Duration::from_std(lock_duration).unwrap_or_default());
        execution.started_at = Some(now);
        Ok(Some(execution.clone()))
    }

    async fn complete_execution(
        &self,
        id: ExecutionId,
        status: ExecutionStatus,
        response: Option<String>,
        error: Option<String>,
    ) -> Result<TaskExecution> {
        let now = Utc::now();
        let mut executions = self.executions.write().unwrap();
        let execution = executions
            .get_mut(&id)
            .ok_or(SchedulerError::ExecutionNotFound(id))?;
        execution.status = status;
        execution.finished_at = Some(now);
        execution.response = response;
        execution.error = error;
        execution.worker_id = None;
        execution.locked_at = None;
        execution.locked_until = None;
        execution.duration_ns = execution
            .started_at
            .and_then(|started| (now - started).num_nanoseconds());
        Ok(execution.clone())
    }

    async fn cleanup_stale_executions(&self, timeout: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(timeout).unwrap_or_default();
        let mut executions = self.executions.write().unwrap();
        let mut count = 0u64;
        for execution in executions.values_mut() {
            if execution.status == ExecutionStatus::Running
                && execution.started_at.map(|s| s < cutoff).unwrap_or(false)
            {
                execution.status = ExecutionStatus::TimedOut;
                execution.finished_at = Some(now);
                execution.error = Some("execution timed out".to_string());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<ScheduledTask>> {
        Ok(self.tasks.read().unwrap().get(&id).cloned())
    }

    async fn create_task(&self, task: ScheduledTask) -> Result<ScheduledTask> {
        self.tasks.write().unwrap().insert(task.id, task.clone());
        Ok(task)
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        self.tasks.write().unwrap().remove(&id);
        Ok(())
    }

    async fn list_tasks(&self, filter: ListTasksFilter) -> Result<Vec<ScheduledTask>> {
        let tasks = self.tasks.read().unwrap();
        let mut matched: Vec<ScheduledTask> = tasks
            .values()
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| {
                filter
                    .agent_id
                    .as_deref()
                    .map(|a| a == t.agent_id)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.created_at);
        apply_pagination(&mut matched, filter.offset, filter.limit);
        Ok(matched)
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<TaskExecution>> {
        Ok(self.executions.read().unwrap().get(&id).cloned())
    }

    async fn update_execution(&self, execution: TaskExecution) -> Result<TaskExecution> {
        self.executions
            .write()
            .unwrap()
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn list_executions(&self, filter: ListExecutionsFilter) -> Result<Vec<TaskExecution>> {
        let executions = self.executions.read().unwrap();
        let mut matched: Vec<TaskExecution> = executions
            .values()
            .filter(|e| filter.task_id.map(|id| id == e.task_id).unwrap_or(true))
            .filter(|e| filter.status.map(|s| s == e.status).unwrap_or(true))
            .filter(|e| {
                filter
                    .scheduled_after
                    .map(|after| e.scheduled_at >= after)
                    .unwrap_or(true)
            })
            .filter(|e| {
                filter
                    .scheduled_before
                    .map(|before| e.scheduled_at <= before)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.scheduled_at);
        apply_pagination(&mut matched, filter.offset, filter.limit);
        Ok(matched)
    }
}

fn apply_pagination<T>(items: &mut Vec<T>, offset: Option<i64>, limit: Option<i64>) {
    let offset = offset.unwrap_or(0).max(0) as usize;
    if offset >= items.len() {
        items.clear();
        return;
    }
    items.drain(0..offset);
    if let Some(limit) = limit {
        items.truncate(limit.max(0) as usize);
    }
}
