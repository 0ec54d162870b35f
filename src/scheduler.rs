//! The Scheduler: three independent long-lived loops (Poll, Claim, Reaper) plus the bounded
//! pool of Runner tasks the Claim Loop spawns, all rendezvousing through one [`Store`].
//!
//! The claim-then-dispatch run loop and its cancellation-token-backed graceful drain on
//! shutdown follow the same shape as a single-queue job worker, split here into three
//! independently-ticking loops because the Poll Loop, Claim Loop, and Reaper operate on
//! different primitives (`GetDueTasks`, `AcquireExecution`, `CleanupStaleExecutions`) with
//! different cadences.

use crate::config::SchedulerConfig;
use crate::entity_ids::TaskId;
use crate::error::{Result, SchedulerError};
use crate::evaluator::{self, NextFire};
use crate::executor::{self, ExecutorRouter};
use crate::model::{ExecutionStatus, ScheduledTask, TaskExecution, TaskStatus};
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Inner {
    store: Arc<dyn Store>,
    router: ExecutorRouter,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    semaphore: Semaphore,
    in_flight: AtomicUsize,
}

impl Inner {
    async fn poll_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.get_due_tasks(now, self.config.poll_batch_limit).await?;
        let mut processed = 0usize;
        for task in due {
            let task_id = task.id;
            if let Err(e) = self.poll_one(task, now).await {
                error!(task_id = %task_id, error = %e, "poll tick failed for task, will retry next tick");
                continue;
            }
            processed += 1;
        }
        Ok(processed)
    }

    async fn poll_one(&self, mut task: ScheduledTask, now: DateTime<Utc>) -> Result<()> {
        if !task.config.allow_overlap {
            let running = self.store.get_running_executions(task.id).await?;
            if !running.is_empty() {
                // Skip this fire; the invariant is "never re-fire a skipped tick", so we still
                // take exactly one schedule step below rather than catching up missed fires.
                return self.advance_schedule(&mut task, now).await;
            }
        }

        let execution = TaskExecution::builder()
            .task_id(task.id)
            .scheduled_at(task.next_run_at)
            .prompt(task.prompt.clone())
            .build();
        let execution = self.store.create_execution(execution).await?;
        info!(task_id = %task.id, execution_id = %execution.id, "materialized execution");

        self.advance_schedule(&mut task, now).await
    }

    async fn advance_schedule(&self, task: &mut ScheduledTask, now: DateTime<Utc>) -> Result<()> {
        match evaluator::next_fire(&task.schedule, &task.timezone, now) {
            Ok(NextFire::At(next)) => {
                task.next_run_at = next;
                task.last_run_at = Some(now);
            }
            Ok(NextFire::Never) => {
                task.status = TaskStatus::Disabled;
                task.last_run_at = Some(now);
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "schedule unparseable, disabling task");
                task.status = TaskStatus::Disabled;
            }
        }
        task.updated_at = now;
        self.store.update_task(task.clone()).await?;
        Ok(())
    }
}

/// One worker's scheduler instance: owns the Poll, Claim, and Reaper loops against a shared
/// [`Store`]. Multiple `Scheduler`s (one per worker process) may run concurrently against the
/// same store; they coordinate only through it.
pub struct Scheduler {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: Mutex<bool>,
}

impl Scheduler {
    /// Builds a scheduler over `store`, dispatching leased executions through `router`.
    /// Zero/negative fields of `config` are replaced with their documented defaults.
    pub fn new(store: Arc<dyn Store>, router: ExecutorRouter, config: SchedulerConfig) -> Self {
        let config = config.normalized();
        let inner = Inner {
            store,
            router,
            semaphore: Semaphore::new(config.max_concurrency),
            shutdown: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            config,
        };
        Self {
            inner: Arc::new(inner),
            handles: Mutex::new(Vec::new()),
            running: Mutex::new(false),
        }
    }

    /// Spawns the Poll, Claim, and Reaper loops as background tasks. A second call while
    /// already running is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if *running {
            return;
        }
        *running = true;

        let mut handles = self.handles.lock().unwrap();
        handles.push(tokio::spawn(poll_loop(self.inner.clone())));
        handles.push(tokio::spawn(claim_loop(self.inner.clone())));
        handles.push(tokio::spawn(reaper_loop(self.inner.clone())));
    }

    /// Signals the three loops to stop and waits for them, and every in-flight Runner, to
    /// return. If `deadline` elapses first, the loops and in-flight work are left to drain in
    /// the background (all their writes are Store-atomic) and `Err(ShutdownTimedOut)` is
    /// returned. A second call while already stopped is a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        {
            let mut running = self.running.lock().unwrap();
            if !*running {
                return Ok(());
            }
            *running = false;
        }
        self.inner.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        let deadline_instant = tokio::time::Instant::now() + deadline;

        if tokio::time::timeout_at(deadline_instant, futures::future::join_all(handles))
            .await
            .is_err()
        {
            return Err(SchedulerError::ShutdownTimedOut);
        }

        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline_instant {
                return Err(SchedulerError::ShutdownTimedOut);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(())
    }

    /// Runs one Poll Loop tick immediately, returning the number of due tasks processed.
    /// Exposed for deterministic testing; the background loop calls this on every tick.
    pub async fn poll_once(&self) -> Result<usize> {
        self.poll_once_at(Utc::now()).await
    }

    /// Runs one Poll Loop tick against an injected `now` rather than the wall clock, so tests
    /// can assert against fixed instants deterministically instead of the time the test happens
    /// to run.
    pub async fn poll_once_at(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.poll_tick(now).await
    }

    /// Attempts to lease and run exactly one pending execution, bypassing the concurrency
    /// gate. Returns the completed execution, or `None` if nothing was pending.
    pub async fn claim_once(&self) -> Result<Option<TaskExecution>> {
        let leased = self
            .inner
            .store
            .acquire_execution(&self.inner.config.worker_id, self.inner.config.lock_duration)
            .await?;
        match leased {
            Some(execution) => Ok(Some(run_execution(self.inner.clone(), execution).await)),
            None => Ok(None),
        }
    }

    /// Runs one Reaper tick immediately, returning the number of executions reclaimed.
    pub async fn reap_once(&self) -> Result<u64> {
        self.inner
            .store
            .cleanup_stale_executions(self.inner.config.stale_timeout)
            .await
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }
}

async fn poll_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.tick().await; // first tick fires immediately; consume it so the cadence starts clean
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = inner.poll_tick(Utc::now()).await {
            error!(error = %e, "poll tick aborted, retrying next tick");
        }
    }
}

async fn claim_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.acquire_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let permit = match inner.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => continue, // no free slot this tick; never block waiting for one
        };
        // The permit borrows `inner.semaphore`, which can't outlive this loop iteration once we
        // spawn; forget it from the guard and track the capacity with `in_flight` instead, added
        // back to the semaphore when the Runner task finishes.
        std::mem::forget(permit);

        match inner
            .store
            .acquire_execution(&inner.config.worker_id, inner.config.lock_duration)
            .await
        {
            Ok(Some(execution)) => {
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                let task_inner = inner.clone();
                tokio::spawn(async move {
                    run_execution(task_inner.clone(), execution).await;
                    task_inner.semaphore.add_permits(1);
                    task_inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Ok(None) => inner.semaphore.add_permits(1),
            Err(e) => {
                error!(error = %e, "failed to acquire execution, releasing slot");
                inner.semaphore.add_permits(1);
            }
        }
    }
}

async fn reaper_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.cleanup_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match inner.store.cleanup_stale_executions(inner.config.stale_timeout).await {
            Ok(0) => {}
            Ok(count) => warn!(count, "reaped stale executions"),
            Err(e) => error!(error = %e, "reaper tick failed"),
        }
    }
}

/// The Runner: given a leased execution, resolves its task, dispatches to the registered
/// Executor under a deadline, classifies the outcome, persists it, stamps the parent task, and
/// enqueues a retry if the failure policy calls for one. A panicking Executor is converted to a
/// `failed` outcome rather than propagating, matching the Claim Loop's guarantee that a slot is
/// always eventually released.
async fn run_execution(inner: Arc<Inner>, execution: TaskExecution) -> TaskExecution {
    let execution_id = execution.id;

    let task = match inner.store.get_task(execution.task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            return inner
                .store
                .complete_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    Some("task not found".to_string()),
                )
                .await
                .unwrap_or(execution);
        }
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "failed to load task for leased execution");
            return execution;
        }
    };

    let execution_type = executor::normalize_execution_type(&task.config.execution_type).to_string();
    let (status, response, error_message) = if !executor::is_recognized_execution_type(&execution_type) {
        (ExecutionStatus::Failed, None, Some("unknown execution type".to_string()))
    } else {
        match inner.router.resolve(&execution_type) {
            None => (
                ExecutionStatus::Failed,
                None,
                Some(format!("no executor registered for execution type {execution_type:?}")),
            ),
            Some(handler) => {
                let cancellation = inner.shutdown.child_token();
                let call = AssertUnwindSafe(handler.execute(&task, &execution, cancellation.clone())).catch_unwind();
                match tokio::time::timeout(task.config.timeout, call).await {
                    Err(_elapsed) => {
                        cancellation.cancel();
                        (ExecutionStatus::TimedOut, None, Some("execution timed out".to_string()))
                    }
                    Ok(Err(_panic)) => (ExecutionStatus::Failed, None, Some("executor panicked".to_string())),
                    Ok(Ok(Err(e))) => (ExecutionStatus::Failed, None, Some(e.to_string())),
                    Ok(Ok(Ok(outcome))) => (ExecutionStatus::Succeeded, Some(outcome.response), None),
                }
            }
        }
    };

    let completed = match inner
        .store
        .complete_execution(execution_id, status, response, error_message)
        .await
    {
        Ok(completed) => completed,
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "failed to persist execution completion");
            return execution;
        }
    };

    let now = Utc::now();
    stamp_task_after_completion(&inner, task.id, completed.id, now).await;

    if completed.status == ExecutionStatus::Failed && completed.attempt_number <= task.config.max_retries {
        enqueue_retry(&inner, &task, &completed, now).await;
    }

    completed
}

async fn stamp_task_after_completion(inner: &Inner, task_id: TaskId, execution_id: crate::entity_ids::ExecutionId, now: DateTime<Utc>) {
    match inner.store.get_task(task_id).await {
        Ok(Some(mut fresh_task)) => {
            fresh_task.last_execution_id = Some(execution_id);
            fresh_task.last_run_at = Some(now);
            fresh_task.updated_at = now;
            if let Err(e) = inner.store.update_task(fresh_task).await {
                error!(task_id = %task_id, error = %e, "failed to stamp task after execution completion");
            }
        }
        Ok(None) => {}
        Err(e) => error!(task_id = %task_id, error = %e, "failed to reload task after execution completion"),
    }
}

async fn enqueue_retry(inner: &Inner, task: &ScheduledTask, completed: &TaskExecution, now: DateTime<Utc>) {
    let retry_delay = chrono::Duration::from_std(task.config.retry_delay).unwrap_or_default();
    let retry = TaskExecution::builder()
        .task_id(task.id)
        .scheduled_at(now + retry_delay)
        .prompt(task.prompt.clone())
        .attempt_number(completed.attempt_number + 1)
        .build();
    if let Err(e) = inner.store.create_execution(retry).await {
        error!(task_id = %task.id, error = %e, "failed to enqueue retry execution");
    }
}
