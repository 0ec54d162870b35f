//! End-to-end scenarios against the in-memory store, run through the live background loops
//! (`Scheduler::start`/`stop`) rather than the deterministic single-tick helpers exercised by
//! the unit tests in `src/scheduler.rs`.

use chrono::Utc;
use scheduler_core::config::{SchedulerConfig, TaskConfig};
use scheduler_core::executor::{Executor, ExecutorOutcome, ExecutorRouter, FunctionExecutor};
use scheduler_core::model::{ExecutionStatus, ListExecutionsFilter, ScheduledTask, TaskExecution, TaskStatus};
use scheduler_core::store::{MemoryStore, Store};
use scheduler_core::Scheduler;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::builder()
        .poll_interval(Duration::from_millis(5))
        .acquire_interval(Duration::from_millis(5))
        .cleanup_interval(Duration::from_millis(5))
        .build()
}

/// Scenario: distributed claim. Two independently-configured schedulers (standing in for two
/// worker processes) share one store; exactly one of them claims the single pending execution.
#[tokio::test]
async fn distributed_claim_hands_the_execution_to_exactly_one_worker() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let task = ScheduledTask::builder()
        .name("shared")
        .agent_id("agent-1")
        .schedule("@once")
        .prompt("p")
        .next_run_at(Utc::now())
        .build();
    store.create_task(task.clone()).await.unwrap();
    store
        .create_execution(
            TaskExecution::builder()
                .task_id(task.id)
                .scheduled_at(Utc::now())
                .prompt("p")
                .build(),
        )
        .await
        .unwrap();

    let w1 = SchedulerConfig::builder().worker_id("w1").build();
    let w2 = SchedulerConfig::builder().worker_id("w2").build();
    let scheduler1 = Scheduler::new(store.clone(), ExecutorRouter::new(), w1);
    let scheduler2 = Scheduler::new(store.clone(), ExecutorRouter::new(), w2);

    let (claimed1, claimed2) = tokio::join!(scheduler1.claim_once(), scheduler2.claim_once());
    let claimed1 = claimed1.unwrap();
    let claimed2 = claimed2.unwrap();

    // Exactly one worker got the execution; the other found nothing pending.
    assert_ne!(claimed1.is_some(), claimed2.is_some());
}

/// Scenario: a task with `allow_overlap = false` whose executor outlives several poll ticks.
/// Over N due ticks during one execution, exactly one execution exists and `next_run_at`
/// advances by N schedule steps (one step per skipped tick, not a catch-up of missed fires).
#[tokio::test]
async fn long_running_execution_suppresses_overlap_across_several_poll_ticks() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let task = ScheduledTask::builder()
        .name("slow")
        .agent_id("agent-1")
        .schedule("* * * * * *") // fires every second, well inside our fast poll cadence
        .prompt("p")
        .next_run_at(Utc::now())
        .build();
    let task_id = task.id;
    store.create_task(task).await.unwrap();

    let release = Arc::new(tokio::sync::Notify::new());
    let release_for_executor = release.clone();
    let router = ExecutorRouter::new().with(
        "agent",
        Arc::new(FunctionExecutor::new(move |_task, _execution| {
            let release = release_for_executor.clone();
            async move {
                release.notified().await;
                Ok("done".to_string())
            }
        })) as Arc<dyn Executor>,
    );

    let scheduler = Scheduler::new(store.clone(), router, fast_config());
    scheduler.start();

    // Let several poll ticks and at least one claim happen while the executor blocks.
    tokio::time::sleep(Duration::from_millis(120)).await;

    let running = store
        .list_executions(ListExecutionsFilter {
            task_id: Some(task_id),
            status: Some(ExecutionStatus::Running),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1, "exactly one execution should be in flight");

    let all = store
        .list_executions(ListExecutionsFilter {
            task_id: Some(task_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        all.len(),
        1,
        "overlap-skip must not materialise a second execution while one is running"
    );

    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.stop(Duration::from_secs(5)).await.unwrap();
}

/// Scenario: retry chain driven end-to-end through the live claim loop rather than the
/// deterministic `claim_once` helper.
#[tokio::test]
async fn retry_chain_runs_to_completion_under_the_live_claim_loop() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_for_executor = attempts.clone();

    struct CountingFailure {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Executor for CountingFailure {
        async fn execute(
            &self,
            _task: &ScheduledTask,
            _execution: &TaskExecution,
            _cancellation: CancellationToken,
        ) -> anyhow::Result<ExecutorOutcome> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("synthetic failure")
        }
    }

    let task = ScheduledTask::builder()
        .name("flaky")
        .agent_id("agent-1")
        .schedule("@once")
        .prompt("p")
        .next_run_at(Utc::now())
        .config(
            TaskConfig::builder()
                .max_retries(2)
                .retry_delay(Duration::from_millis(1))
                .build(),
        )
        .build();
    let task_id = task.id;
    store.create_task(task.clone()).await.unwrap();
    store
        .create_execution(
            TaskExecution::builder()
                .task_id(task_id)
                .scheduled_at(Utc::now())
                .prompt("p")
                .build(),
        )
        .await
        .unwrap();

    let router = ExecutorRouter::new().with(
        "agent",
        Arc::new(CountingFailure {
            attempts: attempts_for_executor,
        }) as Arc<dyn Executor>,
    );
    let scheduler = Scheduler::new(store.clone(), router, fast_config());
    scheduler.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3, "initial attempt plus two retries");

    let all = store
        .list_executions(ListExecutionsFilter {
            task_id: Some(task_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|e| e.status == ExecutionStatus::Failed));
}

/// Scenario: the stale reaper, running as a live background loop, reclassifies a lapsed lease
/// without any help from the poll or claim loops.
#[tokio::test]
async fn background_reaper_reclassifies_lapsed_lease() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let task = ScheduledTask::builder()
        .name("t")
        .agent_id("a")
        .schedule("@once")
        .prompt("p")
        .next_run_at(Utc::now() + chrono::Duration::hours(1)) // not due; poll loop must stay quiet
        .build();
    store.create_task(task.clone()).await.unwrap();

    let mut stuck = TaskExecution::builder()
        .task_id(task.id)
        .scheduled_at(Utc::now())
        .prompt("p")
        .status(ExecutionStatus::Running)
        .build();
    stuck.started_at = Some(Utc::now() - chrono::Duration::minutes(45));
    let stuck_id = stuck.id;
    store.create_execution(stuck).await.unwrap();

    let config = SchedulerConfig::builder()
        .poll_interval(Duration::from_millis(5))
        .acquire_interval(Duration::from_millis(5))
        .cleanup_interval(Duration::from_millis(5))
        .stale_timeout(Duration::from_secs(30 * 60))
        .build();
    let scheduler = Scheduler::new(store.clone(), ExecutorRouter::new(), config);
    scheduler.start();

    tokio::time::sleep(Duration::from_millis(80)).await;
    scheduler.stop(Duration::from_secs(5)).await.unwrap();

    let reaped = store.get_execution(stuck_id).await.unwrap().unwrap();
    assert_eq!(reaped.status, ExecutionStatus::TimedOut);
    assert_eq!(reaped.error.as_deref(), Some("execution timed out"));

    let task = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Active, "reaper never touches the parent task");
}
