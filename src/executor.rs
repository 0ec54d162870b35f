//! Executor contract and Router: dispatches a leased execution to the handler registered for
//! its task's `execution_type`, generalising `kernel::jobs::registry::JobRegistry`'s
//! string-keyed dispatch from job-type-as-handler to execution-type-as-handler.

use crate::model::{ScheduledTask, TaskExecution};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of a single executor invocation, before the Runner classifies it against the
/// execution's deadline.
pub struct ExecutorOutcome {
    pub response: String,
}

/// Domain work invoked by the Runner for a leased execution. Implementors own all
/// task-specific behaviour (dialogue, message delivery, etc.); the Runner is agnostic to it.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        task: &ScheduledTask,
        execution: &TaskExecution,
        cancellation: CancellationToken,
    ) -> anyhow::Result<ExecutorOutcome>;
}

/// The `execution_type` values the core recognises, independent of whether an [`Executor`] is
/// actually registered for them. `""` is treated as `agent` (the default).
pub const EXECUTION_TYPE_AGENT: &str = "agent";
pub const EXECUTION_TYPE_MESSAGE: &str = "message";

/// Normalises an `execution_type` (empty ⇒ `agent`) and reports whether the Router recognises it
/// as a domain concept at all, regardless of whether an executor is registered for it.
pub fn normalize_execution_type(execution_type: &str) -> &str {
    if execution_type.is_empty() {
        EXECUTION_TYPE_AGENT
    } else {
        execution_type
    }
}

pub fn is_recognized_execution_type(execution_type: &str) -> bool {
    matches!(
        normalize_execution_type(execution_type),
        EXECUTION_TYPE_AGENT | EXECUTION_TYPE_MESSAGE
    )
}

/// Maps `execution_type` strings to registered [`Executor`]s. An unrecognised key, or a
/// recognised key with nothing registered, is the Router's job to report as a failure — the
/// Runner does not special-case it.
#[derive(Default, Clone)]
pub struct ExecutorRouter {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, execution_type: impl Into<String>, executor: Arc<dyn Executor>) {
        self.executors.insert(execution_type.into(), executor);
    }

    pub fn with(mut self, execution_type: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.register(execution_type, executor);
        self
    }

    pub fn resolve(&self, execution_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(execution_type).cloned()
    }

    pub fn is_registered(&self, execution_type: &str) -> bool {
        self.executors.contains_key(execution_type)
    }
}

/// Test executor that always returns a fixed response, optionally after a delay. Useful for
/// exercising timeout and cancellation behaviour deterministically.
pub struct FixedResponseExecutor {
    response: String,
    delay: Option<std::time::Duration>,
}

impl FixedResponseExecutor {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            delay: None,
        }
    }

    pub fn with_delay(response: impl Into<String>, delay: std::time::Duration) -> Self {
        Self {
            response: response.into(),
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl Executor for FixedResponseExecutor {
    async fn execute(
        &self,
        _task: &ScheduledTask,
        _execution: &TaskExecution,
        cancellation: CancellationToken,
    ) -> anyhow::Result<ExecutorOutcome> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => {
                    anyhow::bail!("execution cancelled during delay");
                }
            }
        }
        Ok(ExecutorOutcome {
            response: self.response.clone(),
        })
    }
}

type BoxedFn = Box<
    dyn Fn(ScheduledTask, TaskExecution) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>
        + Send
        + Sync,
>;

/// Test executor that wraps an arbitrary async function, for tests that want to assert on
/// the task/execution the Runner actually passed through.
pub struct FunctionExecutor {
    func: BoxedFn,
}

impl FunctionExecutor {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(ScheduledTask, TaskExecution) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self {
            func: Box::new(move |task, execution| Box::pin(func(task, execution))),
        }
    }
}

#[async_trait]
impl Executor for FunctionExecutor {
    async fn execute(
        &self,
        task: &ScheduledTask,
        execution: &TaskExecution,
        _cancellation: CancellationToken,
    ) -> anyhow::Result<ExecutorOutcome> {
        let response = (self.func)(task.clone(), execution.clone()).await?;
        Ok(ExecutorOutcome { response })
    }
}
