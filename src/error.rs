//! Error taxonomy for the scheduler core.
//!
//! A single closed enum is the return type of every library-boundary function
//! ([`crate::store::Store`] methods, [`crate::evaluator::next_fire`], [`crate::scheduler::Scheduler::start`]/`stop`)
//! so callers can match on kind instead of parsing strings. Internal helpers are free to use
//! `anyhow::Result` for convenience.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid schedule expression {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),

    #[error("task not found: {0}")]
    TaskNotFound(crate::entity_ids::TaskId),

    #[error("execution not found: {0}")]
    ExecutionNotFound(crate::entity_ids::ExecutionId),

    #[error("no executor registered for execution type {0:?}")]
    UnknownExecutionType(String),

    #[error("execution timed out")]
    Timeout,

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("shutdown deadline elapsed with background work still draining")]
    ShutdownTimedOut,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
