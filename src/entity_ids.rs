//! Typed ID aliases for the two core entities.

use crate::id::Id;

/// Marker type for [`crate::model::ScheduledTask`] rows.
pub struct Task;

/// Marker type for [`crate::model::TaskExecution`] rows.
pub struct Execution;

pub type TaskId = Id<Task>;
pub type ExecutionId = Id<Execution>;
