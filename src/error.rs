use crate::core::task::{GroupId, TaskId};

/// Errors reported by the pool's public operations.
///
/// Every variant is also reported through `tracing::error!` at the point of
/// detection, so hosts that only watch the log channel see the same
/// diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid task id: {0}")]
    InvalidTaskId(TaskId),

    #[error("invalid group id: {0}")]
    InvalidGroupId(GroupId),

    /// A second thread tried to wait on a task that already has a waiter.
    #[error("another thread is waiting on this task: {description} ({id})")]
    TaskAlreadyWaited { id: TaskId, description: String },

    /// A second thread tried to wait on a group that already has a waiter.
    #[error("another thread is waiting on this group task: {0}")]
    GroupAlreadyWaited(GroupId),

    /// Group tasks must have at least one element to dispatch.
    #[error("group tasks need at least one element")]
    EmptyGroup,

    #[error("the worker pool is already initialized")]
    AlreadyInitialized,

    #[error("the worker pool is not initialized")]
    NotInitialized,
}
