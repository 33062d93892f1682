//! A worker thread pool with grouped tasks and admission control for
//! long-running low priority work.
//!
//! Arbitrary producer threads submit opaque units of work, which run on a
//! fixed-size population of long-lived worker threads. What we want:
//! - Two submission shapes: single tasks (one callable, one execution) and
//!   group tasks (a callable dispatched as sibling executions that
//!   cooperatively drain the element indices `[0, N)`).
//! - Two priority classes, where the low class is admission-controlled so
//!   that long-running background work cannot monopolize the pool; excess
//!   low priority tasks are held and promoted FIFO as slots free up.
//! - Waiting on a task from inside another task without deadlocking: a
//!   worker blocked in a wait keeps servicing the queue instead of idling.
//! - An optional mode that gives each low priority task its own short-lived
//!   OS thread instead of going through the pool, for hosts that want
//!   background work fully isolated from the workers.
//!
//! No work stealing, no cancellation of dispatched tasks, and no resizing of
//! the worker population after [`WorkerPool::init`].

mod core;
mod error;

pub use crate::core::pool::{PoolConfig, WorkerPool};
pub use crate::core::task::{GroupId, Priority, TaskId};
pub use error::PoolError;
