use std::ptr::NonNull;

use super::task::{Task, TaskRef};

/// FIFO of tasks, threaded through the `queue_next` link embedded in each
/// record.
///
/// Push and pop are O(1) and allocation-free. A task is in at most one queue
/// at a time. The queue (and the links it touches) is guarded by the pool's
/// task mutex; none of this is safe to use concurrently on its own.
pub(crate) struct TaskQueue {
    head: Option<NonNull<Task>>,
    tail: Option<NonNull<Task>>,
}

// Holds task pointers, which are Send; the queue itself moves between
// threads only as part of the guarded state.
unsafe impl Send for TaskQueue {}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append a task. It must not currently be in any queue.
    pub fn push_back(&mut self, task: TaskRef) {
        let ptr = task.raw();
        unsafe {
            *task.get().queue_next.get() = None;
            match self.tail {
                Some(tail) => *(*tail.as_ptr()).queue_next.get() = Some(ptr),
                None => self.head = Some(ptr),
            }
        }
        self.tail = Some(ptr);
    }

    /// Unlink and return the head task.
    pub fn pop_front(&mut self) -> Option<TaskRef> {
        let head = self.head?;
        let task = TaskRef::new(head);
        unsafe {
            self.head = (*task.get().queue_next.get()).take();
        }
        if self.head.is_none() {
            self.tail = None;
        }
        Some(task)
    }
}
