use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use crossbeam_utils::CachePadded;

use super::semaphore::Semaphore;
use super::sync::{thread, Arc, AtomicBool, AtomicU32, Mutex};

/// The priority class of a task.
///
/// High priority tasks run on the shared queue without restriction. Low
/// priority tasks are admission-controlled so that long-running work cannot
/// monopolize the workers, or run on dedicated short-lived threads when the
/// pool is configured for native low priority threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

/// Identifier of a submitted task.
///
/// Task and group identifiers are drawn from the same sequence, so an id is
/// unique across both kinds and never reused for the lifetime of a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

/// Identifier of a submitted group task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl GroupId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The callable carried by a task.
///
/// Single tasks run a closure or a plain function pointer with opaque
/// userdata; group variants additionally receive the claimed element index.
pub(crate) enum Work {
    Call(Option<Box<dyn FnOnce() + Send + 'static>>),
    // Shared by every sibling task of a group.
    GroupCall(Arc<dyn Fn(u32) + Send + Sync + 'static>),
    Native {
        func: fn(*mut c_void),
        userdata: *mut c_void,
    },
    NativeGroup {
        func: fn(*mut c_void, u32),
        userdata: *mut c_void,
    },
}

impl Work {
    /// Invoke the callable, passing the claimed element index for group work.
    ///
    /// A panic escaping the callable is caught and reported; it does not
    /// poison the pool and the task still completes.
    pub fn invoke(&mut self, index: Option<u32>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match self {
            Work::Call(f) => {
                let f = f.take().unwrap();
                f();
            }
            Work::GroupCall(f) => (**f)(index.unwrap()),
            Work::Native { func, userdata } => func(*userdata),
            Work::NativeGroup { func, userdata } => func(*userdata, index.unwrap()),
        }));

        if let Err(payload) = result {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("<opaque panic payload>");
            tracing::error!("task callable panicked: {}", msg);
        }
    }

    /// Copy group work for another sibling task.
    pub fn duplicate(&self) -> Work {
        match self {
            Work::GroupCall(f) => Work::GroupCall(Arc::clone(f)),
            Work::NativeGroup { func, userdata } => Work::NativeGroup {
                func: *func,
                userdata: *userdata,
            },
            _ => unreachable!("single-task work is never duplicated"),
        }
    }
}

/// One scheduled execution.
///
/// Records are owned by the pool's task slab; everything else holds a
/// `TaskRef`. A record stays valid from allocation until the single point
/// where it is released: by the waiter at the end of a task wait, by the
/// executor in the group epilogue, by the group waiter in native low
/// priority mode, or by the shutdown sweep.
pub(crate) struct Task {
    /// Exclusive to whichever thread executes the task.
    pub work: UnsafeCell<Work>,
    pub description: String,
    /// Back-reference to the owning group, if any. Not an owning pointer:
    /// the group record belongs to the group slab.
    pub group: Option<GroupRef>,
    pub low_priority: AtomicBool,
    /// Write-once completion flag, readable without the task mutex.
    pub completed: AtomicBool,
    /// Completion signal for the (single) waiter.
    pub done: Semaphore,
    /// Set while some thread is blocked waiting on this task. Guarded by the
    /// task mutex.
    pub waiting: AtomicBool,
    /// The dedicated thread running this task, when low priority work uses
    /// native threads.
    pub native_thread: Mutex<Option<thread::JoinHandle<()>>>,
    /// Embedded link for the run and holding queues. Guarded by the task
    /// mutex.
    pub queue_next: UnsafeCell<Option<NonNull<Task>>>,
}

// The raw userdata pointers in `Work` keep Task from being auto Send/Sync.
// Records are shared across threads under the protocol above; the native
// submission entry points are unsafe and make the caller vouch for the
// userdata.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub fn new(work: Work, description: &str, group: Option<GroupRef>) -> Self {
        Task {
            work: UnsafeCell::new(work),
            description: description.to_string(),
            group,
            low_priority: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            done: Semaphore::new(),
            waiting: AtomicBool::new(false),
            native_thread: Mutex::new(None),
            queue_next: UnsafeCell::new(None),
        }
    }
}

/// A dispatched batch: `tasks_used` sibling tasks cooperatively drain the
/// element indices `[0, max)`.
pub(crate) struct Group {
    /// Total number of elements to process.
    pub max: u32,
    /// Dispatch counter, the next element index to claim.
    pub index: CachePadded<AtomicU32>,
    /// Number of sibling tasks that have exited the group body. The last
    /// one owns the completion signalling.
    pub finished: CachePadded<AtomicU32>,
    /// Number of sibling tasks dispatched for this group.
    pub tasks_used: u32,
    pub completed: AtomicBool,
    /// Posted once, when the last sibling exits the body.
    pub done: Semaphore,
    /// Set once a waiter has committed to this group. Guarded by the task
    /// mutex.
    pub waiting: AtomicBool,
    /// Sibling records running on dedicated native threads. Empty unless the
    /// group is low priority and the pool uses native low priority threads.
    pub native_tasks: Vec<TaskRef>,
}

impl Group {
    pub fn new(max: u32, tasks_used: u32) -> Self {
        Group {
            max,
            index: CachePadded::new(AtomicU32::new(0)),
            finished: CachePadded::new(AtomicU32::new(0)),
            tasks_used,
            completed: AtomicBool::new(false),
            done: Semaphore::new(),
            waiting: AtomicBool::new(false),
            native_tasks: Vec::new(),
        }
    }
}

/// A pointer to a task record in the slab. Carries no ownership.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct TaskRef(NonNull<Task>);

unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    pub fn new(ptr: NonNull<Task>) -> Self {
        TaskRef(ptr)
    }

    /// # Safety
    ///
    /// The record must not have been freed, and the returned reference must
    /// not outlive the point where it is.
    pub unsafe fn get<'a>(self) -> &'a Task {
        &*self.0.as_ptr()
    }

    pub fn raw(self) -> NonNull<Task> {
        self.0
    }
}

/// A pointer to a group record in the slab. Carries no ownership.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct GroupRef(NonNull<Group>);

unsafe impl Send for GroupRef {}
unsafe impl Sync for GroupRef {}

impl GroupRef {
    pub fn new(ptr: NonNull<Group>) -> Self {
        GroupRef(ptr)
    }

    /// # Safety
    ///
    /// Same contract as [`TaskRef::get`].
    pub unsafe fn get<'a>(self) -> &'a Group {
        &*self.0.as_ptr()
    }

    pub fn raw(self) -> NonNull<Group> {
        self.0
    }
}
