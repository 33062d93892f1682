use std::collections::HashMap;
use std::ffi::c_void;

use crossbeam_utils::CachePadded;

use super::semaphore::Semaphore;
use super::sync::{thread, Arc, AtomicBool, AtomicU32, Mutex, RwLock};
use super::task::{GroupId, Priority, TaskId, Work};
use super::{Shared, State};
use crate::error::PoolError;

/// Configuration for [`WorkerPool::init`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of worker threads. `None` asks the OS for a suitable default.
    pub thread_count: Option<usize>,
    /// Give every low priority task its own short-lived OS thread instead of
    /// a pool slot.
    pub use_native_low_priority_threads: bool,
    /// Fraction of the workers that low priority tasks may occupy at once,
    /// in `(0, 1]`. Ignored when native low priority threads are used.
    pub low_priority_task_ratio: f32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            thread_count: None,
            use_native_low_priority_threads: false,
            low_priority_task_ratio: 0.3,
        }
    }
}

impl PoolConfig {
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = Some(count);
        self
    }

    pub fn with_native_low_priority_threads(mut self) -> Self {
        self.use_native_low_priority_threads = true;
        self
    }

    pub fn with_low_priority_task_ratio(mut self, ratio: f32) -> Self {
        self.low_priority_task_ratio = ratio;
        self
    }
}

/// A fixed-size worker thread pool.
///
/// The pool is a value owned by the host: construct it, call
/// [`init`](WorkerPool::init) once, submit and wait from any thread, and call
/// [`finish`](WorkerPool::finish) (or drop the pool) to join the workers.
pub struct WorkerPool {
    inner: RwLock<Option<Arc<Shared>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        WorkerPool {
            inner: RwLock::new(None),
        }
    }

    /// Spawn the worker threads. Fails if the pool is already initialized.
    pub fn init(&self, config: PoolConfig) -> Result<(), PoolError> {
        let mut inner = self.inner.write().unwrap();
        if inner.is_some() {
            tracing::error!("the worker pool is already initialized");
            return Err(PoolError::AlreadyInitialized);
        }

        let num_threads = config
            .thread_count
            .unwrap_or_else(default_thread_count)
            .max(1);
        let max_low_priority_threads = if config.use_native_low_priority_threads {
            0
        } else {
            ((num_threads as f32 * config.low_priority_task_ratio) as u32)
                .clamp(1, num_threads as u32)
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            task_available: Semaphore::new(),
            exit_threads: AtomicBool::new(false),
            low_priority_threads_used: CachePadded::new(AtomicU32::new(0)),
            max_low_priority_threads,
            use_native_low_priority_threads: config.use_native_low_priority_threads,
            num_threads,
            worker_ids: Mutex::new(HashMap::new()),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("Worker#{}", i))
                    .spawn(move || super::worker_thread(shared, i))
                    .unwrap()
            })
            .collect();

        shared.state.lock().unwrap().workers = workers;
        *inner = Some(shared);
        Ok(())
    }

    /// Join the workers and reclaim unconsumed records. Idempotent.
    ///
    /// Tasks still parked in the low priority holding queue never run; each
    /// is reported with its description.
    pub fn finish(&self) {
        let shared = self.inner.write().unwrap().take();
        if let Some(shared) = shared {
            super::finish(&shared);
        }
    }

    /// Submit one execution of `f`.
    pub fn add_task<F>(
        &self,
        f: F,
        priority: Priority,
        description: &str,
    ) -> Result<TaskId, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.shared()?;
        Ok(super::add_task(
            &shared,
            Work::Call(Some(Box::new(f))),
            priority,
            description,
        ))
    }

    /// Submit one execution of a plain function pointer.
    ///
    /// # Safety
    ///
    /// `userdata` must stay valid until the task completes and must be safe
    /// to use from another thread.
    pub unsafe fn add_native_task(
        &self,
        func: fn(*mut c_void),
        userdata: *mut c_void,
        priority: Priority,
        description: &str,
    ) -> Result<TaskId, PoolError> {
        let shared = self.shared()?;
        Ok(super::add_task(
            &shared,
            Work::Native { func, userdata },
            priority,
            description,
        ))
    }

    /// Dispatch `f` over the element indices `[0, elements)` across `tasks`
    /// sibling executions (`None` means one per worker).
    pub fn add_group_task<F>(
        &self,
        f: F,
        elements: u32,
        tasks: Option<u32>,
        priority: Priority,
        description: &str,
    ) -> Result<GroupId, PoolError>
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let shared = self.shared()?;
        super::add_group_task(
            &shared,
            Work::GroupCall(Arc::new(f)),
            elements,
            tasks,
            priority,
            description,
        )
    }

    /// Group variant of [`add_native_task`](WorkerPool::add_native_task).
    ///
    /// # Safety
    ///
    /// Same contract, except the userdata is shared by every sibling
    /// execution concurrently.
    pub unsafe fn add_native_group_task(
        &self,
        func: fn(*mut c_void, u32),
        userdata: *mut c_void,
        elements: u32,
        tasks: Option<u32>,
        priority: Priority,
        description: &str,
    ) -> Result<GroupId, PoolError> {
        let shared = self.shared()?;
        super::add_group_task(
            &shared,
            Work::NativeGroup { func, userdata },
            elements,
            tasks,
            priority,
            description,
        )
    }

    /// Whether the task has finished executing. The flag is write-once, so a
    /// `true` result is final.
    pub fn is_task_completed(&self, id: TaskId) -> Result<bool, PoolError> {
        self.shared()?.is_task_completed(id)
    }

    pub fn is_group_task_completed(&self, id: GroupId) -> Result<bool, PoolError> {
        self.shared()?.is_group_task_completed(id)
    }

    /// Block until the task has completed, then consume its id.
    ///
    /// At most one thread may wait on a given task; a concurrent wait is
    /// rejected. Calling this from inside a task is fine: a waiting worker
    /// keeps executing queued tasks instead of idling.
    pub fn wait_for_task_completion(&self, id: TaskId) -> Result<(), PoolError> {
        self.shared()?.wait_for_task_completion(id)
    }

    /// Block until every element of the group has been processed, then
    /// consume its id.
    pub fn wait_for_group_task_completion(&self, id: GroupId) -> Result<(), PoolError> {
        self.shared()?.wait_for_group_task_completion(id)
    }

    /// Number of worker threads, zero when not initialized.
    pub fn num_worker_threads(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|shared| shared.num_threads)
            .unwrap_or(0)
    }

    fn shared(&self) -> Result<Arc<Shared>, PoolError> {
        match &*self.inner.read().unwrap() {
            Some(shared) => Ok(Arc::clone(shared)),
            None => {
                tracing::error!("the worker pool is not initialized");
                Err(PoolError::NotInitialized)
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.finish();
    }
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
