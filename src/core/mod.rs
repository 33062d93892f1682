pub mod pool;
pub mod queue;
pub mod semaphore;
pub mod slab;
/// basic std::sync types reexported here so that we can hook loom into them
/// for testing.
pub mod sync;
pub mod task;

use std::collections::HashMap;

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::PoolError;
use queue::TaskQueue;
use semaphore::Semaphore;
use slab::Slab;
use sync::{thread, Arc, AtomicBool, AtomicU32, Mutex, Ordering};
use task::{Group, GroupId, GroupRef, Priority, Task, TaskId, TaskRef, Work};

/// Everything guarded by the task mutex: the queues, the identifier
/// registries, the record slabs and the id counter.
pub(crate) struct State {
    pub tasks: HashMap<TaskId, TaskRef>,
    pub groups: HashMap<GroupId, GroupRef>,
    pub task_slab: Slab<Task>,
    pub group_slab: Slab<Group>,
    /// Tasks ready to be picked up by a worker, FIFO.
    pub run_queue: TaskQueue,
    /// Low priority tasks admitted to the pool but over the quota, FIFO.
    pub low_priority_hold_queue: TaskQueue,
    next_id: u64,
    pub workers: Vec<thread::JoinHandle<()>>,
}

impl State {
    pub fn new() -> Self {
        State {
            tasks: HashMap::new(),
            groups: HashMap::new(),
            task_slab: Slab::new(),
            group_slab: Slab::new(),
            run_queue: TaskQueue::new(),
            low_priority_hold_queue: TaskQueue::new(),
            next_id: 1,
            workers: Vec::new(),
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Data shared between the pool handle and all of its threads.
pub(crate) struct Shared {
    pub state: Mutex<State>,
    /// One permit per task sitting in the run queue (plus the shutdown
    /// wake-ups). Posted outside the task mutex.
    pub task_available: Semaphore,
    /// Set once by `finish`, read by the workers after every wake-up.
    pub exit_threads: AtomicBool,
    /// Number of low priority tasks currently in the run queue or executing
    /// on a pool worker. Mutated under the task mutex.
    pub low_priority_threads_used: CachePadded<AtomicU32>,
    /// Admission quota for low priority tasks. Zero when native low priority
    /// threads are used.
    pub max_low_priority_threads: u32,
    pub use_native_low_priority_threads: bool,
    pub num_threads: usize,
    /// Thread id of each worker, so a waiter can recognize that it is itself
    /// a worker and must keep servicing the queue.
    pub worker_ids: Mutex<HashMap<thread::ThreadId, usize>>,
}

impl Shared {
    pub fn is_task_completed(&self, id: TaskId) -> Result<bool, PoolError> {
        let state = self.state.lock().unwrap();
        match state.tasks.get(&id) {
            None => {
                drop(state);
                tracing::error!("invalid task id: {}", id);
                Err(PoolError::InvalidTaskId(id))
            }
            Some(&task) => Ok(unsafe { task.get() }.completed.load(Ordering::Acquire)),
        }
    }

    pub fn is_group_task_completed(&self, id: GroupId) -> Result<bool, PoolError> {
        let state = self.state.lock().unwrap();
        match state.groups.get(&id) {
            None => {
                drop(state);
                tracing::error!("invalid group id: {}", id);
                Err(PoolError::InvalidGroupId(id))
            }
            Some(&group) => Ok(unsafe { group.get() }.completed.load(Ordering::Acquire)),
        }
    }

    pub fn wait_for_task_completion(&self, id: TaskId) -> Result<(), PoolError> {
        let task = {
            let state = self.state.lock().unwrap();
            match state.tasks.get(&id) {
                None => {
                    drop(state);
                    tracing::error!("invalid task id: {}", id);
                    return Err(PoolError::InvalidTaskId(id));
                }
                Some(&task) => {
                    let t = unsafe { task.get() };
                    if t.waiting.load(Ordering::Relaxed) {
                        let description = t.description.clone();
                        drop(state);
                        tracing::error!(
                            "another thread is waiting on task {} ({})",
                            id,
                            description
                        );
                        return Err(PoolError::TaskAlreadyWaited { id, description });
                    }
                    t.waiting.store(true, Ordering::Relaxed);
                    task
                }
            }
        };

        profiling::scope!("wait_for_task_completion");

        let t = unsafe { task.get() };
        let native_thread = t.native_thread.lock().unwrap().take();
        if let Some(handle) = native_thread {
            // Native low priority task: completion is the thread's exit.
            let _ = handle.join();
        } else if self.is_worker_thread() {
            // A worker must not block outright: it keeps servicing the run
            // queue while it waits, otherwise tasks that wait on other tasks
            // can deadlock a saturated pool.
            let mut backoff = Backoff::new();
            loop {
                if t.done.try_wait() {
                    break;
                }
                if self.task_available.try_wait() {
                    process_task_queue(self);
                    backoff = Backoff::new();
                    continue;
                }
                backoff.snooze();
            }
        } else {
            t.done.wait();
        }

        let mut state = self.state.lock().unwrap();
        state.tasks.remove(&id);
        unsafe { state.task_slab.free(task.raw()) };
        Ok(())
    }

    pub fn wait_for_group_task_completion(&self, id: GroupId) -> Result<(), PoolError> {
        let group = {
            let state = self.state.lock().unwrap();
            match state.groups.get(&id) {
                None => {
                    drop(state);
                    tracing::error!("invalid group id: {}", id);
                    return Err(PoolError::InvalidGroupId(id));
                }
                Some(&group) => {
                    let g = unsafe { group.get() };
                    if g.waiting.load(Ordering::Relaxed) {
                        drop(state);
                        tracing::error!("another thread is waiting on group task {}", id);
                        return Err(PoolError::GroupAlreadyWaited(id));
                    }
                    g.waiting.store(true, Ordering::Relaxed);
                    group
                }
            }
        };

        profiling::scope!("wait_for_group_task_completion");

        let g = unsafe { group.get() };
        if !g.native_tasks.is_empty() {
            // Native low priority group: completion is the exit of every
            // sibling thread, and the waiter owns all of the cleanup.
            for &sibling in &g.native_tasks {
                let handle = unsafe { sibling.get() }.native_thread.lock().unwrap().take();
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
            let mut state = self.state.lock().unwrap();
            for &sibling in &g.native_tasks {
                unsafe { state.task_slab.free(sibling.raw()) };
            }
            state.groups.remove(&id);
            unsafe { state.group_slab.free(group.raw()) };
        } else {
            // The done signal is posted by the last sibling to exit the
            // body, so once it is consumed no thread is left using the
            // record and the waiter owns it.
            g.done.wait();

            let mut state = self.state.lock().unwrap();
            state.groups.remove(&id);
            unsafe { state.group_slab.free(group.raw()) };
        }
        Ok(())
    }

    fn is_worker_thread(&self) -> bool {
        self.worker_ids
            .lock()
            .unwrap()
            .contains_key(&thread::current().id())
    }
}

pub(crate) fn add_task(
    shared: &Arc<Shared>,
    work: Work,
    priority: Priority,
    description: &str,
) -> TaskId {
    let (id, task) = {
        let mut state = shared.state.lock().unwrap();
        let id = TaskId(state.take_id());
        let task = TaskRef::new(state.task_slab.alloc(Task::new(work, description, None)));
        state.tasks.insert(id, task);
        (id, task)
    };

    post_task(shared, task, priority);

    id
}

pub(crate) fn add_group_task(
    shared: &Arc<Shared>,
    work: Work,
    elements: u32,
    tasks: Option<u32>,
    priority: Priority,
    description: &str,
) -> Result<GroupId, PoolError> {
    if elements == 0 {
        tracing::error!("rejecting group task with no elements: {}", description);
        return Err(PoolError::EmptyGroup);
    }
    let tasks_used = tasks.unwrap_or(shared.num_threads as u32).max(1);
    let native_low = priority == Priority::Low && shared.use_native_low_priority_threads;

    let mut siblings = Vec::with_capacity(tasks_used as usize);
    let id = {
        let mut state = shared.state.lock().unwrap();
        let id = GroupId(state.take_id());
        let mut group_ptr = state.group_slab.alloc(Group::new(elements, tasks_used));
        let group = GroupRef::new(group_ptr);
        for _ in 0..tasks_used {
            let task = Task::new(work.duplicate(), description, Some(group));
            siblings.push(TaskRef::new(state.task_slab.alloc(task)));
        }
        if native_low {
            // The waiter reclaims native siblings through the group. The
            // record is not registered yet, so this is still the only
            // reference to it.
            unsafe { group_ptr.as_mut().native_tasks = siblings.clone() };
        }
        state.groups.insert(id, group);
        id
    };

    for &task in &siblings {
        post_task(shared, task, priority);
    }

    Ok(id)
}

/// Route a task: dedicated thread, run queue, or the holding queue.
fn post_task(shared: &Arc<Shared>, task: TaskRef, priority: Priority) {
    let t = unsafe { task.get() };
    t.low_priority
        .store(priority == Priority::Low, Ordering::Relaxed);

    if priority == Priority::Low && shared.use_native_low_priority_threads {
        // Dedicated thread: runs this one task and exits. The handle is
        // stored on the record before the id can reach another thread, so
        // the wait path always finds it.
        let thread_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("LowPriorityWorker".to_string())
            .spawn(move || {
                profiling::register_thread!("LowPriorityWorker");
                unsafe { process_task(&thread_shared, task) };
            })
            .unwrap();
        *t.native_thread.lock().unwrap() = Some(handle);
    } else {
        let mut post = false;
        {
            let mut state = shared.state.lock().unwrap();
            if priority == Priority::High
                || shared.low_priority_threads_used.load(Ordering::Relaxed)
                    < shared.max_low_priority_threads
            {
                if priority == Priority::Low {
                    shared
                        .low_priority_threads_used
                        .fetch_add(1, Ordering::Relaxed);
                }
                state.run_queue.push_back(task);
                post = true;
            } else {
                // Over the low priority quota; parked until a slot frees.
                state.low_priority_hold_queue.push_back(task);
            }
        }
        if post {
            shared.task_available.post();
        }
    }
}

/// The body of each pool worker.
pub(crate) fn worker_thread(shared: Arc<Shared>, index: usize) {
    shared
        .worker_ids
        .lock()
        .unwrap()
        .insert(thread::current().id(), index);

    profiling::register_thread!("Worker");

    loop {
        shared.task_available.wait();
        if shared.exit_threads.load(Ordering::Acquire) {
            break;
        }
        process_task_queue(&shared);
    }
}

/// Pop the head of the run queue and execute it.
///
/// The queue can be empty when a shutdown wake-up was consumed by a
/// reentrant waiter instead of a parked worker; that is not an error.
fn process_task_queue(shared: &Shared) {
    let task = shared.state.lock().unwrap().run_queue.pop_front();
    if let Some(task) = task {
        unsafe { process_task(shared, task) };
    }
}

/// Execute one task and run its completion and cleanup protocol.
///
/// # Safety
///
/// The caller must be the unique executor of `task`: either the worker that
/// popped it from the run queue, or the dedicated thread it was handed to.
pub(crate) unsafe fn process_task(shared: &Shared, task: TaskRef) {
    profiling::scope!("process_task");

    // The record can be freed before the epilogue runs; everything the
    // epilogue needs is read out first.
    let low_priority = task.get().low_priority.load(Ordering::Relaxed);
    let group = task.get().group;

    if let Some(group) = group {
        let work = &mut *task.get().work.get();
        let mut is_completer = false;
        loop {
            let work_index = group.get().index.fetch_add(1, Ordering::Relaxed);
            if work_index >= group.get().max {
                // Exactly one sibling claims `max` itself; it marks the
                // group completed when siblings run on dedicated threads.
                is_completer = work_index == group.get().max;
                break;
            }
            work.invoke(Some(work_index));
        }

        if low_priority && shared.use_native_low_priority_threads {
            // Completion is observed per sibling thread; the group waiter
            // joins them and frees all the records.
            task.get().completed.store(true, Ordering::Release);
            task.get().done.post();
            if is_completer {
                group.get().completed.store(true, Ordering::Release);
            }
        } else {
            // Index exhaustion is not completion: a sibling can still be
            // executing its last claimed element. The last sibling to leave
            // the body owns the completion signalling. `tasks_used` is read
            // before the increment, and the done post is the final group
            // access on this thread; the waiter may free the record the
            // moment it lands.
            let tasks_used = group.get().tasks_used;
            let exited = group.get().finished.fetch_add(1, Ordering::AcqRel) + 1;
            if exited == tasks_used {
                group.get().completed.store(true, Ordering::Release);
                group.get().done.post();
            }

            // Group siblings have no public id and free their own record.
            let mut state = shared.state.lock().unwrap();
            state.task_slab.free(task.raw());
        }
    } else {
        let work = &mut *task.get().work.get();
        work.invoke(None);
        task.get().completed.store(true, Ordering::Release);
        task.get().done.post();
    }

    if low_priority && !shared.use_native_low_priority_threads {
        // A low priority slot was released: promote the oldest held task, or
        // give the slot back to the quota. One critical section; the
        // semaphore is posted after it is released.
        let mut promoted = false;
        {
            let mut state = shared.state.lock().unwrap();
            if let Some(held) = state.low_priority_hold_queue.pop_front() {
                state.run_queue.push_back(held);
                promoted = true;
            } else {
                shared
                    .low_priority_threads_used
                    .fetch_sub(1, Ordering::Relaxed);
            }
        }
        if promoted {
            shared.task_available.post();
        }
    }
}

/// Signal the workers to exit, join them, then reclaim every record that was
/// never consumed.
pub(crate) fn finish(shared: &Arc<Shared>) {
    let workers = {
        let mut state = shared.state.lock().unwrap();
        std::mem::take(&mut state.workers)
    };
    if workers.is_empty() {
        return;
    }

    shared.exit_threads.store(true, Ordering::Release);
    for _ in 0..workers.len() {
        shared.task_available.post();
    }
    for worker in workers {
        let _ = worker.join();
    }

    reclaim(shared);
}

/// Free everything still registered once the workers are gone.
fn reclaim(shared: &Shared) {
    let mut pending_joins = Vec::new();
    {
        let mut state = shared.state.lock().unwrap();

        while let Some(task) = state.low_priority_hold_queue.pop_front() {
            let t = unsafe { task.get() };
            tracing::error!(
                "task was never re-claimed from the low priority queue: {}",
                t.description
            );
            if t.group.is_some() {
                // Group siblings have no registry entry to reclaim them by.
                unsafe { state.task_slab.free(task.raw()) };
            }
        }
        while let Some(task) = state.run_queue.pop_front() {
            let t = unsafe { task.get() };
            tracing::debug!("dropping queued task at shutdown: {}", t.description);
            if t.group.is_some() {
                unsafe { state.task_slab.free(task.raw()) };
            }
        }

        // Dedicated low priority threads may still be running. They never
        // take the task mutex, but they are joined with it released anyway.
        for &task in state.tasks.values() {
            if let Some(handle) = unsafe { task.get() }.native_thread.lock().unwrap().take() {
                pending_joins.push(handle);
            }
        }
        for &group in state.groups.values() {
            for &sibling in &unsafe { group.get() }.native_tasks {
                if let Some(handle) =
                    unsafe { sibling.get() }.native_thread.lock().unwrap().take()
                {
                    pending_joins.push(handle);
                }
            }
        }
    }

    for handle in pending_joins {
        let _ = handle.join();
    }

    let mut state = shared.state.lock().unwrap();
    let state = &mut *state;
    for (_, task) in state.tasks.drain() {
        unsafe { state.task_slab.free(task.raw()) };
    }
    for (_, group) in state.groups.drain() {
        for &sibling in &unsafe { group.get() }.native_tasks {
            unsafe { state.task_slab.free(sibling.raw()) };
        }
        unsafe { state.group_slab.free(group.raw()) };
    }
}
