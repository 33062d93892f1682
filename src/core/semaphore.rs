use super::sync::{Condvar, Mutex};

/// A counting semaphore built on a mutex and a condition variable.
///
/// This is the only wake-up primitive in the pool. It is used both as a
/// counting semaphore (the run-availability signal, one permit per queued
/// task) and as a binary one (the per-task and per-group done signals, which
/// are posted at most once).
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Make one permit available, waking a single waiter if there is one.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        // The notify must happen while the lock is held: the moment a waiter
        // can observe the new count it may free the record that owns this
        // semaphore, and the condvar must not be touched after that.
        self.cond.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Take a permit if one is immediately available.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}
