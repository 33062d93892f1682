use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use taskforce::{PoolConfig, PoolError, Priority, WorkerPool};

fn init_pool(threads: usize, native_low_priority: bool, ratio: f32) -> WorkerPool {
    let pool = WorkerPool::new();
    let mut config = PoolConfig::default()
        .with_thread_count(threads)
        .with_low_priority_task_ratio(ratio);
    if native_low_priority {
        config = config.with_native_low_priority_threads();
    }
    pool.init(config).unwrap();
    pool
}

#[track_caller]
fn poll_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn single_task_completes() {
    let pool = init_pool(4, false, 0.5);
    let value = Arc::new(AtomicU32::new(0));

    let id = pool
        .add_task(
            {
                let value = Arc::clone(&value);
                move || value.store(42, Ordering::SeqCst)
            },
            Priority::High,
            "answer",
        )
        .unwrap();

    poll_until(|| pool.is_task_completed(id).unwrap());
    pool.wait_for_task_completion(id).unwrap();
    assert_eq!(value.load(Ordering::SeqCst), 42);

    // The wait consumed the id.
    assert!(matches!(
        pool.wait_for_task_completion(id),
        Err(PoolError::InvalidTaskId(_))
    ));
    assert!(matches!(
        pool.is_task_completed(id),
        Err(PoolError::InvalidTaskId(_))
    ));

    pool.finish();
}

#[test]
fn group_covers_every_index_once() {
    let pool = init_pool(4, false, 0.5);
    let sum = Arc::new(AtomicU64::new(0));
    let covered: Arc<Vec<AtomicU32>> = Arc::new((0..1000).map(|_| AtomicU32::new(0)).collect());

    let id = pool
        .add_group_task(
            {
                let sum = Arc::clone(&sum);
                let covered = Arc::clone(&covered);
                move |index| {
                    covered[index as usize].fetch_add(1, Ordering::SeqCst);
                    sum.fetch_add(index as u64, Ordering::SeqCst);
                }
            },
            1000,
            Some(4),
            Priority::High,
            "sum indices",
        )
        .unwrap();

    poll_until(|| pool.is_group_task_completed(id).unwrap());
    pool.wait_for_group_task_completion(id).unwrap();

    assert_eq!(sum.load(Ordering::SeqCst), 499_500);
    for slot in covered.iter() {
        assert_eq!(slot.load(Ordering::SeqCst), 1);
    }

    assert!(matches!(
        pool.is_group_task_completed(id),
        Err(PoolError::InvalidGroupId(_))
    ));

    pool.finish();
}

#[test]
fn group_with_more_siblings_than_elements() {
    let pool = init_pool(4, false, 0.5);
    let hits = Arc::new(AtomicU32::new(0));

    let id = pool
        .add_group_task(
            {
                let hits = Arc::clone(&hits);
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            },
            3,
            Some(8),
            Priority::High,
            "more siblings than work",
        )
        .unwrap();

    pool.wait_for_group_task_completion(id).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    pool.finish();
}

#[test]
fn group_sibling_count_defaults_to_worker_count() {
    let pool = init_pool(3, false, 0.5);
    let hits = Arc::new(AtomicU32::new(0));

    let id = pool
        .add_group_task(
            {
                let hits = Arc::clone(&hits);
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            },
            100,
            None,
            Priority::Low,
            "default sibling count",
        )
        .unwrap();

    pool.wait_for_group_task_completion(id).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 100);

    pool.finish();
}

#[test]
fn empty_group_is_rejected() {
    let pool = init_pool(2, false, 0.5);
    assert!(matches!(
        pool.add_group_task(|_| {}, 0, None, Priority::High, "empty"),
        Err(PoolError::EmptyGroup)
    ));
    pool.finish();
}

#[test]
fn low_priority_admission_respects_quota() {
    // 4 workers, ratio 0.5: at most 2 low priority tasks on the pool at once.
    let pool = init_pool(4, false, 0.5);
    let in_flight = Arc::new(AtomicU32::new(0));
    let high_water = Arc::new(AtomicU32::new(0));

    let ids: Vec<_> = (0..6)
        .map(|i| {
            let in_flight = Arc::clone(&in_flight);
            let high_water = Arc::clone(&high_water);
            pool.add_task(
                move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                },
                Priority::Low,
                &format!("slow background #{}", i),
            )
            .unwrap()
        })
        .collect();

    for id in ids {
        pool.wait_for_task_completion(id).unwrap();
    }

    assert!(high_water.load(Ordering::SeqCst) <= 2);
    pool.finish();
}

#[test]
fn waiting_inside_a_task_does_not_deadlock() {
    // Saturate a 2-worker pool with tasks that each submit a child and wait
    // on it; the workers drain the children from inside their waits.
    let pool = Arc::new(init_pool(2, false, 0.5));
    let children_run = Arc::new(AtomicU32::new(0));

    let ids: Vec<_> = (0..4)
        .map(|i| {
            let pool = Arc::clone(&pool);
            let children_run = Arc::clone(&children_run);
            pool.clone()
                .add_task(
                    move || {
                        let child = pool
                            .add_task(
                                {
                                    let children_run = Arc::clone(&children_run);
                                    move || {
                                        children_run.fetch_add(1, Ordering::SeqCst);
                                    }
                                },
                                Priority::High,
                                "child",
                            )
                            .unwrap();
                        pool.wait_for_task_completion(child).unwrap();
                    },
                    Priority::High,
                    &format!("parent #{}", i),
                )
                .unwrap()
        })
        .collect();

    for id in ids {
        pool.wait_for_task_completion(id).unwrap();
    }

    assert_eq!(children_run.load(Ordering::SeqCst), 4);
    pool.finish();
}

#[test]
fn native_low_priority_tasks_get_their_own_threads() {
    let pool = init_pool(2, true, 0.5);
    let seen_threads = Arc::new(Mutex::new(HashSet::new()));

    let ids: Vec<_> = (0..8)
        .map(|i| {
            let seen_threads = Arc::clone(&seen_threads);
            pool.add_task(
                move || {
                    seen_threads.lock().unwrap().insert(thread::current().id());
                    thread::sleep(Duration::from_millis(10));
                },
                Priority::Low,
                &format!("native background #{}", i),
            )
            .unwrap()
        })
        .collect();

    for id in ids {
        pool.wait_for_task_completion(id).unwrap();
    }

    // One transient thread per low priority task.
    assert_eq!(seen_threads.lock().unwrap().len(), 8);

    // High priority work still runs on the pool in this mode.
    let ran = Arc::new(AtomicU32::new(0));
    let id = pool
        .add_task(
            {
                let ran = Arc::clone(&ran);
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            },
            Priority::High,
            "pooled",
        )
        .unwrap();
    pool.wait_for_task_completion(id).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    pool.finish();
}

#[test]
fn native_low_priority_group_joins_all_siblings() {
    let pool = init_pool(2, true, 0.5);
    let sum = Arc::new(AtomicU64::new(0));

    let id = pool
        .add_group_task(
            {
                let sum = Arc::clone(&sum);
                move |index| {
                    sum.fetch_add(index as u64, Ordering::SeqCst);
                }
            },
            100,
            Some(4),
            Priority::Low,
            "native group",
        )
        .unwrap();

    pool.wait_for_group_task_completion(id).unwrap();
    assert_eq!(sum.load(Ordering::SeqCst), 4950);

    pool.finish();
}

#[test]
fn shutdown_reports_held_tasks() {
    // One worker, full ratio: one low priority slot.
    let pool = init_pool(1, false, 1.0);
    let started = Arc::new(AtomicU32::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    let first = {
        let started = Arc::clone(&started);
        let ran = Arc::clone(&ran);
        pool.add_task(
            move || {
                started.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                ran.fetch_add(1, Ordering::SeqCst);
            },
            Priority::Low,
            "held #0",
        )
        .unwrap()
    };
    for i in 1..4 {
        let ran = Arc::clone(&ran);
        pool.add_task(
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            },
            Priority::Low,
            &format!("held #{}", i),
        )
        .unwrap();
    }

    // The first task occupies the only slot; the rest sit in the holding
    // queue and are reported and reclaimed by finish.
    poll_until(|| started.load(Ordering::SeqCst) == 1);
    pool.finish();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(matches!(
        pool.is_task_completed(first),
        Err(PoolError::NotInitialized)
    ));
}

#[test]
fn concurrent_waits_are_rejected() {
    let pool = Arc::new(init_pool(2, false, 0.5));
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    let id = pool
        .add_task(
            move || {
                let _ = gate_rx.recv();
            },
            Priority::High,
            "gated",
        )
        .unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.wait_for_task_completion(id))
        })
        .collect();

    // Give both waiters ample time to reach the wait before opening the gate.
    thread::sleep(Duration::from_millis(200));
    gate_tx.send(()).unwrap();

    let results: Vec<_> = waiters
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(PoolError::TaskAlreadyWaited { .. })))
            .count(),
        1
    );

    pool.finish();
}

#[test]
fn second_group_waiter_is_rejected() {
    let pool = Arc::new(init_pool(2, false, 0.5));
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);

    let id = pool
        .add_group_task(
            move |_| {
                let _ = gate_rx.lock().unwrap().recv();
            },
            1,
            Some(1),
            Priority::High,
            "gated group",
        )
        .unwrap();

    let first = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.wait_for_group_task_completion(id))
    };
    thread::sleep(Duration::from_millis(200));

    let second = pool.wait_for_group_task_completion(id);
    assert!(matches!(
        second,
        Err(PoolError::GroupAlreadyWaited(_) | PoolError::InvalidGroupId(_))
    ));

    gate_tx.send(()).unwrap();
    first.join().unwrap().unwrap();

    pool.finish();
}

#[test]
fn identifiers_increase_across_kinds() {
    let pool = init_pool(2, false, 0.5);
    let mut raw_ids = Vec::new();

    for _ in 0..4 {
        let task = pool.add_task(|| {}, Priority::High, "").unwrap();
        raw_ids.push(task.get());
        let group = pool
            .add_group_task(|_| {}, 4, Some(2), Priority::High, "")
            .unwrap();
        raw_ids.push(group.get());
    }

    for pair in raw_ids.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    pool.finish();
}

#[test]
fn native_function_pointer_tasks() {
    fn bump(userdata: *mut c_void) {
        let counter = unsafe { &*(userdata as *const AtomicU64) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn bump_by_index(userdata: *mut c_void, index: u32) {
        let counter = unsafe { &*(userdata as *const AtomicU64) };
        counter.fetch_add(index as u64, Ordering::SeqCst);
    }

    let pool = init_pool(2, false, 0.5);
    let counter = AtomicU64::new(0);
    let userdata = &counter as *const AtomicU64 as *mut c_void;

    let id = unsafe {
        pool.add_native_task(bump, userdata, Priority::High, "native bump")
            .unwrap()
    };
    pool.wait_for_task_completion(id).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let id = unsafe {
        pool.add_native_group_task(bump_by_index, userdata, 10, Some(2), Priority::High, "")
            .unwrap()
    };
    pool.wait_for_group_task_completion(id).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1 + 45);

    pool.finish();
}

#[test]
fn panicking_task_still_completes() {
    let pool = init_pool(2, false, 0.5);

    let id = pool
        .add_task(|| panic!("task body failure"), Priority::High, "panics")
        .unwrap();
    pool.wait_for_task_completion(id).unwrap();

    // The pool is still functional afterwards.
    let ran = Arc::new(AtomicU32::new(0));
    let id = pool
        .add_task(
            {
                let ran = Arc::clone(&ran);
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            },
            Priority::High,
            "after panic",
        )
        .unwrap();
    pool.wait_for_task_completion(id).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    pool.finish();
}

#[test]
fn completion_flag_is_monotonic() {
    let pool = init_pool(2, false, 0.5);
    let (gate_tx, gate_rx) = mpsc::channel::<()>();

    let id = pool
        .add_task(
            move || {
                let _ = gate_rx.recv();
            },
            Priority::High,
            "gated",
        )
        .unwrap();

    assert!(!pool.is_task_completed(id).unwrap());
    gate_tx.send(()).unwrap();
    poll_until(|| pool.is_task_completed(id).unwrap());
    // Once set, the flag stays set until the id is consumed.
    assert!(pool.is_task_completed(id).unwrap());
    pool.wait_for_task_completion(id).unwrap();

    pool.finish();
}

#[test]
fn dropping_the_pool_joins_the_workers() {
    let ran = Arc::new(AtomicU32::new(0));
    {
        let pool = init_pool(2, false, 0.5);
        let id = pool
            .add_task(
                {
                    let ran = Arc::clone(&ran);
                    move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    }
                },
                Priority::High,
                "",
            )
            .unwrap();
        pool.wait_for_task_completion(id).unwrap();
        // No explicit finish; drop handles it.
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
