pub use std::sync::atomic::Ordering;

#[cfg(not(loom))] pub use std::{
    sync::{
        Arc, Mutex, Condvar, RwLock,
        atomic::{AtomicBool, AtomicU32},
    },
    thread,
};

#[cfg(loom)] pub use loom::{
    sync::{
        Arc, Mutex, Condvar, RwLock,
        atomic::{AtomicBool, AtomicU32},
    },
    thread,
};
