//! # weft-core
//!
//! A POSIX-1003.1c thread runtime built on the weak primitives exposed
//! by `weft-host`: raw threads, events, semaphores, sections, and TLS
//! slots. The runtime supplies what the host does not: joinable and
//! detached thread lifecycles over a descriptor reuse pool, deferred
//! cancellation with cleanup handlers and an event-interruptible wait,
//! thread-specific data with exit-time destructors, and the classical
//! synchronization primitives (mutex, condition variable, read/write
//! lock, barrier, spinlock, once, semaphore) with the semantics the
//! standard mandates.
//!
//! Operations report errno-style `i32` codes (0 on success); semaphore
//! operations return -1 and set the per-thread error indicator in
//! [`errno`].

#![deny(unsafe_code)]

pub mod attr;
#[allow(unsafe_code)]
pub mod barrier;
#[allow(unsafe_code)]
pub mod cancel;
#[allow(unsafe_code)]
pub mod cleanup;
#[allow(unsafe_code)]
pub mod cond;
pub mod errno;
pub(crate) mod handle;
#[allow(unsafe_code)]
pub mod mutex;
#[allow(unsafe_code)]
pub mod once;
pub mod process;
#[allow(unsafe_code)]
pub mod rwlock;
#[allow(unsafe_code)]
pub mod sem;
#[allow(unsafe_code)]
pub mod spin;
#[allow(unsafe_code)]
pub mod thread;
pub mod time;
#[allow(unsafe_code)]
pub mod tsd;
#[allow(unsafe_code)]
pub mod wait;

pub use attr::ThreadAttr;
pub use cancel::{
    CANCEL_ASYNCHRONOUS, CANCEL_DEFERRED, CANCEL_DISABLE, CANCEL_ENABLE, cancel,
    set_cancel_state, set_cancel_type, test_cancel,
};
pub use cleanup::{pop as cleanup_pop, push as cleanup_push};
pub use cond::{COND_INITIALIZER, Cond, CondAttr};
pub use mutex::{
    MUTEX_DEFAULT, MUTEX_ERRORCHECK, MUTEX_INITIALIZER, MUTEX_NORMAL, MUTEX_RECURSIVE, Mutex,
    MutexAttr,
};
pub use once::{ONCE_INIT, Once, once};
pub use rwlock::{RWLOCK_INITIALIZER, RwLock};
pub use sem::Semaphore;
pub use spin::{PROCESS_PRIVATE, PROCESS_SHARED, SPIN_INITIALIZER, Spin};
pub use thread::{
    CANCELED, CREATE_DETACHED, CREATE_JOINABLE, StartRoutine, ThreadToken, create, current,
    detach, equal, exit_thread, join,
};
pub use time::Timespec;
pub use wait::{delay_ms, sleep};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Tests share process-global state (the key table, the reuse
    /// pool); serialize them.
    pub(crate) fn serial() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
