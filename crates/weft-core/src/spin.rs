//! Spinlock engine.
//!
//! On a multiprocessor the lock is an atomic word with a bounded
//! busy-wait that yields the timeslice between rounds. A uniprocessor
//! host is detected at initialization and falls back to a mutex, where
//! spinning could never make progress.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::errno;
use crate::handle::{self, STATIC_INIT};
use crate::mutex::{MUTEX_NORMAL, MutexState};
use crate::process;

/// Spins between yields while contended.
const SPIN_ROUNDS: u32 = 100;

/// The lock is private to this process.
pub const PROCESS_PRIVATE: i32 = 0;
/// Cross-process sharing; not supported on this host.
pub const PROCESS_SHARED: i32 = 1;

enum SpinImpl {
    Word(AtomicBool),
    /// Uniprocessor fallback.
    Mutex(MutexState),
}

pub(crate) struct SpinState {
    imp: SpinImpl,
}

impl SpinState {
    fn new() -> Self {
        let imp = if weft_host::cpu_count() > 1 {
            SpinImpl::Word(AtomicBool::new(false))
        } else {
            SpinImpl::Mutex(MutexState::new(MUTEX_NORMAL))
        };
        Self { imp }
    }

    fn lock(&self) -> i32 {
        match &self.imp {
            SpinImpl::Word(word) => {
                let mut rounds = 0;
                while word
                    .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    std::hint::spin_loop();
                    rounds += 1;
                    if rounds >= SPIN_ROUNDS {
                        rounds = 0;
                        weft_host::yield_now();
                    }
                }
                0
            }
            SpinImpl::Mutex(mx) => mx.lock_nocancel(),
        }
    }

    fn try_lock(&self) -> i32 {
        match &self.imp {
            SpinImpl::Word(word) => {
                if word
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    0
                } else {
                    errno::EBUSY
                }
            }
            SpinImpl::Mutex(mx) => mx.try_lock(),
        }
    }

    fn unlock(&self) -> i32 {
        match &self.imp {
            SpinImpl::Word(word) => {
                word.store(false, Ordering::Release);
                0
            }
            SpinImpl::Mutex(mx) => mx.unlock(),
        }
    }

    fn held(&self) -> bool {
        match &self.imp {
            SpinImpl::Word(word) => word.load(Ordering::Acquire),
            SpinImpl::Mutex(mx) => mx.held(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle API
// ---------------------------------------------------------------------------

/// Spinlock handle.
pub struct Spin {
    cell: AtomicUsize,
}

/// Static initializer.
pub const SPIN_INITIALIZER: Spin = Spin {
    cell: AtomicUsize::new(STATIC_INIT),
};

impl Default for Spin {
    fn default() -> Self {
        Self::new()
    }
}

impl Spin {
    #[must_use]
    pub const fn new() -> Self {
        SPIN_INITIALIZER
    }
}

fn state_of(s: &Spin) -> Result<*mut SpinState, i32> {
    handle::resolve_or_promote(&s.cell, process::spin_init_section(), SpinState::new)
}

/// Initialize `s`. Only [`PROCESS_PRIVATE`] sharing is supported.
pub fn init(s: &Spin, pshared: i32) -> i32 {
    process::ensure_init();
    if pshared == PROCESS_SHARED {
        return errno::ENOTSUP;
    }
    if pshared != PROCESS_PRIVATE {
        return errno::EINVAL;
    }
    let current = s.cell.load(Ordering::Acquire);
    if current != 0 && current != STATIC_INIT {
        return errno::EBUSY;
    }
    let state = Box::into_raw(Box::new(SpinState::new()));
    s.cell.store(state as usize, Ordering::Release);
    0
}

/// Busy-wait until the lock is acquired.
pub fn lock(s: &Spin) -> i32 {
    match state_of(s) {
        Ok(state) => unsafe { &*state }.lock(),
        Err(rc) => rc,
    }
}

/// Single acquisition attempt; `EBUSY` without spinning.
pub fn try_lock(s: &Spin) -> i32 {
    match state_of(s) {
        Ok(state) => unsafe { &*state }.try_lock(),
        Err(rc) => rc,
    }
}

/// Release the lock.
pub fn unlock(s: &Spin) -> i32 {
    match state_of(s) {
        Ok(state) => unsafe { &*state }.unlock(),
        Err(rc) => rc,
    }
}

/// Destroy `s`. `EBUSY` while held.
pub fn destroy(s: &Spin) -> i32 {
    match s.cell.load(Ordering::Acquire) {
        0 => errno::EINVAL,
        STATIC_INIT => {
            s.cell.store(0, Ordering::Release);
            0
        }
        state => {
            if unsafe { &*(state as *const SpinState) }.held() {
                return errno::EBUSY;
            }
            s.cell.store(0, Ordering::Release);
            drop(unsafe { Box::from_raw(state as *mut SpinState) });
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
