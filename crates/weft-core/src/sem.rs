//! Counting semaphore with timed, cancellable waits.
//!
//! Semaphore operations follow the POSIX `sem_*` boundary convention:
//! they return 0 on success or -1 with the code in the calling thread's
//! error indicator. Waits are cancellation points.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use weft_host::HostSemaphore;

use crate::cancel;
use crate::errno::{self, set_errno};
use crate::process;
use crate::time::{self, Timespec};
use crate::wait::{self, WaitStatus};

use crate::spin::{PROCESS_PRIVATE, PROCESS_SHARED};

pub(crate) struct SemState {
    sem: HostSemaphore,
}

/// Semaphore handle. No static initializer; `init` is required.
pub struct Semaphore {
    cell: AtomicUsize,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Semaphore {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: AtomicUsize::new(0),
        }
    }
}

fn fail(code: i32) -> i32 {
    set_errno(code);
    -1
}

fn state_of(s: &Semaphore) -> Result<*mut SemState, i32> {
    match s.cell.load(Ordering::Acquire) {
        0 => Err(errno::EINVAL),
        state => Ok(state as *mut SemState),
    }
}

/// Initialize `s` with `value` units. Only process-private semaphores
/// are supported.
pub fn init(s: &Semaphore, pshared: i32, value: u32) -> i32 {
    process::ensure_init();
    if pshared == PROCESS_SHARED {
        return fail(errno::ENOTSUP);
    }
    if pshared != PROCESS_PRIVATE {
        return fail(errno::EINVAL);
    }
    if s.cell.load(Ordering::Acquire) != 0 {
        return fail(errno::EBUSY);
    }
    let state = Box::into_raw(Box::new(SemState {
        sem: HostSemaphore::new(value),
    }));
    s.cell.store(state as usize, Ordering::Release);
    0
}

/// Acquire one unit, blocking while none are available. A cancellation
/// point.
pub fn wait(s: &Semaphore) -> i32 {
    let state = match state_of(s) {
        Ok(state) => state,
        Err(rc) => return fail(rc),
    };
    match wait::wait_cancellable(&unsafe { &*state }.sem, None) {
        WaitStatus::Ok => 0,
        WaitStatus::Cancelled => cancel::unwind(cancel::ExitReason::Cancel),
        WaitStatus::TimedOut => fail(errno::EINTR),
    }
}

/// Acquire one unit without blocking; `EAGAIN` when none are available.
pub fn try_wait(s: &Semaphore) -> i32 {
    let state = match state_of(s) {
        Ok(state) => state,
        Err(rc) => return fail(rc),
    };
    use weft_host::Waitable;
    if unsafe { &*state }.sem.try_consume() {
        0
    } else {
        fail(errno::EAGAIN)
    }
}

/// Acquire one unit, giving up at the absolute deadline `abstime`. A
/// cancellation point.
pub fn timed_wait(s: &Semaphore, abstime: &Timespec) -> i32 {
    let state = match state_of(s) {
        Ok(state) => state,
        Err(rc) => return fail(rc),
    };
    let timeout = Duration::from_millis(time::delta_ms(abstime));
    match wait::wait_cancellable(&unsafe { &*state }.sem, Some(timeout)) {
        WaitStatus::Ok => 0,
        WaitStatus::TimedOut => fail(errno::ETIMEDOUT),
        WaitStatus::Cancelled => cancel::unwind(cancel::ExitReason::Cancel),
    }
}

/// Release one unit.
pub fn post(s: &Semaphore) -> i32 {
    let state = match state_of(s) {
        Ok(state) => state,
        Err(rc) => return fail(rc),
    };
    unsafe { &*state }.sem.post(1);
    0
}

/// Store the current unit count into `value`.
pub fn get_value(s: &Semaphore, value: &mut i32) -> i32 {
    let state = match state_of(s) {
        Ok(state) => state,
        Err(rc) => return fail(rc),
    };
    let count = unsafe { &*state }.sem.value();
    *value = i32::try_from(count).unwrap_or(i32::MAX);
    0
}

/// Destroy `s`.
pub fn destroy(s: &Semaphore) -> i32 {
    match s.cell.load(Ordering::Acquire) {
        0 => fail(errno::EINVAL),
        state => {
            s.cell.store(0, Ordering::Release);
            drop(unsafe { Box::from_raw(state as *mut SemState) });
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
