//! Condition variable engine.
//!
//! A waiters counter, a semaphore the waiters park on, and a
//! manual-reset "waiters done" event, all serialized by one internal
//! section. Signal posts one wakeup only when a waiter is counted, so
//! wakeups are never lost; broadcast posts exactly the counted waiters
//! and then blocks until the last of them has checked out, so a late
//! arrival can never steal a broadcast wakeup. A waiter always
//! reacquires the user mutex before returning, timing out, or
//! propagating cancellation.

use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use weft_host::{HostEvent, HostSection, HostSemaphore};

use crate::cancel;
use crate::errno;
use crate::handle::{self, STATIC_INIT};
use crate::mutex::{self, Mutex, MutexState};
use crate::process;
use crate::time::{self, Timespec};
use crate::wait::{self, WaitStatus};

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Condition variable attributes. Process-shared conditions are not
/// supported on this host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CondAttr {
    _reserved: (),
}

impl CondAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_process_shared(&mut self, shared: bool) -> i32 {
        if shared { errno::ENOTSUP } else { 0 }
    }
}

// ---------------------------------------------------------------------------
// State block
// ---------------------------------------------------------------------------

struct CondInner {
    waiters: u32,
    was_broadcast: bool,
}

pub(crate) struct CondState {
    inner: HostSection<CondInner>,
    sem: HostSemaphore,
    done: HostEvent,
}

impl CondState {
    pub(crate) fn new() -> Self {
        Self {
            inner: HostSection::new(CondInner {
                waiters: 0,
                was_broadcast: false,
            }),
            sem: HostSemaphore::new(0),
            done: HostEvent::new(true, false),
        }
    }

    /// Wait for a signal or broadcast, releasing `mx` while parked.
    /// With an absolute deadline, reports `ETIMEDOUT` on expiry. A
    /// cancellation point; the user mutex is reacquired before the
    /// cancellation propagates, so cleanup handlers run holding it.
    pub(crate) fn wait_on(&self, mx: &MutexState, abstime: Option<&Timespec>) -> i32 {
        self.inner.enter().waiters += 1;

        let rc = mx.unlock();
        if rc != 0 {
            self.inner.enter().waiters -= 1;
            return rc;
        }

        let timeout = abstime.map(|t| Duration::from_millis(time::delta_ms(t)));
        let status = wait::wait_cancellable(&self.sem, timeout);

        let last = {
            let mut inner = self.inner.enter();
            inner.waiters -= 1;
            inner.was_broadcast && inner.waiters == 0
        };
        if last {
            self.done.set();
        }

        let relock = mx.lock_nocancel();
        match status {
            WaitStatus::Ok => relock,
            WaitStatus::TimedOut => {
                if relock == 0 {
                    errno::ETIMEDOUT
                } else {
                    relock
                }
            }
            WaitStatus::Cancelled => cancel::unwind(cancel::ExitReason::Cancel),
        }
    }

    pub(crate) fn signal(&self) -> i32 {
        let inner = self.inner.enter();
        if inner.waiters > 0 {
            self.sem.post(1);
        }
        0
    }

    pub(crate) fn broadcast(&self) -> i32 {
        let mut inner = self.inner.enter();
        if inner.waiters > 0 {
            inner.was_broadcast = true;
            self.done.reset();
            self.sem.post(inner.waiters);
            drop(inner);
            // Block until the counted waiters have all checked out; a
            // late waiter cannot be counted until the section is free,
            // so it cannot steal one of these wakeups.
            weft_host::wait_object(&self.done, None);
            self.inner.enter().was_broadcast = false;
        }
        0
    }

    fn busy(&self) -> bool {
        self.inner.enter().waiters > 0
    }
}

// ---------------------------------------------------------------------------
// Handle API
// ---------------------------------------------------------------------------

/// Condition variable handle.
pub struct Cond {
    cell: AtomicUsize,
}

/// Static initializer.
pub const COND_INITIALIZER: Cond = Cond {
    cell: AtomicUsize::new(STATIC_INIT),
};

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    #[must_use]
    pub const fn new() -> Self {
        COND_INITIALIZER
    }
}

fn state_of(c: &Cond) -> Result<*mut CondState, i32> {
    handle::resolve_or_promote(&c.cell, process::cond_init_section(), CondState::new)
}

/// Initialize `c`.
pub fn init(c: &Cond, _attr: Option<&CondAttr>) -> i32 {
    use std::sync::atomic::Ordering;
    process::ensure_init();
    let current = c.cell.load(Ordering::Acquire);
    if current != 0 && current != STATIC_INIT {
        return errno::EBUSY;
    }
    let state = Box::into_raw(Box::new(CondState::new()));
    c.cell.store(state as usize, Ordering::Release);
    0
}

/// Wait on `c`, releasing `m` while parked.
pub fn wait(c: &Cond, m: &Mutex) -> i32 {
    wait_common(c, m, None)
}

/// Wait on `c` until `abstime`; `ETIMEDOUT` on expiry.
pub fn timed_wait(c: &Cond, m: &Mutex, abstime: &Timespec) -> i32 {
    wait_common(c, m, Some(abstime))
}

fn wait_common(c: &Cond, m: &Mutex, abstime: Option<&Timespec>) -> i32 {
    let cond = match state_of(c) {
        Ok(state) => state,
        Err(rc) => return rc,
    };
    let mx = match mutex::state_of(m) {
        Ok(state) => state,
        Err(rc) => return rc,
    };
    unsafe { &*cond }.wait_on(unsafe { &*mx }, abstime)
}

/// Release one waiter, if any.
pub fn signal(c: &Cond) -> i32 {
    match state_of(c) {
        Ok(state) => unsafe { &*state }.signal(),
        Err(rc) => rc,
    }
}

/// Release every current waiter.
pub fn broadcast(c: &Cond) -> i32 {
    match state_of(c) {
        Ok(state) => unsafe { &*state }.broadcast(),
        Err(rc) => rc,
    }
}

/// Destroy `c`. `EBUSY` while waiters are parked.
pub fn destroy(c: &Cond) -> i32 {
    use std::sync::atomic::Ordering;
    match c.cell.load(Ordering::Acquire) {
        0 => errno::EINVAL,
        STATIC_INIT => {
            c.cell.store(0, Ordering::Release);
            0
        }
        state => {
            if unsafe { &*(state as *const CondState) }.busy() {
                return errno::EBUSY;
            }
            c.cell.store(0, Ordering::Release);
            drop(unsafe { Box::from_raw(state as *mut CondState) });
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::MUTEX_INITIALIZER;
    use crate::test_support::serial;
    use crate::thread::{create, join};
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::time::Duration;

    static M: Mutex = MUTEX_INITIALIZER;
    static C: Cond = COND_INITIALIZER;
    static READY: AtomicU32 = AtomicU32::new(0);
    static WOKE: AtomicU32 = AtomicU32::new(0);

    fn waiter(_arg: usize) -> usize {
        assert_eq!(mutex::lock(&M), 0);
        READY.fetch_add(1, AtomicOrdering::SeqCst);
        while WOKE.load(AtomicOrdering::SeqCst) == 0 {
            let rc = wait(&C, &M);
            assert_eq!(rc, 0);
        }
        // The user mutex is held again on return.
        assert_eq!(mutex::try_lock(&M), errno::EBUSY);
        let count = WOKE.load(AtomicOrdering::SeqCst);
        assert_eq!(mutex::unlock(&M), 0);
        count as usize
    }

    fn spin_until_ready(target: u32) {
        while READY.load(AtomicOrdering::SeqCst) < target {
            std::thread::sleep(Duration::from_millis(5));
        }
        // Let the waiters actually park.
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn signal_wakes_a_waiter_holding_the_mutex() {
        let _g = serial();
        READY.store(0, AtomicOrdering::SeqCst);
        WOKE.store(0, AtomicOrdering::SeqCst);
        let t = create(None, waiter, 0).unwrap();
        spin_until_ready(1);
        assert_eq!(mutex::lock(&M), 0);
        WOKE.store(1, AtomicOrdering::SeqCst);
        assert_eq!(signal(&C), 0);
        assert_eq!(mutex::unlock(&M), 0);
        assert_eq!(join(t).unwrap(), 1);
    }

    #[test]
    fn broadcast_wakes_every_current_waiter() {
        let _g = serial();
        READY.store(0, AtomicOrdering::SeqCst);
        WOKE.store(0, AtomicOrdering::SeqCst);
        let tokens: Vec<_> = (0..4).map(|_| create(None, waiter, 0).unwrap()).collect();
        spin_until_ready(4);
        assert_eq!(mutex::lock(&M), 0);
        WOKE.store(1, AtomicOrdering::SeqCst);
        assert_eq!(mutex::unlock(&M), 0);
        assert_eq!(broadcast(&C), 0);
        for t in tokens {
            assert_eq!(join(t).unwrap(), 1);
        }
    }

    #[test]
    fn timed_wait_reports_timeout_with_mutex_held() {
        let _g = serial();
        let m = Mutex::new();
        let c = Cond::new();
        assert_eq!(mutex::lock(&m), 0);
        let deadline = Timespec::after(Duration::from_millis(50));
        assert_eq!(timed_wait(&c, &m, &deadline), errno::ETIMEDOUT);
        // Still the owner: a second unlock must fail.
        assert_eq!(mutex::unlock(&m), 0);
        assert_eq!(mutex::unlock(&m), errno::EPERM);
        assert_eq!(destroy(&c), 0);
        assert_eq!(mutex::destroy(&m), 0);
    }

    #[test]
    fn timed_wait_with_past_deadline_still_polls() {
        let _g = serial();
        let m = Mutex::new();
        let c = Cond::new();
        assert_eq!(mutex::lock(&m), 0);
        let past = Timespec { sec: 1, nsec: 0 };
        assert_eq!(timed_wait(&c, &m, &past), errno::ETIMEDOUT);
        assert_eq!(mutex::unlock(&m), 0);
        assert_eq!(destroy(&c), 0);
        assert_eq!(mutex::destroy(&m), 0);
    }

    #[test]
    fn signal_with_no_waiters_is_a_no_op() {
        let _g = serial();
        let c = Cond::new();
        assert_eq!(signal(&c), 0);
        assert_eq!(broadcast(&c), 0);
        assert_eq!(destroy(&c), 0);
    }

    #[test]
    fn process_shared_attr_is_rejected() {
        let _g = serial();
        let mut attr = CondAttr::new();
        assert_eq!(attr.set_process_shared(true), errno::ENOTSUP);
        assert_eq!(attr.set_process_shared(false), 0);
    }
}
