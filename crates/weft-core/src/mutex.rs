//! Mutex engine: normal, errorcheck, and recursive disciplines.
//!
//! A contended lock parks on a semaphore gate and is a cancellation
//! point; unlock posts one wakeup when waiters are parked. A normal
//! mutex tracks no owner, so relocking it from the owning thread is the
//! POSIX self-deadlock: the thread parks behind its own lock and never
//! returns.

use std::sync::atomic::AtomicUsize;

use weft_host::{HostSection, HostSemaphore};

use crate::cancel;
use crate::errno;
use crate::handle::{self, STATIC_INIT};
use crate::process;
use crate::thread;
use crate::wait::{self, WaitStatus};

// ---------------------------------------------------------------------------
// Mutex type constants
// ---------------------------------------------------------------------------

/// Normal mutex: no owner tracking, no recursion, self-lock deadlocks.
pub const MUTEX_NORMAL: i32 = 0;
/// Recursive mutex: the owner may re-lock; unlocks must balance.
pub const MUTEX_RECURSIVE: i32 = 1;
/// Error-checking mutex: self-relock and non-owner unlock are reported.
pub const MUTEX_ERRORCHECK: i32 = 2;
/// Default mutex type (alias for NORMAL).
pub const MUTEX_DEFAULT: i32 = MUTEX_NORMAL;

/// Returns true if `kind` is a recognized mutex type.
#[must_use]
pub const fn valid_mutex_type(kind: i32) -> bool {
    matches!(kind, MUTEX_NORMAL | MUTEX_RECURSIVE | MUTEX_ERRORCHECK)
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Mutex creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexAttr {
    kind: i32,
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexAttr {
    pub fn new() -> Self {
        Self { kind: MUTEX_DEFAULT }
    }

    pub fn set_kind(&mut self, kind: i32) -> i32 {
        if !valid_mutex_type(kind) {
            return errno::EINVAL;
        }
        self.kind = kind;
        0
    }

    #[must_use]
    pub fn kind(&self) -> i32 {
        self.kind
    }
}

// ---------------------------------------------------------------------------
// State block
// ---------------------------------------------------------------------------

struct MutexInner {
    locked: bool,
    /// Owning thread token bits; zero for the untracked NORMAL kind.
    owner: usize,
    depth: u32,
    waiters: u32,
}

pub(crate) struct MutexState {
    kind: i32,
    inner: HostSection<MutexInner>,
    gate: HostSemaphore,
}

impl MutexState {
    pub(crate) fn new(kind: i32) -> Self {
        Self {
            kind,
            inner: HostSection::new(MutexInner {
                locked: false,
                owner: 0,
                depth: 0,
                waiters: 0,
            }),
            gate: HostSemaphore::new(0),
        }
    }

    fn identity(&self) -> usize {
        if self.kind == MUTEX_NORMAL {
            0
        } else {
            thread::current().0
        }
    }

    /// Blocking lock; a cancellation point while contended.
    pub(crate) fn lock(&self) -> i32 {
        self.lock_with(true)
    }

    /// Blocking lock that ignores cancellation; used on paths that must
    /// reacquire (condition-wait return, unlock bookkeeping).
    pub(crate) fn lock_nocancel(&self) -> i32 {
        self.lock_with(false)
    }

    fn lock_with(&self, cancellable: bool) -> i32 {
        let me = self.identity();
        loop {
            {
                let mut inner = self.inner.enter();
                if !inner.locked {
                    inner.locked = true;
                    inner.owner = me;
                    inner.depth = 1;
                    return 0;
                }
                if me != 0 && inner.owner == me {
                    match self.kind {
                        MUTEX_RECURSIVE => {
                            inner.depth += 1;
                            return 0;
                        }
                        MUTEX_ERRORCHECK => return errno::EDEADLK,
                        _ => {}
                    }
                }
                inner.waiters += 1;
            }
            let status = if cancellable {
                wait::wait_cancellable(&self.gate, None)
            } else {
                weft_host::wait_object(&self.gate, None);
                WaitStatus::Ok
            };
            self.inner.enter().waiters -= 1;
            if let WaitStatus::Cancelled = status {
                cancel::unwind(cancel::ExitReason::Cancel);
            }
        }
    }

    pub(crate) fn try_lock(&self) -> i32 {
        let me = self.identity();
        let mut inner = self.inner.enter();
        if !inner.locked {
            inner.locked = true;
            inner.owner = me;
            inner.depth = 1;
            return 0;
        }
        if self.kind == MUTEX_RECURSIVE && me != 0 && inner.owner == me {
            inner.depth += 1;
            return 0;
        }
        errno::EBUSY
    }

    pub(crate) fn unlock(&self) -> i32 {
        let me = self.identity();
        let mut inner = self.inner.enter();
        if !inner.locked {
            return errno::EPERM;
        }
        if me != 0 && inner.owner != me {
            return errno::EPERM;
        }
        if inner.depth > 1 {
            inner.depth -= 1;
            return 0;
        }
        inner.locked = false;
        inner.owner = 0;
        inner.depth = 0;
        if inner.waiters > 0 {
            self.gate.post(1);
        }
        0
    }

    pub(crate) fn held(&self) -> bool {
        self.inner.enter().locked
    }
}

// ---------------------------------------------------------------------------
// Handle API
// ---------------------------------------------------------------------------

/// Mutex handle. `Mutex::new()` yields the static-initializer form,
/// promoted to real state on first use.
pub struct Mutex {
    cell: AtomicUsize,
}

/// Static initializer: a default-type mutex.
pub const MUTEX_INITIALIZER: Mutex = Mutex {
    cell: AtomicUsize::new(STATIC_INIT),
};

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    #[must_use]
    pub const fn new() -> Self {
        MUTEX_INITIALIZER
    }
}

fn default_state() -> MutexState {
    MutexState::new(MUTEX_DEFAULT)
}

pub(crate) fn state_of(m: &Mutex) -> Result<*mut MutexState, i32> {
    handle::resolve_or_promote(&m.cell, process::mutex_init_section(), default_state)
}

/// Initialize `m` with the attributes in `attr`.
pub fn init(m: &Mutex, attr: Option<&MutexAttr>) -> i32 {
    process::ensure_init();
    let current = m.cell.load(std::sync::atomic::Ordering::Acquire);
    if current != 0 && current != STATIC_INIT {
        return errno::EBUSY;
    }
    let kind = attr.map_or(MUTEX_DEFAULT, MutexAttr::kind);
    let state = Box::into_raw(Box::new(MutexState::new(kind)));
    m.cell
        .store(state as usize, std::sync::atomic::Ordering::Release);
    0
}

/// Lock `m`, blocking while another thread holds it.
pub fn lock(m: &Mutex) -> i32 {
    match state_of(m) {
        Ok(state) => unsafe { &*state }.lock(),
        Err(rc) => rc,
    }
}

/// Lock `m` without blocking; `EBUSY` when held.
pub fn try_lock(m: &Mutex) -> i32 {
    match state_of(m) {
        Ok(state) => unsafe { &*state }.try_lock(),
        Err(rc) => rc,
    }
}

/// Release `m`.
pub fn unlock(m: &Mutex) -> i32 {
    match state_of(m) {
        Ok(state) => unsafe { &*state }.unlock(),
        Err(rc) => rc,
    }
}

/// Destroy `m`. `EBUSY` while held; an unused static initializer is
/// destroyed without promotion.
pub fn destroy(m: &Mutex) -> i32 {
    use std::sync::atomic::Ordering;
    match m.cell.load(Ordering::Acquire) {
        0 => errno::EINVAL,
        STATIC_INIT => {
            m.cell.store(0, Ordering::Release);
            0
        }
        state => {
            if unsafe { &*(state as *const MutexState) }.held() {
                return errno::EBUSY;
            }
            m.cell.store(0, Ordering::Release);
            drop(unsafe { Box::from_raw(state as *mut MutexState) });
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
