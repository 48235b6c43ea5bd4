//! Read/write lock engine, writer-preferring.
//!
//! Composed from one internal mutex, two internal conditions, and four
//! counters. A reader waits while a writer is active or waiting; a
//! writer waits while readers or a writer are active. Waits inside the
//! conditions are cancellation points; a pushed cleanup record restores
//! the waiting count and releases the internal mutex when a parked
//! thread is cancelled.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::cleanup;
use crate::cond::CondState;
use crate::errno;
use crate::handle::{self, STATIC_INIT};
use crate::mutex::{MutexState, MUTEX_NORMAL};
use crate::process;

// ---------------------------------------------------------------------------
// State block
// ---------------------------------------------------------------------------

pub(crate) struct RwState {
    lock: MutexState,
    readers_ok: CondState,
    writers_ok: CondState,
    // Counters are mutated only under `lock`; the mutex provides the
    // ordering, so relaxed atomics suffice.
    active_readers: AtomicU32,
    active_writer: AtomicBool,
    waiting_readers: AtomicU32,
    waiting_writers: AtomicU32,
}

fn read_wait_abort(arg: usize) {
    let state = unsafe { &*(arg as *const RwState) };
    state.waiting_readers.fetch_sub(1, Ordering::Relaxed);
    let _ = state.lock.unlock();
}

fn write_wait_abort(arg: usize) {
    let state = unsafe { &*(arg as *const RwState) };
    state.waiting_writers.fetch_sub(1, Ordering::Relaxed);
    let _ = state.lock.unlock();
}

impl RwState {
    fn new() -> Self {
        Self {
            lock: MutexState::new(MUTEX_NORMAL),
            readers_ok: CondState::new(),
            writers_ok: CondState::new(),
            active_readers: AtomicU32::new(0),
            active_writer: AtomicBool::new(false),
            waiting_readers: AtomicU32::new(0),
            waiting_writers: AtomicU32::new(0),
        }
    }

    fn writer_excluded(&self) -> bool {
        self.active_writer.load(Ordering::Relaxed)
            || self.waiting_writers.load(Ordering::Relaxed) > 0
    }

    fn rdlock(&self) -> i32 {
        let rc = self.lock.lock();
        if rc != 0 {
            return rc;
        }
        while self.writer_excluded() {
            self.waiting_readers.fetch_add(1, Ordering::Relaxed);
            cleanup::push(read_wait_abort, self as *const Self as usize);
            let rc = self.readers_ok.wait_on(&self.lock, None);
            cleanup::pop(false);
            self.waiting_readers.fetch_sub(1, Ordering::Relaxed);
            if rc != 0 {
                let _ = self.lock.unlock();
                return rc;
            }
        }
        self.active_readers.fetch_add(1, Ordering::Relaxed);
        let _ = self.lock.unlock();
        0
    }

    fn try_rdlock(&self) -> i32 {
        let rc = self.lock.lock_nocancel();
        if rc != 0 {
            return rc;
        }
        let rc = if self.writer_excluded() {
            errno::EBUSY
        } else {
            self.active_readers.fetch_add(1, Ordering::Relaxed);
            0
        };
        let _ = self.lock.unlock();
        rc
    }

    fn wrlock(&self) -> i32 {
        let rc = self.lock.lock();
        if rc != 0 {
            return rc;
        }
        while self.active_writer.load(Ordering::Relaxed)
            || self.active_readers.load(Ordering::Relaxed) > 0
        {
            self.waiting_writers.fetch_add(1, Ordering::Relaxed);
            cleanup::push(write_wait_abort, self as *const Self as usize);
            let rc = self.writers_ok.wait_on(&self.lock, None);
            cleanup::pop(false);
            self.waiting_writers.fetch_sub(1, Ordering::Relaxed);
            if rc != 0 {
                let _ = self.lock.unlock();
                return rc;
            }
        }
        self.active_writer.store(true, Ordering::Relaxed);
        let _ = self.lock.unlock();
        0
    }

    fn try_wrlock(&self) -> i32 {
        let rc = self.lock.lock_nocancel();
        if rc != 0 {
            return rc;
        }
        let rc = if self.active_writer.load(Ordering::Relaxed)
            || self.active_readers.load(Ordering::Relaxed) > 0
        {
            errno::EBUSY
        } else {
            self.active_writer.store(true, Ordering::Relaxed);
            0
        };
        let _ = self.lock.unlock();
        rc
    }

    fn unlock(&self) -> i32 {
        let rc = self.lock.lock_nocancel();
        if rc != 0 {
            return rc;
        }
        let rc = if self.active_writer.load(Ordering::Relaxed) {
            self.active_writer.store(false, Ordering::Relaxed);
            if self.waiting_writers.load(Ordering::Relaxed) > 0 {
                let _ = self.writers_ok.signal();
            } else {
                let _ = self.readers_ok.broadcast();
            }
            0
        } else if self.active_readers.load(Ordering::Relaxed) > 0 {
            let remaining = self.active_readers.fetch_sub(1, Ordering::Relaxed) - 1;
            if remaining == 0 && self.waiting_writers.load(Ordering::Relaxed) > 0 {
                let _ = self.writers_ok.signal();
            }
            0
        } else {
            errno::EPERM
        };
        let _ = self.lock.unlock();
        rc
    }

    fn busy(&self) -> bool {
        self.active_writer.load(Ordering::Relaxed)
            || self.active_readers.load(Ordering::Relaxed) > 0
            || self.waiting_writers.load(Ordering::Relaxed) > 0
            || self.waiting_readers.load(Ordering::Relaxed) > 0
    }
}

// ---------------------------------------------------------------------------
// Handle API
// ---------------------------------------------------------------------------

/// Read/write lock handle.
pub struct RwLock {
    cell: AtomicUsize,
}

/// Static initializer.
pub const RWLOCK_INITIALIZER: RwLock = RwLock {
    cell: AtomicUsize::new(STATIC_INIT),
};

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    #[must_use]
    pub const fn new() -> Self {
        RWLOCK_INITIALIZER
    }
}

fn state_of(rw: &RwLock) -> Result<*mut RwState, i32> {
    handle::resolve_or_promote(&rw.cell, process::rwlock_init_section(), RwState::new)
}

/// Initialize `rw`.
pub fn init(rw: &RwLock) -> i32 {
    process::ensure_init();
    let current = rw.cell.load(Ordering::Acquire);
    if current != 0 && current != STATIC_INIT {
        return errno::EBUSY;
    }
    let state = Box::into_raw(Box::new(RwState::new()));
    rw.cell.store(state as usize, Ordering::Release);
    0
}

/// Acquire `rw` for reading; blocks while a writer is active or
/// waiting.
pub fn rdlock(rw: &RwLock) -> i32 {
    match state_of(rw) {
        Ok(state) => unsafe { &*state }.rdlock(),
        Err(rc) => rc,
    }
}

/// Non-blocking read acquire; `EBUSY` when a writer is active or
/// waiting.
pub fn try_rdlock(rw: &RwLock) -> i32 {
    match state_of(rw) {
        Ok(state) => unsafe { &*state }.try_rdlock(),
        Err(rc) => rc,
    }
}

/// Acquire `rw` for writing; blocks while readers or a writer are
/// active.
pub fn wrlock(rw: &RwLock) -> i32 {
    match state_of(rw) {
        Ok(state) => unsafe { &*state }.wrlock(),
        Err(rc) => rc,
    }
}

/// Non-blocking write acquire.
pub fn try_wrlock(rw: &RwLock) -> i32 {
    match state_of(rw) {
        Ok(state) => unsafe { &*state }.try_wrlock(),
        Err(rc) => rc,
    }
}

/// Release the caller's read or write hold.
pub fn unlock(rw: &RwLock) -> i32 {
    match state_of(rw) {
        Ok(state) => unsafe { &*state }.unlock(),
        Err(rc) => rc,
    }
}

/// Destroy `rw`. `EBUSY` while held or waited on.
pub fn destroy(rw: &RwLock) -> i32 {
    match rw.cell.load(Ordering::Acquire) {
        0 => errno::EINVAL,
        STATIC_INIT => {
            rw.cell.store(0, Ordering::Release);
            0
        }
        state => {
            if unsafe { &*(state as *const RwState) }.busy() {
                return errno::EBUSY;
            }
            rw.cell.store(0, Ordering::Release);
            drop(unsafe { Box::from_raw(state as *mut RwState) });
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
    use crate::test_support::serial;
    use crate::thread::{create, join};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    static RW: RwLock = RWLOCK_INITIALIZER;
    static SHARED: AtomicU32 = AtomicU32::new(0);

    fn reader(_arg: usize) -> usize {
        assert_eq!(rdlock(&RW), 0);
        let seen = SHARED.load(Ordering::SeqCst);
        assert_eq!(unlock(&RW), 0);
        seen as usize
    }

    fn writer_add_ten(hold_ms: usize) -> usize {
        assert_eq!(wrlock(&RW), 0);
        std::thread::sleep(Duration::from_millis(hold_ms as u64));
        let value = SHARED.fetch_add(10, Ordering::SeqCst) + 10;
        assert_eq!(unlock(&RW), 0);
        value as usize
    }

    #[test]
    fn readers_share_writers_exclude() {
        let _g = serial();
        SHARED.store(0, Ordering::SeqCst);
        assert_eq!(rdlock(&RW), 0);
        assert_eq!(try_rdlock(&RW), 0);
        // A writer cannot enter while readers hold the lock.
        assert_eq!(try_wrlock(&RW), errno::EBUSY);
        assert_eq!(unlock(&RW), 0);
        assert_eq!(unlock(&RW), 0);
        assert_eq!(try_wrlock(&RW), 0);
        assert_eq!(try_rdlock(&RW), errno::EBUSY);
        assert_eq!(unlock(&RW), 0);
    }

    #[test]
    fn writer_update_is_visible_to_later_readers() {
        let _g = serial();
        SHARED.store(0, Ordering::SeqCst);
        let w = create(None, writer_add_ten, 100).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let r = create(None, reader, 0).unwrap();
        assert_eq!(join(w).unwrap(), 10);
        // The reader was excluded while the writer held the lock, so it
        // observed the completed update.
        assert_eq!(join(r).unwrap(), 10);
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let _g = serial();
        SHARED.store(0, Ordering::SeqCst);
        assert_eq!(rdlock(&RW), 0);
        let w = create(None, writer_add_ten, 0).unwrap();
        // Give the writer time to queue up behind the held read lock.
        std::thread::sleep(Duration::from_millis(80));
        // Writer-preference: with a writer waiting, a new reader must
        // not slip in.
        assert_eq!(try_rdlock(&RW), errno::EBUSY);
        assert_eq!(unlock(&RW), 0);
        assert_eq!(join(w).unwrap(), 10);
        assert_eq!(reader(0), 10);
    }

    #[test]
    fn unlock_without_hold_is_eperm() {
        let _g = serial();
        let rw = RwLock::new();
        assert_eq!(init(&rw), 0);
        assert_eq!(init(&rw), errno::EBUSY);
        assert_eq!(unlock(&rw), errno::EPERM);
        assert_eq!(destroy(&rw), 0);
    }

    #[test]
    fn destroy_while_held_is_ebusy() {
        let _g = serial();
        let rw = RwLock::new();
        assert_eq!(rdlock(&rw), 0);
        assert_eq!(destroy(&rw), errno::EBUSY);
        assert_eq!(unlock(&rw), 0);
        assert_eq!(destroy(&rw), 0);
    }
}
