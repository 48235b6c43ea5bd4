//! Barrier engine: generation-counted rendezvous.
//!
//! Each cycle counts arrivals under the internal mutex; the last
//! arrival resets the count, advances the generation, and broadcasts.
//! Exactly one thread per cycle receives the serial marker, and a
//! waiter only leaves once the generation it was counted into has
//! passed, so consecutive cycles cannot bleed into each other.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::cleanup;
use crate::cond::CondState;
use crate::errno;
use crate::mutex::{MUTEX_NORMAL, MutexState};
use crate::process;

/// Returned to the one thread per cycle that completes the rendezvous.
pub const BARRIER_SERIAL_THREAD: i32 = -1;

/// Barrier attributes. Process-shared barriers are not supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierAttr {
    _reserved: (),
}

impl BarrierAttr {
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

pub(crate) struct BarrierState {
    lock: MutexState,
    cv: CondState,
    threshold: u32,
    // Mutated only under `lock`.
    count: AtomicU32,
    generation: AtomicU32,
}

fn barrier_wait_abort(arg: usize) {
    let state = unsafe { &*(arg as *const BarrierState) };
    state.count.fetch_sub(1, Ordering::Relaxed);
    let _ = state.lock.unlock();
}

impl BarrierState {
    fn new(threshold: u32) -> Self {
        Self {
            lock: MutexState::new(MUTEX_NORMAL),
            cv: CondState::new(),
            threshold,
            count: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    fn wait(&self) -> i32 {
        let rc = self.lock.lock();
        if rc != 0 {
            return rc;
        }
        let my_generation = self.generation.load(Ordering::Relaxed);
        let arrived = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if arrived == self.threshold {
            self.count.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Relaxed);
            let _ = self.cv.broadcast();
            let _ = self.lock.unlock();
            return BARRIER_SERIAL_THREAD;
        }
        while self.generation.load(Ordering::Relaxed) == my_generation {
            cleanup::push(barrier_wait_abort, self as *const Self as usize);
            let rc = self.cv.wait_on(&self.lock, None);
            cleanup::pop(false);
            if rc != 0 {
                self.count.fetch_sub(1, Ordering::Relaxed);
                let _ = self.lock.unlock();
                return rc;
            }
        }
        let _ = self.lock.unlock();
        0
    }

    fn busy(&self) -> bool {
        self.count.load(Ordering::Relaxed) > 0
    }
}

// ---------------------------------------------------------------------------
// Handle API
// ---------------------------------------------------------------------------

/// Barrier handle. No static initializer; `init` is required.
pub struct Barrier {
    cell: AtomicUsize,
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Barrier {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: AtomicUsize::new(0),
        }
    }
}

fn state_of(b: &Barrier) -> Result<*mut BarrierState, i32> {
    match b.cell.load(Ordering::Acquire) {
        0 => Err(errno::EINVAL),
        state => Ok(state as *mut BarrierState),
    }
}

/// Initialize `b` for `threshold` participants.
pub fn init(b: &Barrier, _attr: Option<&BarrierAttr>, threshold: u32) -> i32 {
    process::ensure_init();
    if threshold == 0 {
        return errno::EINVAL;
    }
    if b.cell.load(Ordering::Acquire) != 0 {
        return errno::EBUSY;
    }
    let state = Box::into_raw(Box::new(BarrierState::new(threshold)));
    b.cell.store(state as usize, Ordering::Release);
    0
}

/// Rendezvous. Returns [`BARRIER_SERIAL_THREAD`] for exactly one
/// participant per cycle and 0 for the rest.
pub fn wait(b: &Barrier) -> i32 {
    match state_of(b) {
        Ok(state) => unsafe { &*state }.wait(),
        Err(rc) => rc,
    }
}

/// Destroy `b`. `EBUSY` while a cycle is incomplete.
pub fn destroy(b: &Barrier) -> i32 {
    match b.cell.load(Ordering::Acquire) {
        0 => errno::EINVAL,
        state => {
            if unsafe { &*(state as *const BarrierState) }.busy() {
                return errno::EBUSY;
            }
            b.cell.store(0, Ordering::Release);
            drop(unsafe { Box::from_raw(state as *mut BarrierState) });
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

    static BARRIER: Barrier = Barrier::new();

    fn cycler(cycles: usize) -> usize {
        let mut serial_count = 0;
        for _ in 0..cycles {
            match wait(&BARRIER) {
                BARRIER_SERIAL_THREAD => serial_count += 1,
                0 => {}
                other => return 1_000_000 + other as usize,
            }
        }
        serial_count
    }

    #[test]
    fn zero_threshold_is_invalid() {
        let _g = serial();
        let b = Barrier::new();
        assert_eq!(init(&b, None, 0), errno::EINVAL);
    }

    #[test]
    fn wait_before_init_is_invalid() {
        let _g = serial();
        let b = Barrier::new();
        assert_eq!(wait(&b), errno::EINVAL);
        assert_eq!(destroy(&b), errno::EINVAL);
    }

    #[test]
    fn each_cycle_elects_exactly_one_serial_thread() {
        let _g = serial();
        const THREADS: usize = 4;
        const CYCLES: usize = 50;
        assert_eq!(init(&BARRIER, None, THREADS as u32), 0);
        let tokens: Vec<_> = (0..THREADS)
            .map(|_| create(None, cycler, CYCLES).unwrap())
            .collect();
        let total: usize = tokens.into_iter().map(|t| join(t).unwrap()).sum();
        assert_eq!(total, CYCLES, "one serial marker per cycle");
        assert_eq!(destroy(&BARRIER), 0);
    }

    #[test]
    fn single_thread_barrier_always_serial() {
        let _g = serial();
        let b = Barrier::new();
        assert_eq!(init(&b, None, 1), 0);
        assert_eq!(wait(&b), BARRIER_SERIAL_THREAD);
        assert_eq!(wait(&b), BARRIER_SERIAL_THREAD);
        assert_eq!(destroy(&b), 0);
    }

    #[test]
    fn process_shared_attr_is_rejected() {
        let _g = serial();
        let mut attr = BarrierAttr::new();
        assert_eq!(attr.set_process_shared(true), errno::ENOTSUP);
        assert_eq!(attr.set_process_shared(false), 0);
    }
}
