//! Once-initialization: single-winner execution under a guarded flag.
//!
//! The first caller to move `started` from -1 to 0 runs the routine;
//! everyone else spin-yields on `done`. A winner cancelled inside the
//! routine restores `started` through a cleanup record, so the losers
//! race again rather than spinning forever.

use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

use crate::cleanup;
use crate::process;

/// Once-control block.
pub struct Once {
    done: AtomicBool,
    started: AtomicIsize,
}

/// Static initializer.
pub const ONCE_INIT: Once = Once {
    done: AtomicBool::new(false),
    started: AtomicIsize::new(-1),
};

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl Once {
    #[must_use]
    pub const fn new() -> Self {
        ONCE_INIT
    }
}

fn reset_started(arg: usize) {
    let ctl = unsafe { &*(arg as *const Once) };
    ctl.started.store(-1, Ordering::Release);
}

/// Run `routine` exactly once across every caller of this control
/// block.
pub fn once(ctl: &Once, routine: fn()) -> i32 {
    process::ensure_init();
    if ctl.done.load(Ordering::Acquire) {
        return 0;
    }
    loop {
        if ctl
            .started
            .compare_exchange(-1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            cleanup::push(reset_started, ctl as *const Once as usize);
            routine();
            cleanup::pop(false);
            ctl.done.store(true, Ordering::Release);
            return 0;
        }
        if ctl.done.load(Ordering::Acquire) {
            return 0;
        }
        weft_host::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial;
    use crate::thread::{create, join};
    use std::sync::atomic::AtomicU32;

    static CONTROL: Once = ONCE_INIT;
    static RUNS: AtomicU32 = AtomicU32::new(0);

    fn count_once() {
        RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn racer(_arg: usize) -> usize {
        once(&CONTROL, count_once) as usize
    }

    #[test]
    fn routine_runs_once_across_threads() {
        let _g = serial();
        RUNS.store(0, Ordering::SeqCst);
        let tokens: Vec<_> = (0..8).map(|_| create(None, racer, 0).unwrap()).collect();
        for t in tokens {
            assert_eq!(join(t).unwrap(), 0);
        }
        assert_eq!(once(&CONTROL, count_once), 0);
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fresh_control_runs_exactly_once_when_repeated() {
        let _g = serial();
        static LOCAL_RUNS: AtomicU32 = AtomicU32::new(0);
        fn bump() {
            LOCAL_RUNS.fetch_add(1, Ordering::SeqCst);
        }
        let ctl = Once::new();
        assert_eq!(once(&ctl, bump), 0);
        assert_eq!(once(&ctl, bump), 0);
        assert_eq!(once(&ctl, bump), 0);
        assert_eq!(LOCAL_RUNS.load(Ordering::SeqCst), 1);
    }
}
