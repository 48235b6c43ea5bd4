//! Cancellation: request, state control, and the unwind sequence.
//!
//! A cancel request marks the target pending and signals its
//! manual-reset cancel event, which interrupts any cancellable wait the
//! target is blocked in. The request takes effect at cancellation
//! points: the target pops its cleanup stack, runs the TSD destructor
//! sweep, and unwinds to its trampoline, which records the cancelled
//! sentinel as the exit value.
//!
//! The unwind vehicle is a sentinel panic payload ([`ExitReason`])
//! caught by the trampoline. User frames are unwound without running
//! any runtime-owned teardown beyond the cleanup records the user
//! registered; the runtime never auto-releases user mutexes.

use std::sync::atomic::Ordering;

use crate::cleanup;
use crate::errno;
use crate::process;
use crate::thread::{self, ThreadToken};
use crate::tsd;

/// Cancellation requests are acted upon.
pub const CANCEL_ENABLE: i32 = 0;
/// Cancellation requests are held pending.
pub const CANCEL_DISABLE: i32 = 1;
/// Requests take effect only at cancellation points.
pub const CANCEL_DEFERRED: i32 = 0;
/// Requests may take effect between cancellation points (best effort;
/// this host guarantees them only at cancellation points).
pub const CANCEL_ASYNCHRONOUS: i32 = 1;

/// Unwind payload carried from a cancellation point or `exit_thread` to
/// the trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitReason {
    Cancel,
    Exit,
}

/// Request cancellation of `token`.
pub fn cancel(token: ThreadToken) -> i32 {
    process::ensure_init();
    let d = match thread::resolve(token) {
        Ok(d) => d,
        Err(rc) => return rc,
    };
    let dref = unsafe { &*d };
    let mut ctl = dref.cancel.enter();
    ctl.pending = true;
    if ctl.state == CANCEL_ENABLE {
        let event = dref.cancel_event.enter().clone();
        if let Some(event) = event {
            event.set();
        }
    }
    0
}

/// Set the calling thread's cancel state, returning the previous one.
pub fn set_cancel_state(state: i32) -> Result<i32, i32> {
    if state != CANCEL_ENABLE && state != CANCEL_DISABLE {
        return Err(errno::EINVAL);
    }
    let d = thread::current_descriptor();
    let dref = unsafe { &*d };
    let mut ctl = dref.cancel.enter();
    let old = ctl.state;
    ctl.state = state;
    if state == CANCEL_ENABLE && ctl.pending {
        let event = dref.cancel_event.enter().clone();
        if let Some(event) = event {
            event.set();
        }
    }
    Ok(old)
}

/// Set the calling thread's cancel type, returning the previous one.
pub fn set_cancel_type(ctype: i32) -> Result<i32, i32> {
    if ctype != CANCEL_DEFERRED && ctype != CANCEL_ASYNCHRONOUS {
        return Err(errno::EINVAL);
    }
    let d = thread::current_descriptor();
    let dref = unsafe { &*d };
    let mut ctl = dref.cancel.enter();
    let old = ctl.ctype;
    ctl.ctype = ctype;
    Ok(old)
}

/// Explicit cancellation point: consumes a pending request when the
/// calling thread is cancellable, otherwise does nothing.
pub fn test_cancel() {
    let Some(d) = thread::try_current_descriptor() else {
        return;
    };
    let dref = unsafe { &*d };
    let fire = {
        let ctl = dref.cancel.enter();
        ctl.pending && ctl.state == CANCEL_ENABLE
    };
    if fire {
        unwind(ExitReason::Cancel);
    }
}

/// The unwind sequence shared by every cancellation point and by
/// `exit_thread`: consume the pending request, pop the cleanup stack,
/// run the destructor sweep on this thread, then unwind to the
/// trampoline.
pub(crate) fn unwind(reason: ExitReason) -> ! {
    if let Some(d) = thread::try_current_descriptor() {
        let dref = unsafe { &*d };
        {
            let mut ctl = dref.cancel.enter();
            ctl.pending = false;
            // Teardown code must not be cancelled again on its way out.
            ctl.state = CANCEL_DISABLE;
        }
        cleanup::pop_all(true);
        tsd::run_destructors(d);
    } else {
        cleanup::pop_all(true);
    }
    std::panic::panic_any(reason)
}

/// Invoke a user cleanup routine or TSD destructor, absorbing anything
/// it throws. A nested cancellation unwind just marks the thread
/// cancelled; any other panic additionally invokes the terminate hook.
/// Either way the thread's exit value becomes the cancelled sentinel
/// and teardown continues.
pub(crate) fn call_user(routine: fn(usize), arg: usize, d: *mut thread::Thread) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| routine(arg)));
    if let Err(payload) = outcome {
        if !payload.is::<ExitReason>() {
            process::run_terminate_hook();
        }
        unsafe { &*d }
            .exit_value
            .store(thread::CANCELED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial;
    use crate::thread::{create, join, CANCELED};
    use crate::wait;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[test]
    fn cancel_state_roundtrip_restores_prior_state() {
        let _g = serial();
        let old = set_cancel_state(CANCEL_DISABLE).unwrap();
        assert_eq!(old, CANCEL_ENABLE);
        let prev = set_cancel_state(old).unwrap();
        assert_eq!(prev, CANCEL_DISABLE);
        assert_eq!(set_cancel_state(CANCEL_ENABLE).unwrap(), CANCEL_ENABLE);
    }

    #[test]
    fn invalid_state_and_type_are_rejected() {
        let _g = serial();
        assert_eq!(set_cancel_state(7), Err(errno::EINVAL));
        assert_eq!(set_cancel_type(-3), Err(errno::EINVAL));
    }

    #[test]
    fn cancel_type_roundtrip() {
        let _g = serial();
        let old = set_cancel_type(CANCEL_ASYNCHRONOUS).unwrap();
        assert_eq!(old, CANCEL_DEFERRED);
        assert_eq!(set_cancel_type(old).unwrap(), CANCEL_ASYNCHRONOUS);
    }

    #[test]
    fn test_cancel_without_pending_request_is_a_no_op() {
        let _g = serial();
        test_cancel();
    }

    #[test]
    fn cancel_interrupts_a_sleeping_thread() {
        let _g = serial();
        fn sleeper(_arg: usize) -> usize {
            wait::delay_ms(30_000);
            1
        }
        let t = create(None, sleeper, 0).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(cancel(t), 0);
        assert_eq!(join(t).unwrap(), CANCELED);
    }

    #[test]
    fn disabled_thread_defers_cancellation_until_enable() {
        let _g = serial();
        static PHASE: AtomicU32 = AtomicU32::new(0);
        fn worker(_arg: usize) -> usize {
            set_cancel_state(CANCEL_DISABLE).unwrap();
            PHASE.store(1, AtomicOrdering::Release);
            // Wait for the cancel request to land while disabled.
            while PHASE.load(AtomicOrdering::Acquire) != 2 {
                std::thread::sleep(Duration::from_millis(5));
            }
            wait::delay_ms(50);
            PHASE.store(3, AtomicOrdering::Release);
            set_cancel_state(CANCEL_ENABLE).unwrap();
            test_cancel();
            4
        }
        PHASE.store(0, AtomicOrdering::Release);
        let t = create(None, worker, 0).unwrap();
        while PHASE.load(AtomicOrdering::Acquire) != 1 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(cancel(t), 0);
        PHASE.store(2, AtomicOrdering::Release);
        assert_eq!(join(t).unwrap(), CANCELED);
        // The thread made it past the delay while disabled.
        assert_eq!(PHASE.load(AtomicOrdering::Acquire), 3);
    }

    #[test]
    fn cancel_stale_token_is_search_error() {
        let _g = serial();
        fn quick(_arg: usize) -> usize {
            0
        }
        let t = create(None, quick, 0).unwrap();
        join(t).unwrap();
        assert_eq!(cancel(t), errno::ESRCH);
    }
}
