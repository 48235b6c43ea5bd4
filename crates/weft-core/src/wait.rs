//! Cancellable waiting, and the sleep primitives built on it.
//!
//! Every blocking engine routes its waits through [`wait_cancellable`]:
//! a single two-handle host wait on the target and the calling thread's
//! cancel event, with the cancel side winning ties so a simultaneous
//! wakeup never swallows a cancel request. A caller with no thread
//! context, or with cancellation disabled, degrades to a plain host
//! wait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use weft_host::{HostEvent, PairVerdict, WaitOutcome, Waitable};

use crate::cancel::{self, CANCEL_ENABLE};
use crate::process;
use crate::thread;

/// Result of a cancellable wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The target was signaled.
    Ok,
    /// The timeout elapsed.
    TimedOut,
    /// The calling thread has a consumable cancel request. The caller
    /// decides whether to propagate; the target was not consumed.
    Cancelled,
}

/// The calling thread's cancel event, when it exists and cancellation
/// is enabled.
fn eligible_cancel_event() -> Option<Arc<HostEvent>> {
    let d = thread::try_current_descriptor()?;
    let dref = unsafe { &*d };
    if dref.cancel.enter().state != CANCEL_ENABLE {
        return None;
    }
    dref.cancel_event.enter().clone()
}

/// Whether a cancel interrupt should be reported to the caller now.
fn cancellable_now() -> bool {
    match thread::try_current_descriptor() {
        Some(d) => {
            let ctl = unsafe { &*d }.cancel.enter();
            ctl.pending && ctl.state == CANCEL_ENABLE
        }
        None => false,
    }
}

/// Block on `target` until it is signaled, the calling thread is
/// cancelled, or `timeout` elapses.
pub(crate) fn wait_cancellable(target: &dyn Waitable, timeout: Option<Duration>) -> WaitStatus {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match eligible_cancel_event() {
            Some(event) => match weft_host::wait_pair(target, Some(&event), remaining) {
                PairVerdict::Primary => return WaitStatus::Ok,
                PairVerdict::TimedOut => return WaitStatus::TimedOut,
                PairVerdict::Interrupt => {
                    if cancellable_now() {
                        return WaitStatus::Cancelled;
                    }
                    // Cancellation got disabled between the eligibility
                    // check and the wakeup; wait again without it.
                }
            },
            None => match weft_host::wait_object(target, remaining) {
                WaitOutcome::Signaled => return WaitStatus::Ok,
                WaitOutcome::TimedOut => return WaitStatus::TimedOut,
                WaitOutcome::Failed => {
                    // Unrecoverable host failure: terminate the thread.
                    process::run_terminate_hook();
                    cancel::unwind(cancel::ExitReason::Cancel);
                }
            },
        }
    }
}

/// Cancellable sleep for `ms` milliseconds. A cancellation point.
pub fn delay_ms(ms: u64) -> i32 {
    process::ensure_init();
    let idle = HostEvent::new(true, false);
    match wait_cancellable(&idle, Some(Duration::from_millis(ms))) {
        WaitStatus::TimedOut | WaitStatus::Ok => 0,
        WaitStatus::Cancelled => cancel::unwind(cancel::ExitReason::Cancel),
    }
}

/// POSIX `sleep`: whole seconds. Always reports zero remaining.
pub fn sleep(seconds: u32) -> u32 {
    delay_ms(u64::from(seconds) * 1_000);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial;
    use weft_host::HostSemaphore;

    #[test]
    fn wait_without_thread_context_times_out() {
        let _g = serial();
        let sem = HostSemaphore::new(0);
        let status = std::thread::spawn(move || {
            wait_cancellable(&sem, Some(Duration::from_millis(20)))
        })
        .join()
        .unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
    }

    #[test]
    fn ready_target_wins_with_zero_timeout() {
        let _g = serial();
        let sem = HostSemaphore::new(1);
        assert_eq!(
            wait_cancellable(&sem, Some(Duration::ZERO)),
            WaitStatus::Ok
        );
    }

    #[test]
    fn delay_returns_after_the_interval() {
        let _g = serial();
        let started = Instant::now();
        assert_eq!(delay_ms(30), 0);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}
