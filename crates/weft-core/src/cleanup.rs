//! Per-thread cancellation cleanup stack.
//!
//! A LIFO of `(routine, arg)` records owned by the calling thread. The
//! head lives in the thread descriptor and is mirrored in the cleanup
//! TSD key. On cancellation or `exit_thread` the runtime pops the whole
//! stack, executing each record, before the TSD destructor sweep.

use std::sync::atomic::Ordering;

use crate::cancel;
use crate::process;
use crate::thread;
use crate::tsd;

/// Cleanup routine: takes the pointer-sized word given at push time.
pub type CleanupRoutine = fn(usize);

struct CleanupRecord {
    routine: CleanupRoutine,
    arg: usize,
    prev: usize,
}

/// Push a cleanup record onto the calling thread's stack.
pub fn push(routine: CleanupRoutine, arg: usize) {
    let d = thread::current_descriptor();
    let dref = unsafe { &*d };
    let prev = dref.cleanup_top.load(Ordering::Acquire);
    let record = Box::into_raw(Box::new(CleanupRecord { routine, arg, prev }));
    let top = record as usize;
    dref.cleanup_top.store(top, Ordering::Release);
    tsd::set_specific(process::cleanup_key(), top);
}

/// Pop the newest record, invoking its routine when `execute` is set.
/// Returns whether a record was present.
pub fn pop(execute: bool) -> bool {
    let Some(d) = thread::try_current_descriptor() else {
        return false;
    };
    let dref = unsafe { &*d };
    let top = dref.cleanup_top.load(Ordering::Acquire);
    if top == 0 {
        return false;
    }
    let record = unsafe { Box::from_raw(top as *mut CleanupRecord) };
    dref.cleanup_top.store(record.prev, Ordering::Release);
    tsd::set_specific(process::cleanup_key(), record.prev);
    if execute {
        (record.routine)(record.arg);
    }
    true
}

/// Pop every record. Used by the unwind sequence with `execute` set,
/// and by the trampoline to discard an unbalanced stack on normal
/// return. Executing pops route through the guarded caller so a panic
/// out of one handler cannot abandon the rest of the stack.
pub(crate) fn pop_all(execute: bool) {
    if !execute {
        while pop(false) {}
        return;
    }
    let Some(d) = thread::try_current_descriptor() else {
        return;
    };
    let dref = unsafe { &*d };
    loop {
        let top = dref.cleanup_top.load(Ordering::Acquire);
        if top == 0 {
            return;
        }
        let record = unsafe { Box::from_raw(top as *mut CleanupRecord) };
        dref.cleanup_top.store(record.prev, Ordering::Release);
        tsd::set_specific(process::cleanup_key(), record.prev);
        cancel::call_user(record.routine, record.arg, d);
    }
}
