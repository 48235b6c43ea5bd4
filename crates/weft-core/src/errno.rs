//! Error number definitions and the per-thread error indicator.
//!
//! Engine operations report errors as errno-style `i32` codes (0 on
//! success). Semaphore operations follow the POSIX convention instead:
//! they return -1 and store the code in the calling thread's error
//! indicator, readable through [`get_errno`].

use std::cell::Cell;

/// Operation not permitted (unlock by a non-owner).
pub const EPERM: i32 = 1;
/// No such thread.
pub const ESRCH: i32 = 3;
/// Interrupted call.
pub const EINTR: i32 = 4;
/// Resource temporarily unavailable (out of keys, descriptors).
pub const EAGAIN: i32 = 11;
/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Resource busy (trylock failure, destroy while in use).
pub const EBUSY: i32 = 16;
/// Invalid argument or object state.
pub const EINVAL: i32 = 22;
/// Deadlock detected (self-join, errorcheck self-relock).
pub const EDEADLK: i32 = 35;
/// Function not implemented.
pub const ENOSYS: i32 = 38;
/// Operation not supported (process-shared, stack address control).
pub const ENOTSUP: i32 = 95;
/// Timed wait expired.
pub const ETIMEDOUT: i32 = 110;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Returns the calling thread's error indicator.
pub fn get_errno() -> i32 {
    ERRNO.with(Cell::get)
}

/// Sets the calling thread's error indicator.
pub fn set_errno(value: i32) {
    ERRNO.with(|e| e.set(value));
}
