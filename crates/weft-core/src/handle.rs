//! Static-initializer handle promotion.
//!
//! Every primitive handle is one atomic word: the all-ones sentinel for
//! a static initializer, zero for destroyed/uninitialized, otherwise a
//! pointer to the heap-allocated state block. A sentinel is promoted to
//! real state on first use under the owning type's test-init section;
//! the recheck under the section makes first use race-free.

use std::sync::atomic::{AtomicUsize, Ordering};

use weft_host::HostSection;

use crate::errno;

/// Reserved static-initializer handle value.
pub(crate) const STATIC_INIT: usize = usize::MAX;

/// Resolve a handle word to its state block, promoting a static
/// initializer under `section` with `make` on first use.
pub(crate) fn resolve_or_promote<T>(
    cell: &AtomicUsize,
    section: &'static HostSection<()>,
    make: fn() -> T,
) -> Result<*mut T, i32> {
    loop {
        match cell.load(Ordering::Acquire) {
            0 => return Err(errno::EINVAL),
            STATIC_INIT => {
                let _guard = section.enter();
                if cell.load(Ordering::Acquire) == STATIC_INIT {
                    let state = Box::into_raw(Box::new(make()));
                    cell.store(state as usize, Ordering::Release);
                    return Ok(state);
                }
            }
            state => return Ok(state as *mut T),
        }
    }
}
