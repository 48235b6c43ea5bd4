//! Process-wide initialization and teardown.
//!
//! Five process-wide facts live here: the initialized flag, the two
//! internal TSD keys (current thread, cleanup-stack top), the per-type
//! test-init sections used for static-initializer promotion, and the
//! user terminate hook. When the runtime is statically linked nothing
//! drives these automatically, so every public entry point calls
//! [`ensure_init`] and programs may call [`init`]/[`terminate`]
//! explicitly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use weft_host::HostSection;

use crate::cancel;
use crate::cleanup;
use crate::thread;
use crate::tsd;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static INIT_SECTION: HostSection<()> = HostSection::new(());

/// Internal key holding the calling thread's token bits.
static SELF_KEY: AtomicU64 = AtomicU64::new(0);

/// Internal key mirroring the cleanup-stack top.
static CLEANUP_KEY: AtomicU64 = AtomicU64::new(0);

// One test-init section per primitive type with a static initializer.
static MUTEX_INIT: HostSection<()> = HostSection::new(());
static COND_INIT: HostSection<()> = HostSection::new(());
static RWLOCK_INIT: HostSection<()> = HostSection::new(());
static SPIN_INIT: HostSection<()> = HostSection::new(());

static TERMINATE_HOOK: HostSection<Option<fn()>> = HostSection::new(None);

fn pack(key: tsd::Key) -> u64 {
    let (index, seq) = key.into_raw();
    (u64::from(index) << 32) | u64::from(seq)
}

fn unpack(bits: u64) -> tsd::Key {
    tsd::Key::from_raw((bits >> 32) as u32, bits as u32)
}

/// Perform process-wide initialization. Idempotent; returns whether the
/// runtime is initialized afterwards.
pub fn init() -> bool {
    let _guard = INIT_SECTION.enter();
    if INITIALIZED.load(Ordering::Acquire) {
        return true;
    }
    install_panic_filter();
    let self_key = match tsd::key_create(None) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let cleanup_key = match tsd::key_create(None) {
        Ok(k) => k,
        Err(_) => {
            let _ = tsd::key_delete(self_key);
            return false;
        }
    };
    SELF_KEY.store(pack(self_key), Ordering::Release);
    CLEANUP_KEY.store(pack(cleanup_key), Ordering::Release);
    INITIALIZED.store(true, Ordering::Release);
    true
}

/// Called by every public entry point; initializes lazily on the static
/// linkage path where no loader hook runs.
pub(crate) fn ensure_init() {
    if !INITIALIZED.load(Ordering::Acquire) {
        init();
    }
}

/// Reverse of [`init`]. Retired descriptors are freed here and only
/// here.
pub fn terminate() {
    let _guard = INIT_SECTION.enter();
    if !INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    let _ = tsd::key_delete(unpack(CLEANUP_KEY.load(Ordering::Acquire)));
    let _ = tsd::key_delete(unpack(SELF_KEY.load(Ordering::Acquire)));
    SELF_KEY.store(0, Ordering::Release);
    CLEANUP_KEY.store(0, Ordering::Release);
    thread::teardown_pool();
    INITIALIZED.store(false, Ordering::Release);
}

pub(crate) fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

pub(crate) fn self_key() -> tsd::Key {
    unpack(SELF_KEY.load(Ordering::Acquire))
}

pub(crate) fn cleanup_key() -> tsd::Key {
    unpack(CLEANUP_KEY.load(Ordering::Acquire))
}

pub(crate) fn mutex_init_section() -> &'static HostSection<()> {
    &MUTEX_INIT
}

pub(crate) fn cond_init_section() -> &'static HostSection<()> {
    &COND_INIT
}

pub(crate) fn rwlock_init_section() -> &'static HostSection<()> {
    &RWLOCK_INIT
}

pub(crate) fn spin_init_section() -> &'static HostSection<()> {
    &SPIN_INIT
}

/// Install the hook invoked when a panic escapes a user entry routine,
/// cleanup handler, or TSD destructor. Returns the previous hook.
pub fn set_terminate_hook(hook: Option<fn()>) -> Option<fn()> {
    std::mem::replace(&mut *TERMINATE_HOOK.enter(), hook)
}

pub(crate) fn run_terminate_hook() {
    let hook = *TERMINATE_HOOK.enter();
    if let Some(hook) = hook {
        hook();
    }
}

/// Per-thread teardown hook for the static linkage path: runs the TSD
/// destructor sweep for the calling thread and reclaims an implicit
/// descriptor. Threads created by the runtime do this in their
/// trampoline.
pub fn on_thread_detach() {
    let Some(d) = thread::try_current_descriptor() else {
        return;
    };
    cleanup::pop_all(true);
    tsd::run_destructors(d);
    if thread::is_implicit(d) {
        tsd::set_specific(self_key(), 0);
        thread::retire_descriptor(d);
    }
}

/// Cancellation and `exit_thread` unwind with a private payload; keep
/// the default panic report quiet for it.
fn install_panic_filter() {
    static HOOKED: std::sync::Once = std::sync::Once::new();
    HOOKED.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().is::<cancel::ExitReason>() {
                return;
            }
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial;

    #[test]
    fn init_is_idempotent() {
        let _g = serial();
        assert!(init());
        assert!(init());
        assert!(is_initialized());
    }

    #[test]
    fn internal_keys_are_distinct() {
        let _g = serial();
        ensure_init();
        assert_ne!(self_key(), cleanup_key());
    }

    #[test]
    fn terminate_hook_replaces_and_returns_previous() {
        let _g = serial();
        fn hook_a() {}
        fn hook_b() {}
        assert_eq!(set_terminate_hook(Some(hook_a)), None);
        let prev = set_terminate_hook(Some(hook_b));
        assert_eq!(prev.map(|f| f as usize), Some(hook_a as usize));
        assert!(set_terminate_hook(None).is_some());
    }
}
