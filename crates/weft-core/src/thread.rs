//! Thread lifecycle: descriptors, the reuse pool, the trampoline, and
//! create/join/detach/exit.
//!
//! ## Architecture
//!
//! Each POSIX thread is represented by a heap-allocated [`Thread`]
//! descriptor. The public [`ThreadToken`] combines the descriptor
//! address (64-byte aligned) with the descriptor's reuse generation in
//! the low alignment bits, so a token from a previous life of a recycled
//! descriptor resolves to nothing rather than to the wrong thread.
//!
//! Descriptors are never returned to the allocator while the process
//! runs: retired ones are cleared and parked on a LIFO reuse stack, and
//! freed only at process teardown. This keeps token comparison stable
//! for the process lifetime and amortizes allocation.
//!
//! ## Lifecycle state machine
//!
//! ```text
//!   STARTING ──> RUNNING ──┬──> FINISHED ──> JOINING ──> JOINED ──> POOLED
//!                          │         │
//!                          │         └──> DETACHED (late detach: caller reclaims)
//!                          │
//!                          └──> DETACHED (self-reclaim on exit) ──> POOLED
//! ```
//!
//! Transitions are CAS-protected so exactly one of join/detach wins; a
//! losing joiner observes `JOINING`/`JOINED`/`DETACHED` and fails with
//! `EINVAL`.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use weft_host::{HostEvent, HostSection, HostThread};

use crate::attr::{DEFAULT_STACK_SIZE, PRIORITY_NORMAL, ThreadAttr};
use crate::cancel::{self, CANCEL_DEFERRED, CANCEL_ENABLE};
use crate::cleanup;
use crate::errno;
use crate::process;
use crate::tsd;
use crate::wait::{self, WaitStatus};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Exit value of a cancelled thread (all-ones sentinel).
pub const CANCELED: usize = usize::MAX;

/// Attribute value: thread can be joined.
pub const CREATE_JOINABLE: i32 = 0;

/// Attribute value: thread reclaims itself on exit.
pub const CREATE_DETACHED: i32 = 1;

/// Descriptor is parked on the reuse stack.
pub const STATE_POOLED: u32 = 0;

/// Created; the trampoline has not run yet.
pub const STATE_STARTING: u32 = 1;

/// The user routine is running (or the thread is unwinding).
pub const STATE_RUNNING: u32 = 2;

/// Terminated, joinable, waiting for a joiner.
pub const STATE_FINISHED: u32 = 3;

/// Detached; the thread reclaims its own descriptor on exit.
pub const STATE_DETACHED: u32 = 4;

/// A joiner has claimed the thread and is collecting it.
pub const STATE_JOINING: u32 = 5;

/// Joined; the exit value has been consumed.
pub const STATE_JOINED: u32 = 6;

/// Token tag bits carved out of the descriptor alignment.
const TAG_MASK: usize = 63;

/// User entry routine: takes and returns a pointer-sized word.
pub type StartRoutine = fn(usize) -> usize;

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Cancellation control block, guarded by the descriptor's cancel
/// section. The same section doubles as the creator latch during
/// `create`.
pub(crate) struct CancelCtl {
    pub(crate) state: i32,
    pub(crate) ctype: i32,
    pub(crate) pending: bool,
}

impl Default for CancelCtl {
    fn default() -> Self {
        Self {
            state: CANCEL_ENABLE,
            ctype: CANCEL_DEFERRED,
            pending: false,
        }
    }
}

/// Per-thread control block. The public thread id is a tagged pointer to
/// this structure.
#[repr(align(64))]
pub struct Thread {
    /// Reuse generation; the low [`TAG_MASK`] bits are folded into the
    /// token. Bumped on retire.
    pub(crate) reuse_seq: AtomicUsize,

    /// Lifecycle state (see `STATE_*`).
    pub(crate) state: AtomicU32,

    /// Host thread handle; present while live, dropped on reclaim.
    pub(crate) host: HostSection<Option<Arc<HostThread>>>,

    /// Host thread id, for diagnostics.
    pub(crate) host_id: AtomicU64,

    /// Entry routine and argument, consumed once by the trampoline.
    pub(crate) entry: HostSection<Option<(StartRoutine, usize)>>,

    /// Exit value from the entry routine, `exit_thread`, or [`CANCELED`].
    pub(crate) exit_value: AtomicUsize,

    /// Cancel state/type/pending, also the creator latch.
    pub(crate) cancel: HostSection<CancelCtl>,

    /// Manual-reset cancel event; exists while live or terminated-unjoined.
    pub(crate) cancel_event: HostSection<Option<Arc<HostEvent>>>,

    /// Head of the cleanup-record LIFO (mirrored in the cleanup TLS key).
    pub(crate) cleanup_top: AtomicUsize,

    /// Head of the thread's key-association list, youngest first.
    pub(crate) keys_head: AtomicUsize,

    /// Joiners currently blocked on this thread.
    pub(crate) join_count: AtomicU32,

    /// Attribute snapshot.
    pub(crate) stack_size: AtomicUsize,
    pub(crate) priority: AtomicI32,

    /// Fabricated for a thread the runtime did not create.
    pub(crate) implicit: AtomicBool,
}

impl Thread {
    fn vacant() -> Self {
        Self {
            reuse_seq: AtomicUsize::new(1),
            state: AtomicU32::new(STATE_STARTING),
            host: HostSection::new(None),
            host_id: AtomicU64::new(0),
            entry: HostSection::new(None),
            exit_value: AtomicUsize::new(0),
            cancel: HostSection::new(CancelCtl::default()),
            cancel_event: HostSection::new(None),
            cleanup_top: AtomicUsize::new(0),
            keys_head: AtomicUsize::new(0),
            join_count: AtomicU32::new(0),
            stack_size: AtomicUsize::new(0),
            priority: AtomicI32::new(0),
            implicit: AtomicBool::new(false),
        }
    }
}

/// Opaque pointer-sized thread identifier. Equality is token identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadToken(pub(crate) usize);

fn make_token(d: *mut Thread) -> ThreadToken {
    let tag = unsafe { &*d }.reuse_seq.load(Ordering::Acquire) & TAG_MASK;
    ThreadToken(d as usize | tag)
}

pub(crate) fn descriptor_bits(token: ThreadToken) -> *mut Thread {
    (token.0 & !TAG_MASK) as *mut Thread
}

// ---------------------------------------------------------------------------
// Registry and reuse stack
// ---------------------------------------------------------------------------

struct ReusePool {
    /// LIFO of cleared descriptors ready for reuse.
    free: Vec<usize>,
    /// Every descriptor ever allocated; freed only at process teardown.
    all: Vec<usize>,
}

static REUSE: HostSection<ReusePool> = HostSection::new(ReusePool {
    free: Vec::new(),
    all: Vec::new(),
});

fn acquire_descriptor() -> *mut Thread {
    let mut pool = REUSE.enter();
    if let Some(addr) = pool.free.pop() {
        let d = addr as *mut Thread;
        unsafe { &*d }.state.store(STATE_STARTING, Ordering::Release);
        return d;
    }
    let d = Box::into_raw(Box::new(Thread::vacant()));
    pool.all.push(d as usize);
    d
}

/// Clear a descriptor and park it on the reuse stack. The cancel event
/// is closed here; a reused descriptor gets a fresh one.
pub(crate) fn retire_descriptor(d: *mut Thread) {
    let dref = unsafe { &*d };
    dref.cancel_event.enter().take();
    dref.host.enter().take();
    dref.entry.enter().take();
    *dref.cancel.enter() = CancelCtl::default();
    dref.host_id.store(0, Ordering::Release);
    dref.exit_value.store(0, Ordering::Release);
    dref.cleanup_top.store(0, Ordering::Release);
    dref.keys_head.store(0, Ordering::Release);
    dref.join_count.store(0, Ordering::Release);
    dref.stack_size.store(0, Ordering::Release);
    dref.priority.store(0, Ordering::Release);
    dref.implicit.store(false, Ordering::Release);
    dref.reuse_seq.fetch_add(1, Ordering::AcqRel);
    dref.state.store(STATE_POOLED, Ordering::Release);
    REUSE.enter().free.push(d as usize);
}

/// Resolve a token to its descriptor, rejecting stale and foreign
/// values.
pub(crate) fn resolve(token: ThreadToken) -> Result<*mut Thread, i32> {
    let addr = token.0 & !TAG_MASK;
    if addr == 0 {
        return Err(errno::EINVAL);
    }
    if !REUSE.enter().all.contains(&addr) {
        return Err(errno::ESRCH);
    }
    let d = addr as *mut Thread;
    let dref = unsafe { &*d };
    if dref.reuse_seq.load(Ordering::Acquire) & TAG_MASK != token.0 & TAG_MASK {
        return Err(errno::ESRCH);
    }
    if dref.state.load(Ordering::Acquire) == STATE_POOLED {
        return Err(errno::ESRCH);
    }
    Ok(d)
}

/// Free pooled descriptors. Called from process teardown only.
pub(crate) fn teardown_pool() {
    let mut pool = REUSE.enter();
    pool.free.clear();
    pool.all.retain(|&addr| {
        let d = addr as *mut Thread;
        if unsafe { &*d }.state.load(Ordering::Acquire) == STATE_POOLED {
            drop(unsafe { Box::from_raw(d) });
            false
        } else {
            true
        }
    });
}

// ---------------------------------------------------------------------------
// Current-thread lookup
// ---------------------------------------------------------------------------

/// The calling thread's token. A thread the runtime did not create gets
/// an implicit, detached descriptor on first use so TSD, cleanup records
/// and cancellation state work for it too.
pub fn current() -> ThreadToken {
    process::ensure_init();
    let bits = tsd::get_specific(process::self_key());
    if bits != 0 {
        return ThreadToken(bits);
    }
    let d = acquire_descriptor();
    let dref = unsafe { &*d };
    *dref.cancel_event.enter() = Some(Arc::new(HostEvent::new(true, false)));
    *dref.cancel.enter() = CancelCtl::default();
    dref.stack_size.store(DEFAULT_STACK_SIZE, Ordering::Release);
    dref.priority.store(PRIORITY_NORMAL, Ordering::Release);
    dref.implicit.store(true, Ordering::Release);
    dref.state.store(STATE_DETACHED, Ordering::Release);
    let token = make_token(d);
    tsd::set_specific(process::self_key(), token.0);
    token
}

/// Descriptor of the calling thread without fabricating an implicit one.
pub(crate) fn try_current_descriptor() -> Option<*mut Thread> {
    if !process::is_initialized() {
        return None;
    }
    let bits = tsd::get_specific(process::self_key());
    if bits == 0 {
        None
    } else {
        Some((bits & !TAG_MASK) as *mut Thread)
    }
}

/// Descriptor of the calling thread, fabricating one if needed.
pub(crate) fn current_descriptor() -> *mut Thread {
    descriptor_bits(current())
}

/// Token equality.
#[must_use]
pub fn equal(a: ThreadToken, b: ThreadToken) -> bool {
    a == b
}

/// Whether `d` is an implicit descriptor fabricated for a foreign
/// thread.
pub(crate) fn is_implicit(d: *mut Thread) -> bool {
    unsafe { &*d }.implicit.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Trampoline
// ---------------------------------------------------------------------------

fn trampoline(token_bits: usize) {
    let d = (token_bits & !TAG_MASK) as *mut Thread;
    let dref = unsafe { &*d };

    // Creator handshake: the creator holds the cancel section until the
    // host handle is published, so a joiner can never observe a token
    // whose descriptor lacks its handle.
    drop(dref.cancel.enter());
    let _ = dref.state.compare_exchange(
        STATE_STARTING,
        STATE_RUNNING,
        Ordering::AcqRel,
        Ordering::Acquire,
    );

    tsd::set_specific(process::self_key(), token_bits);

    let entry = dref.entry.enter().take();
    let Some((entry_fn, arg)) = entry else {
        return;
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry_fn(arg)));
    match outcome {
        Ok(value) => dref.exit_value.store(value, Ordering::Release),
        Err(payload) => match payload.downcast::<cancel::ExitReason>() {
            Ok(reason) => match *reason {
                cancel::ExitReason::Cancel => dref.exit_value.store(CANCELED, Ordering::Release),
                // `exit_thread` recorded the value before unwinding.
                cancel::ExitReason::Exit => {}
            },
            Err(_) => {
                // A foreign panic escaped the user's routine.
                process::run_terminate_hook();
                dref.exit_value.store(CANCELED, Ordering::Release);
            }
        },
    }

    // The destructor sweep runs on the exiting thread. The cancelled
    // path already swept before unwinding; a second pass over an empty
    // association list is a no-op.
    cleanup::pop_all(false);
    tsd::run_destructors(d);

    let prev = dref.state.compare_exchange(
        STATE_RUNNING,
        STATE_FINISHED,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    if prev == Err(STATE_DETACHED) {
        // Nobody will join: reclaim now. The host-level handle is
        // dropped without a join; the OS reaps the thread itself.
        dref.host.enter().take();
        retire_descriptor(d);
    }
    // On JOINING the claimed joiner collects and retires once the host
    // completion signal fires.
}

// ---------------------------------------------------------------------------
// Public lifecycle operations
// ---------------------------------------------------------------------------

/// Create a thread running `entry(arg)`.
///
/// Returns the new thread's token. The creator's writes before `create`
/// are visible to the child before its first user instruction; the
/// cancel-section latch enforces the ordering.
pub fn create(
    attr: Option<&ThreadAttr>,
    entry: StartRoutine,
    arg: usize,
) -> Result<ThreadToken, i32> {
    process::ensure_init();
    let (stack_size, detach_state, priority) = match attr {
        Some(a) => (a.stack_size()?, a.detach_state()?, a.priority()?),
        None => (DEFAULT_STACK_SIZE, CREATE_JOINABLE, PRIORITY_NORMAL),
    };

    let d = acquire_descriptor();
    let dref = unsafe { &*d };
    *dref.cancel_event.enter() = Some(Arc::new(HostEvent::new(true, false)));
    *dref.cancel.enter() = CancelCtl::default();
    *dref.entry.enter() = Some((entry, arg));
    dref.stack_size.store(stack_size, Ordering::Release);
    dref.priority.store(priority, Ordering::Release);
    if detach_state == CREATE_DETACHED {
        dref.state.store(STATE_DETACHED, Ordering::Release);
    }
    let token = make_token(d);

    // Creator latch: hold the cancel section across host creation so the
    // child observes the published handle before running user code.
    let latch = dref.cancel.enter();
    let bits = token.0;
    match weft_host::spawn("weft", stack_size, move || trampoline(bits)) {
        Ok(host) => {
            dref.host_id.store(host.id(), Ordering::Release);
            *dref.host.enter() = Some(host);
            drop(latch);
            Ok(token)
        }
        Err(_) => {
            drop(latch);
            retire_descriptor(d);
            Err(errno::EAGAIN)
        }
    }
}

/// Wait for `token` to terminate and collect its exit value.
///
/// The first arrival claims the join by CAS; concurrent joiners fail
/// with `EINVAL`. Join is a cancellation point.
pub fn join(token: ThreadToken) -> Result<usize, i32> {
    process::ensure_init();
    let d = resolve(token)?;
    if token == current() {
        return Err(errno::EDEADLK);
    }
    let dref = unsafe { &*d };

    let mut already_finished = false;
    loop {
        match dref.state.load(Ordering::Acquire) {
            STATE_DETACHED | STATE_JOINING | STATE_JOINED => return Err(errno::EINVAL),
            STATE_POOLED => return Err(errno::ESRCH),
            s @ (STATE_STARTING | STATE_RUNNING) => {
                if dref
                    .state
                    .compare_exchange(s, STATE_JOINING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
            STATE_FINISHED => {
                if dref
                    .state
                    .compare_exchange(
                        STATE_FINISHED,
                        STATE_JOINING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    already_finished = true;
                    break;
                }
            }
            _ => return Err(errno::EINVAL),
        }
    }

    dref.join_count.fetch_add(1, Ordering::AcqRel);
    if !already_finished {
        let host = dref.host.enter().clone();
        match host {
            Some(h) => {
                if let WaitStatus::Cancelled = wait::wait_cancellable(&*h, None) {
                    // Give the claim back before unwinding so a later
                    // join can still collect the thread.
                    dref.join_count.fetch_sub(1, Ordering::AcqRel);
                    dref.state.store(STATE_RUNNING, Ordering::Release);
                    cancel::unwind(cancel::ExitReason::Cancel);
                }
            }
            None => {
                dref.join_count.fetch_sub(1, Ordering::AcqRel);
                dref.state.store(STATE_RUNNING, Ordering::Release);
                return Err(errno::EINVAL);
            }
        }
    }
    dref.join_count.fetch_sub(1, Ordering::AcqRel);

    let value = dref.exit_value.load(Ordering::Acquire);
    if let Some(h) = dref.host.enter().take() {
        h.reap();
    }
    dref.state.store(STATE_JOINED, Ordering::Release);
    retire_descriptor(d);
    Ok(value)
}

/// Mark `token` detached. If the thread has already terminated its
/// descriptor is reclaimed here; otherwise the trampoline reclaims it on
/// exit.
pub fn detach(token: ThreadToken) -> i32 {
    process::ensure_init();
    let d = match resolve(token) {
        Ok(d) => d,
        Err(rc) => return rc,
    };
    let dref = unsafe { &*d };
    loop {
        match dref.state.load(Ordering::Acquire) {
            STATE_DETACHED | STATE_JOINING | STATE_JOINED => return errno::EINVAL,
            STATE_POOLED => return errno::ESRCH,
            s @ (STATE_STARTING | STATE_RUNNING) => {
                if dref
                    .state
                    .compare_exchange(s, STATE_DETACHED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return 0;
                }
            }
            STATE_FINISHED => {
                if dref
                    .state
                    .compare_exchange(
                        STATE_FINISHED,
                        STATE_DETACHED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    if let Some(h) = dref.host.enter().take() {
                        h.reap();
                    }
                    retire_descriptor(d);
                    return 0;
                }
            }
            _ => return errno::EINVAL,
        }
    }
}

/// Terminate the calling thread with `value` as its exit value, popping
/// cleanup records and running the TSD destructor sweep on the way out.
pub fn exit_thread(value: usize) -> ! {
    let token = current();
    unsafe { &*descriptor_bits(token) }
        .exit_value
        .store(value, Ordering::Release);
    cancel::unwind(cancel::ExitReason::Exit)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn echo(arg: usize) -> usize {
        arg
    }

    static SIGNAL_FLAG: AtomicU32 = AtomicU32::new(0);

    fn signal(arg: usize) -> usize {
        SIGNAL_FLAG.store(arg as u32, Ordering::Release);
        0
    }

    fn slow_echo(arg: usize) -> usize {
        std::thread::sleep(Duration::from_millis(arg as u64));
        arg
    }

    fn exits_with_value(arg: usize) -> usize {
        exit_thread(arg);
    }

    #[test]
    fn create_and_join_returns_entry_value() {
        let _g = serial();
        let t = create(None, echo, 0xDEAD_BEEF).unwrap();
        assert_eq!(join(t).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn multiple_threads_join_in_any_order() {
        let _g = serial();
        let tokens: Vec<_> = (0..4)
            .map(|i| create(None, echo, i).unwrap())
            .collect();
        for (i, t) in tokens.into_iter().enumerate() {
            assert_eq!(join(t).unwrap(), i);
        }
    }

    #[test]
    fn join_self_is_deadlock() {
        let _g = serial();
        fn join_self(_arg: usize) -> usize {
            match join(current()) {
                Err(code) => code as usize,
                Ok(_) => 0,
            }
        }
        let t = create(None, join_self, 0).unwrap();
        assert_eq!(join(t).unwrap(), errno::EDEADLK as usize);
    }

    #[test]
    fn join_stale_token_is_search_error() {
        let _g = serial();
        let t = create(None, echo, 1).unwrap();
        assert_eq!(join(t).unwrap(), 1);
        assert_eq!(join(t), Err(errno::ESRCH));
    }

    #[test]
    fn sequential_lives_reuse_descriptor_but_not_token() {
        let _g = serial();
        let a = create(None, echo, 1).unwrap();
        join(a).unwrap();
        let b = create(None, echo, 2).unwrap();
        join(b).unwrap();
        assert!(!equal(a, b), "recycled descriptor must not revive a token");
    }

    #[test]
    fn detach_then_join_is_invalid() {
        let _g = serial();
        SIGNAL_FLAG.store(0, Ordering::Release);
        let t = create(None, slow_echo, 50).unwrap();
        assert_eq!(detach(t), 0);
        assert_eq!(join(t), Err(errno::EINVAL));
        std::thread::sleep(Duration::from_millis(200));
    }

    #[test]
    fn detached_at_create_runs_and_self_reclaims() {
        let _g = serial();
        SIGNAL_FLAG.store(0, Ordering::Release);
        let mut attr = ThreadAttr::new();
        assert_eq!(attr.set_detach_state(CREATE_DETACHED), 0);
        let t = create(Some(&attr), signal, 42).unwrap();
        for _ in 0..200 {
            if SIGNAL_FLAG.load(Ordering::Acquire) == 42 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(SIGNAL_FLAG.load(Ordering::Acquire), 42);
        // Wait for the self-reclaim to land before the next test reuses
        // the pool.
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(join(t), Err(errno::EINVAL) | Err(errno::ESRCH)));
    }

    #[test]
    fn detach_finished_thread_reclaims_immediately() {
        let _g = serial();
        let t = create(None, echo, 0).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(detach(t), 0);
    }

    #[test]
    fn exit_thread_sets_exit_value() {
        let _g = serial();
        let t = create(None, exits_with_value, 777).unwrap();
        assert_eq!(join(t).unwrap(), 777);
    }

    #[test]
    fn current_is_stable_within_a_thread() {
        let _g = serial();
        fn check(_arg: usize) -> usize {
            let a = current();
            let b = current();
            usize::from(equal(a, b))
        }
        let t = create(None, check, 0).unwrap();
        assert_eq!(join(t).unwrap(), 1);
    }

    #[test]
    fn foreign_thread_gets_an_implicit_identity() {
        let _g = serial();
        let token = std::thread::spawn(|| current())
            .join()
            .unwrap();
        // Implicit descriptors are detached; joining them is invalid.
        assert!(matches!(join(token), Err(errno::EINVAL) | Err(errno::ESRCH)));
    }
}
