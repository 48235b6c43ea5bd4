//! Thread-specific data: keys, values, and the thread↔key association
//! graph.
//!
//! ## Design
//!
//! - **Key table**: up to [`KEYS_MAX`] slots under one section. Each
//!   live key owns a destructor, a host TLS slot holding the per-thread
//!   value word, and the head of its by-key association list. A key
//!   token carries the slot's sequence number, so a deleted-and-reused
//!   slot rejects stale tokens.
//!
//! - **Associations**: one node per (thread, key) pair with a value
//!   set, linked into both the thread's by-thread list and the key's
//!   by-key list, youngest first. The node's back-references are
//!   guarded by its own section; a node is freed only when both sides
//!   have released it, whichever side releases last frees it. The
//!   per-node lock is what serializes `key_delete` against a destructor
//!   call on an exiting thread.
//!
//! - **Destructor sweep**: at thread exit, the thread's list is
//!   detached wholesale and walked youngest-first; passes repeat while
//!   any destructor fired, bounded by [`DESTRUCTOR_ITERATIONS`], so
//!   destructors that re-set keys converge.
//!
//! New associations splice at the head of both lists so the internal
//! self association installed when a thread starts is always last and
//! is released last.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use weft_host::{HostSection, SlotId};

use crate::cancel;
use crate::errno;
use crate::process;
use crate::thread::{self, Thread, ThreadToken};

/// Maximum number of live keys (POSIX requires at least 128).
pub const KEYS_MAX: usize = 1024;

/// Maximum destructor-sweep passes at thread exit (POSIX requires at
/// least 4).
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Key destructor: receives the thread's value word.
pub type Destructor = fn(usize);

/// Thread-specific data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Key {
    index: u32,
    seq: u32,
}

impl Key {
    pub(crate) fn from_raw(index: u32, seq: u32) -> Self {
        Self { index, seq }
    }

    pub(crate) fn into_raw(self) -> (u32, u32) {
        (self.index, self.seq)
    }
}

struct KeyState {
    destructor: Option<Destructor>,
    slot: SlotId,
    /// Head of the by-key association list (node address, 0 when empty).
    threads: HostSection<usize>,
}

struct KeySlotEntry {
    seq: u32,
    state: Option<Arc<KeyState>>,
}

static KEYS: HostSection<Vec<KeySlotEntry>> = HostSection::new(Vec::new());

/// Association of one thread with one key.
struct Assoc {
    refs: HostSection<AssocRefs>,
    /// Link in the owning thread's list; touched only by that thread.
    next_in_thread: usize,
    /// Link in the key's list; guarded by the key's threads section.
    next_in_key: usize,
}

struct AssocRefs {
    /// Descriptor address; 0 once the thread has released the node.
    thread: usize,
    /// Key state; `None` once the key was deleted.
    key: Option<Arc<KeyState>>,
}

// ---------------------------------------------------------------------------
// Key lifecycle
// ---------------------------------------------------------------------------

/// Allocate a key with an optional destructor.
pub fn key_create(destructor: Option<Destructor>) -> Result<Key, i32> {
    let mut table = KEYS.enter();
    let index = match table.iter().position(|entry| entry.state.is_none()) {
        Some(index) => index,
        None => {
            if table.len() >= KEYS_MAX {
                return Err(errno::EAGAIN);
            }
            table.push(KeySlotEntry {
                seq: 0,
                state: None,
            });
            table.len() - 1
        }
    };
    let slot = weft_host::slot_alloc();
    let entry = &mut table[index];
    entry.seq = entry.seq.wrapping_add(1);
    entry.state = Some(Arc::new(KeyState {
        destructor,
        slot,
        threads: HostSection::new(0),
    }));
    Ok(Key {
        index: index as u32,
        seq: entry.seq,
    })
}

fn lookup(key: Key) -> Option<Arc<KeyState>> {
    let table = KEYS.enter();
    let entry = table.get(key.index as usize)?;
    if entry.seq != key.seq {
        return None;
    }
    entry.state.clone()
}

/// Delete a key. Destructors are not run; values already stored in
/// live threads become unreadable.
pub fn key_delete(key: Key) -> i32 {
    let state = {
        let mut table = KEYS.enter();
        let Some(entry) = table.get_mut(key.index as usize) else {
            return errno::EINVAL;
        };
        if entry.seq != key.seq || entry.state.is_none() {
            return errno::EINVAL;
        }
        // Bump the sequence first so no new associations form under
        // this key while its list drains.
        entry.seq = entry.seq.wrapping_add(1);
        match entry.state.take() {
            Some(state) => state,
            None => return errno::EINVAL,
        }
    };

    {
        let mut head = state.threads.enter();
        let mut node = *head;
        while node != 0 {
            let assoc = node as *mut Assoc;
            let next;
            let free_node;
            {
                let mut refs = unsafe { &*assoc }.refs.enter();
                refs.key = None;
                next = unsafe { (*assoc).next_in_key };
                free_node = refs.thread == 0;
            }
            if free_node {
                drop(unsafe { Box::from_raw(assoc) });
            }
            node = next;
        }
        *head = 0;
    }

    weft_host::slot_free(state.slot);
    0
}

// ---------------------------------------------------------------------------
// Value access
// ---------------------------------------------------------------------------

/// Read the calling thread's value for `key`; 0 when unset or the key
/// is invalid.
pub fn get_specific(key: Key) -> usize {
    match lookup(key) {
        Some(state) => weft_host::slot_get(state.slot),
        None => 0,
    }
}

/// Store the calling thread's value for `key`, associating the thread
/// with the key on first non-zero store.
pub fn set_specific(key: Key, value: usize) -> i32 {
    let Some(state) = lookup(key) else {
        return errno::EINVAL;
    };
    weft_host::slot_set(state.slot, value);
    if value != 0 {
        // Setting the internal self key is the bootstrap: the value
        // itself names the descriptor, since the calling thread's
        // identity is not installed yet.
        let owner = if process::is_initialized() && key == process::self_key() {
            thread::descriptor_bits(ThreadToken(value)) as usize
        } else {
            thread::current_descriptor() as usize
        };
        ensure_association(owner, &state);
    }
    0
}

/// Find or create the (thread, key) association, splicing a new node at
/// the head of both lists.
fn ensure_association(owner: usize, state: &Arc<KeyState>) {
    if owner == 0 {
        return;
    }
    let dref = unsafe { &*(owner as *mut Thread) };

    let mut node = dref.keys_head.load(Ordering::Acquire);
    while node != 0 {
        let assoc = unsafe { &*(node as *const Assoc) };
        let matched = {
            let refs = assoc.refs.enter();
            match &refs.key {
                Some(key_state) => Arc::ptr_eq(key_state, state),
                None => false,
            }
        };
        if matched {
            return;
        }
        node = assoc.next_in_thread;
    }

    let assoc = Box::into_raw(Box::new(Assoc {
        refs: HostSection::new(AssocRefs {
            thread: owner,
            key: Some(Arc::clone(state)),
        }),
        next_in_thread: 0,
        next_in_key: 0,
    }));
    {
        let mut head = state.threads.enter();
        unsafe { (*assoc).next_in_key = *head };
        *head = assoc as usize;
    }
    unsafe { (*assoc).next_in_thread = dref.keys_head.load(Ordering::Acquire) };
    dref.keys_head.store(assoc as usize, Ordering::Release);
}

// ---------------------------------------------------------------------------
// Destructor sweep
// ---------------------------------------------------------------------------

/// Run the exiting thread's key destructors.
///
/// Each pass detaches the thread's whole association list and walks it
/// youngest-first: under the node lock, a live key with a non-zero
/// value has the value cleared and its destructor invoked, then the
/// thread's reference is released. Destructors that re-set keys create
/// fresh associations, picked up by the next pass; passes stop when one
/// runs no destructor or the iteration cap is reached.
pub(crate) fn run_destructors(d: *mut Thread) {
    if d.is_null() {
        return;
    }
    let dref = unsafe { &*d };
    for _ in 0..DESTRUCTOR_ITERATIONS {
        if !sweep_pass(dref, d, true) {
            break;
        }
    }
    // Release whatever a stubbornly re-setting destructor left behind,
    // without running destructors again.
    sweep_pass(dref, d, false);
}

/// One pass over the thread's association list. Returns whether any
/// destructor ran.
fn sweep_pass(dref: &Thread, d: *mut Thread, run_dtors: bool) -> bool {
    let mut node = dref.keys_head.swap(0, Ordering::AcqRel);
    let mut ran = false;
    while node != 0 {
        let assoc = node as *mut Assoc;
        let next = unsafe { (*assoc).next_in_thread };
        let free_node;
        {
            let mut refs = unsafe { &*assoc }.refs.enter();
            if run_dtors {
                if let Some(state) = refs.key.clone() {
                    if let Some(destructor) = state.destructor {
                        let value = weft_host::slot_get(state.slot);
                        if value != 0 {
                            weft_host::slot_set(state.slot, 0);
                            ran = true;
                            // Key deletion blocks on this node lock, so
                            // the destructor cannot vanish mid-call.
                            cancel::call_user(destructor, value, d);
                        }
                    }
                }
            }
            refs.thread = 0;
            free_node = refs.key.is_none();
        }
        if free_node {
            drop(unsafe { Box::from_raw(assoc) });
        }
        node = next;
    }
    ran
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial;
    use crate::thread::{create, join};
    use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    fn make_key(destructor: Option<Destructor>) -> Key {
        key_create(destructor).expect("key_create failed")
    }

    #[test]
    fn key_create_assigns_distinct_keys() {
        let _g = serial();
        let k1 = make_key(None);
        let k2 = make_key(None);
        assert_ne!(k1, k2);
        key_delete(k1);
        key_delete(k2);
    }

    #[test]
    fn set_get_roundtrip() {
        let _g = serial();
        let key = make_key(None);
        assert_eq!(set_specific(key, 0xCAFE), 0);
        assert_eq!(get_specific(key), 0xCAFE);
        assert_eq!(key_delete(key), 0);
    }

    #[test]
    fn deleted_key_rejects_access() {
        let _g = serial();
        let key = make_key(None);
        assert_eq!(key_delete(key), 0);
        assert_eq!(key_delete(key), errno::EINVAL);
        assert_eq!(set_specific(key, 1), errno::EINVAL);
        assert_eq!(get_specific(key), 0);
    }

    #[test]
    fn reused_slot_does_not_revive_stale_tokens() {
        let _g = serial();
        let k1 = make_key(None);
        assert_eq!(set_specific(k1, 11), 0);
        assert_eq!(key_delete(k1), 0);
        let k2 = make_key(None);
        assert_eq!(get_specific(k1), 0);
        assert_eq!(get_specific(k2), 0);
        assert_eq!(key_delete(k2), 0);
    }

    #[test]
    fn values_are_per_thread() {
        let _g = serial();
        static KEY_BITS: AtomicU64 = AtomicU64::new(0);
        fn reader(_arg: usize) -> usize {
            let (index, seq) = {
                let bits = KEY_BITS.load(AtomicOrdering::Acquire);
                ((bits >> 32) as u32, bits as u32)
            };
            get_specific(Key::from_raw(index, seq))
        }
        let key = make_key(None);
        let (index, seq) = key.into_raw();
        KEY_BITS.store((u64::from(index) << 32) | u64::from(seq), AtomicOrdering::Release);
        assert_eq!(set_specific(key, 99), 0);
        let t = create(None, reader, 0).unwrap();
        assert_eq!(join(t).unwrap(), 0);
        assert_eq!(get_specific(key), 99);
        assert_eq!(key_delete(key), 0);
    }

    #[test]
    fn destructors_run_lifo_at_thread_exit() {
        let _g = serial();
        static KEYS_UNDER_TEST: Mutex<Vec<Key>> = Mutex::new(Vec::new());
        static SEEN: Mutex<Vec<usize>> = Mutex::new(Vec::new());

        fn record(value: usize) {
            SEEN.lock().unwrap().push(value);
        }

        fn setter(_arg: usize) -> usize {
            let keys = KEYS_UNDER_TEST.lock().unwrap().clone();
            for (i, key) in keys.iter().enumerate() {
                assert_eq!(set_specific(*key, i + 1), 0);
            }
            0
        }

        SEEN.lock().unwrap().clear();
        {
            let mut keys = KEYS_UNDER_TEST.lock().unwrap();
            keys.clear();
            for _ in 0..4 {
                keys.push(make_key(Some(record)));
            }
        }
        let t = create(None, setter, 0).unwrap();
        join(t).unwrap();
        let seen = SEEN.lock().unwrap().clone();
        assert_eq!(seen, vec![4, 3, 2, 1], "youngest association first");
        for key in KEYS_UNDER_TEST.lock().unwrap().drain(..) {
            key_delete(key);
        }
    }

    #[test]
    fn destructor_that_resets_key_is_bounded_by_iteration_cap() {
        let _g = serial();
        static KEY_BITS: AtomicU64 = AtomicU64::new(0);
        static CALLS: AtomicU32 = AtomicU32::new(0);

        fn resetter(value: usize) {
            CALLS.fetch_add(1, AtomicOrdering::SeqCst);
            let bits = KEY_BITS.load(AtomicOrdering::Acquire);
            let key = Key::from_raw((bits >> 32) as u32, bits as u32);
            // Always re-set, forcing the sweep to iterate.
            let _ = set_specific(key, value + 1);
        }

        fn setter(_arg: usize) -> usize {
            let bits = KEY_BITS.load(AtomicOrdering::Acquire);
            let key = Key::from_raw((bits >> 32) as u32, bits as u32);
            assert_eq!(set_specific(key, 1), 0);
            0
        }

        CALLS.store(0, AtomicOrdering::SeqCst);
        let key = make_key(Some(resetter));
        let (index, seq) = key.into_raw();
        KEY_BITS.store((u64::from(index) << 32) | u64::from(seq), AtomicOrdering::Release);
        let t = create(None, setter, 0).unwrap();
        join(t).unwrap();
        let calls = CALLS.load(AtomicOrdering::SeqCst);
        assert!(calls >= 1, "destructor must run at least once");
        assert!(
            calls <= DESTRUCTOR_ITERATIONS as u32,
            "calls ({calls}) exceed the iteration cap"
        );
        key_delete(key);
    }

    #[test]
    fn key_delete_does_not_run_destructors() {
        let _g = serial();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn counter(_value: usize) {
            CALLS.fetch_add(1, AtomicOrdering::SeqCst);
        }
        CALLS.store(0, AtomicOrdering::SeqCst);
        let key = make_key(Some(counter));
        assert_eq!(set_specific(key, 5), 0);
        assert_eq!(key_delete(key), 0);
        assert_eq!(CALLS.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn delete_key_while_setter_thread_still_lives() {
        let _g = serial();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static KEY_BITS: AtomicU64 = AtomicU64::new(0);
        fn counter(_value: usize) {
            CALLS.fetch_add(1, AtomicOrdering::SeqCst);
        }
        fn worker(_arg: usize) -> usize {
            let bits = KEY_BITS.load(AtomicOrdering::Acquire);
            let key = Key::from_raw((bits >> 32) as u32, bits as u32);
            assert_eq!(set_specific(key, 42), 0);
            // The key dies while this thread is alive.
            while KEY_BITS.load(AtomicOrdering::Acquire) != 0 {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            0
        }
        CALLS.store(0, AtomicOrdering::SeqCst);
        let key = make_key(Some(counter));
        let (index, seq) = key.into_raw();
        KEY_BITS.store((u64::from(index) << 32) | u64::from(seq), AtomicOrdering::Release);
        let t = create(None, worker, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(key_delete(key), 0);
        KEY_BITS.store(0, AtomicOrdering::Release);
        join(t).unwrap();
        // The deleted key's destructor never fires, and the exit sweep
        // tolerates the orphaned association.
        assert_eq!(CALLS.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn zero_value_does_not_invoke_destructor() {
        let _g = serial();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static KEY_BITS: AtomicU64 = AtomicU64::new(0);
        fn counter(_value: usize) {
            CALLS.fetch_add(1, AtomicOrdering::SeqCst);
        }
        fn worker(_arg: usize) -> usize {
            let bits = KEY_BITS.load(AtomicOrdering::Acquire);
            let key = Key::from_raw((bits >> 32) as u32, bits as u32);
            assert_eq!(set_specific(key, 9), 0);
            assert_eq!(set_specific(key, 0), 0);
            0
        }
        CALLS.store(0, AtomicOrdering::SeqCst);
        let key = make_key(Some(counter));
        let (index, seq) = key.into_raw();
        KEY_BITS.store((u64::from(index) << 32) | u64::from(seq), AtomicOrdering::Release);
        let t = create(None, worker, 0).unwrap();
        join(t).unwrap();
        assert_eq!(CALLS.load(AtomicOrdering::SeqCst), 0);
        key_delete(key);
    }
}
