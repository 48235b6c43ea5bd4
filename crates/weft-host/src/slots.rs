//! Pointer-sized thread-local storage slots.
//!
//! Slots are allocated process-wide and read/written per thread. A
//! freshly allocated slot reads zero on every thread, including threads
//! that stored values under a previous allocation of the same index:
//! each allocation bumps the slot's generation, and stale generations
//! read as zero.

use std::cell::RefCell;
use std::collections::HashMap;

use parking_lot::Mutex;

/// Identifier of an allocated TLS slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

struct SlotTable {
    /// Per-index generation. Bumped on alloc and on free.
    generations: Vec<u32>,
    free: Vec<u32>,
}

static TABLE: Mutex<SlotTable> = Mutex::new(SlotTable {
    generations: Vec::new(),
    free: Vec::new(),
});

thread_local! {
    static VALUES: RefCell<HashMap<u32, (u32, usize)>> = RefCell::new(HashMap::new());
}

/// Allocate a fresh slot. Reads zero on every thread until written.
pub fn slot_alloc() -> SlotId {
    let mut table = TABLE.lock();
    let index = match table.free.pop() {
        Some(i) => i,
        None => {
            table.generations.push(0);
            (table.generations.len() - 1) as u32
        }
    };
    let slot = &mut table.generations[index as usize];
    *slot = slot.wrapping_add(1);
    SlotId {
        index,
        generation: *slot,
    }
}

/// Release a slot. Values stored under it become unreadable everywhere.
pub fn slot_free(id: SlotId) {
    let mut table = TABLE.lock();
    if let Some(slot) = table.generations.get_mut(id.index as usize) {
        if *slot == id.generation {
            *slot = slot.wrapping_add(1);
            table.free.push(id.index);
        }
    }
}

/// Read the calling thread's word for `id`; zero when never written or
/// when the slot has been freed.
pub fn slot_get(id: SlotId) -> usize {
    VALUES.with(|values| match values.borrow().get(&id.index) {
        Some((generation, value)) if *generation == id.generation => *value,
        _ => 0,
    })
}

/// Write the calling thread's word for `id`.
pub fn slot_set(id: SlotId, value: usize) {
    VALUES.with(|values| {
        values
            .borrow_mut()
            .insert(id.index, (id.generation, value));
    });
}
