//! Counting semaphore.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::waitset::{WaitNode, Waitable, WaiterList};

/// A host counting semaphore. Posts accumulate; each consumption takes
/// exactly one unit.
pub struct HostSemaphore {
    count: Mutex<u64>,
    waiters: WaiterList,
}

impl HostSemaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(u64::from(initial)),
            waiters: WaiterList::new(),
        }
    }

    /// Add `n` units and release waiters.
    pub fn post(&self, n: u32) {
        if n == 0 {
            return;
        }
        {
            let mut count = self.count.lock();
            *count = count.saturating_add(u64::from(n));
        }
        self.waiters.wake_all();
    }

    /// Current unit count.
    pub fn value(&self) -> u64 {
        *self.count.lock()
    }
}

impl Waitable for HostSemaphore {
    fn try_consume(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    fn attach(&self, node: &Arc<WaitNode>) {
        self.waiters.attach(node);
    }

    fn detach(&self, node: &Arc<WaitNode>) {
        self.waiters.detach(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_accumulates_and_consume_drains() {
        let sem = HostSemaphore::new(0);
        sem.post(3);
        assert_eq!(sem.value(), 3);
        assert!(sem.try_consume());
        assert!(sem.try_consume());
        assert!(sem.try_consume());
        assert!(!sem.try_consume());
    }

    #[test]
    fn post_zero_is_a_no_op() {
        let sem = HostSemaphore::new(0);
        sem.post(0);
        assert_eq!(sem.value(), 0);
    }
}
