//! Manual-reset and auto-reset events.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::waitset::{WaitNode, Waitable, WaiterList};

/// A host synchronization event.
///
/// A manual-reset event stays signaled until [`HostEvent::reset`] is
/// called and releases every waiter; an auto-reset event releases a
/// single waiter and clears itself as part of the release.
pub struct HostEvent {
    manual: bool,
    signaled: Mutex<bool>,
    waiters: WaiterList,
}

impl HostEvent {
    pub fn new(manual_reset: bool, initially_set: bool) -> Self {
        Self {
            manual: manual_reset,
            signaled: Mutex::new(initially_set),
            waiters: WaiterList::new(),
        }
    }

    /// Signal the event, releasing waiters.
    pub fn set(&self) {
        *self.signaled.lock() = true;
        self.waiters.wake_all();
    }

    /// Return the event to the non-signaled state.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Non-consuming peek, used for interrupt checks.
    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }
}

impl Waitable for HostEvent {
    fn try_consume(&self) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            if !self.manual {
                *signaled = false;
            }
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
    fn manual_event_stays_set_across_consumers() {
        let ev = HostEvent::new(true, false);
        ev.set();
        assert!(ev.try_consume());
        assert!(ev.try_consume());
        ev.reset();
        assert!(!ev.try_consume());
    }

    #[test]
    fn auto_event_releases_exactly_one_consumer() {
        let ev = HostEvent::new(false, true);
        assert!(ev.try_consume());
        assert!(!ev.try_consume());
    }

    #[test]
    fn is_set_does_not_consume() {
        let ev = HostEvent::new(false, true);
        assert!(ev.is_set());
        assert!(ev.is_set());
        assert!(ev.try_consume());
        assert!(!ev.is_set());
    }
}
