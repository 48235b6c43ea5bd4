//! Parker infrastructure behind the waitable primitives.
//!
//! Every blocking facade object (event, semaphore, thread completion)
//! keeps a registration list of [`WaitNode`] parkers. A state change
//! wakes every registered parker; the parker re-examines the objects it
//! is interested in and either consumes readiness or parks again. The
//! two-handle form [`wait_pair`] is the building block for cancellable
//! waits: the interrupt side is checked first on every pass, so an
//! interrupt is never swallowed by a simultaneous wakeup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::event::HostEvent;

/// Outcome of a single-object wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The object became ready and one unit of readiness was consumed.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
    /// The host reported an unrecoverable wait failure.
    Failed,
}

/// Outcome of a two-handle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairVerdict {
    /// The primary object became ready and was consumed.
    Primary,
    /// The interrupt event was set. The primary object is left untouched.
    Interrupt,
    /// The timeout elapsed first.
    TimedOut,
}

/// A sequence-counted parker shared between one waiter and the objects
/// it is registered with.
pub struct WaitNode {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl WaitNode {
    pub(crate) fn new() -> Self {
        Self {
            seq: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Wake the owning waiter. Called by a registered object after it
    /// changes state.
    pub(crate) fn wake(&self) {
        let mut seq = self.seq.lock();
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    fn snapshot(&self) -> u64 {
        *self.seq.lock()
    }

    /// Park until the sequence moves past `observed` or `deadline`
    /// passes. Returns `false` on deadline expiry with no wake.
    fn park(&self, observed: u64, deadline: Option<Instant>) -> bool {
        let mut seq = self.seq.lock();
        while *seq == observed {
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut seq, d).timed_out() {
                        return *seq != observed;
                    }
                }
                None => self.cond.wait(&mut seq),
            }
        }
        true
    }
}

/// Registration list embedded in each waitable facade object.
pub(crate) struct WaiterList {
    nodes: Mutex<Vec<Arc<WaitNode>>>,
}

impl WaiterList {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn attach(&self, node: &Arc<WaitNode>) {
        self.nodes.lock().push(Arc::clone(node));
    }

    pub(crate) fn detach(&self, node: &Arc<WaitNode>) {
        self.nodes.lock().retain(|n| !Arc::ptr_eq(n, node));
    }

    /// Wake every registered parker. The list is snapshotted so user
    /// wakeups never run under the list lock.
    pub(crate) fn wake_all(&self) {
        let snapshot: Vec<Arc<WaitNode>> = self.nodes.lock().clone();
        for node in snapshot {
            node.wake();
        }
    }
}

/// An object a waiter can block on.
pub trait Waitable {
    /// Attempt to consume one unit of readiness without blocking.
    fn try_consume(&self) -> bool;
    /// Register a parker to be woken on state changes.
    fn attach(&self, node: &Arc<WaitNode>);
    /// Remove a previously registered parker.
    fn detach(&self, node: &Arc<WaitNode>);
}

/// Block until `primary` is consumable, `interrupt` is set, or `timeout`
/// elapses.
///
/// The interrupt side wins a tie: it is examined before the primary on
/// every pass, including the final poll after a timeout, and the primary
/// is never consumed when the verdict is [`PairVerdict::Interrupt`]. A
/// zero timeout degenerates to a poll that still succeeds on a ready
/// object.
pub fn wait_pair(
    primary: &dyn Waitable,
    interrupt: Option<&HostEvent>,
    timeout: Option<Duration>,
) -> PairVerdict {
    if let Some(ev) = interrupt {
        if ev.is_set() {
            return PairVerdict::Interrupt;
        }
    }
    if primary.try_consume() {
        return PairVerdict::Primary;
    }
    if timeout == Some(Duration::ZERO) {
        return PairVerdict::TimedOut;
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let node = Arc::new(WaitNode::new());
    primary.attach(&node);
    if let Some(ev) = interrupt {
        ev.attach(&node);
    }

    let verdict = loop {
        let observed = node.snapshot();
        if let Some(ev) = interrupt {
            if ev.is_set() {
                break PairVerdict::Interrupt;
            }
        }
        if primary.try_consume() {
            break PairVerdict::Primary;
        }
        if !node.park(observed, deadline) {
            // Deadline reached. One final poll so a ready object still
            // wins over the timeout.
            if let Some(ev) = interrupt {
                if ev.is_set() {
                    break PairVerdict::Interrupt;
                }
            }
            if primary.try_consume() {
                break PairVerdict::Primary;
            }
            break PairVerdict::TimedOut;
        }
    };

    primary.detach(&node);
    if let Some(ev) = interrupt {
        ev.detach(&node);
    }
    verdict
}

/// Single-object wait with an optional timeout.
pub fn wait_object(primary: &dyn Waitable, timeout: Option<Duration>) -> WaitOutcome {
    match wait_pair(primary, None, timeout) {
        PairVerdict::Primary => WaitOutcome::Signaled,
        PairVerdict::TimedOut => WaitOutcome::TimedOut,
        PairVerdict::Interrupt => WaitOutcome::Failed,
    }
}
