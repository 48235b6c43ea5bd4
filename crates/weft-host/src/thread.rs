//! Raw host threads.
//!
//! A [`HostThread`] wraps one OS thread together with a completion
//! signal that fires when the thread body finishes, even by unwinding.
//! The completion signal is what makes a thread handle waitable in the
//! same vocabulary as events and semaphores; the final host-level join
//! happens in [`HostThread::reap`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::HostError;
use crate::event::HostEvent;
use crate::waitset::{WaitNode, Waitable};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a spawned host thread.
pub struct HostThread {
    id: u64,
    done: HostEvent,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl HostThread {
    /// Host-assigned thread id, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the thread body has finished.
    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    /// Perform the final host-level join. Must only be called after the
    /// completion signal has fired; returns immediately then. Idempotent.
    pub fn reap(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Waitable for HostThread {
    fn try_consume(&self) -> bool {
        // Completion is a manual-reset condition; observing it does not
        // consume it, so multiple waiters all see the exit.
        self.done.is_set()
    }

    fn attach(&self, node: &Arc<WaitNode>) {
        self.done.attach(node);
    }

    fn detach(&self, node: &Arc<WaitNode>) {
        self.done.detach(node);
    }
}

/// Fires the completion signal when dropped, so an unwinding body still
/// signals exit.
struct Completion(Arc<HostThread>);

impl Drop for Completion {
    fn drop(&mut self) {
        self.0.done.set();
    }
}

/// Spawn a host thread running `body` with the requested stack size.
pub fn spawn(
    name: &str,
    stack_size: usize,
    body: impl FnOnce() + Send + 'static,
) -> Result<Arc<HostThread>, HostError> {
    let host = Arc::new(HostThread {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        done: HostEvent::new(true, false),
        handle: Mutex::new(None),
    });
    let inner = Arc::clone(&host);
    let builder = std::thread::Builder::new()
        .name(format!("{name}-{}", host.id))
        .stack_size(stack_size);
    let handle = builder.spawn(move || {
        let _completion = Completion(inner);
        body();
    })?;
    *host.handle.lock() = Some(handle);
    Ok(host)
}

/// Number of processors available to the process; 1 when unknown.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Yield the rest of the current timeslice.
pub fn yield_now() {
    std::thread::yield_now();
}
