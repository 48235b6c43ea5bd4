//! # weft-host
//!
//! Uniform wrappers over the primitives the operating system actually
//! provides: raw threads, manual/auto-reset events, counting semaphores,
//! mutual-exclusion sections, pointer-sized thread-local slots, and a
//! two-handle interruptible wait. Everything above this crate speaks only
//! this vocabulary; this is the one place that names host-specific calls.

#![forbid(unsafe_code)]

pub mod error;
pub mod event;
pub mod section;
pub mod semaphore;
pub mod slots;
pub mod thread;
pub mod waitset;

pub use error::HostError;
pub use event::HostEvent;
pub use section::{HostSection, SectionGuard};
pub use semaphore::HostSemaphore;
pub use slots::{slot_alloc, slot_free, slot_get, slot_set, SlotId};
pub use thread::{cpu_count, spawn, yield_now, HostThread};
pub use waitset::{wait_object, wait_pair, PairVerdict, WaitOutcome, Waitable};
