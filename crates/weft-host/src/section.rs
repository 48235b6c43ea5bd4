//! Mutual-exclusion sections.

use parking_lot::Mutex;

/// Guard returned by [`HostSection::enter`]; the section is left when the
/// guard drops.
pub type SectionGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// A host critical section guarding its payload.
///
/// Sections serialize short internal state transitions; nothing in the
/// runtime blocks for long under one.
pub struct HostSection<T> {
    inner: Mutex<T>,
}

impl<T> HostSection<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn enter(&self) -> SectionGuard<'_, T> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn section_serializes_increments() {
        let section = Arc::new(HostSection::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&section);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *s.enter() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*section.enter(), 4000);
    }
}
