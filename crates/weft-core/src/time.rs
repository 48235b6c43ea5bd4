//! Absolute-time conversion for timed waits.
//!
//! POSIX timed waits take an absolute `timespec`. The host waits in
//! relative milliseconds, so every timed operation converts immediately
//! before blocking; a deadline already in the past clamps to a zero
//! delta, which the host treats as a poll that still succeeds on a
//! ready object.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NANOS_PER_MILLI: i64 = 1_000_000;
const MILLIS_PER_SEC: i64 = 1_000;

/// Seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    /// Seconds.
    pub sec: i64,
    /// Nanoseconds (0 to 999_999_999).
    pub nsec: i64,
}

impl Timespec {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            sec: since_epoch.as_secs() as i64,
            nsec: i64::from(since_epoch.subsec_nanos()),
        }
    }

    /// An absolute time `d` from now. Convenience for timed-wait callers.
    pub fn after(d: Duration) -> Self {
        let now = Self::now();
        let mut sec = now.sec + d.as_secs() as i64;
        let mut nsec = now.nsec + i64::from(d.subsec_nanos());
        if nsec >= MILLIS_PER_SEC * NANOS_PER_MILLI {
            nsec -= MILLIS_PER_SEC * NANOS_PER_MILLI;
            sec += 1;
        }
        Self { sec, nsec }
    }
}

/// Milliseconds remaining until `abstime`, rounded to the nearest
/// millisecond and clamped at zero.
pub fn delta_ms(abstime: &Timespec) -> u64 {
    let now = Timespec::now();
    let mut millis = (abstime.sec - now.sec) * MILLIS_PER_SEC;
    millis += ((abstime.nsec - now.nsec) + NANOS_PER_MILLI / 2) / NANOS_PER_MILLI;
    if millis < 0 { 0 } else { millis as u64 }
}
