use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};

const USEC_PER_SEC: u64 = 1_000_000;

// epoch of the process clock, pinned on first use
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

// An absolute instant on the process clock, in microseconds. Timestamp::ZERO
// is the clock epoch; the timeout registry also uses it for "never armed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_micros(usecs: u64) -> Timestamp {
        Timestamp(usecs)
    }

    #[inline]
    pub fn as_micros(self) -> u64 {
        self.0
    }

    // the instant `dur` after self
    #[inline]
    pub fn saturating_add(self, dur: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(dur.as_micros() as u64))
    }
}

// difference `to - from`, split into whole seconds plus leftover
// microseconds; saturates to (0, 0) when `to` is not after `from`
pub fn timestamp_difference(from: Timestamp, to: Timestamp) -> (u64, u32) {
    let diff = to.0.saturating_sub(from.0);
    (diff / USEC_PER_SEC, (diff % USEC_PER_SEC) as u32)
}

// source of timestamps for the multiplexer; a trait seam so tests can drive
// the queue with a hand-cranked clock while the process uses MonotonicClock
pub trait Clock: Sync {
    fn current(&self) -> Timestamp;
}

// the real process clock
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn current(&self) -> Timestamp {
        // we need a monotonic clock here, wall clock time can jump
        Timestamp(START_TIME.elapsed().as_micros() as u64)
    }
}

// test clock that only moves when told to
#[cfg(test)]
pub(crate) struct ManualClock {
    now: AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            now: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, t: Timestamp) {
        self.now.store(t.0, Ordering::Relaxed);
    }

    pub fn advance(&self, dur: Duration) {
        self.now
            .fetch_add(dur.as_micros() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn current(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::Relaxed))
    }
}
