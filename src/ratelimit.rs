use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Lets at most one diagnostic through per interval.
///
/// Lock-free, so it is safe to consult from the sampler thread.
#[derive(Debug)]
pub struct RateLimiter {
    origin: Instant,
    interval_nanos: u64,
    // nanos since `origin` of the last permitted message, +1 so 0 means never
    last: AtomicU64,
    suppressed: AtomicU64,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        RateLimiter {
            origin: Instant::now(),
            interval_nanos: interval.as_nanos() as u64,
            last: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed)` if the caller may log now, where
    /// `suppressed` counts the messages swallowed since the last one.
    pub fn check(&self) -> Option<u64> {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last.load(Ordering::Relaxed);
        let due = last == 0 || now.saturating_sub(last) >= self.interval_nanos;
        if due
            && self
                .last
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::AcqRel));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}
