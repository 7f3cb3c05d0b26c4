//! Coalescing rate limiter.
//!
//! A [`Throttle`] admits at most one caller per interval regardless of how
//! many tasks ask concurrently. It is lock-free: the last admitted instant is
//! stored as an offset from the throttle's creation instant.
//!
//! Time is read from tokio's clock, so a paused test runtime controls it.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

use crate::time::Duration;

const NEVER: u64 = u64::MAX;

#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    origin: Instant,
    /// Millis since `origin` of the last admitted call, or `NEVER`.
    last: AtomicU64,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            origin: Instant::now(),
            last: AtomicU64::new(NEVER),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` if the caller may proceed now.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Same as [`Throttle::try_acquire`] with an explicit "now".
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let now_ms = now.saturating_duration_since(self.origin).as_millis() as u64;
        let interval_ms = self.interval.as_millis() as u64;

        let mut last = self.last.load(Ordering::Acquire);
        loop {
            if last != NEVER && now_ms.saturating_sub(last) < interval_ms {
                return false;
            }
            match self
                .last
                .compare_exchange_weak(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => last = actual,
            }
        }
    }
}
