//! Time-related operations.
//!
//! Sleeps and timeouts go through tokio's timer wheel, so tests running on a
//! paused runtime (`#[tokio::test(start_paused = true)]`) control them fully.
//! `Instant` is the std monotonic clock; use [`SystemTime`] or a bridge
//! `Clock` for wall-clock values such as file modification times.

pub use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
pub use tokio::time::{interval, sleep, sleep_until, timeout, Interval, Sleep, Timeout};

/// Returns the current time as milliseconds since UNIX_EPOCH.
///
/// Returns 0 if the system clock reports a time before the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Converts a millisecond count into a [`Duration`], treating negative values
/// as zero.
///
/// Configuration values arrive as signed integers; a non-positive delay means
/// "now".
///
/// ```rust
/// use core_async::time::{duration_from_millis, Duration};
///
/// assert_eq!(duration_from_millis(-5), Duration::ZERO);
/// assert_eq!(duration_from_millis(250), Duration::from_millis(250));
/// ```
pub fn duration_from_millis(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn negative_millis_clamp_to_zero() {
        assert_eq!(duration_from_millis(i64::MIN), Duration::ZERO);
        assert_eq!(duration_from_millis(0), Duration::ZERO);
        assert_eq!(duration_from_millis(1), Duration::from_millis(1));
    }
}
