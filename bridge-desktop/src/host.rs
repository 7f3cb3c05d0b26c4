//! Host session for standalone desktop processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bridge_traits::host::HostSession;
use chrono::{DateTime, Utc};
use tracing::trace;

/// Default idle timeout reported to the engine.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A desktop process never idles out, so touches are only recorded.
#[derive(Debug)]
pub struct DesktopHostSession {
    idle_timeout: Duration,
    touches: AtomicU64,
    last_touch: Mutex<Option<DateTime<Utc>>>,
}

impl DesktopHostSession {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            touches: AtomicU64::new(0),
            last_touch: Mutex::new(None),
        }
    }

    pub fn touch_count(&self) -> u64 {
        self.touches.load(Ordering::Relaxed)
    }

    pub fn last_touch(&self) -> Option<DateTime<Utc>> {
        self.last_touch.lock().ok().and_then(|last| *last)
    }
}

impl Default for DesktopHostSession {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl HostSession for DesktopHostSession {
    fn touch(&self) {
        let count = self.touches.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut last) = self.last_touch.lock() {
            *last = Some(Utc::now());
        }
        trace!(count, "Host session touched");
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
