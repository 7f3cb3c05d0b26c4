//! Host Session Capability
//!
//! The host application (a media server, a recorder) expires idle sessions.
//! While uploads are pending or running the engine periodically "touches" the
//! session so the host does not tear it down underneath a long transfer.

use std::time::Duration;

/// Keep-alive channel to the host session that owns the storage root.
///
/// `touch` is called from many tasks; the engine coalesces calls so the host
/// sees at most one per [`HostSession::keep_alive_interval`].
///
/// # Example
///
/// ```
/// use bridge_traits::host::{HostSession, NoopHostSession};
/// use std::time::Duration;
///
/// let host = NoopHostSession::new(Duration::from_secs(60));
/// assert_eq!(host.keep_alive_interval(), Duration::from_secs(30));
/// host.touch();
/// ```
pub trait HostSession: Send + Sync {
    /// Mark the session as active.
    fn touch(&self);

    /// How long the host waits before expiring an untouched session.
    fn idle_timeout(&self) -> Duration;

    /// Interval between keep-alive touches: half the idle timeout.
    fn keep_alive_interval(&self) -> Duration {
        self.idle_timeout() / 2
    }
}

/// Host session for hosts that never expire sessions.
#[derive(Debug, Clone)]
pub struct NoopHostSession {
    idle_timeout: Duration,
}

impl NoopHostSession {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }
}

impl Default for NoopHostSession {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl HostSession for NoopHostSession {
    fn touch(&self) {}

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
