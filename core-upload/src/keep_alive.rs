use std::sync::Arc;

use bridge_traits::HostSession;
use core_async::{Duration, Throttle};
use tracing::trace;

/// Rate-limited host keep-alive.
///
/// Long loops (version probing, stability waits, transfer progress) call
/// [`KeepAlive::touch`] freely; the host sees at most one touch per
/// `idle_timeout / 2`, no matter how many tasks call it.
#[derive(Clone)]
pub struct KeepAlive {
    host: Arc<dyn HostSession>,
    throttle: Arc<Throttle>,
}

impl KeepAlive {
    pub fn new(host: Arc<dyn HostSession>) -> Self {
        let throttle = Arc::new(Throttle::new(host.keep_alive_interval()));
        Self { host, throttle }
    }

    /// Touches the host session if the interval has elapsed.
    ///
    /// Returns `true` when the host was actually touched.
    pub fn touch(&self) -> bool {
        if self.throttle.try_acquire() {
            trace!("Touching host session");
            self.host.touch();
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.throttle.interval()
    }
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("interval", &self.interval())
            .finish()
    }
}
