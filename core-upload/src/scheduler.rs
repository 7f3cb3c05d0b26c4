//! # Stability Scheduler
//!
//! Decides when a file has stopped changing long enough to upload.
//!
//! [`Scheduler::schedule`] replaces any pending wait for the file, then
//! either fires at once (zero delay, or the file is already old enough) or
//! spawns a wait task that re-checks the file's age until it reaches the
//! delay. The same entry point provides retry backoff after a failed
//! attempt: the caller passes `restart_timeout + current_age`.
//!
//! Each re-check runs under the shared lock and ends the wait if:
//!
//! - shutdown has begun
//! - the marker was removed
//! - the file got younger than last observed (it was written to again)
//!
//! A younger file is an anomaly, not a transfer failure, so it is not
//! retried automatically.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bridge_traits::Clock;
use core_async::time::timeout;
use core_async::{Duration, TimerTicket};
use core_runtime::{AbandonReason, EventBus, UploadEvent};
use tracing::{debug, instrument, trace, warn};

use crate::error::Result;
use crate::keep_alive::KeepAlive;
use crate::marker::MarkerStore;
use crate::state::SharedState;

/// Shortest sleep between re-checks.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Receives files the scheduler considers settled.
#[async_trait]
pub trait UploadTrigger: Send + Sync {
    async fn start_upload(&self, media_name: &str);
}

/// What a re-check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    /// Not settled yet; carries the age just observed.
    Wait(Duration),
    Fire,
    Stop,
}

#[derive(Clone)]
pub struct Scheduler {
    state: SharedState,
    markers: MarkerStore,
    clock: Arc<dyn Clock>,
    keep_alive: KeepAlive,
    events: EventBus,
    trigger: Weak<dyn UploadTrigger>,
}

impl Scheduler {
    pub fn new(
        state: SharedState,
        markers: MarkerStore,
        clock: Arc<dyn Clock>,
        keep_alive: KeepAlive,
        events: EventBus,
        trigger: Weak<dyn UploadTrigger>,
    ) -> Self {
        Self {
            state,
            markers,
            clock,
            keep_alive,
            events,
            trigger,
        }
    }

    /// Upper bound on a single sleep, so keep-alive touches keep flowing
    /// during long waits.
    fn tick_cap(&self) -> Duration {
        self.keep_alive.interval() / 2
    }

    /// Age of the source file, or `None` if it is gone.
    async fn source_age(&self, media_name: &str) -> Result<Option<Duration>> {
        Ok(self
            .markers
            .source_modified(media_name)
            .await?
            .map(|modified| self.clock.age_of(modified)))
    }

    /// Arms (or re-arms) the stability wait for `media_name`.
    ///
    /// No-op once shutdown has begun. When the file is already at least
    /// `delay` old, the upload is started before this returns.
    #[instrument(skip(self), fields(delay_ms = delay.as_millis() as u64))]
    pub async fn schedule(&self, media_name: &str, delay: Duration) {
        // A missing source still fires: the upload path removes the orphan.
        let age = match self.source_age(media_name).await {
            Ok(age) => age,
            Err(e) => {
                warn!(media_name, error = %e, "Cannot stat source file; not scheduling");
                return;
            }
        };
        let immediate = delay.is_zero() || age.map_or(true, |age| age >= delay);

        let ticket = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                debug!(media_name, "Ignoring schedule request during shutdown");
                return;
            }
            if immediate {
                state.timers.cancel(media_name);
                None
            } else {
                Some(state.timers.arm(media_name.to_string()))
            }
        };

        match ticket {
            None => {
                debug!(media_name, "File already settled; starting upload");
                self.fire(media_name).await;
            }
            Some(ticket) => {
                let age = age.unwrap_or(Duration::ZERO);
                self.events.upload(UploadEvent::Scheduled {
                    media_name: media_name.to_string(),
                    delay_ms: delay.as_millis() as u64,
                });
                debug!(
                    media_name,
                    age_ms = age.as_millis() as u64,
                    generation = ticket.generation,
                    "Waiting for file to settle"
                );
                let scheduler = self.clone();
                let media_name = media_name.to_string();
                core_async::spawn(async move {
                    scheduler.wait_until_settled(media_name, delay, ticket, age).await;
                });
            }
        }
    }

    async fn fire(&self, media_name: &str) {
        match self.trigger.upgrade() {
            Some(trigger) => trigger.start_upload(media_name).await,
            None => debug!(media_name, "Upload engine dropped; not starting upload"),
        }
    }

    async fn wait_until_settled(
        &self,
        media_name: String,
        delay: Duration,
        ticket: TimerTicket,
        mut last_age: Duration,
    ) {
        loop {
            let step = delay
                .saturating_sub(last_age)
                .min(self.tick_cap())
                .max(MIN_TICK);

            // Ok means the token was cancelled before the step elapsed.
            if timeout(step, ticket.token.cancelled()).await.is_ok() {
                trace!(media_name = %media_name, generation = ticket.generation, "Wait cancelled");
                return;
            }

            match self.recheck(&media_name, delay, &ticket, last_age).await {
                Tick::Wait(age) => {
                    last_age = age;
                    self.keep_alive.touch();
                }
                Tick::Fire => {
                    self.fire(&media_name).await;
                    return;
                }
                Tick::Stop => return,
            }
        }
    }

    async fn recheck(
        &self,
        media_name: &str,
        delay: Duration,
        ticket: &TimerTicket,
        last_age: Duration,
    ) -> Tick {
        let mut state = self.state.lock().await;
        if !state.timers.is_current(media_name, ticket.generation) {
            return Tick::Stop;
        }

        if state.shutting_down {
            state.timers.disarm(media_name, ticket.generation);
            self.abandon(media_name, AbandonReason::ShuttingDown);
            return Tick::Stop;
        }

        match self.markers.exists(media_name).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(media_name, "Marker disappeared while waiting; abandoning");
                state.timers.disarm(media_name, ticket.generation);
                self.abandon(media_name, AbandonReason::MarkerRemoved);
                return Tick::Stop;
            }
            Err(e) => {
                warn!(media_name, error = %e, "Cannot check marker; abandoning wait");
                state.timers.disarm(media_name, ticket.generation);
                return Tick::Stop;
            }
        }

        let age = match self.source_age(media_name).await {
            Ok(Some(age)) => age,
            Ok(None) => {
                state.timers.disarm(media_name, ticket.generation);
                return Tick::Fire;
            }
            Err(e) => {
                warn!(media_name, error = %e, "Cannot stat source file; abandoning wait");
                state.timers.disarm(media_name, ticket.generation);
                return Tick::Stop;
            }
        };

        if age < last_age {
            warn!(
                media_name,
                age_ms = age.as_millis() as u64,
                last_age_ms = last_age.as_millis() as u64,
                "File modified after it was presumed complete; abandoning"
            );
            state.timers.disarm(media_name, ticket.generation);
            self.abandon(media_name, AbandonReason::SourceModified);
            return Tick::Stop;
        }

        if age >= delay {
            state.timers.disarm(media_name, ticket.generation);
            return Tick::Fire;
        }

        Tick::Wait(age)
    }

    fn abandon(&self, media_name: &str, reason: AbandonReason) {
        self.events.upload(UploadEvent::Abandoned {
            media_name: media_name.to_string(),
            reason,
        });
    }

    /// Number of pending stability waits.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.timers.len()
    }

    pub async fn is_pending(&self, media_name: &str) -> bool {
        self.state.lock().await.timers.contains_key(media_name)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("root", &self.markers.root())
            .field("tick_cap", &self.tick_cap())
            .finish()
    }
}
