//! Bookkeeping shared by the scheduler and the orchestrator.
//!
//! Everything here lives behind one mutex. Holders must not perform network
//! transfers or checkpoint writes while holding it; marker existence checks
//! followed by creation or deletion are the only I/O done under the lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use core_async::sync::Mutex;
use core_async::KeyedTimers;

use crate::naming::KeyLedger;

/// Identifies one transfer attempt for one media file.
pub type AttemptId = u64;

#[derive(Debug, Default)]
pub struct UploadState {
    /// Pending stability waits, one slot per media name.
    pub timers: KeyedTimers<String>,
    /// Object keys this process is currently uploading or has reserved.
    pub in_flight: InFlightKeys,
    /// Media name to its running attempt.
    pub active: HashMap<String, AttemptId>,
    /// Set once by shutdown, never cleared.
    pub shutting_down: bool,
    next_attempt: AttemptId,
}

impl UploadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new attempt for `media_name`, or `None` if one is running.
    pub fn begin_attempt(&mut self, media_name: &str) -> Option<AttemptId> {
        if self.active.contains_key(media_name) {
            return None;
        }
        self.next_attempt += 1;
        let id = self.next_attempt;
        self.active.insert(media_name.to_string(), id);
        Some(id)
    }

    /// Ends `attempt` if it is still the current one for `media_name`.
    pub fn end_attempt(&mut self, media_name: &str, attempt: AttemptId) -> bool {
        if self.is_current_attempt(media_name, attempt) {
            self.active.remove(media_name);
            true
        } else {
            false
        }
    }

    pub fn is_current_attempt(&self, media_name: &str, attempt: AttemptId) -> bool {
        self.active.get(media_name) == Some(&attempt)
    }
}

/// Reference-counted set of object keys held by running attempts.
///
/// A versioned claim is exclusive. With versioning off, or when resuming, two
/// attempts may hold the same key; the key stays in flight until both release.
#[derive(Debug, Default)]
pub struct InFlightKeys {
    holders: HashMap<String, usize>,
}

impl InFlightKeys {
    pub fn contains(&self, key: &str) -> bool {
        self.holders.contains_key(key)
    }

    /// Takes `key` only if nobody holds it.
    pub fn try_reserve(&mut self, key: &str) -> bool {
        if self.holders.contains_key(key) {
            return false;
        }
        self.holders.insert(key.to_string(), 1);
        true
    }

    /// Adds a holder for `key` and returns the holder count.
    pub fn acquire(&mut self, key: &str) -> usize {
        let count = self.holders.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drops one holder. Returns `false` if `key` was not held.
    pub fn release(&mut self, key: &str) -> bool {
        match self.holders.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.holders.remove(key);
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.holders.keys()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

pub type SharedState = Arc<Mutex<UploadState>>;

/// [`KeyLedger`] view over the in-flight key set of a [`SharedState`].
#[derive(Debug, Clone)]
pub struct InFlightLedger {
    state: SharedState,
}

impl InFlightLedger {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub async fn release(&self, key: &str) -> bool {
        self.state.lock().await.in_flight.release(key)
    }
}

#[async_trait]
impl KeyLedger for InFlightLedger {
    async fn is_reserved(&self, key: &str) -> bool {
        self.state.lock().await.in_flight.contains(key)
    }

    async fn try_reserve(&self, key: &str) -> bool {
        self.state.lock().await.in_flight.try_reserve(key)
    }

    async fn acquire(&self, key: &str) -> usize {
        self.state.lock().await.in_flight.acquire(key)
    }
}
