//! Per-key cancellable delayed tasks.
//!
//! [`KeyedTimers`] is the bookkeeping half of a "one pending timer per key"
//! scheduler. It does not own a lock or spawn anything itself: the caller keeps
//! it inside whatever state its own mutex already guards, arms a slot, and
//! hands the returned [`TimerTicket`] to the task that sleeps.
//!
//! Arming a key always cancels the previous slot for that key, so at most one
//! live slot exists per key. A sleeping task must confirm it is still current
//! (`is_current`) after waking and before acting. A cancelled token alone is
//! not enough, because a task may wake between the cancel and its own check.
//!
//! ```rust
//! use core_async::timer::KeyedTimers;
//!
//! let mut timers = KeyedTimers::new();
//! let first = timers.arm("clip.mp4".to_string());
//! let second = timers.arm("clip.mp4".to_string());
//!
//! assert!(first.token.is_cancelled());
//! assert!(!timers.is_current("clip.mp4", first.generation));
//! assert!(timers.is_current("clip.mp4", second.generation));
//! assert_eq!(timers.len(), 1);
//! ```

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use crate::sync::CancellationToken;

/// Handle given to the task that services one armed slot.
#[derive(Debug, Clone)]
pub struct TimerTicket {
    /// Monotonic identifier of the slot; unique for the lifetime of the map.
    pub generation: u64,
    /// Cancelled when the slot is replaced or cancelled.
    pub token: CancellationToken,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    token: CancellationToken,
}

/// Map of key to its single live timer slot.
#[derive(Debug)]
pub struct KeyedTimers<K> {
    slots: HashMap<K, Slot>,
    next_generation: u64,
}

impl<K> Default for KeyedTimers<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            next_generation: 1,
        }
    }
}

impl<K: Eq + Hash> KeyedTimers<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a fresh slot for `key`, cancelling and replacing any existing one.
    pub fn arm(&mut self, key: K) -> TimerTicket {
        let generation = self.next_generation;
        self.next_generation += 1;

        let token = CancellationToken::new();
        let previous = self.slots.insert(
            key,
            Slot {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        TimerTicket { generation, token }
    }

    /// Cancels and removes the slot for `key`. Returns `true` if one existed.
    pub fn cancel<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.slots.remove(key) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels and removes every slot, returning how many were live.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            slot.token.cancel();
        }
        count
    }

    /// Whether `generation` is still the live slot for `key`.
    pub fn is_current<Q>(&self, key: &Q, generation: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots
            .get(key)
            .map(|slot| slot.generation == generation)
            .unwrap_or(false)
    }

    /// Removes the slot for `key` only if `generation` is still current.
    ///
    /// Called by the servicing task when it finishes on its own (fired or
    /// abandoned). A stale ticket leaves the newer slot untouched.
    pub fn disarm<Q>(&mut self, key: &Q, generation: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.is_current(key, generation) {
            self.slots.remove(key);
            true
        } else {
            false
        }
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.slots.keys()
    }
}
