//! Typing indicator state for one room.
//!
//! DESIGN
//! ======
//! Pure state machine owned by a room actor. A `typing_start` marks a user
//! active until either an explicit `typing_stop` or the expiry window
//! lapses; repeated starts inside the window refresh the deadline without
//! producing another notification, which is what debounces a fast typist
//! into a single `user_typing` per pause. Expiry is observed by the actor
//! polling `next_deadline`, and an expired user is indistinguishable from
//! one who stopped explicitly.
//!
//! All mutators take an explicit `now` so tests drive time directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// A user is considered to have stopped typing this long after their last
/// `typing_start`.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct TypingSet {
    expiry: Duration,
    /// user -> deadline after which they count as stopped
    active: HashMap<Uuid, Instant>,
}

impl Default for TypingSet {
    fn default() -> Self {
        Self::with_expiry(TYPING_EXPIRY)
    }
}

impl TypingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            expiry,
            active: HashMap::new(),
        }
    }

    /// Record a `typing_start`. Returns `true` when observers should be
    /// told (first start, or first after a stop/expiry that was already
    /// announced); a refresh returns `false`.
    pub fn start_at(&mut self, user_id: Uuid, now: Instant) -> bool {
        self.active.insert(user_id, now + self.expiry).is_none()
    }

    /// Record an explicit `typing_stop`. Returns `true` when the user was
    /// active and observers should be told they stopped.
    pub fn stop_at(&mut self, user_id: Uuid, _now: Instant) -> bool {
        self.active.remove(&user_id).is_some()
    }

    /// Collect users whose window lapsed at `now`, removing them. Each
    /// returned user needs the same fan-out as an explicit stop.
    pub fn expire_due(&mut self, now: Instant) -> Vec<Uuid> {
        let due: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(user, _)| *user)
            .collect();
        for user in &due {
            self.active.remove(user);
        }
        due
    }

    /// Earliest pending expiry, if anyone is typing.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.values().min().copied()
    }

    /// Drop one user without any notification bookkeeping (membership
    /// revocation, session teardown).
    pub fn forget(&mut self, user_id: Uuid) -> bool {
        self.active.remove(&user_id).is_some()
    }

    #[must_use]
    pub fn is_typing(&self, user_id: Uuid) -> bool {
        self.active.contains_key(&user_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
