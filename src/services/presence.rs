//! Presence tracking with an offline grace window.
//!
//! ARCHITECTURE
//! ============
//! One background task consumes the registry's transition stream and owns
//! the authoritative online set. Offline edges are not believed
//! immediately: the user enters a grace window, and a reconnect inside it
//! cancels the flip so page refreshes and flaky mobile links never flap
//! presence. Online edges for a user in the window simply cancel it.
//!
//! Visible flips do three things: update the shared `PresenceView` (lock
//! per lookup, no channels on the read path), notify live rooms so they
//! can tell sessions that share a room with the user, and broadcast the
//! global `online_users_count`.
//!
//! The fold itself is a pure state machine (`PresenceState`) driven with
//! explicit timestamps, so the grace behavior is tested without timers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::event::ServerEvent;
use crate::services::registry::{ConnectionChange, ConnectionRegistry};
use crate::services::room::RoomDirectory;
use crate::services::{env_parse, sleep_until_opt};

const DEFAULT_GRACE_MS: u64 = 4_000;

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    /// How long an offline edge is held back waiting for a reconnect.
    pub grace: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
        }
    }
}

impl PresenceConfig {
    /// Read `PRESENCE_GRACE_MS` from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            grace: Duration::from_millis(env_parse("PRESENCE_GRACE_MS", DEFAULT_GRACE_MS)),
        }
    }
}

// =============================================================================
// READ VIEW
// =============================================================================

/// Shared read-only view of who is visibly online. Written only by the
/// presence task; everyone else takes the read lock for O(1) lookups.
#[derive(Clone, Default)]
pub struct PresenceView {
    online: Arc<RwLock<HashSet<Uuid>>>,
}

impl PresenceView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.read().contains(&user_id)
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.read().len()
    }

    /// Filter `users` down to the visibly-online ones, preserving order.
    #[must_use]
    pub fn online_subset(&self, users: &[Uuid]) -> Vec<Uuid> {
        let online = self.read();
        users.iter().copied().filter(|u| online.contains(u)).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashSet<Uuid>> {
        self.online.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn apply(&self, user_id: Uuid, online: bool) {
        let mut set = self.online.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if online {
            set.insert(user_id);
        } else {
            set.remove(&user_id);
        }
    }
}

// =============================================================================
// FOLD
// =============================================================================

/// A visible presence flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceShift {
    Online(Uuid),
    Offline(Uuid),
}

/// Pure fold over registry transitions. Offline edges park the user in
/// `pending` until the grace deadline; `due_at` harvests the ones that
/// really expired.
#[derive(Debug)]
pub struct PresenceState {
    grace: Duration,
    online: HashSet<Uuid>,
    pending: HashMap<Uuid, Instant>,
}

impl PresenceState {
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            online: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn fold_at(&mut self, change: ConnectionChange, now: Instant) -> Option<PresenceShift> {
        if change.online {
            if self.pending.remove(&change.user_id).is_some() {
                // Reconnected inside the grace window: nobody ever saw
                // them leave, so nobody sees them arrive.
                return None;
            }
            self.online
                .insert(change.user_id)
                .then_some(PresenceShift::Online(change.user_id))
        } else {
            if self.online.contains(&change.user_id) {
                self.pending.insert(change.user_id, now + self.grace);
            }
            None
        }
    }

    /// Harvest users whose grace window lapsed at `now`.
    pub fn due_at(&mut self, now: Instant) -> Vec<PresenceShift> {
        let due: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(user, _)| *user)
            .collect();
        due.iter()
            .map(|user| {
                self.pending.remove(user);
                self.online.remove(user);
                PresenceShift::Offline(*user)
            })
            .collect()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    #[must_use]
    pub fn visible_count(&self) -> usize {
        self.online.len()
    }
}

// =============================================================================
// TASK
// =============================================================================

/// Spawn the presence tracker over the registry's transition stream.
pub fn spawn_presence_tracker(
    mut changes: mpsc::UnboundedReceiver<ConnectionChange>,
    view: PresenceView,
    registry: ConnectionRegistry,
    rooms: RoomDirectory,
    config: PresenceConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = PresenceState::new(config.grace);
        loop {
            tokio::select! {
                maybe = changes.recv() => {
                    let Some(change) = maybe else { break };
                    if let Some(shift) = state.fold_at(change, Instant::now()) {
                        publish(&shift, &state, &view, &registry, &rooms).await;
                    }
                }
                () = sleep_until_opt(state.next_deadline()) => {
                    for shift in state.due_at(Instant::now()) {
                        publish(&shift, &state, &view, &registry, &rooms).await;
                    }
                }
            }
        }
    })
}

async fn publish(
    shift: &PresenceShift,
    state: &PresenceState,
    view: &PresenceView,
    registry: &ConnectionRegistry,
    rooms: &RoomDirectory,
) {
    let (user_id, online) = match shift {
        PresenceShift::Online(u) => (*u, true),
        PresenceShift::Offline(u) => (*u, false),
    };
    view.apply(user_id, online);
    info!(%user_id, online, count = state.visible_count(), "presence shift");
    rooms.notify_presence(user_id, online).await;
    registry.broadcast_all(&ServerEvent::OnlineUsersCount {
        count: state.visible_count(),
    });
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
