//! Connection registry — user to live websocket connections.
//!
//! DESIGN
//! ======
//! Each upgraded socket registers its per-connection outbound channel under
//! `(user_id, conn_id)`. A user with several tabs or devices owns several
//! entries; fan-out to a user targets all of them. The registry is the only
//! place that knows when a user's connection count crosses zero, so it is
//! also the single producer of presence transitions: exactly one `online`
//! edge when the first connection lands, exactly one `offline` edge when
//! the last one dies. Everything downstream (grace windows, room
//! notifications) is the presence tracker's job.
//!
//! Sends are best-effort `try_send`; a slow consumer loses frames rather
//! than stalling the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::ServerEvent;

/// A user's connection count crossed zero in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionChange {
    pub user_id: Uuid,
    pub online: bool,
}

#[derive(Default)]
struct Inner {
    /// user -> conn -> outbound channel
    users: HashMap<Uuid, HashMap<Uuid, mpsc::Sender<ServerEvent>>>,
    /// conn -> owning user
    owners: HashMap<Uuid, Uuid>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
    changes: mpsc::UnboundedSender<ConnectionChange>,
}

impl ConnectionRegistry {
    /// Build the registry plus the transition stream consumed by the
    /// presence tracker. The channel is unbounded: transitions are tiny,
    /// rare, and must never be dropped.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionChange>) {
        let (changes, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Mutex::new(Inner::default())),
                changes,
            },
            rx,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a connection. Re-registering the same `conn_id` is a no-op.
    pub fn register(&self, user_id: Uuid, conn_id: Uuid, tx: mpsc::Sender<ServerEvent>) {
        let first = {
            let mut inner = self.lock();
            if inner.owners.contains_key(&conn_id) {
                return;
            }
            inner.owners.insert(conn_id, user_id);
            let conns = inner.users.entry(user_id).or_default();
            let first = conns.is_empty();
            conns.insert(conn_id, tx);
            first
        };
        debug!(%user_id, %conn_id, first, "connection registered");
        if first {
            let _ = self.changes.send(ConnectionChange { user_id, online: true });
        }
    }

    /// Drop a connection. Emits an offline edge when it was the user's last.
    pub fn unregister(&self, conn_id: Uuid) {
        let last_for = {
            let mut inner = self.lock();
            let Some(user_id) = inner.owners.remove(&conn_id) else {
                return;
            };
            let mut last = false;
            if let Some(conns) = inner.users.get_mut(&user_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    inner.users.remove(&user_id);
                    last = true;
                }
            }
            last.then_some(user_id)
        };
        if let Some(user_id) = last_for {
            debug!(%user_id, %conn_id, "last connection gone");
            let _ = self.changes.send(ConnectionChange { user_id, online: false });
        }
    }

    /// Push an event to every live connection of one user. Returns how many
    /// connections accepted it; zero means the user is unreachable right now.
    pub fn fan_out(&self, user_id: Uuid, event: &ServerEvent) -> usize {
        let senders: Vec<mpsc::Sender<ServerEvent>> = {
            let inner = self.lock();
            match inner.users.get(&user_id) {
                Some(conns) => conns.values().cloned().collect(),
                None => return 0,
            }
        };
        let mut accepted = 0;
        for tx in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%user_id, event = event.name(), "dropping event for slow connection");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        accepted
    }

    /// Push an event to every connection of every user.
    pub fn broadcast_all(&self, event: &ServerEvent) {
        let senders: Vec<mpsc::Sender<ServerEvent>> = {
            let inner = self.lock();
            inner.users.values().flat_map(|conns| conns.values().cloned()).collect()
        };
        for tx in senders {
            let _ = tx.try_send(event.clone());
        }
    }

    /// Live connection count for one user.
    #[must_use]
    pub fn user_connections(&self, user_id: Uuid) -> usize {
        self.lock().users.get(&user_id).map_or(0, HashMap::len)
    }

    /// Total live connections across all users.
    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.lock().owners.len()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
