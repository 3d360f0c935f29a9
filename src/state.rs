//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is the axum state: the store seam, the connection registry,
//! the room directory, and the presence read view. Everything inside is
//! already `Arc`-backed, so the struct clones cheaply per request.
//!
//! `test_helpers` builds the same wiring around an in-memory store so the
//! full websocket and room paths run in tests without Postgres.

use std::sync::Arc;

use crate::services::presence::PresenceView;
use crate::services::registry::ConnectionRegistry;
use crate::services::room::RoomDirectory;
use crate::services::store::ChatStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub registry: ConnectionRegistry,
    pub rooms: RoomDirectory,
    pub presence: PresenceView,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: ConnectionRegistry,
        rooms: RoomDirectory,
        presence: PresenceView,
    ) -> Self {
        Self {
            store,
            registry,
            rooms,
            presence,
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
