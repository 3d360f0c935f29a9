mod db;
mod event;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use services::presence::{PresenceConfig, PresenceView, spawn_presence_tracker};
use services::registry::ConnectionRegistry;
use services::room::{RoomConfig, RoomDirectory};
use services::store::{ChatStore, PgChatStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let store: Arc<dyn ChatStore> = Arc::new(PgChatStore::new(pool));
    let (registry, changes) = ConnectionRegistry::new();
    let presence = PresenceView::new();
    let rooms = RoomDirectory::new(store.clone(), registry.clone(), presence.clone(), RoomConfig::from_env());

    // Presence edges flow from the registry into the tracker, which owns
    // the grace window and fans user_online/user_offline to member rooms.
    let _presence_tracker = spawn_presence_tracker(
        changes,
        presence.clone(),
        registry.clone(),
        rooms.clone(),
        PresenceConfig::from_env(),
    );

    let state = state::AppState::new(store, registry, rooms, presence);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "studyhall listening");
    axum::serve(listener, app).await.expect("server failed");
}
