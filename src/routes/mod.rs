//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the REST surface and the websocket endpoint under a
//! single Axum router. REST covers login and room administration; the
//! websocket at `/api/ws` carries all live traffic once a session holds
//! a token.

pub mod auth;
pub mod rooms;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// REST + websocket routes shared by every frontend.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route("/api/rooms/{id}", get(rooms::get_room))
        .route(
            "/api/rooms/{id}/messages",
            get(rooms::message_history).delete(rooms::purge_room),
        )
        .route("/api/rooms/{id}/members", post(rooms::upsert_member))
        .route(
            "/api/rooms/{id}/members/{user_id}",
            axum::routing::delete(rooms::remove_member),
        )
        .route("/api/rooms/{id}/export.jsonl", get(rooms::export_jsonl))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
