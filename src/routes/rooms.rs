//! Room administration routes.
//!
//! Live messaging happens over the websocket; these endpoints cover the
//! management surface around it: creating rooms, wiring membership,
//! browsing history pages, and exporting a room archive.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{MemberInfo, MemberRole, Message, RoomError, RoomInfo, RoomKind, now_ms};
use crate::routes::auth::AuthUser;
use crate::services::delivery;
use crate::services::membership::RoomMembership;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 100;
const EXPORT_CHUNK: i64 = 500;

pub(crate) fn room_error_to_status(err: &RoomError) -> StatusCode {
    match err {
        RoomError::RoomNotFound(_) | RoomError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        RoomError::Forbidden(_) => StatusCode::FORBIDDEN,
        RoomError::Invalid(_) => StatusCode::BAD_REQUEST,
        RoomError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RoomError::NotJoined(_) => StatusCode::CONFLICT,
    }
}

/// Load the room row and its membership, or the right error status.
async fn load_room(state: &AppState, room_id: Uuid) -> Result<(RoomInfo, RoomMembership), StatusCode> {
    let record = state
        .store
        .fetch_room(room_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let members = state
        .store
        .fetch_members(room_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok((record.to_info(), RoomMembership::from_rows(members)))
}

// =============================================================================
// ROOMS
// =============================================================================

#[derive(Deserialize)]
pub struct CreateRoomBody {
    pub name: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
}

/// `GET /api/rooms` — list the caller's rooms, newest first.
pub async fn list_rooms(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Vec<RoomInfo>>, StatusCode> {
    let rooms = state
        .store
        .list_rooms_for_user(auth.user.id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(rooms))
}

/// `POST /api/rooms` — create a room.
///
/// Direct rooms are keyed by their two participants: asking for a direct
/// room that already exists returns the existing one instead of minting
/// a duplicate conversation.
pub async fn create_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<RoomInfo>), StatusCode> {
    let Some(kind) = RoomKind::from_str(&body.kind) else {
        return Err(StatusCode::BAD_REQUEST);
    };

    if kind == RoomKind::Direct {
        let others: Vec<Uuid> = body.member_ids.iter().copied().filter(|id| *id != auth.user.id).collect();
        let &[other] = others.as_slice() else {
            return Err(StatusCode::BAD_REQUEST);
        };
        if let Some(existing) = state
            .store
            .find_direct_room(auth.user.id, other)
            .await
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?
        {
            let (room, _) = load_room(&state, existing).await?;
            return Ok((StatusCode::OK, Json(room)));
        }
        let record = state
            .store
            .create_room("", kind, auth.user.id, &[other])
            .await
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
        return Ok((StatusCode::CREATED, Json(record.to_info())));
    }

    let name = body.name.as_deref().unwrap_or_default().trim().to_owned();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let record = state
        .store
        .create_room(&name, kind, auth.user.id, &body.member_ids)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok((StatusCode::CREATED, Json(record.to_info())))
}

#[derive(Serialize)]
pub struct RoomDetailResponse {
    pub room: RoomInfo,
    pub members: Vec<MemberInfo>,
}

/// `GET /api/rooms/:id` — room metadata plus membership, members only.
pub async fn get_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
) -> Result<Json<RoomDetailResponse>, StatusCode> {
    let (room, membership) = load_room(&state, room_id).await?;
    membership.authorize(auth.user.id).map_err(|e| room_error_to_status(&e))?;
    Ok(Json(RoomDetailResponse {
        room,
        members: membership.members().to_vec(),
    }))
}

// =============================================================================
// HISTORY
// =============================================================================

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub before_seq: Option<i64>,
    pub limit: Option<i64>,
}

/// `GET /api/rooms/:id/messages` — one history page, newest first.
///
/// `before_seq` is an exclusive cursor; pass the lowest seq of the page
/// you already hold to walk further back.
pub async fn message_history(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let (room, membership) = load_room(&state, room_id).await?;
    membership.authorize(auth.user.id).map_err(|e| room_error_to_status(&e))?;

    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    let mut page = state
        .store
        .history_page(room_id, query.before_seq, limit)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    for msg in &mut page {
        delivery::decorate(msg, room.kind, membership.recipient_count(msg.sender_id));
    }
    Ok(Json(page))
}

#[derive(Serialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

/// `DELETE /api/rooms/:id/messages` — drop the room's entire history.
/// Admins only; direct conversations cannot be purged.
pub async fn purge_room(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
) -> Result<Json<PurgeResponse>, StatusCode> {
    let (room, membership) = load_room(&state, room_id).await?;
    let role = membership.authorize(auth.user.id).map_err(|e| room_error_to_status(&e))?;
    if room.kind == RoomKind::Direct || !role.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }

    let purged = state.rooms.purge(room_id).await.map_err(|e| room_error_to_status(&e))?;
    Ok(Json(PurgeResponse { purged }))
}

// =============================================================================
// MEMBERS
// =============================================================================

#[derive(Deserialize)]
pub struct UpsertMemberBody {
    pub user_id: Uuid,
    pub role: Option<String>,
}

/// `POST /api/rooms/:id/members` — add a member or change their role.
/// Admins only. Ownership is fixed at creation and direct rooms have
/// fixed membership.
pub async fn upsert_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
    Json(body): Json<UpsertMemberBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let role = match body.role.as_deref() {
        None => MemberRole::Member,
        Some(raw) => match MemberRole::from_str(raw) {
            Some(MemberRole::Owner) | None => return Err(StatusCode::BAD_REQUEST),
            Some(role) => role,
        },
    };

    let (room, membership) = load_room(&state, room_id).await?;
    if room.kind == RoomKind::Direct {
        return Err(StatusCode::BAD_REQUEST);
    }
    let caller = membership.authorize(auth.user.id).map_err(|e| room_error_to_status(&e))?;
    if !caller.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }
    if membership.role_of(body.user_id) == Some(MemberRole::Owner) {
        return Err(StatusCode::FORBIDDEN);
    }

    state
        .store
        .upsert_member(room_id, body.user_id, role)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    state.rooms.invalidate_members(room_id).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `DELETE /api/rooms/:id/members/:user_id` — remove a member.
/// Admins can remove anyone but the owner; anyone can remove themselves.
pub async fn remove_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((room_id, member_user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let (room, membership) = load_room(&state, room_id).await?;
    if room.kind == RoomKind::Direct {
        return Err(StatusCode::BAD_REQUEST);
    }
    let caller = membership.authorize(auth.user.id).map_err(|e| room_error_to_status(&e))?;
    let self_removal = member_user_id == auth.user.id;
    if !self_removal && !caller.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }
    if membership.role_of(member_user_id) == Some(MemberRole::Owner) {
        return Err(StatusCode::FORBIDDEN);
    }

    state
        .store
        .remove_member(room_id, member_user_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    state.rooms.invalidate_members(room_id).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// =============================================================================
// EXPORT
// =============================================================================

#[derive(Serialize)]
struct RoomExportMetaLine {
    #[serde(rename = "type")]
    line_type: &'static str,
    version: u8,
    room_id: Uuid,
    exported_at_ms: i64,
    message_count: usize,
}

#[derive(Serialize)]
struct RoomExportMessageLine<'a> {
    #[serde(rename = "type")]
    line_type: &'static str,
    #[serde(flatten)]
    message: &'a Message,
}

pub(crate) fn export_lines(room_id: Uuid, messages: &[Message]) -> Result<Vec<String>, serde_json::Error> {
    let mut lines = Vec::with_capacity(messages.len() + 1);
    let meta = RoomExportMetaLine {
        line_type: "room_export_meta",
        version: 1,
        room_id,
        exported_at_ms: now_ms(),
        message_count: messages.len(),
    };
    lines.push(format!("{}\n", serde_json::to_string(&meta)?));
    for message in messages {
        let line = RoomExportMessageLine {
            line_type: "message",
            message,
        };
        lines.push(format!("{}\n", serde_json::to_string(&line)?));
    }
    Ok(lines)
}

/// `GET /api/rooms/:id/export.jsonl` — download the room history as
/// NDJSON/JSONL, oldest first, members only.
pub async fn export_jsonl(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(room_id): Path<Uuid>,
) -> Result<Response, StatusCode> {
    let (room, membership) = load_room(&state, room_id).await?;
    membership.authorize(auth.user.id).map_err(|e| room_error_to_status(&e))?;

    let mut messages: Vec<Message> = Vec::new();
    let mut after_seq = 0;
    loop {
        let chunk = state
            .store
            .messages_since(room_id, after_seq, EXPORT_CHUNK)
            .await
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
        let done = i64::try_from(chunk.len()).unwrap_or(i64::MAX) < EXPORT_CHUNK;
        if let Some(last) = chunk.last() {
            after_seq = last.seq;
        }
        messages.extend(chunk);
        if done {
            break;
        }
    }
    for msg in &mut messages {
        delivery::decorate(msg, room.kind, membership.recipient_count(msg.sender_id));
    }

    let lines = export_lines(room_id, &messages).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let stream = futures::stream::iter(
        lines
            .into_iter()
            .map(|line| Ok::<axum::body::Bytes, std::convert::Infallible>(axum::body::Bytes::from(line))),
    );
    let body = axum::body::Body::from_stream(stream);
    let filename = format!("room-{room_id}.jsonl");

    Ok((
        [
            (CONTENT_TYPE, "application/x-ndjson; charset=utf-8"),
            (CONTENT_DISPOSITION, &format!("attachment; filename=\"{filename}\"")),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
