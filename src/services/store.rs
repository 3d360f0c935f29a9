//! Durable chat storage behind a trait seam.
//!
//! ARCHITECTURE
//! ============
//! Room actors and HTTP routes talk to `ChatStore`, never to sqlx directly.
//! `PgChatStore` is the production implementation; tests swap in an
//! in-memory store so ordering, receipt, and presence behavior can be
//! exercised without Postgres (see `state::test_helpers`).
//!
//! ERROR HANDLING
//! ==============
//! Every store failure collapses into `StoreError::Unavailable`. Callers
//! treat it as fail-closed: a send is not acknowledged, an authorization
//! check does not pass, and the caller is told to retry.

use std::collections::HashMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use rand::Rng;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::event::{MemberInfo, MemberRole, Message, MessageKind, RoomError, RoomInfo, RoomKind, now_ms};

// =============================================================================
// TYPES
// =============================================================================

/// Authenticated user attached to a session token.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub name: String,
}

/// Room row plus creator, as stored.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: RoomKind,
    pub created_by: Option<Uuid>,
}

impl RoomRecord {
    #[must_use]
    pub fn to_info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<StoreError> for RoomError {
    fn from(err: StoreError) -> Self {
        let StoreError::Unavailable(msg) = err;
        Self::StoreUnavailable(msg)
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Durable state operations used by room actors and HTTP routes.
///
/// `messages_since` and `history_page` are the two read shapes: ascending
/// backfill after a cursor, and descending pages for history browsing.
/// `merge_receipts` must keep existing stamps on conflict so the earliest
/// delivery or read time always wins.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_login(&self, name: &str) -> Result<(String, SessionUser), StoreError>;
    async fn validate_token(&self, token: &str) -> Result<Option<SessionUser>, StoreError>;
    async fn revoke_token(&self, token: &str) -> Result<(), StoreError>;

    async fn create_room(
        &self,
        name: &str,
        kind: RoomKind,
        creator: Uuid,
        member_ids: &[Uuid],
    ) -> Result<RoomRecord, StoreError>;
    async fn find_direct_room(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>, StoreError>;
    async fn fetch_room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, StoreError>;
    async fn fetch_members(&self, room_id: Uuid) -> Result<Vec<MemberInfo>, StoreError>;
    async fn list_rooms_for_user(&self, user_id: Uuid) -> Result<Vec<RoomInfo>, StoreError>;
    async fn upsert_member(&self, room_id: Uuid, user_id: Uuid, role: MemberRole) -> Result<(), StoreError>;
    async fn remove_member(&self, room_id: Uuid, user_id: Uuid) -> Result<(), StoreError>;

    async fn append_message(&self, msg: &Message) -> Result<(), StoreError>;
    async fn max_seq(&self, room_id: Uuid) -> Result<i64, StoreError>;
    async fn messages_since(&self, room_id: Uuid, after_seq: i64, limit: i64) -> Result<Vec<Message>, StoreError>;
    async fn history_page(
        &self,
        room_id: Uuid,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;
    async fn fetch_message(&self, room_id: Uuid, message_id: Uuid) -> Result<Option<Message>, StoreError>;
    async fn merge_receipts(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        delivered: &[(Uuid, i64)],
        read: &[(Uuid, i64)],
    ) -> Result<(), StoreError>;
    async fn apply_edit(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        content: &str,
        kind: Option<MessageKind>,
        edited_at: i64,
    ) -> Result<bool, StoreError>;
    async fn delete_message(&self, room_id: Uuid, message_id: Uuid) -> Result<bool, StoreError>;
    async fn purge_room(&self, room_id: Uuid) -> Result<u64, StoreError>;
}

// =============================================================================
// TOKENS
// =============================================================================

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a cryptographically random 32-byte hex session token.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

fn receipt_json(pairs: &[(Uuid, i64)]) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(pairs.len());
    for (user, at) in pairs {
        map.insert(user.to_string(), serde_json::Value::from(*at));
    }
    serde_json::Value::Object(map)
}

fn receipt_map(value: serde_json::Value) -> HashMap<Uuid, i64> {
    serde_json::from_value(value).unwrap_or_default()
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<Message, StoreError> {
    let kind_raw: String = row.get("kind");
    let kind = MessageKind::from_str(&kind_raw)
        .ok_or_else(|| StoreError::Unavailable(format!("corrupt message kind: {kind_raw}")))?;
    Ok(Message {
        id: row.get("id"),
        room_id: row.get("room_id"),
        seq: row.get("seq"),
        sender_id: row.get("sender_id"),
        sender_name: row.get("sender_name"),
        kind,
        content: row.get("content"),
        reply_to: row.get("reply_to"),
        forward_of: row.get("forward_of"),
        sent_at: row.get("sent_at"),
        edited_at: row.get("edited_at"),
        delivered_to: receipt_map(row.get("delivered_to")),
        read_by: receipt_map(row.get("read_by")),
        delivery: crate::event::DeliveryState::Sent,
    })
}

const MESSAGE_COLUMNS: &str = "id, room_id, seq, sender_id, sender_name, kind, content, \
     reply_to, forward_of, sent_at, edited_at, delivered_to, read_by";

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_login(&self, name: &str) -> Result<(String, SessionUser), StoreError> {
        let row = sqlx::query(
            r"INSERT INTO users (id, name) VALUES ($1, $2)
              ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
              RETURNING id, name",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        let user = SessionUser {
            id: row.get("id"),
            name: row.get("name"),
        };

        let token = generate_token();
        sqlx::query("INSERT INTO sessions (token, user_id) VALUES ($1, $2)")
            .bind(&token)
            .bind(user.id)
            .execute(&self.pool)
            .await?;
        Ok((token, user))
    }

    async fn validate_token(&self, token: &str) -> Result<Option<SessionUser>, StoreError> {
        let row = sqlx::query(
            r"SELECT u.id, u.name
              FROM sessions s
              JOIN users u ON u.id = s.user_id
              WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| SessionUser {
            id: r.get("id"),
            name: r.get("name"),
        }))
    }

    async fn revoke_token(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_room(
        &self,
        name: &str,
        kind: RoomKind,
        creator: Uuid,
        member_ids: &[Uuid],
    ) -> Result<RoomRecord, StoreError> {
        let room_id = Uuid::new_v4();
        let joined = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO rooms (id, name, kind, created_by) VALUES ($1, $2, $3, $4)")
            .bind(room_id)
            .bind(name)
            .bind(kind.as_str())
            .bind(creator)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO room_members (room_id, user_id, role, joined_at) VALUES ($1, $2, $3, $4)")
            .bind(room_id)
            .bind(creator)
            .bind(MemberRole::Owner.as_str())
            .bind(joined)
            .execute(&mut *tx)
            .await?;
        for member in member_ids {
            if *member == creator {
                continue;
            }
            sqlx::query(
                r"INSERT INTO room_members (room_id, user_id, role, joined_at)
                  VALUES ($1, $2, $3, $4)
                  ON CONFLICT (room_id, user_id) DO NOTHING",
            )
            .bind(room_id)
            .bind(member)
            .bind(MemberRole::Member.as_str())
            .bind(joined)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(RoomRecord {
            id: room_id,
            name: name.to_string(),
            kind,
            created_by: Some(creator),
        })
    }

    async fn find_direct_room(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r"SELECT r.id
              FROM rooms r
              JOIN room_members m1 ON m1.room_id = r.id AND m1.user_id = $1
              JOIN room_members m2 ON m2.room_id = r.id AND m2.user_id = $2
              WHERE r.kind = 'direct'
              LIMIT 1",
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn fetch_room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, StoreError> {
        let Some(row) = sqlx::query("SELECT id, name, kind, created_by FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let kind_raw: String = row.get("kind");
        let kind = RoomKind::from_str(&kind_raw)
            .ok_or_else(|| StoreError::Unavailable(format!("corrupt room kind: {kind_raw}")))?;
        Ok(Some(RoomRecord {
            id: row.get("id"),
            name: row.get("name"),
            kind,
            created_by: row.get("created_by"),
        }))
    }

    async fn fetch_members(&self, room_id: Uuid) -> Result<Vec<MemberInfo>, StoreError> {
        let rows = sqlx::query(
            r"SELECT m.user_id, u.name, m.role, m.joined_at
              FROM room_members m
              JOIN users u ON u.id = m.user_id
              WHERE m.room_id = $1
              ORDER BY m.joined_at ASC, m.user_id ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let role_raw: String = r.get("role");
                let role = MemberRole::from_str(&role_raw)
                    .ok_or_else(|| StoreError::Unavailable(format!("corrupt member role: {role_raw}")))?;
                Ok(MemberInfo {
                    user_id: r.get("user_id"),
                    name: r.get("name"),
                    role,
                    joined_at: r.get("joined_at"),
                })
            })
            .collect()
    }

    async fn list_rooms_for_user(&self, user_id: Uuid) -> Result<Vec<RoomInfo>, StoreError> {
        let rows = sqlx::query(
            r"SELECT r.id, r.name, r.kind
              FROM rooms r
              JOIN room_members m ON m.room_id = r.id
              WHERE m.user_id = $1
              ORDER BY r.created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let kind_raw: String = r.get("kind");
                let kind = RoomKind::from_str(&kind_raw)
                    .ok_or_else(|| StoreError::Unavailable(format!("corrupt room kind: {kind_raw}")))?;
                Ok(RoomInfo {
                    id: r.get("id"),
                    name: r.get("name"),
                    kind,
                })
            })
            .collect()
    }

    async fn upsert_member(&self, room_id: Uuid, user_id: Uuid, role: MemberRole) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO room_members (room_id, user_id, role, joined_at)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (room_id, user_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_member(&self, room_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_message(&self, msg: &Message) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO messages
                  (id, room_id, seq, sender_id, sender_name, kind, content,
                   reply_to, forward_of, sent_at, edited_at, delivered_to, read_by)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(msg.id)
        .bind(msg.room_id)
        .bind(msg.seq)
        .bind(msg.sender_id)
        .bind(&msg.sender_name)
        .bind(msg.kind.as_str())
        .bind(&msg.content)
        .bind(msg.reply_to)
        .bind(msg.forward_of)
        .bind(msg.sent_at)
        .bind(msg.edited_at)
        .bind(receipt_json(&[]))
        .bind(receipt_json(&[]))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn max_seq(&self, room_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS max_seq FROM messages WHERE room_id = $1")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("max_seq"))
    }

    async fn messages_since(&self, room_id: Uuid, after_seq: i64, limit: i64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE room_id = $1 AND seq > $2 ORDER BY seq ASC LIMIT $3"
        ))
        .bind(room_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn history_page(
        &self,
        room_id: Uuid,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE room_id = $1 AND ($2::bigint IS NULL OR seq < $2) \
             ORDER BY seq DESC LIMIT $3"
        ))
        .bind(room_id)
        .bind(before_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn fetch_message(&self, room_id: Uuid, message_id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 AND id = $2"
        ))
        .bind(room_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn merge_receipts(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        delivered: &[(Uuid, i64)],
        read: &[(Uuid, i64)],
    ) -> Result<(), StoreError> {
        if delivered.is_empty() && read.is_empty() {
            return Ok(());
        }
        // Existing stamps win on conflict: `incoming || existing` keeps the
        // right-hand value for duplicate keys, so the earliest stamp sticks.
        sqlx::query(
            r"UPDATE messages
              SET delivered_to = $3::jsonb || delivered_to,
                  read_by = $4::jsonb || read_by
              WHERE room_id = $1 AND id = $2",
        )
        .bind(room_id)
        .bind(message_id)
        .bind(receipt_json(delivered))
        .bind(receipt_json(read))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_edit(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        content: &str,
        kind: Option<MessageKind>,
        edited_at: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE messages
              SET content = $3, kind = COALESCE($4, kind), edited_at = $5
              WHERE room_id = $1 AND id = $2",
        )
        .bind(room_id)
        .bind(message_id)
        .bind(content)
        .bind(kind.map(MessageKind::as_str))
        .bind(edited_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_message(&self, room_id: Uuid, message_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE room_id = $1 AND id = $2")
            .bind(room_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_room(&self, room_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE room_id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
