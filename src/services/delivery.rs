//! Message acceptance and receipt tracking rules.
//!
//! DESIGN
//! ======
//! Pure functions over `Message`; the room actor owns the data and calls
//! in here, so every rule is testable without channels or a store.
//!
//! A message progresses `sent -> delivered -> read` and never backwards.
//! `delivered_to` and `read_by` are per-recipient first-write-wins maps;
//! the sender never appears in either. The sender-visible aggregate
//! differs by room kind: direct rooms report `delivered`/`read` only when
//! every recipient has the stamp, group-shaped rooms report `delivered`
//! once any recipient does and leave per-user read detail to
//! `fetch_receipts`.

use uuid::Uuid;

use crate::event::{DeliveryState, MemberRole, Message, MessageKind, RoomError, RoomKind, now_ms};
use crate::services::store::SessionUser;

/// Upper bound on message content, in bytes.
pub const MAX_CONTENT_LEN: usize = 10_000;

// =============================================================================
// ACCEPTANCE
// =============================================================================

/// Validate a client-submitted post against room kind, sender role, and
/// content rules. Membership itself is checked by the caller.
pub fn validate_post(
    room_kind: RoomKind,
    role: MemberRole,
    kind: MessageKind,
    content: &str,
) -> Result<(), RoomError> {
    if kind == MessageKind::System {
        return Err(RoomError::Invalid("system messages cannot be sent by clients"));
    }
    if kind == MessageKind::Announcement && room_kind != RoomKind::Announcement {
        return Err(RoomError::Invalid("announcement messages belong in announcement rooms"));
    }
    if room_kind == RoomKind::Announcement && !role.is_admin() {
        return Err(RoomError::Forbidden("only admins can post in announcement rooms"));
    }
    if content.trim().is_empty() {
        return Err(RoomError::Invalid("empty message content"));
    }
    if content.len() > MAX_CONTENT_LEN {
        return Err(RoomError::Invalid("message content too long"));
    }
    Ok(())
}

/// Build the accepted message for position `seq`. The id, timestamps, and
/// empty receipt maps are fixed here; `seq` comes from the room actor.
#[must_use]
pub fn build_message(
    room_id: Uuid,
    seq: i64,
    sender: &SessionUser,
    kind: MessageKind,
    content: String,
    reply_to: Option<Uuid>,
    forward_of: Option<Uuid>,
) -> Message {
    Message {
        id: Uuid::new_v4(),
        room_id,
        seq,
        sender_id: sender.id,
        sender_name: sender.name.clone(),
        kind,
        content,
        reply_to,
        forward_of,
        sent_at: now_ms(),
        edited_at: None,
        delivered_to: std::collections::HashMap::new(),
        read_by: std::collections::HashMap::new(),
        delivery: DeliveryState::Sent,
    }
}

// =============================================================================
// RECEIPTS
// =============================================================================

/// Stamp `user_id` as delivered at `at_ms`. Returns `true` when the map
/// changed; repeats and the sender itself are no-ops.
pub fn mark_delivered(msg: &mut Message, user_id: Uuid, at_ms: i64) -> bool {
    if user_id == msg.sender_id || msg.delivered_to.contains_key(&user_id) {
        return false;
    }
    msg.delivered_to.insert(user_id, at_ms);
    true
}

/// Stamp `user_id` as read at `at_ms`, backfilling the delivered stamp
/// when it is missing so read always implies delivered. Returns `true`
/// when anything changed.
pub fn mark_read(msg: &mut Message, user_id: Uuid, at_ms: i64) -> bool {
    if user_id == msg.sender_id {
        return false;
    }
    let delivered = mark_delivered(msg, user_id, at_ms);
    if msg.read_by.contains_key(&user_id) {
        return delivered;
    }
    msg.read_by.insert(user_id, at_ms);
    true
}

/// Sender-visible aggregate for a message with `recipient_count` members
/// besides the sender.
#[must_use]
pub fn aggregate(room_kind: RoomKind, recipient_count: usize, msg: &Message) -> DeliveryState {
    match room_kind {
        RoomKind::Direct => {
            if recipient_count > 0 && msg.read_by.len() >= recipient_count {
                DeliveryState::Read
            } else if recipient_count > 0 && msg.delivered_to.len() >= recipient_count {
                DeliveryState::Delivered
            } else {
                DeliveryState::Sent
            }
        }
        // Group-shaped rooms cap the aggregate at `delivered`; per-user
        // read detail is served on demand.
        RoomKind::Group | RoomKind::Course | RoomKind::Announcement => {
            if msg.delivered_to.is_empty() {
                DeliveryState::Sent
            } else {
                DeliveryState::Delivered
            }
        }
    }
}

/// Fill the derived `delivery` field in place before a message leaves the
/// server.
pub fn decorate(msg: &mut Message, room_kind: RoomKind, recipient_count: usize) {
    msg.delivery = aggregate(room_kind, recipient_count, msg);
}

#[cfg(test)]
#[path = "delivery_test.rs"]
mod tests;
