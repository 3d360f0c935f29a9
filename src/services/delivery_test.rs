use super::*;
use crate::event::ErrorCode;

fn sender() -> SessionUser {
    SessionUser {
        id: Uuid::new_v4(),
        name: "ada".into(),
    }
}

fn fresh_message(from: &SessionUser) -> Message {
    build_message(
        Uuid::new_v4(),
        1,
        from,
        MessageKind::Text,
        "morning all".into(),
        None,
        None,
    )
}

// =============================================================================
// VALIDATION
// =============================================================================

#[test]
fn plain_text_post_passes() {
    assert!(validate_post(RoomKind::Group, MemberRole::Member, MessageKind::Text, "hi").is_ok());
}

#[test]
fn empty_and_whitespace_content_rejected() {
    let err = validate_post(RoomKind::Group, MemberRole::Member, MessageKind::Text, "   \n\t").unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID");
}

#[test]
fn oversized_content_rejected() {
    let big = "x".repeat(MAX_CONTENT_LEN + 1);
    let err = validate_post(RoomKind::Group, MemberRole::Member, MessageKind::Text, &big).unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID");
}

#[test]
fn clients_cannot_send_system_messages() {
    let err = validate_post(RoomKind::Group, MemberRole::Owner, MessageKind::System, "hack").unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID");
}

#[test]
fn announcement_room_is_admin_only() {
    let err = validate_post(
        RoomKind::Announcement,
        MemberRole::Member,
        MessageKind::Announcement,
        "exam moved",
    )
    .unwrap_err();
    assert_eq!(err.error_code(), "E_FORBIDDEN");

    assert!(
        validate_post(
            RoomKind::Announcement,
            MemberRole::Admin,
            MessageKind::Announcement,
            "exam moved",
        )
        .is_ok()
    );
}

#[test]
fn announcement_kind_outside_announcement_room_rejected() {
    let err = validate_post(RoomKind::Course, MemberRole::Admin, MessageKind::Announcement, "psst").unwrap_err();
    assert_eq!(err.error_code(), "E_INVALID");
}

// =============================================================================
// RECEIPT STAMPS
// =============================================================================

#[test]
fn delivered_stamp_is_first_write_wins() {
    let from = sender();
    let mut msg = fresh_message(&from);
    let reader = Uuid::new_v4();

    assert!(mark_delivered(&mut msg, reader, 100));
    assert!(!mark_delivered(&mut msg, reader, 999), "repeat must be a no-op");
    assert_eq!(msg.delivered_to.get(&reader), Some(&100));
}

#[test]
fn sender_never_appears_in_receipts() {
    let from = sender();
    let mut msg = fresh_message(&from);

    assert!(!mark_delivered(&mut msg, from.id, 100));
    assert!(!mark_read(&mut msg, from.id, 100));
    assert!(msg.delivered_to.is_empty());
    assert!(msg.read_by.is_empty());
}

#[test]
fn read_backfills_delivered() {
    let from = sender();
    let mut msg = fresh_message(&from);
    let reader = Uuid::new_v4();

    assert!(mark_read(&mut msg, reader, 500));
    assert_eq!(msg.delivered_to.get(&reader), Some(&500));
    assert_eq!(msg.read_by.get(&reader), Some(&500));
}

#[test]
fn read_after_delivered_keeps_both_stamps() {
    let from = sender();
    let mut msg = fresh_message(&from);
    let reader = Uuid::new_v4();

    mark_delivered(&mut msg, reader, 100);
    assert!(mark_read(&mut msg, reader, 300));
    assert!(!mark_read(&mut msg, reader, 900), "second read is a no-op");
    assert_eq!(msg.delivered_to.get(&reader), Some(&100));
    assert_eq!(msg.read_by.get(&reader), Some(&300));
}

// =============================================================================
// AGGREGATE ASYMMETRY
// =============================================================================

#[test]
fn direct_aggregate_requires_the_full_recipient_set() {
    let from = sender();
    let mut msg = fresh_message(&from);
    let peer = Uuid::new_v4();

    assert_eq!(aggregate(RoomKind::Direct, 1, &msg), DeliveryState::Sent);
    mark_delivered(&mut msg, peer, 100);
    assert_eq!(aggregate(RoomKind::Direct, 1, &msg), DeliveryState::Delivered);
    mark_read(&mut msg, peer, 200);
    assert_eq!(aggregate(RoomKind::Direct, 1, &msg), DeliveryState::Read);
}

#[test]
fn group_aggregate_moves_on_first_delivery_and_caps_at_delivered() {
    let from = sender();
    let mut msg = fresh_message(&from);
    let one_of_many = Uuid::new_v4();

    assert_eq!(aggregate(RoomKind::Group, 5, &msg), DeliveryState::Sent);
    mark_delivered(&mut msg, one_of_many, 100);
    assert_eq!(aggregate(RoomKind::Group, 5, &msg), DeliveryState::Delivered);

    // Even a full read set never lifts the group aggregate to `read`.
    for _ in 0..5 {
        mark_read(&mut msg, Uuid::new_v4(), 200);
    }
    assert_eq!(aggregate(RoomKind::Group, 5, &msg), DeliveryState::Delivered);
    assert_eq!(aggregate(RoomKind::Course, 5, &msg), DeliveryState::Delivered);
}

#[test]
fn state_never_moves_backwards() {
    let from = sender();
    let mut msg = fresh_message(&from);
    let peer = Uuid::new_v4();

    mark_read(&mut msg, peer, 100);
    assert_eq!(aggregate(RoomKind::Direct, 1, &msg), DeliveryState::Read);
    // A late delivered stamp for the same user changes nothing.
    mark_delivered(&mut msg, peer, 999);
    assert_eq!(aggregate(RoomKind::Direct, 1, &msg), DeliveryState::Read);
}

#[test]
fn decorate_sets_the_derived_field() {
    let from = sender();
    let mut msg = fresh_message(&from);
    mark_delivered(&mut msg, Uuid::new_v4(), 100);

    decorate(&mut msg, RoomKind::Group, 3);
    assert_eq!(msg.delivery, DeliveryState::Delivered);
}

#[test]
fn build_message_stamps_position_and_time() {
    let from = sender();
    let msg = build_message(
        Uuid::new_v4(),
        41,
        &from,
        MessageKind::File,
        "notes.pdf".into(),
        Some(Uuid::new_v4()),
        None,
    );
    assert_eq!(msg.seq, 41);
    assert_eq!(msg.sender_id, from.id);
    assert_eq!(msg.kind, MessageKind::File);
    assert!(msg.sent_at > 0);
    assert!(msg.edited_at.is_none());
    assert!(msg.reply_to.is_some());
}
