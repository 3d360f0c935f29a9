use super::*;

use crate::event::{DeliveryState, MessageKind};
use crate::services::store::{ChatStore, SessionUser};
use crate::state::test_helpers::{MemoryStore, test_app_state};

fn auth_as(store: &MemoryStore, user: &SessionUser) -> AuthUser {
    AuthUser {
        user: user.clone(),
        token: store.login(user),
    }
}

fn create_body(kind: &str, name: Option<&str>, member_ids: Vec<Uuid>) -> Json<CreateRoomBody> {
    Json(CreateRoomBody {
        name: name.map(str::to_owned),
        kind: kind.to_owned(),
        member_ids,
    })
}

#[test]
fn room_errors_map_to_the_right_status() {
    assert_eq!(room_error_to_status(&RoomError::Forbidden("nope")), StatusCode::FORBIDDEN);
    assert_eq!(
        room_error_to_status(&RoomError::RoomNotFound(Uuid::new_v4())),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        room_error_to_status(&RoomError::MessageNotFound(Uuid::new_v4())),
        StatusCode::NOT_FOUND
    );
    assert_eq!(room_error_to_status(&RoomError::Invalid("bad")), StatusCode::BAD_REQUEST);
    assert_eq!(
        room_error_to_status(&RoomError::StoreUnavailable("db down".into())),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
        room_error_to_status(&RoomError::NotJoined(Uuid::new_v4())),
        StatusCode::CONFLICT
    );
}

#[tokio::test]
async fn direct_rooms_dedupe_per_pair() {
    let (state, store) = test_app_state();
    let alice = store.add_user("alice");
    let bob = store.add_user("bob");

    let (status, first) = create_room(
        State(state.clone()),
        auth_as(&store, &alice),
        create_body("direct", None, vec![bob.id]),
    )
    .await
    .expect("first create succeeds");
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first.kind, RoomKind::Direct);

    let (status, again) = create_room(
        State(state.clone()),
        auth_as(&store, &alice),
        create_body("direct", None, vec![bob.id]),
    )
    .await
    .expect("repeat create succeeds");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again.id, first.id);

    // Same pair from the other side, creator listed in member_ids too.
    let (status, reversed) = create_room(
        State(state),
        auth_as(&store, &bob),
        create_body("direct", None, vec![alice.id, bob.id]),
    )
    .await
    .expect("reversed create succeeds");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reversed.id, first.id);
}

#[tokio::test]
async fn create_room_validates_kind_name_and_direct_shape() {
    let (state, store) = test_app_state();
    let alice = store.add_user("alice");
    let bob = store.add_user("bob");
    let carol = store.add_user("carol");

    let unknown_kind = create_room(
        State(state.clone()),
        auth_as(&store, &alice),
        create_body("broadcast", Some("news"), vec![]),
    )
    .await;
    assert_eq!(unknown_kind.err(), Some(StatusCode::BAD_REQUEST));

    let nameless_group = create_room(
        State(state.clone()),
        auth_as(&store, &alice),
        create_body("group", Some("   "), vec![bob.id]),
    )
    .await;
    assert_eq!(nameless_group.err(), Some(StatusCode::BAD_REQUEST));

    let lonely_direct = create_room(
        State(state.clone()),
        auth_as(&store, &alice),
        create_body("direct", None, vec![]),
    )
    .await;
    assert_eq!(lonely_direct.err(), Some(StatusCode::BAD_REQUEST));

    let crowded_direct = create_room(
        State(state.clone()),
        auth_as(&store, &alice),
        create_body("direct", None, vec![bob.id, carol.id]),
    )
    .await;
    assert_eq!(crowded_direct.err(), Some(StatusCode::BAD_REQUEST));

    let (status, group) = create_room(
        State(state),
        auth_as(&store, &alice),
        create_body("group", Some("  algebra crew  "), vec![bob.id]),
    )
    .await
    .expect("valid group create succeeds");
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(group.name, "algebra crew");

    let members = store.fetch_members(group.id).await.expect("members load");
    let role_of = |id: Uuid| members.iter().find(|m| m.user_id == id).map(|m| m.role);
    assert_eq!(role_of(alice.id), Some(MemberRole::Owner));
    assert_eq!(role_of(bob.id), Some(MemberRole::Member));
}

#[tokio::test]
async fn room_detail_is_members_only() {
    let (state, store) = test_app_state();
    let alice = store.add_user("alice");
    let bob = store.add_user("bob");
    let mallory = store.add_user("mallory");
    let room_id = store.add_room(
        RoomKind::Group,
        "algebra",
        &[(&alice, MemberRole::Owner), (&bob, MemberRole::Member)],
    );

    let outsider = get_room(State(state.clone()), auth_as(&store, &mallory), Path(room_id)).await;
    assert_eq!(outsider.err(), Some(StatusCode::FORBIDDEN));

    let missing = get_room(State(state.clone()), auth_as(&store, &alice), Path(Uuid::new_v4())).await;
    assert_eq!(missing.err(), Some(StatusCode::NOT_FOUND));

    let detail = get_room(State(state), auth_as(&store, &bob), Path(room_id))
        .await
        .expect("member sees the room");
    assert_eq!(detail.room.id, room_id);
    assert_eq!(detail.room.name, "algebra");
    assert_eq!(detail.members.len(), 2);
}

#[tokio::test]
async fn history_pages_newest_first_with_decorated_delivery() {
    let (state, store) = test_app_state();
    let alice = store.add_user("alice");
    let bob = store.add_user("bob");
    let mallory = store.add_user("mallory");
    let room_id = store.add_room(
        RoomKind::Direct,
        "",
        &[(&alice, MemberRole::Member), (&bob, MemberRole::Member)],
    );

    let mut newest_id = Uuid::nil();
    for seq in 1..=5 {
        let msg = delivery::build_message(room_id, seq, &alice, MessageKind::Text, format!("m{seq}"), None, None);
        newest_id = msg.id;
        store.append_message(&msg).await.expect("append succeeds");
    }
    store
        .merge_receipts(room_id, newest_id, &[(bob.id, now_ms())], &[])
        .await
        .expect("receipt merge succeeds");

    let outsider = message_history(
        State(state.clone()),
        auth_as(&store, &mallory),
        Path(room_id),
        Query(HistoryQuery {
            before_seq: None,
            limit: None,
        }),
    )
    .await;
    assert_eq!(outsider.err(), Some(StatusCode::FORBIDDEN));

    let page = message_history(
        State(state.clone()),
        auth_as(&store, &bob),
        Path(room_id),
        Query(HistoryQuery {
            before_seq: None,
            limit: Some(2),
        }),
    )
    .await
    .expect("first page loads");
    let seqs: Vec<i64> = page.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![5, 4]);
    assert_eq!(page[0].delivery, DeliveryState::Delivered);
    assert_eq!(page[1].delivery, DeliveryState::Sent);

    let page = message_history(
        State(state.clone()),
        auth_as(&store, &bob),
        Path(room_id),
        Query(HistoryQuery {
            before_seq: Some(4),
            limit: Some(2),
        }),
    )
    .await
    .expect("second page loads");
    let seqs: Vec<i64> = page.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![3, 2]);

    let page = message_history(
        State(state),
        auth_as(&store, &bob),
        Path(room_id),
        Query(HistoryQuery {
            before_seq: Some(2),
            limit: None,
        }),
    )
    .await
    .expect("last page loads");
    let seqs: Vec<i64> = page.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1]);
}

#[tokio::test]
async fn purging_requires_admin_in_a_group_shaped_room() {
    let (state, store) = test_app_state();
    let alice = store.add_user("alice");
    let bob = store.add_user("bob");
    let group_id = store.add_room(
        RoomKind::Group,
        "algebra",
        &[(&alice, MemberRole::Owner), (&bob, MemberRole::Member)],
    );
    let direct_id = store.add_room(
        RoomKind::Direct,
        "",
        &[(&alice, MemberRole::Owner), (&bob, MemberRole::Member)],
    );
    for seq in 1..=3 {
        let msg = delivery::build_message(group_id, seq, &alice, MessageKind::Text, "note".into(), None, None);
        store.append_message(&msg).await.expect("append succeeds");
    }

    let as_member = purge_room(State(state.clone()), auth_as(&store, &bob), Path(group_id)).await;
    assert_eq!(as_member.err(), Some(StatusCode::FORBIDDEN));

    let on_direct = purge_room(State(state.clone()), auth_as(&store, &alice), Path(direct_id)).await;
    assert_eq!(on_direct.err(), Some(StatusCode::FORBIDDEN));

    let purged = purge_room(State(state), auth_as(&store, &alice), Path(group_id))
        .await
        .expect("owner purges");
    assert_eq!(purged.purged, 3);
    assert_eq!(store.message_count(group_id), 0);
}

#[tokio::test]
async fn member_management_respects_roles_and_room_shape() {
    let (state, store) = test_app_state();
    let alice = store.add_user("alice");
    let bob = store.add_user("bob");
    let carol = store.add_user("carol");
    let group_id = store.add_room(
        RoomKind::Group,
        "algebra",
        &[(&alice, MemberRole::Owner), (&bob, MemberRole::Member)],
    );
    let direct_id = store.add_room(
        RoomKind::Direct,
        "",
        &[(&alice, MemberRole::Member), (&bob, MemberRole::Member)],
    );

    let add_body = |user_id: Uuid, role: Option<&str>| {
        Json(UpsertMemberBody {
            user_id,
            role: role.map(str::to_owned),
        })
    };

    let by_member = upsert_member(
        State(state.clone()),
        auth_as(&store, &bob),
        Path(group_id),
        add_body(carol.id, None),
    )
    .await;
    assert_eq!(by_member.err(), Some(StatusCode::FORBIDDEN));

    let on_direct = upsert_member(
        State(state.clone()),
        auth_as(&store, &alice),
        Path(direct_id),
        add_body(carol.id, None),
    )
    .await;
    assert_eq!(on_direct.err(), Some(StatusCode::BAD_REQUEST));

    let to_owner = upsert_member(
        State(state.clone()),
        auth_as(&store, &alice),
        Path(group_id),
        add_body(carol.id, Some("owner")),
    )
    .await;
    assert_eq!(to_owner.err(), Some(StatusCode::BAD_REQUEST));

    upsert_member(
        State(state.clone()),
        auth_as(&store, &alice),
        Path(group_id),
        add_body(carol.id, None),
    )
    .await
    .expect("owner adds carol");
    upsert_member(
        State(state.clone()),
        auth_as(&store, &alice),
        Path(group_id),
        add_body(bob.id, Some("admin")),
    )
    .await
    .expect("owner promotes bob");

    let members = store.fetch_members(group_id).await.expect("members load");
    let role_of = |id: Uuid| members.iter().find(|m| m.user_id == id).map(|m| m.role);
    assert_eq!(role_of(carol.id), Some(MemberRole::Member));
    assert_eq!(role_of(bob.id), Some(MemberRole::Admin));

    // Demoting or removing the owner is off the table, even for admins.
    let demote_owner = upsert_member(
        State(state.clone()),
        auth_as(&store, &bob),
        Path(group_id),
        add_body(alice.id, Some("member")),
    )
    .await;
    assert_eq!(demote_owner.err(), Some(StatusCode::FORBIDDEN));
    let remove_owner = remove_member(
        State(state.clone()),
        auth_as(&store, &bob),
        Path((group_id, alice.id)),
    )
    .await;
    assert_eq!(remove_owner.err(), Some(StatusCode::FORBIDDEN));

    let by_plain_member = remove_member(
        State(state.clone()),
        auth_as(&store, &carol),
        Path((group_id, bob.id)),
    )
    .await;
    assert_eq!(by_plain_member.err(), Some(StatusCode::FORBIDDEN));

    remove_member(State(state.clone()), auth_as(&store, &carol), Path((group_id, carol.id)))
        .await
        .expect("members can leave");
    remove_member(State(state.clone()), auth_as(&store, &bob), Path((group_id, bob.id)))
        .await
        .expect("admins can leave");

    let members = store.fetch_members(group_id).await.expect("members load");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].user_id, alice.id);

    let on_direct = remove_member(State(state), auth_as(&store, &alice), Path((direct_id, bob.id))).await;
    assert_eq!(on_direct.err(), Some(StatusCode::BAD_REQUEST));
}

#[test]
fn export_lines_start_with_meta_and_parse_back() {
    let room_id = Uuid::new_v4();
    let alice = SessionUser {
        id: Uuid::new_v4(),
        name: "alice".into(),
    };
    let first = delivery::build_message(room_id, 1, &alice, MessageKind::Text, "hi".into(), None, None);
    let second = delivery::build_message(room_id, 2, &alice, MessageKind::File, "notes.pdf".into(), None, None);

    let lines = export_lines(room_id, &[first.clone(), second]).expect("lines serialize");
    assert_eq!(lines.len(), 3);
    assert!(lines.iter().all(|line| line.ends_with('\n')));

    let meta: serde_json::Value = serde_json::from_str(&lines[0]).expect("meta parses");
    assert_eq!(meta["type"], "room_export_meta");
    assert_eq!(meta["version"], 1);
    assert_eq!(meta["message_count"], 2);
    assert_eq!(meta["room_id"].as_str(), Some(room_id.to_string().as_str()));

    let line: serde_json::Value = serde_json::from_str(&lines[1]).expect("message line parses");
    assert_eq!(line["type"], "message");
    assert_eq!(line["seq"], 1);
    assert_eq!(line["content"], "hi");
    assert_eq!(line["id"].as_str(), Some(first.id.to_string().as_str()));
}
