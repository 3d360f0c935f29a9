use super::*;

use std::sync::Arc;

use crate::services::room::{RoomConfig, RoomDirectory};
use crate::services::store::ChatStore;
use crate::state::test_helpers::MemoryStore;

fn change(user_id: Uuid, online: bool) -> ConnectionChange {
    ConnectionChange { user_id, online }
}

const GRACE: Duration = Duration::from_millis(100);

// =============================================================================
// PURE FOLD
// =============================================================================

#[test]
fn online_edge_flips_once() {
    let mut state = PresenceState::new(GRACE);
    let user = Uuid::new_v4();
    let t0 = Instant::now();

    assert_eq!(state.fold_at(change(user, true), t0), Some(PresenceShift::Online(user)));
    assert_eq!(state.fold_at(change(user, true), t0), None, "duplicate edge stays quiet");
    assert_eq!(state.visible_count(), 1);
}

#[test]
fn offline_edge_defers_until_grace_lapses() {
    let mut state = PresenceState::new(GRACE);
    let user = Uuid::new_v4();
    let t0 = Instant::now();
    state.fold_at(change(user, true), t0);

    assert_eq!(state.fold_at(change(user, false), t0), None, "flip must wait out the grace");
    assert!(state.due_at(t0 + GRACE / 2).is_empty());
    assert_eq!(state.due_at(t0 + GRACE), vec![PresenceShift::Offline(user)]);
    assert_eq!(state.visible_count(), 0);
}

#[test]
fn reconnect_inside_grace_cancels_the_flip() {
    let mut state = PresenceState::new(GRACE);
    let user = Uuid::new_v4();
    let t0 = Instant::now();
    state.fold_at(change(user, true), t0);
    state.fold_at(change(user, false), t0 + Duration::from_millis(10));

    // Back before the deadline: no offline, and no fresh online either.
    assert_eq!(state.fold_at(change(user, true), t0 + Duration::from_millis(50)), None);
    assert!(state.due_at(t0 + GRACE * 2).is_empty());
    assert_eq!(state.visible_count(), 1);
}

#[test]
fn offline_for_unknown_user_is_ignored() {
    let mut state = PresenceState::new(GRACE);
    let t0 = Instant::now();
    assert_eq!(state.fold_at(change(Uuid::new_v4(), false), t0), None);
    assert!(state.next_deadline().is_none());
}

#[test]
fn due_harvests_each_lapsed_user_once() {
    let mut state = PresenceState::new(GRACE);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let t0 = Instant::now();
    state.fold_at(change(a, true), t0);
    state.fold_at(change(b, true), t0);
    state.fold_at(change(a, false), t0);
    state.fold_at(change(b, false), t0 + Duration::from_millis(30));

    let first = state.due_at(t0 + GRACE);
    assert_eq!(first, vec![PresenceShift::Offline(a)]);
    assert!(state.due_at(t0 + GRACE).is_empty(), "already harvested");
    assert_eq!(state.due_at(t0 + GRACE + Duration::from_millis(30)), vec![PresenceShift::Offline(b)]);
}

#[test]
fn next_deadline_tracks_earliest_pending() {
    let mut state = PresenceState::new(GRACE);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let t0 = Instant::now();
    state.fold_at(change(a, true), t0);
    state.fold_at(change(b, true), t0);
    state.fold_at(change(b, false), t0 + Duration::from_millis(20));
    state.fold_at(change(a, false), t0);

    assert_eq!(state.next_deadline(), Some(t0 + GRACE));
}

// =============================================================================
// VIEW
// =============================================================================

#[test]
fn view_supports_subset_and_count() {
    let view = PresenceView::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    view.apply(a, true);

    assert!(view.is_online(a));
    assert!(!view.is_online(b));
    assert_eq!(view.online_count(), 1);
    assert_eq!(view.online_subset(&[b, a]), vec![a]);

    view.apply(a, false);
    assert_eq!(view.online_count(), 0);
}

// =============================================================================
// TASK
// =============================================================================

async fn recv_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

fn expect_count(event: &ServerEvent) -> usize {
    match event {
        ServerEvent::OnlineUsersCount { count } => *count,
        other => panic!("expected online_users_count, got {other:?}"),
    }
}

#[tokio::test]
async fn tracker_broadcasts_counts_and_absorbs_reconnects() {
    let (registry, changes) = ConnectionRegistry::new();
    let view = PresenceView::new();
    let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
    let rooms = RoomDirectory::new(store, registry.clone(), view.clone(), RoomConfig::default());
    let _task = spawn_presence_tracker(
        changes,
        view.clone(),
        registry.clone(),
        rooms,
        PresenceConfig {
            grace: Duration::from_millis(40),
        },
    );

    // Observer connection watches the global count stream.
    let observer = Uuid::new_v4();
    let (obs_tx, mut obs_rx) = mpsc::channel(16);
    registry.register(observer, Uuid::new_v4(), obs_tx);
    assert_eq!(expect_count(&recv_event(&mut obs_rx).await), 1);

    let user = Uuid::new_v4();
    let first_conn = Uuid::new_v4();
    let (tx1, _rx1) = mpsc::channel(16);
    registry.register(user, first_conn, tx1);
    assert_eq!(expect_count(&recv_event(&mut obs_rx).await), 2);
    assert!(view.is_online(user));

    // Refresh: drop and come back inside the grace window.
    registry.unregister(first_conn);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second_conn = Uuid::new_v4();
    let (tx2, _rx2) = mpsc::channel(16);
    registry.register(user, second_conn, tx2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(view.is_online(user), "reconnect inside grace must not flap");
    assert!(obs_rx.try_recv().is_err(), "no count churn during the refresh");

    // Real disconnect: offline lands only after the grace window.
    registry.unregister(second_conn);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(view.is_online(user), "still inside grace");
    assert_eq!(expect_count(&recv_event(&mut obs_rx).await), 1);
    assert!(!view.is_online(user));
}
