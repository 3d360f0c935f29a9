use super::*;

#[test]
fn first_start_announces_then_refreshes_stay_quiet() {
    let mut typing = TypingSet::new();
    let user = Uuid::new_v4();
    let t0 = Instant::now();

    assert!(typing.start_at(user, t0), "first start must announce");
    // A burst of keystroke-driven starts inside the window.
    for i in 1..=10 {
        let now = t0 + Duration::from_millis(i * 150);
        assert!(!typing.start_at(user, now), "refresh {i} must not re-announce");
    }
    assert!(typing.is_typing(user));
}

#[test]
fn refresh_pushes_the_deadline_forward() {
    let mut typing = TypingSet::new();
    let user = Uuid::new_v4();
    let t0 = Instant::now();
    typing.start_at(user, t0);

    let t1 = t0 + Duration::from_millis(1_500);
    typing.start_at(user, t1);

    // Old deadline has passed but the refresh moved it.
    assert!(typing.expire_due(t0 + TYPING_EXPIRY).is_empty());
    let due = typing.expire_due(t1 + TYPING_EXPIRY);
    assert_eq!(due, vec![user]);
    assert!(typing.is_empty());
}

#[test]
fn explicit_stop_announces_once() {
    let mut typing = TypingSet::new();
    let user = Uuid::new_v4();
    let t0 = Instant::now();

    typing.start_at(user, t0);
    assert!(typing.stop_at(user, t0 + Duration::from_millis(100)));
    assert!(!typing.stop_at(user, t0 + Duration::from_millis(200)), "double stop is silent");
}

#[test]
fn stop_without_start_is_silent() {
    let mut typing = TypingSet::new();
    assert!(!typing.stop_at(Uuid::new_v4(), Instant::now()));
}

#[test]
fn start_after_stop_announces_again() {
    let mut typing = TypingSet::new();
    let user = Uuid::new_v4();
    let t0 = Instant::now();

    typing.start_at(user, t0);
    typing.stop_at(user, t0 + Duration::from_millis(300));
    assert!(typing.start_at(user, t0 + Duration::from_millis(400)));
}

#[test]
fn expiry_collects_only_due_users() {
    let mut typing = TypingSet::new();
    let early = Uuid::new_v4();
    let late = Uuid::new_v4();
    let t0 = Instant::now();

    typing.start_at(early, t0);
    typing.start_at(late, t0 + Duration::from_millis(900));

    let due = typing.expire_due(t0 + TYPING_EXPIRY);
    assert_eq!(due, vec![early]);
    assert!(typing.is_typing(late));
    assert_eq!(typing.next_deadline(), Some(t0 + Duration::from_millis(900) + TYPING_EXPIRY));
}

#[test]
fn next_deadline_is_none_when_idle() {
    let typing = TypingSet::new();
    assert!(typing.next_deadline().is_none());
}

#[test]
fn forget_drops_without_state_for_announcement() {
    let mut typing = TypingSet::new();
    let user = Uuid::new_v4();
    typing.start_at(user, Instant::now());
    assert!(typing.forget(user));
    assert!(!typing.forget(user));
    assert!(typing.is_empty());
}
