use super::*;
use chrono::{Duration, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::clock::ManualClock;
use crate::lifecycle::{Action, BookingState, TransitionError};
use crate::limits::MAX_CALENDAR_DAYS;
use crate::policy::{PolicyAdjustment, PolicyError, PolicyScope, WallClock};

// ── Helpers ──────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("wal.snapshot"));
    path
}

/// 2026-03-`d` `h`:`m` UTC. March 2nd 2026 is a Monday.
fn t(d: u32, h: u32, m: u32) -> Ts {
    Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
}

fn open_engine(path: PathBuf, clock: Arc<ManualClock>) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), clock, EngineSettings::default()).unwrap()
}

fn engine_at(name: &str, now: Ts) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now));
    (open_engine(test_wal_path(name), clock.clone()), clock)
}

fn room_with(policy: Option<BookingPolicy>) -> Room {
    Room {
        id: Ulid::new(),
        name: Some("Studio A".into()),
        category_id: None,
        organization_id: None,
        timezone: Tz::UTC,
        capacity: 6,
        hourly_rate_cents: 2000,
        policy,
    }
}

async fn add_room(engine: &Engine, policy: Option<BookingPolicy>) -> Ulid {
    let room = room_with(policy);
    let id = room.id;
    engine.create_room(room).await.unwrap();
    id
}

fn candidate(room_id: Ulid, user_id: Ulid, start: Ts, minutes: i64) -> BookingCandidate {
    BookingCandidate {
        room_id,
        user_id,
        span: Span::new(start, start + Duration::minutes(minutes)),
        notes: None,
    }
}

fn violation(err: EngineError) -> PolicyViolation {
    match err {
        EngineError::Policy(v) => v,
        other => panic!("expected policy violation, got {other:?}"),
    }
}

// ── Registry ─────────────────────────────────────────────

#[tokio::test]
async fn room_registry_checks() {
    let (engine, _) = engine_at("registry.wal", t(2, 8, 30));
    let room = room_with(None);
    engine.create_room(room.clone()).await.unwrap();
    assert!(matches!(engine.create_room(room.clone()).await, Err(EngineError::AlreadyExists(_))));

    let orphan = Room {
        category_id: Some(Ulid::new()),
        ..room_with(None)
    };
    assert!(matches!(engine.create_room(orphan).await, Err(EngineError::NotFound(_))));

    let bad_policy = BookingPolicy {
        min_booking_minutes: 300,
        ..BookingPolicy::default()
    };
    assert!(matches!(
        engine.create_room(room_with(Some(bad_policy))).await,
        Err(EngineError::InvalidPolicy(_))
    ));

    let renamed = Room {
        name: Some("Studio B".into()),
        ..room.clone()
    };
    engine.update_room(renamed).await.unwrap();
    assert_eq!(engine.get_room(room.id).await.unwrap().name.as_deref(), Some("Studio B"));
    assert!(matches!(engine.update_room(room_with(None)).await, Err(EngineError::NotFound(_))));
    assert_eq!(engine.list_rooms().await.len(), 1);
}

#[tokio::test]
async fn category_policy_applies_to_member_rooms() {
    let (engine, _) = engine_at("category.wal", t(2, 8, 30));
    let category = Category {
        id: Ulid::new(),
        name: Some("Rehearsal".into()),
        policy: Some(BookingPolicy {
            max_booking_minutes: 60,
            ..BookingPolicy::default()
        }),
    };
    engine.upsert_category(category.clone()).await.unwrap();
    let room = Room {
        category_id: Some(category.id),
        ..room_with(None)
    };
    let room_id = room.id;
    engine.create_room(room).await.unwrap();

    let policy = engine.effective_policy(room_id, None).await.unwrap();
    assert_eq!(policy.scope, PolicyScope::Category(category.id));
    assert_eq!(policy.policy.max_booking_minutes, 60);

    let err = engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 0), 90))
        .await
        .unwrap_err();
    assert!(matches!(violation(err), PolicyViolation::DurationTooLong { limit: 60, actual: 90 }));
}

// ── Booking creation ─────────────────────────────────────

#[tokio::test]
async fn create_booking_prices_and_gates_confirmation() {
    let (engine, _) = engine_at("create_booking.wal", t(2, 10, 0));
    let room_id = add_room(&engine, None).await;
    let user = Ulid::new();

    let b = engine
        .create_booking(candidate(room_id, user, t(12, 10, 0), 90))
        .await
        .unwrap();
    assert_eq!(b.state, BookingState::Scheduled);
    assert_eq!(b.total_price_cents, 3000);
    assert_eq!(b.confirmation_requested_at, Some(t(9, 10, 0)));
    assert_eq!(b.confirmation_deadline, Some(t(11, 10, 0)));
    assert_eq!(engine.get_booking(b.id).await.unwrap(), b);

    // Two days out is already inside the window: no gating.
    let soon = engine
        .create_booking(candidate(room_id, user, t(4, 10, 0), 60))
        .await
        .unwrap();
    assert_eq!(soon.confirmation_requested_at, None);
    assert_eq!(soon.confirmation_deadline, None);
}

#[tokio::test]
async fn overlap_is_rejected_touching_is_not() {
    let (engine, _) = engine_at("overlap.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;

    let first = engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 0), 60))
        .await
        .unwrap();
    let err = engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 30), 60))
        .await
        .unwrap_err();
    assert_eq!(
        violation(err),
        PolicyViolation::RoomConflict {
            conflicting: vec![first.id]
        }
    );

    engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 11, 0), 60))
        .await
        .unwrap();
    engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 9, 0), 60))
        .await
        .unwrap();

    // A cancelled booking frees its slot.
    engine.transition(first.id, Action::Cancel, None).await.unwrap();
    engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 0), 60))
        .await
        .unwrap();
}

#[tokio::test]
async fn invalid_spans_never_reach_the_validator() {
    let (engine, _) = engine_at("invalid_span.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let inverted = BookingCandidate {
        room_id,
        user_id: Ulid::new(),
        span: Span {
            start: t(3, 11, 0),
            end: t(3, 10, 0),
        },
        notes: None,
    };
    assert!(matches!(
        engine.create_booking(inverted).await,
        Err(EngineError::InvalidSpan { .. })
    ));
    assert!(matches!(
        engine
            .create_booking(candidate(Ulid::new(), Ulid::new(), t(3, 10, 0), 60))
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_on_one_slot_yield_one_booking() {
    let (engine, _) = engine_at("concurrent.wal", t(2, 8, 30));
    let engine = Arc::new(engine);
    let room_id = add_room(&engine, None).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        // Every attempt overlaps 10:00-11:00 somewhere.
        let start = t(3, 9, 30) + Duration::minutes(30 * (i % 2));
        handles.push(tokio::spawn(async move {
            engine.create_booking(candidate(room_id, Ulid::new(), start, 60)).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(violation(e), PolicyViolation::RoomConflict { .. })),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.room_bookings(room_id, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn weekly_quota_counts_live_bookings() {
    let (engine, _) = engine_at("quota.wal", t(2, 8, 30));
    let policy = BookingPolicy {
        max_bookings_per_week: 3,
        ..BookingPolicy::default()
    };
    let room_id = add_room(&engine, Some(policy)).await;
    let user = Ulid::new();

    let mut made = Vec::new();
    for day in [3, 4, 5] {
        made.push(
            engine
                .create_booking(candidate(room_id, user, t(day, 10, 0), 60))
                .await
                .unwrap(),
        );
    }
    let fourth = candidate(room_id, user, t(6, 10, 0), 60);
    let err = engine.create_booking(fourth.clone()).await.unwrap_err();
    assert!(matches!(
        violation(err),
        PolicyViolation::WeeklyQuotaExceeded { limit: 3, existing: 3, .. }
    ));

    // Another user is unaffected, and so is next week.
    engine
        .create_booking(candidate(room_id, Ulid::new(), t(6, 10, 0), 60))
        .await
        .unwrap();
    engine
        .create_booking(candidate(room_id, user, t(10, 10, 0), 60))
        .await
        .unwrap();

    engine.transition(made[0].id, Action::Cancel, None).await.unwrap();
    engine
        .create_booking(candidate(room_id, user, t(6, 12, 0), 60))
        .await
        .unwrap();
}

#[tokio::test]
async fn weekly_quota_spans_rooms() {
    let (engine, _) = engine_at("quota_rooms.wal", t(2, 8, 30));
    let policy = BookingPolicy {
        max_bookings_per_week: 3,
        ..BookingPolicy::default()
    };
    let room_a = add_room(&engine, Some(policy.clone())).await;
    let room_b = add_room(&engine, Some(policy)).await;
    let user = Ulid::new();

    let mut made = Vec::new();
    for day in [3, 4, 5] {
        made.push(
            engine
                .create_booking(candidate(room_a, user, t(day, 10, 0), 60))
                .await
                .unwrap(),
        );
    }
    let fourth = candidate(room_b, user, t(6, 10, 0), 60);
    let err = engine.create_booking(fourth.clone()).await.unwrap_err();
    assert!(matches!(
        violation(err),
        PolicyViolation::WeeklyQuotaExceeded { limit: 3, existing: 3, .. }
    ));
    assert!(matches!(
        engine.validate_booking(&fourth).await,
        Err(EngineError::Policy(PolicyViolation::WeeklyQuotaExceeded { .. }))
    ));

    // Cancelling in room A frees quota for room B.
    engine.transition(made[1].id, Action::Cancel, None).await.unwrap();
    let b = engine.create_booking(fourth).await.unwrap();
    assert!(engine.revalidate_booking(b.id).await.unwrap().is_ok());
}

#[tokio::test]
async fn weekly_quota_across_rooms_survives_restart() {
    let path = test_wal_path("quota_rooms_replay.wal");
    let clock = Arc::new(ManualClock::new(t(2, 8, 30)));
    let policy = BookingPolicy {
        max_bookings_per_week: 1,
        ..BookingPolicy::default()
    };
    let user = Ulid::new();
    let (room_b, cancelled) = {
        let engine = open_engine(path.clone(), clock.clone());
        let room_a = add_room(&engine, Some(policy.clone())).await;
        let room_b = add_room(&engine, Some(policy.clone())).await;
        let room_c = add_room(&engine, Some(policy)).await;
        engine
            .create_booking(candidate(room_a, user, t(3, 10, 0), 60))
            .await
            .unwrap();
        let next_week = engine
            .create_booking(candidate(room_c, user, t(10, 10, 0), 60))
            .await
            .unwrap();
        engine.transition(next_week.id, Action::Cancel, None).await.unwrap();
        (room_b, next_week)
    };

    let engine = open_engine(path, clock);
    let err = engine
        .create_booking(candidate(room_b, user, t(4, 10, 0), 60))
        .await
        .unwrap_err();
    assert!(matches!(violation(err), PolicyViolation::WeeklyQuotaExceeded { .. }));
    // The cancelled booking no longer counts after replay.
    engine
        .create_booking(candidate(room_b, user, cancelled.span.start, 60))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn weekly_quota_holds_under_concurrent_rooms() {
    let (engine, _) = engine_at("quota_race.wal", t(2, 8, 30));
    let engine = Arc::new(engine);
    let policy = BookingPolicy {
        max_bookings_per_week: 1,
        ..BookingPolicy::default()
    };
    let mut rooms = Vec::new();
    for _ in 0..8 {
        rooms.push(add_room(&engine, Some(policy.clone())).await);
    }
    let user = Ulid::new();

    let mut handles = Vec::new();
    for room_id in rooms {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_booking(candidate(room_id, user, t(4, 10, 0), 60)).await
        }));
    }
    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert!(matches!(violation(e), PolicyViolation::WeeklyQuotaExceeded { .. })),
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test]
async fn override_lifts_limit_for_one_user() {
    let (engine, _) = engine_at("override.wal", t(2, 8, 30));
    let policy = BookingPolicy {
        max_advance_booking_days: 7,
        ..BookingPolicy::default()
    };
    let room_id = add_room(&engine, Some(policy)).await;
    let vip = Ulid::new();
    let far = t(20, 10, 0);

    let err = engine
        .create_booking(candidate(room_id, vip, far, 60))
        .await
        .unwrap_err();
    assert!(matches!(violation(err), PolicyViolation::TooFarInAdvance { limit_days: 7, .. }));

    engine
        .grant_override(PolicyOverride {
            scope: PolicyScope::Room(room_id),
            user_id: vip,
            adjustment: PolicyAdjustment::MaxAdvanceBookingDays(30),
            expires_at: None,
        })
        .await
        .unwrap();
    engine
        .create_booking(candidate(room_id, vip, far, 60))
        .await
        .unwrap();

    let other = engine
        .create_booking(candidate(room_id, Ulid::new(), far + Duration::hours(2), 60))
        .await
        .unwrap_err();
    assert!(matches!(violation(other), PolicyViolation::TooFarInAdvance { .. }));

    assert!(engine.revoke_override(PolicyScope::Room(room_id), vip).await.unwrap());
    assert!(!engine.revoke_override(PolicyScope::Room(room_id), vip).await.unwrap());
    let err = engine
        .create_booking(candidate(room_id, vip, far + Duration::hours(4), 60))
        .await
        .unwrap_err();
    assert!(matches!(violation(err), PolicyViolation::TooFarInAdvance { .. }));
}

#[tokio::test]
async fn override_cannot_break_policy_invariants() {
    let (engine, clock) = engine_at("override_invariants.wal", t(2, 8, 30));
    let room_id = add_room(&engine, Some(BookingPolicy::default())).await;
    let vip = Ulid::new();
    let grant = |adjustment| PolicyOverride {
        scope: PolicyScope::Room(room_id),
        user_id: vip,
        adjustment,
        expires_at: None,
    };

    // A 5-day deadline on a 3-day window would make confirmation impossible.
    let err = engine
        .grant_override(grant(PolicyAdjustment::AutoConfirmationDeadlineDays(5)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidPolicy(PolicyError::DeadlineOutsideWindow {
            deadline_days: 5,
            window_days: 3
        })
    ));
    assert!(matches!(
        engine
            .grant_override(grant(PolicyAdjustment::ClosingTime(WallClock::hm(8, 0))))
            .await,
        Err(EngineError::InvalidPolicy(PolicyError::InvertedHours { .. }))
    ));

    // Widening the window first makes the same deadline valid, and the merged
    // pair is what later grants are checked against.
    engine
        .grant_override(grant(PolicyAdjustment::ConfirmationWindowDays(7)))
        .await
        .unwrap();
    engine
        .grant_override(grant(PolicyAdjustment::AutoConfirmationDeadlineDays(5)))
        .await
        .unwrap();
    assert!(matches!(
        engine
            .grant_override(grant(PolicyAdjustment::ConfirmationWindowDays(2)))
            .await,
        Err(EngineError::InvalidPolicy(PolicyError::DeadlineOutsideWindow { .. }))
    ));

    let b = engine
        .create_booking(candidate(room_id, vip, t(12, 10, 0), 60))
        .await
        .unwrap();
    assert_eq!(b.confirmation_requested_at, Some(t(5, 10, 0)));
    assert_eq!(b.confirmation_deadline, Some(t(7, 10, 0)));
    clock.set(t(6, 9, 0));
    engine.transition(b.id, Action::Confirm, None).await.unwrap();

    // A base change that would make an old grant invalid disables that grant.
    engine
        .grant_override(grant(PolicyAdjustment::MinBookingMinutes(120)))
        .await
        .unwrap();
    let eff = engine.effective_policy(room_id, Some(vip)).await.unwrap();
    assert_eq!(eff.policy.min_booking_minutes, 120);
    let mut room = engine.get_room(room_id).await.unwrap();
    room.policy = Some(BookingPolicy {
        max_booking_minutes: 90,
        ..BookingPolicy::default()
    });
    engine.update_room(room).await.unwrap();
    let eff = engine.effective_policy(room_id, Some(vip)).await.unwrap();
    assert_eq!(eff.policy.min_booking_minutes, 30);
    assert!(eff.policy.validate().is_ok());
}

#[tokio::test]
async fn expired_override_is_ignored() {
    let (engine, clock) = engine_at("override_expiry.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let user = Ulid::new();
    engine
        .grant_override(PolicyOverride {
            scope: PolicyScope::System,
            user_id: user,
            adjustment: PolicyAdjustment::MaxBookingMinutes(480),
            expires_at: Some(t(3, 0, 0)),
        })
        .await
        .unwrap();
    assert_eq!(
        engine.effective_policy(room_id, Some(user)).await.unwrap().policy.max_booking_minutes,
        480
    );
    clock.set(t(3, 0, 0));
    assert_eq!(
        engine.effective_policy(room_id, Some(user)).await.unwrap().policy.max_booking_minutes,
        240
    );
}

#[tokio::test]
async fn validate_and_revalidate_do_not_persist() {
    let (engine, _) = engine_at("dry_run.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let user = Ulid::new();
    let c = candidate(room_id, user, t(3, 10, 0), 60);

    let valid = engine.validate_booking(&c).await.unwrap();
    assert_eq!(valid.span, c.span);
    assert_eq!(valid.policy_scope, PolicyScope::System);
    assert!(engine.room_bookings(room_id, None).await.unwrap().is_empty());

    let b = engine.create_booking(c).await.unwrap();
    // Revalidation ignores the booking itself.
    assert!(engine.revalidate_booking(b.id).await.unwrap().is_ok());
    assert!(!engine.is_available(room_id, b.span).await.unwrap());
    assert_eq!(engine.intersects(room_id, b.span).await.unwrap().len(), 1);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn confirmation_window_is_enforced() {
    let now = t(2, 10, 0);
    let (engine, clock) = engine_at("confirm_window.wal", now);
    let room_id = add_room(&engine, None).await;
    let a = engine
        .create_booking(candidate(room_id, Ulid::new(), t(12, 10, 0), 60))
        .await
        .unwrap();
    let b = engine
        .create_booking(candidate(room_id, Ulid::new(), t(12, 12, 0), 60))
        .await
        .unwrap();

    clock.set(now + Duration::days(1));
    let err = engine.transition(a.id, Action::Confirm, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Transition(TransitionError::OutOfWindow { .. })));

    clock.set(now + Duration::days(8));
    let confirmed = engine.transition(a.id, Action::Confirm, None).await.unwrap();
    assert_eq!(confirmed.state, BookingState::Confirmed);
    assert_eq!(confirmed.confirmed_at, Some(now + Duration::days(8)));

    clock.set(now + Duration::days(9) + Duration::hours(12));
    let err = engine.transition(b.id, Action::Confirm, None).await.unwrap_err();
    match err {
        EngineError::Transition(TransitionError::OutOfWindow { deadline, .. }) => {
            assert_eq!(deadline, t(11, 12, 0));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(engine.get_booking(b.id).await.unwrap().state, BookingState::Scheduled);
}

#[tokio::test]
async fn no_show_needs_grace_period() {
    let (engine, clock) = engine_at("no_show.wal", t(2, 10, 0));
    let room_id = add_room(&engine, None).await;
    let b = engine
        .create_booking(candidate(room_id, Ulid::new(), t(2, 12, 0), 60))
        .await
        .unwrap();
    engine.transition(b.id, Action::Confirm, None).await.unwrap();

    clock.set(t(2, 12, 5));
    let err = engine.transition(b.id, Action::MarkNoShow, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transition(TransitionError::InvalidTransition {
            from: BookingState::Confirmed,
            ..
        })
    ));

    clock.set(t(2, 12, 20));
    let marked = engine
        .transition(b.id, Action::MarkNoShow, Some("nobody came".into()))
        .await
        .unwrap();
    assert_eq!(marked.state, BookingState::NoShow);
    assert_eq!(marked.no_show_notes.as_deref(), Some("nobody came"));
}

#[tokio::test]
async fn happy_path_records_history() {
    let (engine, clock) = engine_at("happy_path.wal", t(2, 10, 0));
    let room_id = add_room(&engine, None).await;
    let b = engine
        .create_booking(candidate(room_id, Ulid::new(), t(2, 12, 0), 60))
        .await
        .unwrap();

    engine.transition(b.id, Action::Confirm, None).await.unwrap();
    clock.set(t(2, 11, 55));
    engine
        .transition(
            b.id,
            Action::CheckIn {
                payment_completed: true,
            },
            None,
        )
        .await
        .unwrap();
    clock.set(t(2, 13, 0));
    let done = engine.transition(b.id, Action::Complete, None).await.unwrap();

    assert_eq!(done.state, BookingState::Completed);
    assert!(done.payment_completed);
    assert_eq!(done.check_in_time, Some(t(2, 11, 55)));
    assert_eq!(done.check_out_time, Some(t(2, 13, 0)));
    let path: Vec<_> = done.history.iter().map(|r| r.to).collect();
    assert_eq!(
        path,
        vec![BookingState::Confirmed, BookingState::CheckedIn, BookingState::Completed]
    );

    let err = engine.transition(b.id, Action::Cancel, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Transition(TransitionError::InvalidTransition { .. })));
}

#[tokio::test]
async fn transition_from_is_compare_and_swap() {
    let (engine, _) = engine_at("cas.wal", t(2, 10, 0));
    let room_id = add_room(&engine, None).await;
    let b = engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 12, 0), 60))
        .await
        .unwrap();

    let err = engine
        .transition_from(b.id, BookingState::Confirmed, Action::Cancel, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transition(TransitionError::InvalidTransition {
            from: BookingState::Scheduled,
            attempted: "cancel",
        })
    ));
    assert_eq!(engine.get_booking(b.id).await.unwrap().state, BookingState::Scheduled);

    engine
        .transition_from(b.id, BookingState::Scheduled, Action::Confirm, None)
        .await
        .unwrap();
    assert!(
        engine
            .transition_from(b.id, BookingState::Scheduled, Action::Confirm, None)
            .await
            .is_err()
    );
    assert!(matches!(
        engine.transition(Ulid::new(), Action::Confirm, None).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn refund_eligibility_is_advisory() {
    let (engine, clock) = engine_at("refund.wal", t(2, 10, 0));
    let room_id = add_room(&engine, None).await;
    let b = engine
        .create_booking(candidate(room_id, Ulid::new(), t(4, 10, 0), 60))
        .await
        .unwrap();
    assert!(engine.can_cancel_with_refund(b.id).await.unwrap());

    clock.set(t(3, 10, 0));
    assert!(engine.can_cancel_with_refund(b.id).await.unwrap());
    clock.set(t(3, 10, 30));
    assert!(!engine.can_cancel_with_refund(b.id).await.unwrap());
    // Still cancellable, just without refund.
    engine.transition(b.id, Action::Cancel, Some("plans changed".into())).await.unwrap();
}

// ── Confirmation sweep ───────────────────────────────────

#[tokio::test]
async fn confirmation_requests_are_recorded_once() {
    let now = t(2, 10, 0);
    let (engine, clock) = engine_at("confirm_request.wal", now);
    let room_id = add_room(&engine, None).await;
    let b = engine
        .create_booking(candidate(room_id, Ulid::new(), t(12, 10, 0), 60))
        .await
        .unwrap();

    assert!(engine.due_for_confirmation_request(now).await.is_empty());
    clock.set(t(9, 10, 0));
    let due = engine.due_for_confirmation_request(clock.now()).await;
    assert_eq!(due.iter().map(|b| b.id).collect::<Vec<_>>(), vec![b.id]);

    assert!(engine.record_confirmation_requested(b.id).await.unwrap());
    assert!(!engine.record_confirmation_requested(b.id).await.unwrap());
    assert!(engine.due_for_confirmation_request(clock.now()).await.is_empty());
}

#[tokio::test]
async fn unconfirmed_bookings_are_auto_cancelled() {
    let (engine, clock) = engine_at("auto_cancel.wal", t(2, 10, 0));
    let room_id = add_room(&engine, None).await;
    let lapsed = engine
        .create_booking(candidate(room_id, Ulid::new(), t(12, 10, 0), 60))
        .await
        .unwrap();
    let kept = engine
        .create_booking(candidate(room_id, Ulid::new(), t(12, 14, 0), 60))
        .await
        .unwrap();

    clock.set(t(10, 10, 0));
    engine.transition(kept.id, Action::Confirm, None).await.unwrap();

    clock.set(t(11, 10, 0));
    // The deadline itself is still inside the window.
    assert!(engine.due_for_auto_cancellation(clock.now()).await.is_empty());

    clock.set(t(11, 10, 1));
    let cancelled = engine.auto_cancel_unconfirmed(clock.now()).await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, lapsed.id);
    assert_eq!(cancelled[0].cancellation_reason.as_deref(), Some("no confirmation received"));
    assert!(engine.auto_cancel_unconfirmed(clock.now()).await.unwrap().is_empty());
    assert_eq!(engine.get_booking(kept.id).await.unwrap().state, BookingState::Confirmed);
}

#[tokio::test]
async fn reminders_are_keyed_by_lead_time() {
    let (engine, _) = engine_at("reminders.wal", t(2, 10, 0));
    let room_id = add_room(&engine, None).await;
    let b = engine
        .create_booking(candidate(room_id, Ulid::new(), t(2, 12, 0), 60))
        .await
        .unwrap();
    let now = t(2, 10, 0);
    let day = Duration::hours(24);

    assert_eq!(engine.due_for_reminder(now, day).await.len(), 1);
    assert!(engine.due_for_reminder(now, Duration::hours(1)).await.is_empty());
    assert!(engine.record_reminder_sent(b.id, day).await.unwrap());
    assert!(engine.due_for_reminder(now, day).await.is_empty());
    // A different lead time is a different notification.
    assert_eq!(engine.due_for_reminder(now, Duration::hours(3)).await.len(), 1);

    engine.transition(b.id, Action::Cancel, None).await.unwrap();
    assert!(engine.due_for_reminder(now, Duration::hours(3)).await.is_empty());
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn calendar_marks_viewer_bookings() {
    let (engine, _) = engine_at("calendar.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let viewer = Ulid::new();
    let mine = engine
        .create_booking(candidate(room_id, viewer, t(3, 10, 0), 60))
        .await
        .unwrap();
    let day = t(3, 0, 0).date_naive();

    let cal = engine
        .generate_calendar(room_id, day, day, Some(viewer), t(2, 8, 30))
        .await
        .unwrap();
    let cells = &cal[&0];
    assert_eq!(cells.len(), 26);
    let ten = cells.iter().find(|c| c.span.start == t(3, 10, 0)).unwrap();
    assert_eq!(ten.booking_id, Some(mine.id));
    assert!(ten.is_current_user_booking);
    assert_eq!(ten.invalid_reason, Some(InvalidReason::Booking));

    let stranger = engine
        .generate_calendar(room_id, day, day, Some(Ulid::new()), t(2, 8, 30))
        .await
        .unwrap();
    assert!(!stranger[&0].iter().any(|c| c.is_current_user_booking));

    let too_wide = day + Duration::days(MAX_CALENDAR_DAYS);
    assert!(matches!(
        engine.generate_calendar(room_id, day, too_wide, None, t(2, 8, 30)).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn durations_stop_at_next_booking() {
    let (engine, _) = engine_at("durations.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 14, 0), 120))
        .await
        .unwrap();
    let durations = engine
        .available_durations(room_id, t(3, 13, 0), None, true)
        .await
        .unwrap();
    assert_eq!(durations, vec![30, 60]);
    assert!(
        engine
            .available_durations(room_id, t(3, 14, 30), None, true)
            .await
            .unwrap()
            .is_empty()
    );
}

// ── Recurrence ───────────────────────────────────────────

fn weekly() -> RecurrencePattern {
    RecurrencePattern::every(Frequency::Weekly)
}

#[tokio::test]
async fn expansion_reports_conflicts_without_aborting() {
    let (engine, _) = engine_at("expand.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let user = Ulid::new();
    let seed = engine
        .create_booking(BookingCandidate {
            notes: Some("band practice".into()),
            ..candidate(room_id, user, t(3, 10, 0), 60)
        })
        .await
        .unwrap();
    let blocker = engine
        .create_booking(candidate(room_id, Ulid::new(), t(17, 10, 0), 60))
        .await
        .unwrap();

    let preview = engine
        .preview_recurring_dates(seed.id, &weekly(), Some(4), None)
        .await
        .unwrap();
    assert_eq!(preview.len(), 4);
    assert_eq!(preview[0], seed.span);

    let outcome = engine.expand_recurrence(seed.id, weekly(), Some(4), None).await.unwrap();
    let starts: Vec<_> = outcome.created.iter().map(|b| b.span.start).collect();
    assert_eq!(starts, vec![t(10, 10, 0), t(24, 10, 0)]);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].occurrence.start, t(17, 10, 0));
    assert_eq!(
        outcome.conflicts[0].reason,
        PolicyViolation::RoomConflict {
            conflicting: vec![blocker.id]
        }
    );

    for child in &outcome.created {
        assert_eq!(child.recurring_parent_id, Some(seed.id));
        assert_eq!(child.notes.as_deref(), Some("band practice"));
        assert_eq!(child.total_price_cents, seed.total_price_cents);
        assert_eq!(child.user_id, user);
    }
    let parent = engine.get_booking(seed.id).await.unwrap();
    assert!(parent.is_recurring_parent);
    assert_eq!(parent.recurrence_rule, Some(weekly()));
    assert_eq!(engine.series_members(seed.id).await.unwrap().len(), 2);

    let nested = engine
        .expand_recurrence(outcome.created[0].id, weekly(), Some(4), None)
        .await;
    assert!(matches!(nested, Err(EngineError::NestedSeries(_))));
}

#[tokio::test]
async fn expansion_defaults_to_ten_occurrences() {
    let (engine, _) = engine_at("expand_default.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let seed = engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 0), 60))
        .await
        .unwrap();

    let preview = engine
        .preview_recurring_dates(seed.id, &weekly(), None, None)
        .await
        .unwrap();
    assert_eq!(preview.len(), DEFAULT_OCCURRENCE_LIMIT);
    assert_eq!(preview[9].start, t(3, 10, 0) + Duration::weeks(9));

    let outcome = engine.expand_recurrence(seed.id, weekly(), None, None).await.unwrap();
    assert_eq!(outcome.created.len(), DEFAULT_OCCURRENCE_LIMIT - 1);
    assert!(outcome.conflicts.is_empty());
}

#[tokio::test]
async fn regenerate_replaces_future_instances() {
    let (engine, _) = engine_at("regenerate.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let seed = engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 0), 60))
        .await
        .unwrap();
    let outcome = engine.expand_recurrence(seed.id, weekly(), Some(4), None).await.unwrap();
    assert_eq!(outcome.created.len(), 3);
    let anchor = outcome.created[0].id;

    // Move the series from Tuesdays to Wednesdays from the anchor onward.
    let wednesdays = RecurrencePattern {
        by_weekday: vec![Weekday::Wed],
        ..weekly()
    };
    let regenerated = engine
        .regenerate_series(anchor, Some(wednesdays.clone()), Some(4), None)
        .await
        .unwrap();
    let starts: Vec<_> = regenerated.created.iter().map(|b| b.span.start).collect();
    assert_eq!(starts, vec![t(11, 10, 0), t(18, 10, 0)]);
    assert!(regenerated.conflicts.is_empty());

    let members: Vec<_> = engine
        .series_members(seed.id)
        .await
        .unwrap()
        .iter()
        .map(|b| b.span.start)
        .collect();
    assert_eq!(members, vec![t(11, 10, 0), t(18, 10, 0)]);
    assert!(engine.get_booking(anchor).await.is_none());
    assert!(engine.is_available(room_id, Span::new(t(10, 10, 0), t(10, 11, 0))).await.unwrap());
    assert_eq!(engine.get_booking(seed.id).await.unwrap().recurrence_rule, Some(wednesdays));

    let lone = engine
        .create_booking(candidate(room_id, Ulid::new(), t(5, 10, 0), 60))
        .await
        .unwrap();
    assert!(matches!(
        engine.regenerate_series(lone.id, None, Some(4), None).await,
        Err(EngineError::NotInSeries(_))
    ));
}

#[tokio::test]
async fn cancel_future_caps_the_series() {
    let (engine, _) = engine_at("cancel_future.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let seed = engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 0), 60))
        .await
        .unwrap();
    let outcome = engine.expand_recurrence(seed.id, weekly(), Some(4), None).await.unwrap();
    let [second, third, fourth] = [0, 1, 2].map(|i| outcome.created[i].clone());

    let cancelled = engine.cancel_future(third.id, Some("room closed".into())).await.unwrap();
    let ids: Vec<_> = cancelled.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![third.id, fourth.id]);
    assert!(cancelled.iter().all(|b| b.state == BookingState::Cancelled));

    let parent = engine.get_booking(seed.id).await.unwrap();
    assert_eq!(parent.state, BookingState::Scheduled);
    assert_eq!(parent.recurrence_end_date, Some(third.span.start));
    assert_eq!(engine.get_booking(second.id).await.unwrap().state, BookingState::Scheduled);

    // Regenerating from the start respects the cap.
    let again = engine.regenerate_series(seed.id, None, Some(6), None).await.unwrap();
    let starts: Vec<_> = again.created.iter().map(|b| b.span.start).collect();
    assert_eq!(starts, vec![t(10, 10, 0)]);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let clock = Arc::new(ManualClock::new(t(2, 10, 0)));
    let (room_id, booking_id, user) = {
        let engine = open_engine(path.clone(), clock.clone());
        let room_id = add_room(&engine, None).await;
        let user = Ulid::new();
        let b = engine
            .create_booking(candidate(room_id, user, t(3, 10, 0), 60))
            .await
            .unwrap();
        engine.transition(b.id, Action::Confirm, Some("see you".into())).await.unwrap();
        engine.record_reminder_sent(b.id, Duration::hours(24)).await.unwrap();
        engine
            .grant_override(PolicyOverride {
                scope: PolicyScope::System,
                user_id: user,
                adjustment: PolicyAdjustment::MaxBookingMinutes(480),
                expires_at: None,
            })
            .await
            .unwrap();
        (room_id, b.id, user)
    };

    let engine = open_engine(path, clock);
    let b = engine.get_booking(booking_id).await.unwrap();
    assert_eq!(b.room_id, room_id);
    assert_eq!(b.state, BookingState::Confirmed);
    assert_eq!(b.history.len(), 1);
    assert_eq!(b.history[0].note.as_deref(), Some("see you"));
    assert!(!engine.record_reminder_sent(booking_id, Duration::hours(24)).await.unwrap());
    assert_eq!(
        engine.effective_policy(room_id, Some(user)).await.unwrap().policy.max_booking_minutes,
        480
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let clock = Arc::new(ManualClock::new(t(2, 8, 30)));
    let (seed_id, removed_id) = {
        let engine = open_engine(path.clone(), clock.clone());
        engine
            .upsert_category(Category {
                id: Ulid::new(),
                name: Some("Booths".into()),
                policy: None,
            })
            .await
            .unwrap();
        let room_id = add_room(&engine, None).await;
        let seed = engine
            .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 0), 60))
            .await
            .unwrap();
        let outcome = engine.expand_recurrence(seed.id, weekly(), Some(3), None).await.unwrap();
        let removed = outcome.created[0].id;
        let wednesdays = RecurrencePattern {
            by_weekday: vec![Weekday::Wed],
            ..weekly()
        };
        engine
            .regenerate_series(removed, Some(wednesdays), Some(4), None)
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (seed.id, removed)
    };

    let engine = open_engine(path, clock);
    assert!(engine.get_booking(removed_id).await.is_none());
    let parent = engine.get_booking(seed_id).await.unwrap();
    assert!(parent.is_recurring_parent);
    assert_eq!(engine.series_members(seed_id).await.unwrap().len(), 2);
    assert_eq!(engine.list_rooms().await.len(), 1);
}

#[tokio::test]
async fn events_reach_room_subscribers() {
    let (engine, _) = engine_at("notify.wal", t(2, 8, 30));
    let room_id = add_room(&engine, None).await;
    let mut rx = engine.notify.subscribe(room_id);

    let b = engine
        .create_booking(candidate(room_id, Ulid::new(), t(3, 10, 0), 60))
        .await
        .unwrap();
    engine.transition(b.id, Action::Cancel, None).await.unwrap();

    match rx.recv().await.unwrap() {
        Event::BookingCreated { booking } => assert_eq!(booking.id, b.id),
        other => panic!("unexpected {other:?}"),
    }
    match rx.recv().await.unwrap() {
        Event::BookingTransitioned { id, to, .. } => {
            assert_eq!(id, b.id);
            assert_eq!(to, BookingState::Cancelled);
        }
        other => panic!("unexpected {other:?}"),
    }
}
