use chrono::{Duration, Timelike};
use ulid::Ulid;

use crate::localtime;
use crate::model::*;
use crate::policy::EffectivePolicy;

use super::conflict::intersects;
use super::error::PolicyViolation;

/// Calendar and booking granularity, in minutes of local time.
pub const SLOT_MINUTES: u32 = 30;

/// Everything the validator reads besides the candidate itself.
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    pub room: &'a RoomState,
    pub policy: &'a EffectivePolicy,
    pub now: Ts,
    /// Booking being revalidated; ignored by conflict and quota checks.
    pub exclude: Option<Ulid>,
    /// The user's live bookings in other rooms. Only the weekly quota reads them.
    pub elsewhere: &'a [Span],
}

pub fn is_slot_aligned(room: &Room, t: Ts) -> bool {
    let local = t.with_timezone(&room.timezone);
    local.minute() % SLOT_MINUTES == 0 && local.second() == 0 && local.nanosecond() == 0
}

/// Run the policy checks in order and stop at the first failure.
pub fn validate(candidate: &BookingCandidate, ctx: &ValidationContext<'_>) -> Result<ValidInterval, PolicyViolation> {
    let room = &ctx.room.room;
    let policy = &ctx.policy.policy;
    let span = candidate.span;

    if !is_slot_aligned(room, span.start) {
        return Err(PolicyViolation::MisalignedStart {
            start: span.start,
            granularity_minutes: SLOT_MINUTES,
        });
    }

    let conflicting = intersects(ctx.room, &span, ctx.exclude);
    if !conflicting.is_empty() {
        return Err(PolicyViolation::RoomConflict {
            conflicting: conflicting.iter().map(|b| b.id).collect(),
        });
    }

    let minutes = span.minutes();
    if minutes < i64::from(policy.min_booking_minutes) {
        return Err(PolicyViolation::DurationTooShort {
            limit: policy.min_booking_minutes,
            actual: minutes,
        });
    }
    if minutes > i64::from(policy.max_booking_minutes) {
        return Err(PolicyViolation::DurationTooLong {
            limit: policy.max_booking_minutes,
            actual: minutes,
        });
    }

    let date = localtime::local_date(room.timezone, span.start);
    match localtime::opening_window(room.timezone, date, policy.opening_time, policy.closing_time) {
        Some(window) if span.start < window.start => {
            return Err(PolicyViolation::BeforeOpening {
                opening: policy.opening_time,
                start: span.start,
            });
        }
        Some(window) if span.end > window.end => {
            return Err(PolicyViolation::AfterClosing {
                closing: policy.closing_time,
                end: span.end,
            });
        }
        Some(_) => {}
        None => {
            return Err(PolicyViolation::BeforeOpening {
                opening: policy.opening_time,
                start: span.start,
            });
        }
    }

    if policy.max_advance_booking_days > 0 {
        let latest_start = ctx.now + Duration::days(i64::from(policy.max_advance_booking_days));
        if span.start > latest_start {
            return Err(PolicyViolation::TooFarInAdvance {
                limit_days: policy.max_advance_booking_days,
                latest_start,
            });
        }
    }

    let earliest_start = ctx.now + policy.min_advance();
    if span.start < earliest_start {
        return Err(PolicyViolation::InsufficientNotice {
            limit_minutes: policy.min_advance_booking_minutes,
            earliest_start,
        });
    }

    if policy.max_bookings_per_week > 0 {
        let (week_start, week) = localtime::iso_week(room.timezone, span.start);
        let here = ctx
            .room
            .overlapping(&week)
            .filter(|b| b.is_blocking() && b.user_id == candidate.user_id && Some(b.id) != ctx.exclude)
            .count();
        let there = ctx.elsewhere.iter().filter(|s| s.overlaps(&week)).count();
        let existing = (here + there) as u32;
        if existing >= policy.max_bookings_per_week {
            return Err(PolicyViolation::WeeklyQuotaExceeded {
                limit: policy.max_bookings_per_week,
                existing,
                week_start,
            });
        }
    }

    Ok(ValidInterval {
        room_id: room.id,
        user_id: candidate.user_id,
        span,
        policy_scope: ctx.policy.scope,
        checked_at: ctx.now,
    })
}

/// Advisory: cancelling now still qualifies for a refund. Never gates the
/// cancel transition itself.
pub fn can_cancel_with_refund(booking: &Booking, policy: &EffectivePolicy, now: Ts) -> bool {
    now <= booking.span.start - policy.policy.cancellation_window()
}
