use chrono::{Duration, NaiveDate};
use ulid::Ulid;

use crate::localtime;
use crate::model::*;
use crate::policy::BookingPolicy;

use super::validate::SLOT_MINUTES;

// ── Calendar grid ─────────────────────────────────────────────────

fn slot() -> Duration {
    Duration::minutes(i64::from(SLOT_MINUTES))
}

/// Blocking bookings in a start-sorted slice that overlap `query`.
fn blocking_in<'a>(bookings: &'a [Booking], query: Span) -> impl Iterator<Item = &'a Booking> {
    let right_bound = bookings.partition_point(|b| b.span.start < query.end);
    bookings[..right_bound]
        .iter()
        .filter(move |b| b.is_blocking() && b.span.end > query.start)
}

/// Slot grid for every local date in `from..=to`.
///
/// For each day the room is open, one cell per 30-minute step from opening
/// time while the slot still ends by closing time. Each cell gets at most one
/// invalid reason, checked in order: past, same-day advance notice, too close
/// to closing for the minimum duration, occupied by a booking, inside the
/// minimum-duration lead-up to a booking. A cell covered by a booking keeps
/// its `booking_id` whatever the reason.
///
/// `bookings` must be sorted by start. Pure in all its inputs.
pub fn generate_calendar(
    room: &Room,
    policy: &BookingPolicy,
    bookings: &[Booking],
    from: NaiveDate,
    to: NaiveDate,
    viewer: Option<Ulid>,
    now: Ts,
) -> Calendar {
    let tz = room.timezone;
    let min_duration = policy.min_duration();
    let today = localtime::local_date(tz, now);
    let earliest_today = now + policy.min_advance();

    let mut calendar = Calendar::new();
    for (index, date) in from.iter_days().take_while(|d| *d <= to).enumerate() {
        let mut cells = Vec::new();
        if let Some(window) = localtime::opening_window(tz, date, policy.opening_time, policy.closing_time) {
            let lookahead = Span::new(window.start, window.end + min_duration.max(slot()));
            let day_bookings: Vec<&Booking> = blocking_in(bookings, lookahead).collect();

            let mut start = window.start;
            while start + slot() <= window.end {
                let span = Span::new(start, start + slot());
                let occupant = day_bookings.iter().find(|b| b.span.overlaps(&span));
                let lead_up = || {
                    day_bookings
                        .iter()
                        .any(|b| start < b.span.start && b.span.start < start + min_duration)
                };

                let reason = if start < now {
                    Some(InvalidReason::Past)
                } else if date == today && start < earliest_today {
                    Some(InvalidReason::AdvanceNotice)
                } else if window.end - start < min_duration {
                    Some(InvalidReason::ClosingTime)
                } else if occupant.is_some() {
                    Some(InvalidReason::Booking)
                } else if lead_up() {
                    Some(InvalidReason::AdjacentBooking)
                } else {
                    None
                };

                cells.push(CalendarCell {
                    date,
                    time_slot: start.with_timezone(&tz).time(),
                    span,
                    booking_id: occupant.map(|b| b.id),
                    is_current_user_booking: occupant.is_some_and(|b| Some(b.user_id) == viewer),
                    invalid: reason.is_some(),
                    invalid_reason: reason,
                });
                start += slot();
            }
        }
        calendar.insert(index as u32, cells);
    }
    calendar
}

// ── Offered durations ─────────────────────────────────────────────

/// Durations in minutes bookable from `start`: from the policy minimum up to
/// the lesser of the maximum and the gap before the next booking (or closing).
/// Steps are 30 minutes with `half_hour_steps`, else `max(60, minimum)`.
///
/// `bookings` must be sorted by start.
pub fn available_durations(
    room: &Room,
    policy: &BookingPolicy,
    bookings: &[Booking],
    start: Ts,
    half_hour_steps: bool,
) -> Vec<u32> {
    let tz = room.timezone;
    let date = localtime::local_date(tz, start);
    let Some(window) = localtime::opening_window(tz, date, policy.opening_time, policy.closing_time) else {
        return Vec::new();
    };
    if !window.contains_instant(start) {
        return Vec::new();
    }
    if bookings.iter().any(|b| b.is_blocking() && b.span.contains_instant(start)) {
        return Vec::new();
    }

    let limit = next_blocking_after(bookings, start).map_or(window.end, |b| b.span.start.min(window.end));
    let gap = (limit - start).num_minutes().max(0);
    let ceiling = gap.min(i64::from(policy.max_booking_minutes));

    let step = if half_hour_steps {
        i64::from(SLOT_MINUTES)
    } else {
        i64::from(policy.min_booking_minutes).max(60)
    };
    let first = match policy.min_booking_minutes {
        0 => step,
        min => i64::from(min),
    };

    let mut out = Vec::new();
    let mut d = first;
    while d <= ceiling {
        out.push(d as u32);
        d += step;
    }
    out
}
