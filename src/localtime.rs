//! Conversions between a room's local wall clock and UTC instants.
//!
//! Nonexistent local times (spring-forward gap) shift forward by one hour;
//! ambiguous local times (fall-back overlap) resolve to the earlier instant.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::model::{Span, Ts};
use crate::policy::WallClock;

pub fn local_instant(tz: Tz, local: NaiveDateTime) -> Ts {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|| local.and_utc())
}

/// Instant at which `wall` occurs on `date` in `tz`. `24:00` maps to the next midnight.
pub fn at_wall_clock(tz: Tz, date: NaiveDate, wall: WallClock) -> Ts {
    let local = date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(wall.minutes()));
    local_instant(tz, local)
}

pub fn local_date(tz: Tz, instant: Ts) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// `[opening, closing)` of `date` in `tz`, or `None` when the room does not open that day.
pub fn opening_window(tz: Tz, date: NaiveDate, opening: WallClock, closing: WallClock) -> Option<Span> {
    let open = at_wall_clock(tz, date, opening);
    let close = at_wall_clock(tz, date, closing);
    (open < close).then(|| Span::new(open, close))
}

/// The ISO week (Monday 00:00 to next Monday 00:00, local) containing `instant`.
pub fn iso_week(tz: Tz, instant: Ts) -> (NaiveDate, Span) {
    let date = local_date(tz, instant);
    let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
    let start = local_instant(tz, monday.and_time(NaiveTime::MIN));
    let end = local_instant(tz, (monday + Duration::days(7)).and_time(NaiveTime::MIN));
    (monday, Span::new(start, end))
}
