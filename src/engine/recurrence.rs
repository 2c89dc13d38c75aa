//! Recurrence expansion on top of the `rrule` crate.
//!
//! A pattern is rendered as an RFC 5545 RRULE anchored at the seed's local
//! start (`DTSTART;TZID=<room tz>`), so occurrences keep their wall-clock time
//! across DST changes. `until` and `max_date` are applied after expansion, by
//! local start date, instead of being injected as `UNTIL`.

use chrono::{NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::limits::{MAX_RECURRENCE_INTERVAL, MAX_RECURRENCE_OCCURRENCES};
use crate::localtime;
use crate::model::*;

use super::EngineError;

pub const DEFAULT_OCCURRENCE_LIMIT: usize = 10;

fn ical_weekday(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}

impl RecurrencePattern {
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidRecurrence(msg.to_string()));
        if self.interval == 0 || self.interval > MAX_RECURRENCE_INTERVAL {
            return invalid("interval out of range");
        }
        if self.count == Some(0) {
            return invalid("count must be at least 1");
        }
        if self.by_month_day.iter().any(|d| *d == 0 || !(-31..=31).contains(d)) {
            return invalid("month day must be within 1..=31 or -31..=-1");
        }
        if self.frequency == Frequency::Weekly && !self.by_month_day.is_empty() {
            return invalid("month days cannot constrain a weekly rule");
        }
        Ok(())
    }

    /// RRULE body without `DTSTART`, e.g. `FREQ=WEEKLY;INTERVAL=1;BYDAY=MO,WE`.
    pub fn to_rrule(&self) -> String {
        let mut rule = format!("FREQ={};INTERVAL={}", self.frequency.as_str(), self.interval);
        if let Some(count) = self.count {
            rule.push_str(&format!(";COUNT={count}"));
        }
        if !self.by_weekday.is_empty() {
            let days: Vec<_> = self.by_weekday.iter().map(|d| ical_weekday(*d)).collect();
            rule.push_str(&format!(";BYDAY={}", days.join(",")));
        }
        if !self.by_month_day.is_empty() {
            let days: Vec<_> = self.by_month_day.iter().map(i8::to_string).collect();
            rule.push_str(&format!(";BYMONTHDAY={}", days.join(",")));
        }
        rule
    }
}

/// Ordered occurrences of `pattern` starting with `seed`, each as long as the
/// seed. At most `limit` entries (seed included), none starting after
/// `pattern.until` or `max_date` in the room's local calendar.
pub fn expand_occurrences(
    seed: Span,
    tz: Tz,
    pattern: &RecurrencePattern,
    limit: usize,
    max_date: Option<NaiveDate>,
) -> Result<Vec<Span>, EngineError> {
    pattern.validate()?;
    let limit = limit.min(MAX_RECURRENCE_OCCURRENCES);
    if limit == 0 {
        return Ok(Vec::new());
    }
    let limit = pattern.count.map_or(limit, |c| limit.min(c as usize));

    let dtstart = seed.start.with_timezone(&tz).naive_local().format("%Y%m%dT%H%M%S");
    let text = format!("DTSTART;TZID={}:{}\nRRULE:{}", tz.name(), dtstart, pattern.to_rrule());
    let set: RRuleSet = text
        .parse()
        .map_err(|e| EngineError::InvalidRecurrence(format!("{e}")))?;

    // One extra in case the seed itself is among the results.
    let fetch = u16::try_from(limit + 1).unwrap_or(u16::MAX);
    let last_date = match (pattern.until, max_date) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let duration = seed.duration();

    let mut occurrences = vec![seed];
    occurrences.extend(
        set.all(fetch)
            .dates
            .into_iter()
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|start| *start != seed.start)
            .filter(|start| last_date.is_none_or(|last| localtime::local_date(tz, *start) <= last))
            .map(|start| Span::new(start, start + duration)),
    );
    occurrences.truncate(limit);
    Ok(occurrences)
}
