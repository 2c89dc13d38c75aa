use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::lifecycle::TransitionError;
use crate::model::{Span, Ts};
use crate::policy::{PolicyError, WallClock};

/// Why a candidate booking was rejected. Variants appear in the order the
/// validator checks them; the first failing check wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("start {start} is not on a {granularity_minutes}-minute boundary")]
    MisalignedStart { start: Ts, granularity_minutes: u32 },
    #[error("room is already booked ({} conflicting)", .conflicting.len())]
    RoomConflict { conflicting: Vec<Ulid> },
    #[error("booking of {actual} min is shorter than the {limit} min minimum")]
    DurationTooShort { limit: u32, actual: i64 },
    #[error("booking of {actual} min is longer than the {limit} min maximum")]
    DurationTooLong { limit: u32, actual: i64 },
    #[error("booking starts before opening time {opening}")]
    BeforeOpening { opening: WallClock, start: Ts },
    #[error("booking ends after closing time {closing}")]
    AfterClosing { closing: WallClock, end: Ts },
    #[error("booking starts more than {limit_days} days ahead")]
    TooFarInAdvance { limit_days: u32, latest_start: Ts },
    #[error("booking needs {limit_minutes} min notice, earliest start is {earliest_start}")]
    InsufficientNotice { limit_minutes: u32, earliest_start: Ts },
    #[error("weekly limit of {limit} bookings reached for week of {week_start} ({existing} booked)")]
    WeeklyQuotaExceeded {
        limit: u32,
        existing: u32,
        week_start: NaiveDate,
    },
}

impl PolicyViolation {
    /// Stable machine-readable code, also used as a metric label.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PolicyViolation::MisalignedStart { .. } => "misaligned_start",
            PolicyViolation::RoomConflict { .. } => "room_conflict",
            PolicyViolation::DurationTooShort { .. } => "duration_too_short",
            PolicyViolation::DurationTooLong { .. } => "duration_too_long",
            PolicyViolation::BeforeOpening { .. } => "before_opening",
            PolicyViolation::AfterClosing { .. } => "after_closing",
            PolicyViolation::TooFarInAdvance { .. } => "too_far_in_advance",
            PolicyViolation::InsufficientNotice { .. } => "insufficient_notice",
            PolicyViolation::WeeklyQuotaExceeded { .. } => "weekly_quota_exceeded",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("invalid span [{}, {}): {reason}", .span.start, .span.end)]
    InvalidSpan { span: Span, reason: &'static str },
    #[error("invalid policy: {0}")]
    InvalidPolicy(#[from] PolicyError),
    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(String),
    #[error("booking {0} is not part of a series")]
    NotInSeries(Ulid),
    #[error("booking {0} is already a series instance and cannot own one")]
    NestedSeries(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// An occurrence the expander could not materialize. Reported next to the
/// created bookings; never aborts the series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceConflict {
    pub occurrence: Span,
    pub reason: PolicyViolation,
}

#[derive(Debug, Clone, Default)]
pub struct RecurrenceOutcome {
    pub created: Vec<crate::model::Booking>,
    pub conflicts: Vec<RecurrenceConflict>,
}
