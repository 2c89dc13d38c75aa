use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::lifecycle::{BookingState, TransitionRecord};
use crate::policy::{BookingPolicy, PolicyOverride, PolicyScope};

/// Absolute instant. Bookings are stored and compared in UTC only.
pub type Ts = DateTime<Utc>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ts,
    pub end: Ts,
}

impl Span {
    pub fn new(start: Ts, end: Ts) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: Ts, end: Ts) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn minutes(&self) -> i64 {
        self.duration().num_minutes()
    }

    /// Touching boundaries do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ts) -> bool {
        self.start <= t && t < self.end
    }
}

/// Grouping of rooms sharing a default policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Ulid,
    pub name: Option<String>,
    pub policy: Option<BookingPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: Option<String>,
    pub category_id: Option<Ulid>,
    pub organization_id: Option<Ulid>,
    pub timezone: Tz,
    pub capacity: u32,
    pub hourly_rate_cents: i64,
    /// Own policy; `None` inherits from the category, then the system default.
    pub policy: Option<BookingPolicy>,
}

impl Room {
    /// Price of booking this room for `span`, rounded down to the cent.
    pub fn price_for(&self, span: &Span) -> i64 {
        self.hourly_rate_cents.saturating_mul(span.minutes()) / 60
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
        }
    }
}

/// Repeat rule of a booking series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub frequency: Frequency,
    pub interval: u32,
    /// Total occurrences including the seed.
    pub count: Option<u32>,
    /// Last local date (inclusive) an occurrence may start on.
    pub until: Option<NaiveDate>,
    pub by_weekday: Vec<Weekday>,
    /// 1..=31, or -31..=-1 counting from the end of the month.
    pub by_month_day: Vec<i8>,
}

impl RecurrencePattern {
    pub fn every(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            count: None,
            until: None,
            by_weekday: Vec::new(),
            by_month_day: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub state: BookingState,
    pub notes: Option<String>,
    pub created_at: Ts,
    pub confirmation_requested_at: Option<Ts>,
    pub confirmation_deadline: Option<Ts>,
    pub confirmed_at: Option<Ts>,
    pub cancelled_at: Option<Ts>,
    pub cancellation_reason: Option<String>,
    pub check_in_time: Option<Ts>,
    pub check_out_time: Option<Ts>,
    pub no_show_notes: Option<String>,
    pub payment_completed: bool,
    pub total_price_cents: i64,
    pub is_recurring_parent: bool,
    pub recurring_parent_id: Option<Ulid>,
    pub recurrence_rule: Option<RecurrencePattern>,
    /// Instances starting at or after this instant are not generated.
    pub recurrence_end_date: Option<Ts>,
    pub history: Vec<TransitionRecord>,
}

impl Booking {
    /// Fresh `Scheduled` booking with no confirmation gating.
    pub fn scheduled(id: Ulid, room_id: Ulid, user_id: Ulid, span: Span, created_at: Ts) -> Self {
        Self {
            id,
            room_id,
            user_id,
            span,
            state: BookingState::Scheduled,
            notes: None,
            created_at,
            confirmation_requested_at: None,
            confirmation_deadline: None,
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            check_in_time: None,
            check_out_time: None,
            no_show_notes: None,
            payment_completed: false,
            total_price_cents: 0,
            is_recurring_parent: false,
            recurring_parent_id: None,
            recurrence_rule: None,
            recurrence_end_date: None,
            history: Vec::new(),
        }
    }

    /// Everything except a cancelled booking occupies its room.
    pub fn is_blocking(&self) -> bool {
        self.state != BookingState::Cancelled
    }
}

/// Booking request before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingCandidate {
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub notes: Option<String>,
}

/// Proof that a candidate passed every policy check at `checked_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidInterval {
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub policy_scope: PolicyScope,
    pub checked_at: Ts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidReason {
    Past,
    AdvanceNotice,
    ClosingTime,
    AdjacentBooking,
    Booking,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::Past => "past",
            InvalidReason::AdvanceNotice => "advance_notice",
            InvalidReason::ClosingTime => "closing_time",
            InvalidReason::AdjacentBooking => "adjacent_booking",
            InvalidReason::Booking => "booking",
        }
    }
}

/// One 30-minute slot of a generated calendar. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarCell {
    pub date: NaiveDate,
    /// Local wall-clock start of the slot.
    pub time_slot: NaiveTime,
    pub span: Span,
    pub booking_id: Option<Ulid>,
    pub is_current_user_booking: bool,
    pub invalid: bool,
    pub invalid_reason: Option<InvalidReason>,
}

/// Day index (0 = first requested date) → slots of that day in time order.
pub type Calendar = BTreeMap<u32, Vec<CalendarCell>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    ConfirmationRequest,
    Reminder,
}

/// Idempotency key of an outbound notification. `parameter` distinguishes
/// repeated kinds, e.g. the reminder lead time in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationKey {
    pub booking_id: Ulid,
    pub kind: NotificationKind,
    pub parameter: i64,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// All bookings of the room, cancelled included, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.room.id
    }

    /// Insert keeping sort order by start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (any state) whose span overlaps `query`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything from right_bound on starts at or after query.end.
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// First blocking booking starting at or after `t`. `bookings` must be sorted
/// by start, as `RoomState::bookings` is.
pub fn next_blocking_after(bookings: &[Booking], t: Ts) -> Option<&Booking> {
    let from = bookings.partition_point(|b| b.span.start < t);
    bookings[from..].iter().find(|b| b.is_blocking())
}

/// Persisted domain events, one WAL record each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CategoryUpserted {
        category: Category,
    },
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    OverrideGranted {
        grant: PolicyOverride,
    },
    OverrideRevoked {
        scope: PolicyScope,
        user_id: Ulid,
    },
    /// Full snapshot; compaction re-emits live bookings in this form.
    BookingCreated {
        booking: Booking,
    },
    BookingTransitioned {
        id: Ulid,
        room_id: Ulid,
        from: BookingState,
        to: BookingState,
        at: Ts,
        note: Option<String>,
        payment_completed: Option<bool>,
    },
    /// Only generated series instances that have not started are ever removed.
    BookingRemoved {
        id: Ulid,
        room_id: Ulid,
    },
    SeriesUpdated {
        parent_id: Ulid,
        room_id: Ulid,
        rule: Option<RecurrencePattern>,
        end_date: Option<Ts>,
    },
    NotificationRecorded {
        key: NotificationKey,
        room_id: Ulid,
        at: Ts,
    },
}

impl Event {
    /// Room whose state this event mutates, if any.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => Some(room.id),
            Event::BookingCreated { booking } => Some(booking.room_id),
            Event::BookingTransitioned { room_id, .. }
            | Event::BookingRemoved { room_id, .. }
            | Event::SeriesUpdated { room_id, .. }
            | Event::NotificationRecorded { room_id, .. } => Some(*room_id),
            Event::CategoryUpserted { .. } | Event::OverrideGranted { .. } | Event::OverrideRevoked { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::CategoryUpserted { .. } => "category_upserted",
            Event::RoomCreated { .. } => "room_created",
            Event::RoomUpdated { .. } => "room_updated",
            Event::OverrideGranted { .. } => "override_granted",
            Event::OverrideRevoked { .. } => "override_revoked",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingTransitioned { .. } => "booking_transitioned",
            Event::BookingRemoved { .. } => "booking_removed",
            Event::SeriesUpdated { .. } => "series_updated",
            Event::NotificationRecorded { .. } => "notification_recorded",
        }
    }
}
