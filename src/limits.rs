//! Hard limits enforced by the engine.

pub const MAX_ROOMS: usize = 100_000;
pub const MAX_CATEGORIES: usize = 10_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 1_000_000;
pub const MAX_OVERRIDES_PER_USER: usize = 32;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 4096;

/// Longest single booking.
pub const MAX_BOOKING_SPAN_MINUTES: i64 = 7 * 24 * 60;

/// Widest calendar request, in days.
pub const MAX_CALENDAR_DAYS: i64 = 92;

/// Upper bound on occurrences produced by one recurrence expansion.
pub const MAX_RECURRENCE_OCCURRENCES: usize = 366;
pub const MAX_RECURRENCE_INTERVAL: u32 = 366;
