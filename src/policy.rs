use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Category, Room, Ts};

/// Local wall-clock time as minutes since midnight, `00:00..=24:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallClock(u16);

impl WallClock {
    pub const MIDNIGHT: WallClock = WallClock(0);
    pub const END_OF_DAY: WallClock = WallClock(24 * 60);

    /// Saturates at `24:00`.
    pub fn hm(hour: u32, minute: u32) -> Self {
        let total = hour.saturating_mul(60).saturating_add(minute).min(24 * 60);
        WallClock(total as u16)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for WallClock {
    type Err = PolicyError;

    /// Accepts `HH:MM` and `HH:MM:SS` (seconds must be zero).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PolicyError::InvalidWallClock(s.to_string());
        let mut parts = s.trim().split(':');
        let hour: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let minute: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        if let Some(sec) = parts.next()
            && sec.parse::<u32>().ok() != Some(0)
        {
            return Err(bad());
        }
        if parts.next().is_some() || minute > 59 || hour > 24 || (hour == 24 && minute != 0) {
            return Err(bad());
        }
        Ok(WallClock::hm(hour, minute))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("invalid wall-clock time {0:?}, expected HH:MM")]
    InvalidWallClock(String),
    #[error("opening time {opening} is not before closing time {closing}")]
    InvertedHours { opening: WallClock, closing: WallClock },
    #[error("minimum booking duration {min} min exceeds maximum {max} min")]
    InvertedDurations { min: u32, max: u32 },
    #[error("confirmation deadline ({deadline_days} days) exceeds confirmation window ({window_days} days)")]
    DeadlineOutsideWindow { deadline_days: u32, window_days: u32 },
}

/// Constraints governing valid bookings of a room. Immutable value: overrides
/// produce a new policy rather than mutating a shared one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPolicy {
    pub opening_time: WallClock,
    pub closing_time: WallClock,
    pub min_booking_minutes: u32,
    pub max_booking_minutes: u32,
    /// 0 = unlimited.
    pub max_advance_booking_days: u32,
    pub min_advance_booking_minutes: u32,
    /// Refund cut-off before start.
    pub cancellation_minutes: u32,
    /// 0 = unlimited.
    pub max_bookings_per_week: u32,
    /// Days before start when confirmation is requested. 0 disables confirmation gating.
    pub confirmation_window_days: u32,
    /// Days before start when an unconfirmed booking is auto-cancelled.
    pub auto_confirmation_deadline_days: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            opening_time: WallClock::hm(9, 0),
            closing_time: WallClock::hm(22, 0),
            min_booking_minutes: 30,
            max_booking_minutes: 240,
            max_advance_booking_days: 90,
            min_advance_booking_minutes: 60,
            cancellation_minutes: 24 * 60,
            max_bookings_per_week: 0,
            confirmation_window_days: 3,
            auto_confirmation_deadline_days: 1,
        }
    }
}

impl BookingPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.opening_time >= self.closing_time {
            return Err(PolicyError::InvertedHours {
                opening: self.opening_time,
                closing: self.closing_time,
            });
        }
        if self.min_booking_minutes > self.max_booking_minutes {
            return Err(PolicyError::InvertedDurations {
                min: self.min_booking_minutes,
                max: self.max_booking_minutes,
            });
        }
        if self.auto_confirmation_deadline_days > self.confirmation_window_days {
            return Err(PolicyError::DeadlineOutsideWindow {
                deadline_days: self.auto_confirmation_deadline_days,
                window_days: self.confirmation_window_days,
            });
        }
        Ok(())
    }

    pub fn min_duration(&self) -> Duration {
        Duration::minutes(i64::from(self.min_booking_minutes))
    }

    pub fn max_duration(&self) -> Duration {
        Duration::minutes(i64::from(self.max_booking_minutes))
    }

    pub fn min_advance(&self) -> Duration {
        Duration::minutes(i64::from(self.min_advance_booking_minutes))
    }

    pub fn cancellation_window(&self) -> Duration {
        Duration::minutes(i64::from(self.cancellation_minutes))
    }

    /// Copy of this policy with one field replaced.
    pub fn adjusted(&self, adjustment: &PolicyAdjustment) -> Self {
        let mut p = self.clone();
        match *adjustment {
            PolicyAdjustment::OpeningTime(v) => p.opening_time = v,
            PolicyAdjustment::ClosingTime(v) => p.closing_time = v,
            PolicyAdjustment::MinBookingMinutes(v) => p.min_booking_minutes = v,
            PolicyAdjustment::MaxBookingMinutes(v) => p.max_booking_minutes = v,
            PolicyAdjustment::MaxAdvanceBookingDays(v) => p.max_advance_booking_days = v,
            PolicyAdjustment::MinAdvanceBookingMinutes(v) => p.min_advance_booking_minutes = v,
            PolicyAdjustment::CancellationMinutes(v) => p.cancellation_minutes = v,
            PolicyAdjustment::MaxBookingsPerWeek(v) => p.max_bookings_per_week = v,
            PolicyAdjustment::ConfirmationWindowDays(v) => p.confirmation_window_days = v,
            PolicyAdjustment::AutoConfirmationDeadlineDays(v) => p.auto_confirmation_deadline_days = v,
        }
        p
    }
}

/// Identity of the policy a room resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PolicyScope {
    Room(Ulid),
    Category(Ulid),
    System,
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyScope::Room(id) => write!(f, "room:{id}"),
            PolicyScope::Category(id) => write!(f, "category:{id}"),
            PolicyScope::System => f.write_str("system"),
        }
    }
}

/// Replacement value for exactly one policy field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAdjustment {
    OpeningTime(WallClock),
    ClosingTime(WallClock),
    MinBookingMinutes(u32),
    MaxBookingMinutes(u32),
    MaxAdvanceBookingDays(u32),
    MinAdvanceBookingMinutes(u32),
    CancellationMinutes(u32),
    MaxBookingsPerWeek(u32),
    ConfirmationWindowDays(u32),
    AutoConfirmationDeadlineDays(u32),
}

impl PolicyAdjustment {
    pub fn same_field(&self, other: &PolicyAdjustment) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Per-user exception to a policy (VIP arrangements and the like).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub scope: PolicyScope,
    pub user_id: Ulid,
    pub adjustment: PolicyAdjustment,
    pub expires_at: Option<Ts>,
}

impl PolicyOverride {
    pub fn is_active(&self, now: Ts) -> bool {
        self.expires_at.is_none_or(|expiry| now < expiry)
    }
}

/// The one flat policy downstream components work with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub scope: PolicyScope,
    pub policy: BookingPolicy,
}

impl EffectivePolicy {
    /// Room override, then category default, then system default.
    pub fn resolve(room: &Room, category: Option<&Category>, system: &BookingPolicy) -> Self {
        if let Some(policy) = &room.policy {
            return Self {
                scope: PolicyScope::Room(room.id),
                policy: policy.clone(),
            };
        }
        if let Some(category) = category
            && let Some(policy) = &category.policy
        {
            return Self {
                scope: PolicyScope::Category(category.id),
                policy: policy.clone(),
            };
        }
        Self {
            scope: PolicyScope::System,
            policy: system.clone(),
        }
    }

    /// Apply the user's active overrides registered against this policy's scope.
    /// When the full merge breaks an invariant (the base policy changed after
    /// the grants), adjustments are applied one at a time and any that would
    /// leave the policy invalid is skipped.
    pub fn with_overrides<'a>(
        mut self,
        overrides: impl IntoIterator<Item = &'a PolicyOverride>,
        user_id: Ulid,
        now: Ts,
    ) -> Self {
        let applicable: Vec<&PolicyAdjustment> = overrides
            .into_iter()
            .filter(|o| o.scope == self.scope && o.user_id == user_id && o.is_active(now))
            .map(|o| &o.adjustment)
            .collect();
        let merged = applicable.iter().fold(self.policy.clone(), |p, a| p.adjusted(a));
        if merged.validate().is_ok() {
            self.policy = merged;
            return self;
        }
        for a in applicable {
            let adjusted = self.policy.adjusted(a);
            if adjusted.validate().is_ok() {
                self.policy = adjusted;
            }
        }
        self
    }
}
