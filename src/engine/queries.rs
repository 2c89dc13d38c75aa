use std::time::Instant;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_CALENDAR_DAYS;
use crate::model::*;
use crate::observability;
use crate::policy::EffectivePolicy;

use super::availability;
use super::conflict;
use super::error::PolicyViolation;
use super::validate::{self, ValidationContext};
use super::{Engine, EngineError};

impl Engine {
    // ── Lookups ──────────────────────────────────────────────────

    pub async fn get_room(&self, id: Ulid) -> Option<Room> {
        let rs = self.room_arc(&id)?;
        let guard = rs.read().await;
        Some(guard.room.clone())
    }

    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for rs in self.room_arcs() {
            rooms.push(rs.read().await.room.clone());
        }
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    pub fn get_category(&self, id: Ulid) -> Option<Category> {
        self.categories.get(&id).map(|c| c.value().clone())
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let room_id = self.room_of_booking(&id)?;
        let rs = self.room_arc(&room_id)?;
        let guard = rs.read().await;
        guard.booking(id).cloned()
    }

    /// Bookings of a room in start order, in any state. With a window, only
    /// those overlapping it.
    pub async fn room_bookings(&self, room_id: Ulid, window: Option<Span>) -> Result<Vec<Booking>, EngineError> {
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(match window {
            Some(w) => guard.overlapping(&w).cloned().collect(),
            None => guard.bookings.clone(),
        })
    }

    /// Generated instances of a series parent, in start order.
    pub async fn series_members(&self, parent_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let room_id = self
            .room_of_booking(&parent_id)
            .ok_or(EngineError::NotFound(parent_id))?;
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let mut members: Vec<Booking> = self
            .idx
            .series
            .get(&parent_id)
            .map(|kids| kids.iter().filter_map(|id| guard.booking(*id).cloned()).collect())
            .unwrap_or_default();
        members.sort_by_key(|b| b.span.start);
        Ok(members)
    }

    // ── Policy ───────────────────────────────────────────────────

    pub async fn effective_policy(&self, room_id: Ulid, user_id: Option<Ulid>) -> Result<EffectivePolicy, EngineError> {
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(self.resolve_policy(&guard.room, user_id, self.clock.now()))
    }

    /// Dry run of `create_booking`'s checks. Nothing is persisted and the
    /// answer may be stale by the time the caller acts on it.
    pub async fn validate_booking(&self, candidate: &BookingCandidate) -> Result<ValidInterval, EngineError> {
        conflict::validate_span(&candidate.span)?;
        let rs = self
            .room_arc(&candidate.room_id)
            .ok_or(EngineError::NotFound(candidate.room_id))?;
        let guard = rs.read().await;
        let now = self.clock.now();
        let policy = self.resolve_policy(&guard.room, Some(candidate.user_id), now);
        let elsewhere = self.user_spans_elsewhere(candidate.user_id, candidate.room_id);
        let ctx = ValidationContext {
            room: &guard,
            policy: &policy,
            now,
            exclude: None,
            elsewhere: &elsewhere,
        };
        Ok(validate::validate(candidate, &ctx)?)
    }

    /// Re-run the validator for a stored booking as if it were new, ignoring
    /// the booking itself in conflict and quota checks.
    pub async fn revalidate_booking(&self, id: Ulid) -> Result<Result<ValidInterval, PolicyViolation>, EngineError> {
        let room_id = self.room_of_booking(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let candidate = BookingCandidate {
            room_id,
            user_id: booking.user_id,
            span: booking.span,
            notes: booking.notes.clone(),
        };
        let now = self.clock.now();
        let policy = self.resolve_policy(&guard.room, Some(booking.user_id), now);
        let elsewhere = self.user_spans_elsewhere(booking.user_id, room_id);
        let ctx = ValidationContext {
            room: &guard,
            policy: &policy,
            now,
            exclude: Some(id),
            elsewhere: &elsewhere,
        };
        Ok(validate::validate(&candidate, &ctx))
    }

    pub async fn can_cancel_with_refund(&self, booking_id: Ulid) -> Result<bool, EngineError> {
        let room_id = self
            .room_of_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let booking = guard.booking(booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let now = self.clock.now();
        let policy = self.resolve_policy(&guard.room, Some(booking.user_id), now);
        Ok(validate::can_cancel_with_refund(booking, &policy, now))
    }

    // ── Conflicts ────────────────────────────────────────────────

    /// Non-cancelled bookings overlapping `span`.
    pub async fn intersects(&self, room_id: Ulid, span: Span) -> Result<Vec<Booking>, EngineError> {
        conflict::validate_span(&span)?;
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(conflict::intersects(&guard, &span, None).into_iter().cloned().collect())
    }

    pub async fn is_available(&self, room_id: Ulid, span: Span) -> Result<bool, EngineError> {
        conflict::validate_span(&span)?;
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(conflict::is_available(&guard, &span, None))
    }

    // ── Availability ─────────────────────────────────────────────

    /// Slot grid for `from..=to` as seen by `viewer` at `now`.
    pub async fn generate_calendar(
        &self,
        room_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        viewer: Option<Ulid>,
        now: Ts,
    ) -> Result<Calendar, EngineError> {
        if (to - from).num_days() >= MAX_CALENDAR_DAYS {
            return Err(EngineError::LimitExceeded("calendar range too wide"));
        }
        let started = Instant::now();
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let policy = self.resolve_policy(&guard.room, viewer, now);
        let calendar = availability::generate_calendar(&guard.room, &policy.policy, &guard.bookings, from, to, viewer, now);
        metrics::histogram!(observability::CALENDAR_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(calendar)
    }

    /// Bookable durations in minutes for a booking starting at `start`.
    pub async fn available_durations(
        &self,
        room_id: Ulid,
        start: Ts,
        user_id: Option<Ulid>,
        half_hour_steps: bool,
    ) -> Result<Vec<u32>, EngineError> {
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let policy = self.resolve_policy(&guard.room, user_id, self.clock.now());
        Ok(availability::available_durations(
            &guard.room,
            &policy.policy,
            &guard.bookings,
            start,
            half_hour_steps,
        ))
    }
}
