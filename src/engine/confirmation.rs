use chrono::Duration;
use tracing::{debug, info};
use ulid::Ulid;

use crate::lifecycle::{Action, BookingState};
use crate::model::*;
use crate::policy::BookingPolicy;

use super::{Engine, EngineError};

pub const AUTO_CANCEL_REASON: &str = "no confirmation received";

/// When a booking's confirmation window opens and closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationSchedule {
    pub requested_at: Ts,
    pub deadline: Ts,
}

/// Gating for a booking created at `now`. `None` means the booking is
/// confirmable right away: either gating is disabled or the start is already
/// inside the window.
pub fn schedule_confirmation(start: Ts, now: Ts, policy: &BookingPolicy) -> Option<ConfirmationSchedule> {
    if policy.confirmation_window_days == 0 {
        return None;
    }
    let window = Duration::days(i64::from(policy.confirmation_window_days));
    if start - now <= window {
        return None;
    }
    Some(ConfirmationSchedule {
        requested_at: start - window,
        deadline: start - Duration::days(i64::from(policy.auto_confirmation_deadline_days)),
    })
}

fn confirmation_key(booking_id: Ulid) -> NotificationKey {
    NotificationKey {
        booking_id,
        kind: NotificationKind::ConfirmationRequest,
        parameter: 0,
    }
}

fn reminder_key(booking_id: Ulid, lead: Duration) -> NotificationKey {
    NotificationKey {
        booking_id,
        kind: NotificationKind::Reminder,
        parameter: lead.num_minutes(),
    }
}

impl Engine {
    /// Clone every booking matching `pred`, in start order per room.
    async fn scan_bookings(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut out = Vec::new();
        for rs in self.room_arcs() {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| pred(b)).cloned());
        }
        out
    }

    /// Scheduled bookings whose confirmation window is open and whose request
    /// has not been recorded yet.
    pub async fn due_for_confirmation_request(&self, now: Ts) -> Vec<Booking> {
        self.scan_bookings(|b| {
            b.state == BookingState::Scheduled
                && matches!((b.confirmation_requested_at, b.confirmation_deadline),
                    (Some(open), Some(deadline)) if open <= now && now < deadline)
                && !self.idx.notifications.contains(&confirmation_key(b.id))
        })
        .await
    }

    /// Scheduled bookings past their confirmation deadline.
    pub async fn due_for_auto_cancellation(&self, now: Ts) -> Vec<Booking> {
        self.scan_bookings(|b| {
            b.state == BookingState::Scheduled && b.confirmation_deadline.is_some_and(|deadline| deadline < now)
        })
        .await
    }

    /// Live bookings starting within `lead` that have no reminder recorded for
    /// this lead time.
    pub async fn due_for_reminder(&self, now: Ts, lead: Duration) -> Vec<Booking> {
        self.scan_bookings(|b| {
            matches!(b.state, BookingState::Scheduled | BookingState::Confirmed)
                && now < b.span.start
                && b.span.start <= now + lead
                && !self.idx.notifications.contains(&reminder_key(b.id, lead))
        })
        .await
    }

    async fn record_notification(&self, key: NotificationKey) -> Result<bool, EngineError> {
        let (_gate, mut rs) = self.lock_booking_room(key.booking_id).await?;
        if self.idx.notifications.contains(&key) {
            return Ok(false);
        }
        let event = Event::NotificationRecorded {
            key,
            room_id: rs.room.id,
            at: self.clock.now(),
        };
        self.persist_and_apply(&mut rs, &event).await?;
        Ok(true)
    }

    /// Mark the confirmation request as sent. False if it already was.
    pub async fn record_confirmation_requested(&self, booking_id: Ulid) -> Result<bool, EngineError> {
        self.record_notification(confirmation_key(booking_id)).await
    }

    /// Mark the reminder for `lead` as sent. False if it already was.
    pub async fn record_reminder_sent(&self, booking_id: Ulid, lead: Duration) -> Result<bool, EngineError> {
        self.record_notification(reminder_key(booking_id, lead)).await
    }

    /// Cancel every Scheduled booking past its deadline. A booking confirmed
    /// between the scan and its cancellation is left alone.
    pub async fn auto_cancel_unconfirmed(&self, now: Ts) -> Result<Vec<Booking>, EngineError> {
        let mut cancelled = Vec::new();
        for booking in self.due_for_auto_cancellation(now).await {
            match self
                .transition_from(
                    booking.id,
                    BookingState::Scheduled,
                    Action::Cancel,
                    Some(AUTO_CANCEL_REASON.to_string()),
                )
                .await
            {
                Ok(b) => {
                    info!(booking = %b.id, room = %b.room_id, "unconfirmed booking auto-cancelled");
                    cancelled.push(b);
                }
                Err(EngineError::Transition(e)) => {
                    debug!(booking = %booking.id, "skipping auto-cancel: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }
}
