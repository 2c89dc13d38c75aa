//! Booking state machine.
//!
//! ```text
//! Scheduled ──confirm──▶ Confirmed ──check_in──▶ CheckedIn ──complete──▶ Completed
//!     │                     │  │
//!     └──cancel──▶ Cancelled ◀──┘  └──mark_no_show──▶ NoShow
//! ```
//!
//! `Completed`, `Cancelled` and `NoShow` are terminal. Legality lives in one
//! table ([`next_state`]); the extra time guards (confirmation window, no-show
//! grace) are checked in [`Booking::apply`].

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Booking, Ts};

pub const DEFAULT_NO_SHOW_GRACE_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingState {
    Scheduled,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingState {
    pub const ALL: [BookingState; 6] = [
        BookingState::Scheduled,
        BookingState::Confirmed,
        BookingState::CheckedIn,
        BookingState::Completed,
        BookingState::Cancelled,
        BookingState::NoShow,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Confirmed => "confirmed",
            Self::CheckedIn => "checked_in",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Confirm,
    CheckIn { payment_completed: bool },
    Complete,
    MarkNoShow,
    Cancel,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Confirm => "confirm",
            Action::CheckIn { .. } => "check_in",
            Action::Complete => "complete",
            Action::MarkNoShow => "mark_no_show",
            Action::Cancel => "cancel",
        }
    }

    pub(crate) fn payment_completed(&self) -> Option<bool> {
        match *self {
            Action::CheckIn { payment_completed } => Some(payment_completed),
            Action::Confirm | Action::Complete | Action::MarkNoShow | Action::Cancel => None,
        }
    }
}

/// Transition table keyed by `(current state, action)`. Every live state spells
/// out its rejected actions, so a new action fails to compile until placed.
pub fn next_state(from: BookingState, action: &Action) -> Option<BookingState> {
    use BookingState::*;
    match (from, action) {
        (Scheduled, Action::Confirm) => Some(Confirmed),
        (Scheduled, Action::Cancel) => Some(Cancelled),
        (Confirmed, Action::CheckIn { .. }) => Some(CheckedIn),
        (Confirmed, Action::MarkNoShow) => Some(NoShow),
        (Confirmed, Action::Cancel) => Some(Cancelled),
        (CheckedIn, Action::Complete) => Some(Completed),
        (Scheduled, Action::CheckIn { .. } | Action::Complete | Action::MarkNoShow)
        | (Confirmed, Action::Confirm | Action::Complete)
        | (CheckedIn, Action::Confirm | Action::CheckIn { .. } | Action::MarkNoShow | Action::Cancel)
        | (Completed | Cancelled | NoShow, _) => None,
    }
}

/// One entry of a booking's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: BookingState,
    pub to: BookingState,
    pub at: Ts,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {attempted} a booking that is {from}")]
    InvalidTransition {
        from: BookingState,
        attempted: &'static str,
    },
    #[error("confirmation accepted only between {opens_at} and {deadline}, attempted at {attempted_at}")]
    OutOfWindow {
        opens_at: Ts,
        deadline: Ts,
        attempted_at: Ts,
    },
}

impl Booking {
    /// Target state of `action` at `now`, without changing anything.
    pub fn check_transition(&self, action: &Action, now: Ts, no_show_grace: Duration) -> Result<BookingState, TransitionError> {
        let invalid = || TransitionError::InvalidTransition {
            from: self.state,
            attempted: action.name(),
        };
        let to = next_state(self.state, action).ok_or_else(invalid)?;
        match action {
            Action::Confirm => {
                if let (Some(opens_at), Some(deadline)) = (self.confirmation_requested_at, self.confirmation_deadline)
                    && (now < opens_at || now > deadline)
                {
                    return Err(TransitionError::OutOfWindow {
                        opens_at,
                        deadline,
                        attempted_at: now,
                    });
                }
            }
            Action::MarkNoShow => {
                if !self.can_be_marked_as_no_show(now, no_show_grace) {
                    return Err(invalid());
                }
            }
            Action::CheckIn { .. } | Action::Complete | Action::Cancel => {}
        }
        Ok(to)
    }

    /// Validate and perform `action`. On error the booking is untouched.
    pub fn apply(
        &mut self,
        action: &Action,
        note: Option<String>,
        now: Ts,
        no_show_grace: Duration,
    ) -> Result<TransitionRecord, TransitionError> {
        let to = self.check_transition(action, now, no_show_grace)?;
        Ok(self.enter(to, now, note, action.payment_completed()))
    }

    /// Move to `to` and stamp the matching timestamp fields. Shared by the live
    /// path and log replay; performs no legality check.
    pub fn enter(&mut self, to: BookingState, at: Ts, note: Option<String>, payment_completed: Option<bool>) -> TransitionRecord {
        match to {
            BookingState::Scheduled => {}
            BookingState::Confirmed => self.confirmed_at = Some(at),
            BookingState::CheckedIn => {
                self.check_in_time = Some(at);
                if let Some(paid) = payment_completed {
                    self.payment_completed = paid;
                }
            }
            BookingState::Completed => self.check_out_time = Some(at),
            BookingState::Cancelled => {
                self.cancelled_at = Some(at);
                self.cancellation_reason = note.clone();
            }
            BookingState::NoShow => self.no_show_notes = note.clone(),
        }
        let record = TransitionRecord {
            from: self.state,
            to,
            at,
            note,
        };
        self.state = to;
        self.history.push(record.clone());
        record
    }

    pub fn confirm(&mut self, note: Option<String>, now: Ts) -> Result<TransitionRecord, TransitionError> {
        self.apply(&Action::Confirm, note, now, Duration::zero())
    }

    pub fn check_in(&mut self, note: Option<String>, payment_completed: bool, now: Ts) -> Result<TransitionRecord, TransitionError> {
        self.apply(&Action::CheckIn { payment_completed }, note, now, Duration::zero())
    }

    pub fn complete(&mut self, note: Option<String>, now: Ts) -> Result<TransitionRecord, TransitionError> {
        self.apply(&Action::Complete, note, now, Duration::zero())
    }

    pub fn mark_no_show(&mut self, note: Option<String>, now: Ts, grace: Duration) -> Result<TransitionRecord, TransitionError> {
        self.apply(&Action::MarkNoShow, note, now, grace)
    }

    pub fn cancel(&mut self, reason: Option<String>, now: Ts) -> Result<TransitionRecord, TransitionError> {
        self.apply(&Action::Cancel, reason, now, Duration::zero())
    }

    /// Confirmed, and the grace period after start has fully elapsed.
    pub fn can_be_marked_as_no_show(&self, now: Ts, grace: Duration) -> bool {
        self.state == BookingState::Confirmed && now >= self.span.start + grace
    }
}
