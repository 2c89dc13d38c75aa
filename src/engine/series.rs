//! Recurring series: expansion into child bookings, "this and future"
//! regeneration, and "future only" cancellation.
//!
//! A series is one parent booking plus the instances generated from its rule.
//! Instances never own instances. Each occurrence is validated and written
//! under its own room lock acquisition, so a long series never holds the room
//! for the whole batch.

use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::lifecycle::{Action, BookingState, TransitionError};
use crate::limits::MAX_BOOKINGS_PER_ROOM;
use crate::model::*;
use crate::observability;

use super::confirmation::schedule_confirmation;
use super::error::{RecurrenceConflict, RecurrenceOutcome};
use super::recurrence::{DEFAULT_OCCURRENCE_LIMIT, expand_occurrences};
use super::validate::{ValidationContext, validate};
use super::{Engine, EngineError};

impl Engine {
    /// Occurrences `expand_recurrence` would try, seed first. Nothing is
    /// validated or persisted. `limit` counts the seed and defaults to
    /// `DEFAULT_OCCURRENCE_LIMIT`.
    pub async fn preview_recurring_dates(
        &self,
        seed_id: Ulid,
        pattern: &RecurrencePattern,
        limit: Option<usize>,
        max_date: Option<NaiveDate>,
    ) -> Result<Vec<Span>, EngineError> {
        let room_id = self.room_of_booking(&seed_id).ok_or(EngineError::NotFound(seed_id))?;
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let seed = guard.booking(seed_id).ok_or(EngineError::NotFound(seed_id))?;
        let limit = limit.unwrap_or(DEFAULT_OCCURRENCE_LIMIT);
        expand_occurrences(seed.span, guard.room.timezone, pattern, limit, max_date)
    }

    /// Turn `seed_id` into a series parent and materialize its occurrences.
    /// Occurrences failing validation are reported, not fatal.
    pub async fn expand_recurrence(
        &self,
        seed_id: Ulid,
        pattern: RecurrencePattern,
        limit: Option<usize>,
        max_date: Option<NaiveDate>,
    ) -> Result<RecurrenceOutcome, EngineError> {
        pattern.validate()?;
        let (parent, occurrences) = {
            let (_gate, mut rs) = self.lock_booking_room(seed_id).await?;
            let seed = rs.booking(seed_id).ok_or(EngineError::NotFound(seed_id))?;
            if seed.recurring_parent_id.is_some() {
                return Err(EngineError::NestedSeries(seed_id));
            }
            if seed.state.is_terminal() {
                return Err(TransitionError::InvalidTransition {
                    from: seed.state,
                    attempted: "expand_recurrence",
                }
                .into());
            }
            let limit = limit.unwrap_or(DEFAULT_OCCURRENCE_LIMIT);
            let occurrences = expand_occurrences(seed.span, rs.room.timezone, &pattern, limit, max_date)?;
            let event = Event::SeriesUpdated {
                parent_id: seed_id,
                room_id: rs.room.id,
                rule: Some(pattern),
                end_date: seed.recurrence_end_date,
            };
            self.persist_and_apply(&mut rs, &event).await?;
            let parent = rs.booking(seed_id).cloned().ok_or(EngineError::NotFound(seed_id))?;
            (parent, occurrences)
        };

        // The first occurrence is the seed itself.
        let outcome = self.materialize(&parent, occurrences.into_iter().skip(1)).await?;
        info!(
            parent = %seed_id,
            created = outcome.created.len(),
            conflicts = outcome.conflicts.len(),
            "recurrence expanded"
        );
        Ok(outcome)
    }

    /// Validate and persist one child per occurrence, taking the room lock
    /// per occurrence. Stops at the parent's end date, re-read each time.
    async fn materialize(
        &self,
        parent: &Booking,
        occurrences: impl Iterator<Item = Span>,
    ) -> Result<RecurrenceOutcome, EngineError> {
        let mut outcome = RecurrenceOutcome::default();
        for span in occurrences {
            let _user = self.lock_user(parent.user_id).await;
            let (_gate, mut rs) = self.lock_room(parent.room_id).await?;
            let end_date = rs.booking(parent.id).and_then(|p| p.recurrence_end_date);
            if end_date.is_some_and(|end| span.start >= end) {
                debug!(parent = %parent.id, "series capped, stopping");
                break;
            }
            if rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many bookings in room"));
            }

            let now = self.clock.now();
            let policy = self.resolve_policy(&rs.room, Some(parent.user_id), now);
            let candidate = BookingCandidate {
                room_id: parent.room_id,
                user_id: parent.user_id,
                span,
                notes: parent.notes.clone(),
            };
            let elsewhere = self.user_spans_elsewhere(parent.user_id, parent.room_id);
            let ctx = ValidationContext {
                room: &rs,
                policy: &policy,
                now,
                exclude: None,
                elsewhere: &elsewhere,
            };
            if let Err(reason) = validate(&candidate, &ctx) {
                metrics::counter!(observability::RECURRENCE_OCCURRENCES_TOTAL, "outcome" => "conflict").increment(1);
                debug!(parent = %parent.id, start = %span.start, reason = reason.reason_code(), "occurrence skipped");
                outcome.conflicts.push(RecurrenceConflict { occurrence: span, reason });
                continue;
            }

            let mut child = Booking::scheduled(Ulid::new(), parent.room_id, parent.user_id, span, now);
            child.notes = parent.notes.clone();
            child.total_price_cents = parent.total_price_cents;
            child.payment_completed = parent.payment_completed;
            child.recurring_parent_id = Some(parent.id);
            if let Some(schedule) = schedule_confirmation(span.start, now, &policy.policy) {
                child.confirmation_requested_at = Some(schedule.requested_at);
                child.confirmation_deadline = Some(schedule.deadline);
            }
            self.persist_and_apply(&mut rs, &Event::BookingCreated { booking: child.clone() })
                .await?;
            metrics::counter!(observability::RECURRENCE_OCCURRENCES_TOTAL, "outcome" => "created").increment(1);
            metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "origin" => "recurrence").increment(1);
            outcome.created.push(child);
        }
        Ok(outcome)
    }

    /// "This and future": drop the series' not-yet-started instances from
    /// `anchor_id`'s start onward and re-expand with `pattern`, or with the
    /// parent's current rule when `None`.
    pub async fn regenerate_series(
        &self,
        anchor_id: Ulid,
        pattern: Option<RecurrencePattern>,
        limit: Option<usize>,
        max_date: Option<NaiveDate>,
    ) -> Result<RecurrenceOutcome, EngineError> {
        if let Some(p) = &pattern {
            p.validate()?;
        }
        let (parent, pending) = {
            let (_gate, mut rs) = self.lock_booking_room(anchor_id).await?;
            let anchor = rs.booking(anchor_id).ok_or(EngineError::NotFound(anchor_id))?;
            let parent_id = match anchor.recurring_parent_id {
                Some(parent_id) => parent_id,
                None if anchor.is_recurring_parent => anchor_id,
                None => return Err(EngineError::NotInSeries(anchor_id)),
            };
            let from = anchor.span.start;
            let parent = rs.booking(parent_id).cloned().ok_or(EngineError::NotFound(parent_id))?;
            let rule = pattern
                .or_else(|| parent.recurrence_rule.clone())
                .ok_or(EngineError::NotInSeries(anchor_id))?;

            let now = self.clock.now();
            let children: Vec<Ulid> = self
                .idx
                .series
                .get(&parent_id)
                .map(|kids| kids.value().clone())
                .unwrap_or_default();
            let doomed: Vec<Ulid> = children
                .iter()
                .filter_map(|id| rs.booking(*id))
                .filter(|b| {
                    b.span.start >= from
                        && b.span.start > now
                        && matches!(b.state, BookingState::Scheduled | BookingState::Confirmed)
                })
                .map(|b| b.id)
                .collect();
            let room_id = rs.room.id;
            for id in &doomed {
                self.persist_and_apply(&mut rs, &Event::BookingRemoved { id: *id, room_id })
                    .await?;
            }

            let taken: HashSet<Ts> = children
                .iter()
                .filter_map(|id| rs.booking(*id))
                .map(|b| b.span.start)
                .collect();
            let limit = limit.unwrap_or(DEFAULT_OCCURRENCE_LIMIT);
            let occurrences = expand_occurrences(parent.span, rs.room.timezone, &rule, limit, max_date)?;
            let pending: Vec<Span> = occurrences
                .into_iter()
                .skip(1)
                .filter(|s| s.start >= from && s.start > now && !taken.contains(&s.start))
                .collect();

            let event = Event::SeriesUpdated {
                parent_id,
                room_id,
                rule: Some(rule),
                end_date: parent.recurrence_end_date,
            };
            self.persist_and_apply(&mut rs, &event).await?;
            info!(parent = %parent_id, removed = doomed.len(), "series instances removed for regeneration");
            let parent = rs.booking(parent_id).cloned().ok_or(EngineError::NotFound(parent_id))?;
            (parent, pending)
        };

        self.materialize(&parent, pending.into_iter()).await
    }

    /// "Future only": cancel every live member of the series starting at or
    /// after `instance_id`, then cap the parent's end date there so no later
    /// instance is generated. Returns the cancelled bookings in start order.
    pub async fn cancel_future(&self, instance_id: Ulid, reason: Option<String>) -> Result<Vec<Booking>, EngineError> {
        let (_gate, mut rs) = self.lock_booking_room(instance_id).await?;
        let instance = rs.booking(instance_id).ok_or(EngineError::NotFound(instance_id))?;
        let parent_id = match instance.recurring_parent_id {
            Some(parent_id) => parent_id,
            None if instance.is_recurring_parent => instance_id,
            None => return Err(EngineError::NotInSeries(instance_id)),
        };
        let from = instance.span.start;

        let mut members: Vec<Ulid> = self
            .idx
            .series
            .get(&parent_id)
            .map(|kids| kids.value().clone())
            .unwrap_or_default();
        members.push(parent_id);
        let mut targets: Vec<(Ts, Ulid)> = members
            .iter()
            .filter_map(|id| rs.booking(*id))
            .filter(|b| b.span.start >= from && matches!(b.state, BookingState::Scheduled | BookingState::Confirmed))
            .map(|b| (b.span.start, b.id))
            .collect();
        targets.sort_unstable();

        let mut cancelled = Vec::with_capacity(targets.len());
        for (_, id) in targets {
            let booking = self
                .transition_locked(&mut rs, id, None, Action::Cancel, reason.clone())
                .await?;
            metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => "cancel", "outcome" => "ok").increment(1);
            cancelled.push(booking);
        }

        let rule = rs.booking(parent_id).and_then(|p| p.recurrence_rule.clone());
        let event = Event::SeriesUpdated {
            parent_id,
            room_id: rs.room.id,
            rule,
            end_date: Some(from),
        };
        self.persist_and_apply(&mut rs, &event).await?;
        info!(parent = %parent_id, cancelled = cancelled.len(), cap = %from, "series cancelled from instance onward");
        Ok(cancelled)
    }
}
