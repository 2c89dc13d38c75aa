use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::lifecycle::{Action, BookingState, TransitionError};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::policy::{BookingPolicy, PolicyOverride, PolicyScope};

use super::confirmation::schedule_confirmation;
use super::conflict::validate_span;
use super::validate::{ValidationContext, validate};
use super::{Engine, EngineError};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("name too long")),
        _ => Ok(()),
    }
}

fn check_note(note: &Option<String>) -> Result<(), EngineError> {
    match note {
        Some(n) if n.len() > MAX_NOTE_LEN => Err(EngineError::LimitExceeded("note too long")),
        _ => Ok(()),
    }
}

impl Engine {
    // ── Registry ─────────────────────────────────────────────────

    pub async fn upsert_category(&self, category: Category) -> Result<(), EngineError> {
        check_name(&category.name)?;
        if let Some(policy) = &category.policy {
            policy.validate()?;
        }
        let _guard = self.lock_global().await;
        if !self.categories.contains_key(&category.id) && self.categories.len() >= MAX_CATEGORIES {
            return Err(EngineError::LimitExceeded("too many categories"));
        }
        let id = category.id;
        self.persist_global(&Event::CategoryUpserted { category }).await?;
        info!(category = %id, "category upserted");
        Ok(())
    }

    fn check_room(&self, room: &Room) -> Result<(), EngineError> {
        check_name(&room.name)?;
        if let Some(policy) = &room.policy {
            policy.validate()?;
        }
        if let Some(category_id) = room.category_id
            && !self.categories.contains_key(&category_id)
        {
            return Err(EngineError::NotFound(category_id));
        }
        Ok(())
    }

    pub async fn create_room(&self, room: Room) -> Result<(), EngineError> {
        self.check_room(&room)?;
        let _guard = self.lock_global().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }
        let id = room.id;
        self.persist_global(&Event::RoomCreated { room }).await?;
        info!(room = %id, "room created");
        Ok(())
    }

    /// Replace a room's attributes. Existing bookings are not revalidated.
    pub async fn update_room(&self, room: Room) -> Result<(), EngineError> {
        self.check_room(&room)?;
        let (_gate, mut rs) = self.lock_room(room.id).await?;
        let id = room.id;
        self.persist_and_apply(&mut rs, &Event::RoomUpdated { room }).await?;
        info!(room = %id, "room updated");
        Ok(())
    }

    /// Policy an override in `scope` adjusts, before any overrides.
    async fn scope_policy(&self, scope: PolicyScope) -> Result<BookingPolicy, EngineError> {
        match scope {
            PolicyScope::Room(id) => {
                let rs = self.room_arc(&id).ok_or(EngineError::NotFound(id))?;
                let room = rs.read().await.room.clone();
                Ok(self.resolve_policy(&room, None, self.clock.now()).policy)
            }
            PolicyScope::Category(id) => {
                let category = self.categories.get(&id).ok_or(EngineError::NotFound(id))?;
                Ok(category
                    .policy
                    .clone()
                    .unwrap_or_else(|| self.settings.system_policy.clone()))
            }
            PolicyScope::System => Ok(self.settings.system_policy.clone()),
        }
    }

    /// Register a per-user exception. A grant for a field the user already
    /// overrides in that scope replaces the older one. The grant is refused
    /// when, merged with the user's other overrides, it breaks a policy
    /// invariant.
    pub async fn grant_override(&self, grant: PolicyOverride) -> Result<(), EngineError> {
        let base = self.scope_policy(grant.scope).await?;
        let _guard = self.lock_global().await;
        let others: Vec<PolicyOverride> = self
            .overrides
            .get(&(grant.scope, grant.user_id))
            .map(|list| {
                list.iter()
                    .filter(|o| !o.adjustment.same_field(&grant.adjustment))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if others.len() >= MAX_OVERRIDES_PER_USER {
            return Err(EngineError::LimitExceeded("too many overrides for user"));
        }
        let now = self.clock.now();
        others
            .iter()
            .filter(|o| o.is_active(now))
            .fold(base, |p, o| p.adjusted(&o.adjustment))
            .adjusted(&grant.adjustment)
            .validate()?;
        let (scope, user) = (grant.scope, grant.user_id);
        self.persist_global(&Event::OverrideGranted { grant }).await?;
        info!(%scope, %user, "policy override granted");
        Ok(())
    }

    /// Drop all of a user's overrides in `scope`. Returns false when there were none.
    pub async fn revoke_override(&self, scope: PolicyScope, user_id: Ulid) -> Result<bool, EngineError> {
        let _guard = self.lock_global().await;
        if !self.overrides.contains_key(&(scope, user_id)) {
            return Ok(false);
        }
        self.persist_global(&Event::OverrideRevoked { scope, user_id }).await?;
        info!(%scope, user = %user_id, "policy overrides revoked");
        Ok(true)
    }

    // ── Bookings ─────────────────────────────────────────────────

    /// Validate and persist in one serialised step per room: the room lock is
    /// held from reading conflicts until the event is applied. The user lock
    /// around it covers the user's bookings in other rooms.
    pub async fn create_booking(&self, candidate: BookingCandidate) -> Result<Booking, EngineError> {
        validate_span(&candidate.span)?;
        check_note(&candidate.notes)?;

        let _user = self.lock_user(candidate.user_id).await;
        let (_gate, mut rs) = self.lock_room(candidate.room_id).await?;
        if rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings in room"));
        }
        let now = self.clock.now();
        let policy = self.resolve_policy(&rs.room, Some(candidate.user_id), now);
        let elsewhere = self.user_spans_elsewhere(candidate.user_id, candidate.room_id);
        let ctx = ValidationContext {
            room: &rs,
            policy: &policy,
            now,
            exclude: None,
            elsewhere: &elsewhere,
        };
        if let Err(violation) = validate(&candidate, &ctx) {
            metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => violation.reason_code()).increment(1);
            debug!(room = %candidate.room_id, user = %candidate.user_id, reason = violation.reason_code(), "booking rejected");
            return Err(violation.into());
        }

        let mut booking = Booking::scheduled(Ulid::new(), rs.room.id, candidate.user_id, candidate.span, now);
        booking.notes = candidate.notes;
        booking.total_price_cents = rs.room.price_for(&candidate.span);
        if let Some(schedule) = schedule_confirmation(candidate.span.start, now, &policy.policy) {
            booking.confirmation_requested_at = Some(schedule.requested_at);
            booking.confirmation_deadline = Some(schedule.deadline);
        }

        self.persist_and_apply(&mut rs, &Event::BookingCreated { booking: booking.clone() })
            .await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "origin" => "direct").increment(1);
        info!(booking = %booking.id, room = %booking.room_id, start = %booking.span.start, "booking created");
        Ok(booking)
    }

    /// Apply a lifecycle action to the booking's current state.
    pub async fn transition(&self, id: Ulid, action: Action, note: Option<String>) -> Result<Booking, EngineError> {
        self.transition_inner(id, None, action, note).await
    }

    /// Compare-and-swap variant: fails with `InvalidTransition` unless the
    /// booking is still in `expected`.
    pub async fn transition_from(
        &self,
        id: Ulid,
        expected: BookingState,
        action: Action,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.transition_inner(id, Some(expected), action, note).await
    }

    async fn transition_inner(
        &self,
        id: Ulid,
        expected: Option<BookingState>,
        action: Action,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_note(&note)?;
        let (_gate, mut rs) = self.lock_booking_room(id).await?;
        let result = self.transition_locked(&mut rs, id, expected, action, note).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(EngineError::Transition(TransitionError::OutOfWindow { .. })) => "out_of_window",
            Err(EngineError::Transition(TransitionError::InvalidTransition { .. })) => "invalid",
            Err(_) => "error",
        };
        metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => action.name(), "outcome" => outcome).increment(1);
        result
    }

    /// Check and persist one transition. The caller holds the room lock.
    pub(super) async fn transition_locked(
        &self,
        rs: &mut RoomState,
        id: Ulid,
        expected: Option<BookingState>,
        action: Action,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let booking = rs.booking(id).ok_or(EngineError::NotFound(id))?;
        if let Some(expected) = expected
            && booking.state != expected
        {
            return Err(TransitionError::InvalidTransition {
                from: booking.state,
                attempted: action.name(),
            }
            .into());
        }
        let from = booking.state;
        let to = match booking.check_transition(&action, now, self.settings.no_show_grace) {
            Ok(to) => to,
            Err(e) => {
                warn!(booking = %id, %from, action = action.name(), "transition refused: {e}");
                return Err(e.into());
            }
        };
        let event = Event::BookingTransitioned {
            id,
            room_id: rs.room.id,
            from,
            to,
            at: now,
            note,
            payment_completed: action.payment_completed(),
        };
        self.persist_and_apply(rs, &event).await?;
        info!(booking = %id, %from, %to, "booking transitioned");
        rs.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── Log maintenance ──────────────────────────────────────────

    /// Rewrite the log as one snapshot event per live entity. Writers are
    /// held off for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;
        let now = self.clock.now();
        let mut events = Vec::new();

        for entry in self.categories.iter() {
            events.push(Event::CategoryUpserted {
                category: entry.value().clone(),
            });
        }
        for entry in self.overrides.iter() {
            for grant in entry.value() {
                events.push(Event::OverrideGranted { grant: grant.clone() });
            }
        }
        let rooms = self.room_arcs();
        for rs in &rooms {
            events.push(Event::RoomCreated {
                room: rs.read().await.room.clone(),
            });
        }
        for rs in &rooms {
            let guard = rs.read().await;
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }
        for key in self.idx.notifications.iter() {
            if let Some(room_id) = self.room_of_booking(&key.booking_id) {
                events.push(Event::NotificationRecorded {
                    key: *key,
                    room_id,
                    at: now,
                });
            }
        }

        let count = events.len();
        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, "log compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
