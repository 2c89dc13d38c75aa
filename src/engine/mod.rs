mod availability;
mod confirmation;
mod conflict;
mod error;
mod mutations;
mod queries;
mod recurrence;
mod series;
mod validate;
#[cfg(test)]
mod tests;

pub use availability::{available_durations, generate_calendar};
pub use confirmation::{ConfirmationSchedule, schedule_confirmation};
pub use conflict::{intersects, is_available};
pub use error::{EngineError, PolicyViolation, RecurrenceConflict, RecurrenceOutcome};
pub use recurrence::{DEFAULT_OCCURRENCE_LIMIT, expand_occurrences};
pub use validate::{SLOT_MINUTES, ValidationContext, can_cancel_with_refund, is_slot_aligned, validate};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, MutexGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::info;
use ulid::Ulid;

use crate::clock::Clock;
use crate::lifecycle::DEFAULT_NO_SHOW_GRACE_MINUTES;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::{BookingPolicy, EffectivePolicy, PolicyOverride, PolicyScope};
use crate::wal::{Wal, WalHandle};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Engine-wide knobs that are not part of any stored policy.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Applies to rooms with neither an own nor a category policy.
    pub system_policy: BookingPolicy,
    pub no_show_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            system_policy: BookingPolicy::default(),
            no_show_grace: Duration::minutes(DEFAULT_NO_SHOW_GRACE_MINUTES),
        }
    }
}

/// Number of mutexes user ids are hashed onto for `lock_user`.
const USER_LOCK_STRIPES: usize = 64;

/// A live booking as seen from its user's side.
#[derive(Debug, Clone, Copy)]
pub(super) struct UserBooking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub span: Span,
}

/// Lookup tables derived from room state, rebuilt on replay.
#[derive(Default)]
pub(super) struct Indexes {
    pub booking_to_room: DashMap<Ulid, Ulid>,
    /// Series parent → generated instances.
    pub series: DashMap<Ulid, Vec<Ulid>>,
    /// Notifications already dispatched.
    pub notifications: DashSet<NotificationKey>,
    /// User → non-cancelled bookings in every room.
    pub by_user: DashMap<Ulid, Vec<UserBooking>>,
}

impl Indexes {
    fn forget_user_booking(&self, user_id: Ulid, booking_id: Ulid) {
        if let Some(mut list) = self.by_user.get_mut(&user_id) {
            list.retain(|b| b.id != booking_id);
        }
    }
}

/// Held by every writer for the duration of one mutation. Compaction takes it
/// exclusively so the snapshot and the log swap see no interleaved append.
type WriteGate<'a> = RwLockReadGuard<'a, ()>;

pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) categories: DashMap<Ulid, Category>,
    pub(super) overrides: DashMap<(PolicyScope, Ulid), Vec<PolicyOverride>>,
    pub(super) idx: Indexes,
    pub(super) wal: WalHandle,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    /// Serialises category, room-creation and override writes.
    pub(super) global: Mutex<()>,
    /// Serialise booking creation per user, ahead of the gate and room lock.
    pub(super) user_locks: Vec<Mutex<()>>,
    pub(super) gate: RwLock<()>,
}

/// Apply a room-scoped event. Caller holds the room lock (or owns the state
/// outright during replay).
pub(super) fn apply_to_room(rs: &mut RoomState, event: &Event, idx: &Indexes) {
    match event {
        Event::RoomUpdated { room } => rs.room = room.clone(),
        Event::BookingCreated { booking } => {
            idx.booking_to_room.insert(booking.id, booking.room_id);
            if booking.is_blocking() {
                idx.by_user.entry(booking.user_id).or_default().push(UserBooking {
                    id: booking.id,
                    room_id: booking.room_id,
                    span: booking.span,
                });
            }
            if let Some(parent) = booking.recurring_parent_id {
                idx.series.entry(parent).or_default().push(booking.id);
            }
            rs.insert(booking.clone());
        }
        Event::BookingTransitioned {
            id,
            to,
            at,
            note,
            payment_completed,
            ..
        } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.enter(*to, *at, note.clone(), *payment_completed);
                if !b.is_blocking() {
                    idx.forget_user_booking(b.user_id, *id);
                }
            }
        }
        Event::BookingRemoved { id, .. } => {
            if let Some(removed) = rs.remove(*id) {
                idx.booking_to_room.remove(id);
                idx.forget_user_booking(removed.user_id, *id);
                if let Some(parent) = removed.recurring_parent_id
                    && let Some(mut kids) = idx.series.get_mut(&parent)
                {
                    kids.retain(|k| k != id);
                }
            }
        }
        Event::SeriesUpdated {
            parent_id,
            rule,
            end_date,
            ..
        } => {
            if let Some(parent) = rs.booking_mut(*parent_id) {
                parent.is_recurring_parent = true;
                parent.recurrence_rule = rule.clone();
                parent.recurrence_end_date = *end_date;
            }
        }
        Event::NotificationRecorded { key, .. } => {
            idx.notifications.insert(*key);
        }
        // Registry-level events never reach a room.
        Event::RoomCreated { .. }
        | Event::CategoryUpserted { .. }
        | Event::OverrideGranted { .. }
        | Event::OverrideRevoked { .. } => {}
    }
}

fn apply_override(overrides: &DashMap<(PolicyScope, Ulid), Vec<PolicyOverride>>, event: &Event) {
    match event {
        Event::OverrideGranted { grant } => {
            let mut list = overrides.entry((grant.scope, grant.user_id)).or_default();
            list.retain(|o| !o.adjustment.same_field(&grant.adjustment));
            list.push(grant.clone());
        }
        Event::OverrideRevoked { scope, user_id } => {
            overrides.remove(&(*scope, *user_id));
        }
        _ => {}
    }
}

impl Engine {
    /// Replay the log at `wal_path` and start its writer task. Must run inside
    /// a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let idx = Indexes::default();
        let categories = DashMap::new();
        let overrides = DashMap::new();
        let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();

        for event in &events {
            match event {
                Event::RoomCreated { room } => {
                    rooms.insert(room.id, RoomState::new(room.clone()));
                }
                Event::CategoryUpserted { category } => {
                    categories.insert(category.id, category.clone());
                }
                Event::OverrideGranted { .. } | Event::OverrideRevoked { .. } => apply_override(&overrides, event),
                other => {
                    if let Some(room_id) = other.room_id()
                        && let Some(rs) = rooms.get_mut(&room_id)
                    {
                        apply_to_room(rs, other, &idx);
                    }
                }
            }
        }

        let room_count = rooms.len();
        let engine = Self {
            rooms: rooms
                .into_iter()
                .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
                .collect(),
            categories,
            overrides,
            idx,
            wal,
            notify,
            clock,
            settings,
            global: Mutex::new(()),
            user_locks: (0..USER_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            gate: RwLock::new(()),
        };
        metrics::gauge!(crate::observability::ROOMS_ACTIVE).set(room_count as f64);
        info!(events = events.len(), rooms = room_count, path = %wal_path.display(), "engine replayed");
        Ok(engine)
    }

    pub fn now(&self) -> Ts {
        self.clock.now()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(super) fn room_arc(&self, room_id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(room_id).map(|e| e.value().clone())
    }

    pub(super) fn room_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.idx.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    pub(super) fn room_arcs(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    /// Enter the write gate, then take the room's write lock. This pair is
    /// the per-room serialisation scope for validate-then-write.
    pub(super) async fn lock_room(
        &self,
        room_id: Ulid,
    ) -> Result<(WriteGate<'_>, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let gate = self.gate.read().await;
        let rs = self.room_arc(&room_id).ok_or(EngineError::NotFound(room_id))?;
        Ok((gate, rs.write_owned().await))
    }

    pub(super) async fn lock_booking_room(
        &self,
        booking_id: Ulid,
    ) -> Result<(WriteGate<'_>, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_of_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        self.lock_room(room_id).await
    }

    /// Held around validate-then-write of a new booking so that the weekly
    /// quota, which spans rooms, sees every earlier booking of the user.
    /// Always taken before `lock_room`, never while holding it.
    pub(super) async fn lock_user(&self, user_id: Ulid) -> MutexGuard<'_, ()> {
        let stripe = (user_id.0 % self.user_locks.len() as u128) as usize;
        self.user_locks[stripe].lock().await
    }

    /// Spans of the user's live bookings outside `room_id`.
    pub(super) fn user_spans_elsewhere(&self, user_id: Ulid, room_id: Ulid) -> Vec<Span> {
        self.idx
            .by_user
            .get(&user_id)
            .map(|list| {
                list.iter()
                    .filter(|b| b.room_id != room_id)
                    .map(|b| b.span)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(super) async fn lock_global(&self) -> (WriteGate<'_>, MutexGuard<'_, ()>) {
        let gate = self.gate.read().await;
        (gate, self.global.lock().await)
    }

    /// Log, apply, publish. The caller holds the room write lock.
    pub(super) async fn persist_and_apply(&self, rs: &mut RoomState, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        apply_to_room(rs, event, &self.idx);
        self.notify.publish(event);
        Ok(())
    }

    /// Same for registry-level events. The caller holds `lock_global`.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        match event {
            Event::RoomCreated { room } => {
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
                metrics::gauge!(crate::observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
            }
            Event::CategoryUpserted { category } => {
                self.categories.insert(category.id, category.clone());
            }
            Event::OverrideGranted { .. } | Event::OverrideRevoked { .. } => apply_override(&self.overrides, event),
            _ => {}
        }
        self.notify.publish(event);
        Ok(())
    }

    /// The room's resolved policy with `user_id`'s active overrides applied.
    pub(super) fn resolve_policy(&self, room: &Room, user_id: Option<Ulid>, now: Ts) -> EffectivePolicy {
        let category = room
            .category_id
            .and_then(|id| self.categories.get(&id).map(|c| c.value().clone()));
        let base = EffectivePolicy::resolve(room, category.as_ref(), &self.settings.system_policy);
        let Some(user_id) = user_id else { return base };
        match self.overrides.get(&(base.scope, user_id)) {
            Some(list) => base.with_overrides(list.iter(), user_id, now),
            None => base,
        }
    }
}
