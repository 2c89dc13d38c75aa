//! # roombook
//!
//! Booking lifecycle and availability engine for a finite set of rooms.
//!
//! - [`engine`]: the async [`engine::Engine`] and the pure algorithms under it
//!   (conflicts, policy validation, calendars, recurrence, confirmation scheduling)
//! - [`lifecycle`]: booking state machine
//! - [`policy`]: booking policies, inheritance and per-user overrides
//! - [`model`]: rooms, bookings, spans, persisted events
//! - [`wal`]: append-only event log used as the persistence collaborator
//! - [`notify`]: broadcast hub consumed by notification dispatchers
//! - [`sweeper`]: periodic confirmation/reminder sweep and log compaction

pub mod clock;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod limits;
pub mod localtime;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod sweeper;
pub mod wal;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineError, EngineSettings, PolicyViolation};
pub use lifecycle::{Action, BookingState, TransitionError};
pub use model::{Booking, BookingCandidate, Room, Span};
pub use policy::{BookingPolicy, WallClock};
