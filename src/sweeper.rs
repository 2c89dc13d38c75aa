use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::model::Booking;
use crate::observability;

/// What one sweep did. Dispatchers pick the bookings up from here or from the
/// `NotifyHub` firehose.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub confirmation_requests: Vec<Booking>,
    pub auto_cancelled: Vec<Booking>,
    pub reminders: Vec<Booking>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.confirmation_requests.is_empty() && self.auto_cancelled.is_empty() && self.reminders.is_empty()
    }
}

/// One pass of the periodic work: open confirmation windows, cancel bookings
/// whose deadline lapsed, and record due reminders. Every step is idempotent,
/// so overlapping or repeated sweeps are harmless.
pub async fn sweep_once(engine: &Engine, reminder_lead: Duration) -> Result<SweepReport, EngineError> {
    let now = engine.now();
    let mut report = SweepReport::default();

    for booking in engine.due_for_confirmation_request(now).await {
        if engine.record_confirmation_requested(booking.id).await? {
            report.confirmation_requests.push(booking);
        }
    }

    report.auto_cancelled = engine.auto_cancel_unconfirmed(now).await?;

    for booking in engine.due_for_reminder(now, reminder_lead).await {
        if engine.record_reminder_sent(booking.id, reminder_lead).await? {
            report.reminders.push(booking);
        }
    }

    for (kind, n) in [
        ("confirmation_request", report.confirmation_requests.len()),
        ("auto_cancel", report.auto_cancelled.len()),
        ("reminder", report.reminders.len()),
    ] {
        metrics::counter!(observability::SWEEP_ACTIONS_TOTAL, "kind" => kind).increment(n as u64);
    }
    Ok(report)
}

/// Background task running `sweep_once` every `every`.
pub async fn run_sweeper(engine: Arc<Engine>, every: StdDuration, reminder_lead: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match sweep_once(&engine, reminder_lead).await {
            Ok(report) if report.is_empty() => debug!("sweep: nothing due"),
            Ok(report) => info!(
                confirmation_requests = report.confirmation_requests.len(),
                auto_cancelled = report.auto_cancelled.len(),
                reminders = report.reminders.len(),
                "sweep finished"
            ),
            Err(e) => warn!("sweep failed: {e}"),
        }
    }
}

/// Background task compacting the log once `threshold` events were appended
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: StdDuration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appended = engine.wal_appends_since_compact().await;
        if appended < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!(appended, "compaction failed: {e}");
        }
    }
}
