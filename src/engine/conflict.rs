use ulid::Ulid;

use crate::limits::MAX_BOOKING_SPAN_MINUTES;
use crate::model::*;

use super::EngineError;

/// Every blocking booking of the room overlapping `span` (half-open), skipping
/// `exclude` when revalidating an existing booking.
pub fn intersects<'a>(rs: &'a RoomState, span: &Span, exclude: Option<Ulid>) -> Vec<&'a Booking> {
    rs.overlapping(span)
        .filter(|b| b.is_blocking() && Some(b.id) != exclude)
        .collect()
}

pub fn is_available(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> bool {
    rs.overlapping(span)
        .all(|b| !b.is_blocking() || Some(b.id) == exclude)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidSpan {
            span: *span,
            reason: "start must be before end",
        });
    }
    if span.minutes() > MAX_BOOKING_SPAN_MINUTES {
        return Err(EngineError::LimitExceeded("booking span too wide"));
    }
    Ok(())
}
