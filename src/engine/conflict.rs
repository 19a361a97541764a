use crate::config::BookingPolicy;
use crate::model::*;

use super::EngineError;

/// Check a requested `[start, end)` against the absolute limits and the booking windows.
pub(crate) fn validate_range(
    policy: &BookingPolicy,
    start: Ms,
    end: Ms,
    now: Ms,
) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidRange("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidRange("timestamp out of range"));
    }
    if end - start > policy.max_duration_ms {
        return Err(EngineError::InvalidRange("reservation too long"));
    }
    if start < now - policy.max_past_skew_ms {
        return Err(EngineError::InvalidRange("start is in the past"));
    }
    if start > now + policy.max_advance_ms {
        return Err(EngineError::InvalidRange("start is too far ahead"));
    }
    Ok(Span::new(start, end))
}

/// Active reservations on the space that overlap `span`.
pub(crate) fn find_conflicts(ss: &SpaceState, span: &Span) -> Vec<ConflictInfo> {
    ss.overlapping(span)
        .filter(|r| r.status.is_active())
        .map(|r| ConflictInfo {
            reservation_id: r.id,
            span: r.span,
        })
        .collect()
}
