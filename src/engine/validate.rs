use chrono::{Duration, NaiveDateTime};

use crate::limits::BOOKING_HORIZON_DAYS;
use crate::model::*;

use super::BookingError;

pub fn parse_resource(raw: &str) -> Result<ResourceKind, BookingError> {
    ResourceKind::from_code(raw).ok_or(BookingError::InvalidResource)
}

/// The single accepted slot form, `YYYY-MM-DD HH:MM`. No alternates.
pub fn parse_slot_time(raw: &str) -> Result<SlotTime, BookingError> {
    SlotTime::parse(raw).ok_or(BookingError::InvalidTimeFormat)
}

pub(super) fn require_fields(fields: &[&str]) -> Result<(), BookingError> {
    if fields.iter().any(|f| f.trim().is_empty()) {
        return Err(BookingError::MissingFields);
    }
    Ok(())
}

/// `now < slot <= now + horizon`. A slot at `now` is already gone; one exactly
/// at the far edge is still bookable.
pub fn check_horizon(slot: SlotTime, now: NaiveDateTime) -> Result<(), BookingError> {
    let at = slot.as_naive();
    let limit = now + Duration::days(BOOKING_HORIZON_DAYS);
    if at <= now || at > limit {
        return Err(BookingError::OutOfHorizon);
    }
    Ok(())
}

/// Early, user-facing conflict check. Only upcoming reservations block; the
/// board's own key check at insert time is what actually decides.
pub(super) fn check_no_conflict(board: &SlotBoard, slot: SlotTime, now: NaiveDateTime) -> Result<(), BookingError> {
    match board.get(&slot) {
        Some(existing) if existing.is_upcoming(now) => Err(BookingError::SlotTaken),
        _ => Ok(()),
    }
}

pub(super) fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), BookingError> {
    if value.len() > max {
        return Err(BookingError::LimitExceeded(what));
    }
    Ok(())
}
