use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The one accepted slot literal: `YYYY-MM-DD HH:MM`, local wall clock.
pub const SLOT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// The one accepted calendar-day literal: `YYYY-MM-DD`.
pub const SLOT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Opaque, stable identity handed to the core by the identity adapter.
pub type UserId = Ulid;

/// Monotonic surrogate key for reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookable field sizes. The catalog is closed; anything else is rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Five,
    Seven,
    Eight,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Five, ResourceKind::Seven, ResourceKind::Eight];

    /// Wire code, e.g. `"5"`.
    pub fn code(self) -> &'static str {
        match self {
            ResourceKind::Five => "5",
            ResourceKind::Seven => "7",
            ResourceKind::Eight => "8",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Five => "5-a-side field",
            ResourceKind::Seven => "7-a-side field",
            ResourceKind::Eight => "8-a-side field",
        }
    }

    /// Position in `ALL`; also the slot-board index and lock order.
    pub fn index(self) -> usize {
        match self {
            ResourceKind::Five => 0,
            ResourceKind::Seven => 1,
            ResourceKind::Eight => 2,
        }
    }

    pub fn from_code(raw: &str) -> Option<Self> {
        ResourceKind::ALL.into_iter().find(|k| k.code() == raw)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A single occupied instant, minute granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotTime(NaiveDateTime);

impl SlotTime {
    /// Parse `YYYY-MM-DD HH:MM` exactly. Seconds, offsets, `T` separators and
    /// unpadded fields are all rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() != 16 || !raw.is_ascii() {
            return None;
        }
        NaiveDateTime::parse_from_str(raw, SLOT_TIME_FORMAT)
            .ok()
            .map(SlotTime)
    }

    /// Truncates to the minute.
    pub fn from_naive(dt: NaiveDateTime) -> Self {
        let time = dt.time();
        let minute = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(NaiveTime::MIN);
        SlotTime(dt.date().and_time(minute))
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date()
    }

    /// First slot of the given calendar day.
    pub fn start_of(date: NaiveDate) -> Self {
        SlotTime(date.and_time(NaiveTime::MIN))
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(SLOT_TIME_FORMAT))
    }
}

/// Parse a `YYYY-MM-DD` calendar day, same strictness as [`SlotTime::parse`].
pub fn parse_slot_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() != 10 || !raw.is_ascii() {
        return None;
    }
    NaiveDate::parse_from_str(raw, SLOT_DATE_FORMAT).ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub owner_id: UserId,
    pub resource: ResourceKind,
    pub slot_time: SlotTime,
    /// Owner's profile name as it was at creation time.
    pub display_name: String,
    pub created_at: NaiveDateTime,
}

impl Reservation {
    /// Upcoming means strictly after `now`, evaluated at query time.
    pub fn is_upcoming(&self, now: NaiveDateTime) -> bool {
        self.slot_time.as_naive() > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    /// Login identifier; unique, stored case-folded.
    pub email: String,
    pub display_name: String,
    pub created_at: NaiveDateTime,
}

/// Occupancy of one resource. The map key is the `(resource, slot_time)`
/// uniqueness constraint: a second row for the same instant cannot exist.
#[derive(Debug, Clone)]
pub struct SlotBoard {
    pub kind: ResourceKind,
    slots: BTreeMap<SlotTime, Reservation>,
}

impl SlotBoard {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            slots: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, at: &SlotTime) -> Option<&Reservation> {
        self.slots.get(at)
    }

    /// Insert unless the instant is already held; on collision returns the holder's id.
    pub fn insert(&mut self, reservation: Reservation) -> Result<(), ReservationId> {
        if let Some(existing) = self.slots.get(&reservation.slot_time) {
            return Err(existing.id);
        }
        self.slots.insert(reservation.slot_time, reservation);
        Ok(())
    }

    pub fn remove(&mut self, at: &SlotTime) -> Option<Reservation> {
        self.slots.remove(at)
    }

    /// Remove every reservation owned by `owner`, returning them in slot order.
    pub fn remove_owned_by(&mut self, owner: &UserId) -> Vec<Reservation> {
        let keys: Vec<SlotTime> = self
            .slots
            .values()
            .filter(|r| r.owner_id == *owner)
            .map(|r| r.slot_time)
            .collect();
        keys.iter().filter_map(|k| self.slots.remove(k)).collect()
    }

    /// All reservations in ascending slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.slots.values()
    }

    /// Reservations whose slot falls on the given calendar day, ascending.
    pub fn on_date(&self, date: NaiveDate) -> impl Iterator<Item = &Reservation> {
        let upper = match date.succ_opt() {
            Some(next) => Bound::Excluded(SlotTime::start_of(next)),
            None => Bound::Unbounded,
        };
        self.slots
            .range((Bound::Included(SlotTime::start_of(date)), upper))
            .map(|(_, r)| r)
    }
}

/// The event types, flat. This is the WAL record format; one record is one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: UserId,
        email: String,
        display_name: String,
        created_at: NaiveDateTime,
    },
    /// Removes the identity and, atomically, every reservation it owns.
    UserDeleted {
        id: UserId,
    },
    ReservationCreated {
        id: ReservationId,
        owner_id: UserId,
        resource: ResourceKind,
        slot_time: SlotTime,
        display_name: String,
        created_at: NaiveDateTime,
    },
    ReservationCancelled {
        id: ReservationId,
        resource: ResourceKind,
        slot_time: SlotTime,
    },
    /// Written first by compaction so cancelled ids are never handed out again.
    IdWatermark {
        next_reservation_id: u64,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Occupancy of one resource on one day, from the caller's point of view.
/// `mine` is a subset of `occupied`; other owners are never revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    pub occupied: Vec<SlotTime>,
    pub mine: Vec<SlotTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(raw: &str) -> SlotTime {
        SlotTime::parse(raw).unwrap()
    }

    fn reservation(id: u64, owner: UserId, at: &str) -> Reservation {
        Reservation {
            id: ReservationId(id),
            owner_id: owner,
            resource: ResourceKind::Five,
            slot_time: slot(at),
            display_name: "Ana".into(),
            created_at: slot("2025-01-01 00:00").as_naive(),
        }
    }

    #[test]
    fn resource_codes() {
        assert_eq!(ResourceKind::from_code("5"), Some(ResourceKind::Five));
        assert_eq!(ResourceKind::from_code("7"), Some(ResourceKind::Seven));
        assert_eq!(ResourceKind::from_code("8"), Some(ResourceKind::Eight));
        assert_eq!(ResourceKind::from_code("9"), None);
        assert_eq!(ResourceKind::from_code(" 5"), None);
        assert_eq!(ResourceKind::from_code(""), None);
        for (i, k) in ResourceKind::ALL.iter().enumerate() {
            assert_eq!(k.index(), i);
        }
    }

    #[test]
    fn slot_time_literal_only() {
        assert_eq!(slot("2025-01-10 18:00").to_string(), "2025-01-10 18:00");
        assert!(SlotTime::parse("2025-01-10 18:00:00").is_none());
        assert!(SlotTime::parse("2025-01-10T18:00").is_none());
        assert!(SlotTime::parse("2025-1-10 18:00").is_none());
        assert!(SlotTime::parse("2025-01-10 18:0").is_none());
        assert!(SlotTime::parse("2025-02-30 18:00").is_none());
        assert!(SlotTime::parse("2025-01-10 24:00").is_none());
        assert!(SlotTime::parse("tomorrow").is_none());
        assert!(SlotTime::parse("").is_none());
    }

    #[test]
    fn slot_time_truncates_to_minute() {
        let dt = NaiveDateTime::parse_from_str("2025-01-10 18:07:45", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(SlotTime::from_naive(dt), slot("2025-01-10 18:07"));
    }

    #[test]
    fn slot_date_literal_only() {
        assert!(parse_slot_date("2025-01-10").is_some());
        assert!(parse_slot_date("2025-1-10").is_none());
        assert!(parse_slot_date("2025-01-10 18:00").is_none());
        assert!(parse_slot_date("").is_none());
    }

    #[test]
    fn board_rejects_duplicate_instant() {
        let mut board = SlotBoard::new(ResourceKind::Five);
        let owner = Ulid::new();
        board.insert(reservation(1, owner, "2025-01-10 18:00")).unwrap();
        let err = board
            .insert(reservation(2, Ulid::new(), "2025-01-10 18:00"))
            .unwrap_err();
        assert_eq!(err, ReservationId(1));
        assert_eq!(board.len(), 1);
        // Adjacent minute is a different slot
        board.insert(reservation(3, owner, "2025-01-10 18:01")).unwrap();
        assert_eq!(board.len(), 2);
    }

    #[test]
    fn board_iterates_in_slot_order() {
        let mut board = SlotBoard::new(ResourceKind::Five);
        let owner = Ulid::new();
        board.insert(reservation(1, owner, "2025-01-10 20:00")).unwrap();
        board.insert(reservation(2, owner, "2025-01-09 08:00")).unwrap();
        board.insert(reservation(3, owner, "2025-01-10 18:00")).unwrap();
        let ids: Vec<u64> = board.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn board_on_date_bounds() {
        let mut board = SlotBoard::new(ResourceKind::Five);
        let owner = Ulid::new();
        board.insert(reservation(1, owner, "2025-01-09 23:59")).unwrap();
        board.insert(reservation(2, owner, "2025-01-10 00:00")).unwrap();
        board.insert(reservation(3, owner, "2025-01-10 23:59")).unwrap();
        board.insert(reservation(4, owner, "2025-01-11 00:00")).unwrap();
        let day = parse_slot_date("2025-01-10").unwrap();
        let ids: Vec<u64> = board.on_date(day).map(|r| r.id.0).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn board_remove_owned_by() {
        let mut board = SlotBoard::new(ResourceKind::Five);
        let a = Ulid::new();
        let b = Ulid::new();
        board.insert(reservation(1, a, "2025-01-10 18:00")).unwrap();
        board.insert(reservation(2, b, "2025-01-10 19:00")).unwrap();
        board.insert(reservation(3, a, "2025-01-10 20:00")).unwrap();
        let removed = board.remove_owned_by(&a);
        assert_eq!(removed.iter().map(|r| r.id.0).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(board.len(), 1);
        assert!(board.get(&slot("2025-01-10 19:00")).is_some());
    }

    #[test]
    fn upcoming_is_strict() {
        let r = reservation(1, Ulid::new(), "2025-01-10 18:00");
        assert!(!r.is_upcoming(slot("2025-01-10 18:00").as_naive()));
        assert!(r.is_upcoming(slot("2025-01-10 17:59").as_naive()));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            id: ReservationId(7),
            owner_id: Ulid::new(),
            resource: ResourceKind::Eight,
            slot_time: slot("2025-01-10 18:00"),
            display_name: "Ana".into(),
            created_at: slot("2025-01-03 09:00").as_naive(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
