use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;

use crate::model::*;

pub type SharedSlotBoard = Arc<RwLock<SlotBoard>>;

/// A structural constraint rejected the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueViolation(pub &'static str);

pub const SLOT_CONSTRAINT: &str = "reservations_resource_slot_time_key";
pub const EMAIL_CONSTRAINT: &str = "users_email_key";

/// Reservation and identity tables. Reservations live on one board per
/// resource kind; mutate a board only while holding its write lock.
pub struct ReservationStore {
    boards: [SharedSlotBoard; 3],
    /// reservation id → where it sits
    locations: DashMap<ReservationId, (ResourceKind, SlotTime)>,
    users: DashMap<UserId, User>,
    /// case-folded email → user id
    emails: DashMap<String, UserId>,
    next_reservation_id: AtomicU64,
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            boards: ResourceKind::ALL.map(|k| Arc::new(RwLock::new(SlotBoard::new(k)))),
            locations: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            next_reservation_id: AtomicU64::new(1),
        }
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn board(&self, kind: ResourceKind) -> SharedSlotBoard {
        self.boards[kind.index()].clone()
    }

    /// Boards in lock order.
    pub fn boards(&self) -> impl Iterator<Item = SharedSlotBoard> + '_ {
        self.boards.iter().cloned()
    }

    pub fn locate(&self, id: &ReservationId) -> Option<(ResourceKind, SlotTime)> {
        self.locations.get(id).map(|e| *e.value())
    }

    pub fn reservation_count(&self) -> usize {
        self.locations.len()
    }

    pub fn allocate_reservation_id(&self) -> ReservationId {
        ReservationId(self.next_reservation_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn peek_next_reservation_id(&self) -> u64 {
        self.next_reservation_id.load(Ordering::SeqCst)
    }

    fn bump_reservation_id(&self, at_least: u64) {
        self.next_reservation_id.fetch_max(at_least, Ordering::SeqCst);
    }

    /// The structural `(resource, slot_time)` check. Caller holds the board lock.
    pub fn check_vacant(&self, board: &SlotBoard, at: &SlotTime) -> Result<(), UniqueViolation> {
        match board.get(at) {
            Some(_) => Err(UniqueViolation(SLOT_CONSTRAINT)),
            None => Ok(()),
        }
    }

    // ── Identities ───────────────────────────────────────────

    pub fn user(&self, id: &UserId) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn has_user(&self, id: &UserId) -> bool {
        self.users.contains_key(id)
    }

    pub fn user_by_email(&self, email: &str) -> Option<UserId> {
        self.emails.get(&fold_email(email)).map(|e| *e.value())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn users(&self) -> Vec<User> {
        let mut all: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|u| u.id);
        all
    }

    /// Claim a login identifier; the email index is the uniqueness constraint.
    pub fn claim_email(&self, email: &str, id: UserId) -> Result<(), UniqueViolation> {
        match self.emails.entry(fold_email(email)) {
            Entry::Occupied(_) => Err(UniqueViolation(EMAIL_CONSTRAINT)),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    /// Undo a claim whose WAL write failed.
    pub fn release_email(&self, email: &str, id: &UserId) {
        self.emails.remove_if(&fold_email(email), |_, owner| owner == id);
    }

    // ── Event application ────────────────────────────────────

    /// Reservation events. Caller holds the write lock on `board`.
    pub fn apply_to_board(&self, board: &mut SlotBoard, event: &Event) {
        match event {
            Event::ReservationCreated {
                id,
                owner_id,
                resource,
                slot_time,
                display_name,
                created_at,
            } => {
                let reservation = Reservation {
                    id: *id,
                    owner_id: *owner_id,
                    resource: *resource,
                    slot_time: *slot_time,
                    display_name: display_name.clone(),
                    created_at: *created_at,
                };
                if let Err(holder) = board.insert(reservation) {
                    tracing::warn!("reservation {id} collides with {holder} at {resource}/{slot_time}, skipped");
                    return;
                }
                self.locations.insert(*id, (*resource, *slot_time));
                self.bump_reservation_id(id.0 + 1);
            }
            Event::ReservationCancelled { id, slot_time, .. } => {
                if board.get(slot_time).is_some_and(|r| r.id == *id) {
                    board.remove(slot_time);
                }
                self.locations.remove(id);
            }
            Event::UserRegistered { .. } | Event::UserDeleted { .. } | Event::IdWatermark { .. } => {}
        }
    }

    pub fn apply_user_registered(&self, id: UserId, email: &str, display_name: &str, created_at: chrono::NaiveDateTime) {
        self.emails.insert(fold_email(email), id);
        self.users.insert(
            id,
            User {
                id,
                email: fold_email(email),
                display_name: display_name.to_string(),
                created_at,
            },
        );
    }

    /// Drop an identity and everything it owns. Caller holds every board's write lock.
    pub fn apply_user_deleted<G>(&self, boards: &mut [G], id: &UserId) -> usize
    where
        G: DerefMut<Target = SlotBoard>,
    {
        let mut removed = 0;
        for board in boards.iter_mut() {
            for r in board.remove_owned_by(id) {
                self.locations.remove(&r.id);
                removed += 1;
            }
        }
        if let Some((_, user)) = self.users.remove(id) {
            self.emails.remove_if(&user.email, |_, owner| owner == id);
        }
        removed
    }

    /// Rebuild state from WAL records. We are the sole owner of the boards here,
    /// so `try_write` never contends.
    pub fn replay(&self, events: &[Event]) {
        for event in events {
            match event {
                Event::UserRegistered {
                    id,
                    email,
                    display_name,
                    created_at,
                } => self.apply_user_registered(*id, email, display_name, *created_at),
                Event::UserDeleted { id } => {
                    let mut guards: Vec<_> = self
                        .boards
                        .iter()
                        .filter_map(|b| b.try_write().ok())
                        .collect();
                    self.apply_user_deleted(guards.as_mut_slice(), id);
                }
                Event::ReservationCreated { resource, .. } | Event::ReservationCancelled { resource, .. } => {
                    if let Ok(mut guard) = self.boards[resource.index()].try_write() {
                        self.apply_to_board(&mut guard, event);
                    }
                }
                Event::IdWatermark { next_reservation_id } => {
                    self.bump_reservation_id(*next_reservation_id);
                }
            }
        }
    }
}

pub fn fold_email(email: &str) -> String {
    email.trim().to_lowercase()
}
