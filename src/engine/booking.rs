use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{RESERVATIONS_CANCELLED_TOTAL, RESERVATIONS_CREATED_TOTAL, RESERVATIONS_REJECTED_TOTAL};

use super::store::fold_email;
use super::validate::{check_horizon, check_len, check_no_conflict, parse_resource, parse_slot_time, require_fields};
use super::{BookingError, Engine};

impl Engine {
    /// Book `slot_raw` on `resource_raw` for the caller.
    ///
    /// Checks run in a fixed order and stop at the first failure: caller
    /// present, fields present, resource known, time parses, horizon, slot
    /// free, caller has a profile. The slot-free check here is only an early
    /// answer; the board's key check under the write lock is authoritative.
    pub async fn create_reservation(
        &self,
        caller: Option<UserId>,
        resource_raw: &str,
        slot_raw: &str,
    ) -> Result<Reservation, BookingError> {
        let result = self.try_create_reservation(caller, resource_raw, slot_raw).await;
        match &result {
            Ok(r) => {
                metrics::counter!(RESERVATIONS_CREATED_TOTAL, "resource" => r.resource.code()).increment(1);
                tracing::debug!("reservation {} created: {}/{} for {}", r.id, r.resource, r.slot_time, r.owner_id);
            }
            Err(e) => {
                metrics::counter!(RESERVATIONS_REJECTED_TOTAL, "reason" => e.code()).increment(1);
                tracing::debug!("reservation rejected ({resource_raw:?}, {slot_raw:?}): {e}");
            }
        }
        result
    }

    async fn try_create_reservation(
        &self,
        caller: Option<UserId>,
        resource_raw: &str,
        slot_raw: &str,
    ) -> Result<Reservation, BookingError> {
        let caller = caller.ok_or(BookingError::Unauthenticated)?;
        require_fields(&[resource_raw, slot_raw])?;
        let resource = parse_resource(resource_raw)?;
        let slot_time = parse_slot_time(slot_raw)?;
        let now = self.clock.now();
        check_horizon(slot_time, now)?;

        let board = self.store.board(resource);
        {
            let guard = board.read().await;
            check_no_conflict(&guard, slot_time, now)?;
        }

        let owner = self.store.user(&caller).ok_or(BookingError::OwnerNotFound)?;

        let mut guard = board.write().await;
        // Deleting a user takes every board lock, so this sees a settled directory.
        if !self.store.has_user(&caller) {
            return Err(BookingError::OwnerNotFound);
        }
        if guard.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(BookingError::LimitExceeded("too many reservations on resource"));
        }
        self.store
            .check_vacant(&guard, &slot_time)
            .map_err(|_| BookingError::SlotTaken)?;

        let reservation = Reservation {
            id: self.store.allocate_reservation_id(),
            owner_id: caller,
            resource,
            slot_time,
            display_name: owner.display_name,
            created_at: now,
        };
        let event = Event::ReservationCreated {
            id: reservation.id,
            owner_id: reservation.owner_id,
            resource,
            slot_time,
            display_name: reservation.display_name.clone(),
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(reservation)
    }

    /// Hard-delete a reservation the caller owns. Someone else's id and a
    /// missing id fail the same way.
    pub async fn cancel_reservation(&self, caller: Option<UserId>, id: ReservationId) -> Result<(), BookingError> {
        let caller = caller.ok_or(BookingError::Unauthenticated)?;
        let (resource, slot_time) = self.store.locate(&id).ok_or(BookingError::NotFound)?;

        let board = self.store.board(resource);
        let mut guard = board.write().await;
        match guard.get(&slot_time) {
            Some(r) if r.id == id && r.owner_id == caller => {}
            _ => return Err(BookingError::NotFound),
        }

        let event = Event::ReservationCancelled { id, resource, slot_time };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL).increment(1);
        tracing::debug!("reservation {id} cancelled by {caller}");
        Ok(())
    }

    // ── Identity adapter ─────────────────────────────────────

    pub async fn register_user(&self, email: &str, display_name: &str) -> Result<User, BookingError> {
        require_fields(&[email, display_name])?;
        let email = fold_email(email);
        let display_name = display_name.trim();
        check_len(&email, MAX_EMAIL_LEN, "email too long")?;
        check_len(display_name, MAX_DISPLAY_NAME_LEN, "display name too long")?;

        let _gate = self.directory_gate.read().await;
        if self.store.user_count() >= MAX_USERS_PER_VENUE {
            return Err(BookingError::LimitExceeded("too many users"));
        }

        let id = Ulid::new();
        self.store
            .claim_email(&email, id)
            .map_err(|_| BookingError::EmailTaken)?;

        let created_at = self.clock.now();
        let event = Event::UserRegistered {
            id,
            email: email.clone(),
            display_name: display_name.to_string(),
            created_at,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.store.release_email(&email, &id);
            return Err(e);
        }
        self.store.apply_user_registered(id, &email, display_name, created_at);
        tracing::debug!("user {id} registered");

        self.store.user(&id).ok_or(BookingError::UserNotFound)
    }

    /// Remove the caller's own identity together with all of its reservations,
    /// past and upcoming, as one record. Returns how many reservations went
    /// with it. Someone else's id fails exactly like a missing one.
    pub async fn delete_user(&self, caller: Option<UserId>, id: UserId) -> Result<usize, BookingError> {
        let caller = caller.ok_or(BookingError::Unauthenticated)?;
        if caller != id {
            return Err(BookingError::UserNotFound);
        }

        let _gate = self.directory_gate.read().await;
        let mut guards = Vec::with_capacity(ResourceKind::ALL.len());
        for board in self.store.boards() {
            guards.push(board.write_owned().await);
        }
        if !self.store.has_user(&id) {
            return Err(BookingError::UserNotFound);
        }

        self.wal_append(&Event::UserDeleted { id }).await?;
        let removed = self.store.apply_user_deleted(guards.as_mut_slice(), &id);
        tracing::debug!("user {id} deleted with {removed} reservations");
        Ok(removed)
    }
}
