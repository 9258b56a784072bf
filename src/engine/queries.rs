use crate::model::*;

use super::validate::{parse_resource, require_fields};
use super::{BookingError, Engine};

impl Engine {
    /// The caller's upcoming reservations across all resources, soonest first.
    pub async fn list_mine(&self, caller: Option<UserId>) -> Result<Vec<Reservation>, BookingError> {
        let caller = caller.ok_or(BookingError::Unauthenticated)?;
        let now = self.clock.now();
        let mut mine = Vec::new();
        for board in self.store.boards() {
            let guard = board.read().await;
            mine.extend(
                guard
                    .iter()
                    .filter(|r| r.owner_id == caller && r.is_upcoming(now))
                    .cloned(),
            );
        }
        sort_by_slot(&mut mine);
        Ok(mine)
    }

    /// Upcoming occupied slots on one resource for one calendar day, with the
    /// caller's own subset. A malformed day matches nothing.
    pub async fn list_availability(
        &self,
        caller: Option<UserId>,
        resource_raw: &str,
        date_raw: &str,
    ) -> Result<Availability, BookingError> {
        let caller = caller.ok_or(BookingError::Unauthenticated)?;
        require_fields(&[resource_raw, date_raw])?;
        let resource = parse_resource(resource_raw)?;
        let Some(date) = parse_slot_date(date_raw) else {
            return Ok(Availability::default());
        };

        let now = self.clock.now();
        let board = self.store.board(resource);
        let guard = board.read().await;
        let mut result = Availability::default();
        for r in guard.on_date(date).filter(|r| r.is_upcoming(now)) {
            result.occupied.push(r.slot_time);
            if r.owner_id == caller {
                result.mine.push(r.slot_time);
            }
        }
        Ok(result)
    }

    /// Every stored reservation of `user_id`, past and upcoming, oldest first.
    /// Unauthenticated history view.
    pub async fn list_all_for_user(&self, user_id: UserId) -> Vec<Reservation> {
        let mut all = Vec::new();
        for board in self.store.boards() {
            let guard = board.read().await;
            all.extend(guard.iter().filter(|r| r.owner_id == user_id).cloned());
        }
        sort_by_slot(&mut all);
        all
    }

    pub fn resources(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL.to_vec()
    }

    // ── Identity lookups ─────────────────────────────────────

    /// Login identifier → caller identity. Unknown logins are anonymous.
    pub fn resolve_login(&self, email: &str) -> Option<UserId> {
        self.store.user_by_email(email)
    }

    pub fn find_user(&self, id: &UserId) -> Option<User> {
        self.store.user(id)
    }

    pub fn display_name(&self, id: &UserId) -> Option<String> {
        self.store.user(id).map(|u| u.display_name)
    }
}

/// Slot order; same instant on different resources falls back to resource order.
fn sort_by_slot(reservations: &mut [Reservation]) {
    reservations.sort_by_key(|r| (r.slot_time, r.resource));
}
