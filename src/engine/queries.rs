use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, Entity};

impl Engine {
    // ── Registry reads ───────────────────────────────────────

    pub fn get_parking(&self, id: Ulid) -> Result<Parking, EngineError> {
        self.store
            .parking(&id)
            .ok_or(EngineError::NotFound(Entity::Parking, id))
    }

    pub fn list_parkings(&self, page: Page) -> Paged<Parking> {
        page.slice(&self.store.parkings())
    }

    pub fn get_sector(&self, id: Ulid) -> Result<Sector, EngineError> {
        self.store
            .sector(&id)
            .ok_or(EngineError::NotFound(Entity::Sector, id))
    }

    /// Sectors in the parking's own order.
    pub fn list_sectors(&self, parking_id: Ulid, page: Page) -> Result<Paged<Sector>, EngineError> {
        let parking = self.get_parking(parking_id)?;
        Ok(page.slice(&self.store.sectors_of(&parking)))
    }

    // ── Reservation reads ────────────────────────────────────

    pub fn get_reservation(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let reservation = self
            .store
            .reservation(&id)
            .ok_or(EngineError::NotFound(Entity::Reservation, id))?;
        if !can_see(ctx, &reservation) {
            return Err(EngineError::NotOwner(id));
        }
        Ok(reservation)
    }

    /// Clients see their own reservations, operators see everything,
    /// anonymous callers see nothing.
    pub fn list_reservations(&self, ctx: &ExecutionContext, page: Page) -> Paged<Reservation> {
        let all = if ctx.caller.is_privileged() {
            self.store.reservations()
        } else if let Some(client_id) = ctx.caller.client_id() {
            let mut own = self.store.reservations_for_client(&client_id);
            own.sort_by_key(|r| r.id);
            own
        } else {
            Vec::new()
        };
        page.slice(&all)
    }

    /// Gate events of one reservation, oldest first.
    pub fn reservation_events(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
    ) -> Result<Vec<ParkingEvent>, EngineError> {
        self.get_reservation(ctx, id)?;
        Ok(self.store.events(&id))
    }

    pub fn is_occupying(&self, id: Ulid) -> Result<bool, EngineError> {
        let reservation = self
            .store
            .reservation(&id)
            .ok_or(EngineError::NotFound(Entity::Reservation, id))?;
        Ok(is_occupying(&reservation, &self.store.events(&id)))
    }

    /// Number of reservations inside the sector right now, counted from the
    /// event log rather than the ledger.
    pub fn sector_occupancy(&self, sector_id: Ulid) -> Result<u32, EngineError> {
        self.get_sector(sector_id)?;
        let count = self
            .store
            .reservations_for_sector(&sector_id)
            .iter()
            .filter(|r| is_occupying(r, &self.store.events(&r.id)))
            .count();
        Ok(count as u32)
    }

    // ── Sweeper scans ────────────────────────────────────────

    /// CREATED, window over, never entered.
    pub fn collect_expirable(&self, now: Ms) -> Vec<Ulid> {
        self.store
            .reservations()
            .into_iter()
            .filter(|r| {
                r.status == ReservationStatus::Created
                    && r.window.end < now
                    && !has_entered(&self.store.events(&r.id))
            })
            .map(|r| r.id)
            .collect()
    }

    /// Still inside after `end + grace`.
    pub fn collect_overstayed(&self, now: Ms) -> Vec<Ulid> {
        let grace = self.config.grace_ms;
        self.store
            .reservations()
            .into_iter()
            .filter(|r| r.window.end + grace < now && is_occupying(r, &self.store.events(&r.id)))
            .map(|r| r.id)
            .collect()
    }

    /// Entered at least once, currently outside, window over, still CREATED.
    pub fn collect_finished(&self, now: Ms) -> Vec<Ulid> {
        self.store
            .reservations()
            .into_iter()
            .filter(|r| {
                if r.status != ReservationStatus::Created || r.window.end >= now {
                    return false;
                }
                let events = self.store.events(&r.id);
                has_entered(&events) && !is_occupying(r, &events)
            })
            .map(|r| r.id)
            .collect()
    }

    /// Sectors still flagged active although their deactivation time passed.
    pub fn collect_lapsed_sectors(&self, now: Ms) -> Vec<Ulid> {
        self.store
            .sectors()
            .into_iter()
            .filter(|s| s.active && s.deactivation_time.is_some_and(|t| t <= now))
            .map(|s| s.id)
            .collect()
    }
}

fn can_see(ctx: &ExecutionContext, reservation: &Reservation) -> bool {
    ctx.caller.is_privileged()
        || (reservation.client_id.is_some() && reservation.client_id == ctx.caller.client_id())
}
