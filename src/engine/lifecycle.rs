use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability::observe;

use super::allocation::choose;
use super::ledger::{release_slot, reserve_slot};
use super::store::Txn;
use super::{require_privileged, Engine, EngineError, Entity};

/// Short code printed on the ticket. Taken from the random part of a ULID.
fn allocation_code() -> String {
    Ulid::new().to_string()[18..].to_string()
}

fn validate_window(begin: Ms, end: Ms, now: Ms, max: Ms) -> Result<Span, EngineError> {
    if begin < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if begin >= end {
        return Err(EngineError::InvalidTimeframe);
    }
    if end - begin > max {
        return Err(EngineError::DurationExceeded { max });
    }
    if begin < now {
        return Err(EngineError::BeginInPast);
    }
    Ok(Span::new(begin, end))
}

fn ensure_owner(ctx: &ExecutionContext, reservation: &Reservation) -> Result<(), EngineError> {
    if ctx.caller.is_privileged() {
        return Ok(());
    }
    match (ctx.caller.client_id(), reservation.client_id) {
        (Some(caller), Some(owner)) if caller == owner => Ok(()),
        _ => Err(EngineError::NotOwner(reservation.id)),
    }
}

/// Client-owned stays need the owner; anonymous ones need the ticket code.
/// A code, when given, must always match.
fn authorize_exit(
    ctx: &ExecutionContext,
    reservation: &Reservation,
    code: Option<&str>,
) -> Result<(), EngineError> {
    if let Some(code) = code
        && reservation.allocation_code.as_deref() != Some(code)
    {
        return Err(EngineError::AllocationCodeMismatch(reservation.id));
    }
    match reservation.client_id {
        Some(_) => ensure_owner(ctx, reservation),
        None if code.is_some() || ctx.caller.is_privileged() => Ok(()),
        None => Err(EngineError::AllocationCodeMismatch(reservation.id)),
    }
}

impl Engine {
    fn load_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.store
            .reservation(&id)
            .ok_or(EngineError::NotFound(Entity::Reservation, id))
    }

    fn load_sector(&self, id: Ulid) -> Result<Sector, EngineError> {
        self.store
            .sector(&id)
            .ok_or(EngineError::NotFound(Entity::Sector, id))
    }

    // ── Booking ──────────────────────────────────────────────

    /// Book a sector for a future window. No place is taken until entry.
    pub async fn make_reservation(
        &self,
        ctx: &ExecutionContext,
        sector_id: Ulid,
        begin: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result: Result<Reservation, EngineError> = async {
            let client_id = ctx
                .caller
                .client_id()
                .ok_or(EngineError::Forbidden("booking requires a client account"))?;
            let window = validate_window(begin, end, ctx.now, self.config.max_reservation_ms)?;
            self.with_contention_retry("make_reservation", || {
                self.book_once(ctx, client_id, sector_id, window)
            })
            .await
        }
        .await;
        observe("make_reservation", started, &result);
        if let Ok(r) = &result {
            info!("reservation {} booked on sector {sector_id} for {:?}", r.id, r.window);
            self.notify(
                r.client_id,
                Notification::ReservationCreated {
                    reservation_id: r.id,
                    sector_id,
                    begin: r.window.start,
                    end: r.window.end,
                },
            )
            .await;
        }
        result
    }

    async fn book_once(
        &self,
        ctx: &ExecutionContext,
        client_id: Ulid,
        sector_id: Ulid,
        window: Span,
    ) -> Result<Reservation, EngineError> {
        let sector = self.load_sector(sector_id)?;
        if !sector.is_active_at(ctx.now)
            || sector.deactivation_time.is_some_and(|t| t < window.end)
        {
            return Err(EngineError::SectorInactive(sector_id));
        }

        let overlapping = self
            .store
            .reservations_for_sector(&sector_id)
            .iter()
            .filter(|r| r.status == ReservationStatus::Created && r.window.overlaps(&window))
            .count();
        if overlapping >= sector.max_places as usize {
            return Err(EngineError::CapacityExhausted(sector_id));
        }

        let mut txn = Txn::new();
        // Version bump only: serializes admissions to the same sector.
        txn.update_sector(sector.clone());
        let reservation = txn.insert_reservation(Reservation {
            id: Ulid::new(),
            client_id: Some(client_id),
            parking_id: sector.parking_id,
            sector_id,
            window,
            status: ReservationStatus::Created,
            booked: true,
            allocation_code: None,
            version: 0,
        });
        self.store.commit(txn).await?;
        Ok(reservation)
    }

    pub async fn cancel_reservation(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result: Result<Reservation, EngineError> = async {
            let reservation = self.load_reservation(reservation_id)?;
            ensure_owner(ctx, &reservation)?;
            if reservation.status != ReservationStatus::Created {
                return Err(EngineError::InvalidStatus {
                    id: reservation_id,
                    status: reservation.status,
                    action: "cancel",
                });
            }
            if has_entered(&self.store.events(&reservation_id)) {
                return Err(EngineError::AlreadyEntered(reservation_id));
            }

            let mut txn = Txn::new();
            let cancelled = txn.update_reservation(Reservation {
                status: ReservationStatus::Cancelled,
                ..reservation
            });
            self.store.commit(txn).await?;
            Ok(cancelled)
        }
        .await;
        observe("cancel_reservation", started, &result);
        if let Ok(r) = &result {
            info!("reservation {reservation_id} cancelled");
            self.notify(
                r.client_id,
                Notification::ReservationCancelled {
                    reservation_id,
                },
            )
            .await;
        }
        result
    }

    // ── Entry ────────────────────────────────────────────────

    /// Drive in on a booking. Takes one place in the booked sector.
    pub async fn enter_with_reservation(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<EntryTicket, EngineError> {
        let started = Instant::now();
        let result = self
            .with_contention_retry("enter_with_reservation", || {
                self.enter_booked_once(ctx, reservation_id)
            })
            .await;
        observe("enter_with_reservation", started, &result);
        if let Ok(t) = &result {
            info!("reservation {reservation_id} entered sector {}", t.sector_name);
        }
        result
    }

    async fn enter_booked_once(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<EntryTicket, EngineError> {
        let reservation = self.load_reservation(reservation_id)?;
        ensure_owner(ctx, &reservation)?;
        if reservation.status != ReservationStatus::Created {
            return Err(EngineError::InvalidStatus {
                id: reservation_id,
                status: reservation.status,
                action: "enter",
            });
        }
        if is_occupying(&reservation, &self.store.events(&reservation_id)) {
            return Err(EngineError::AlreadyOccupying(reservation_id));
        }
        if ctx.now < reservation.window.start {
            return Err(EngineError::ReservationNotStarted(reservation_id));
        }
        if ctx.now > reservation.window.end {
            return Err(EngineError::ReservationExpired(reservation_id));
        }

        let sector = self.load_sector(reservation.sector_id)?;
        let taken = reserve_slot(&sector, ctx.now)?;
        let code = allocation_code();

        let mut txn = Txn::new();
        txn.update_sector(taken);
        txn.update_reservation(Reservation {
            allocation_code: Some(code.clone()),
            ..reservation
        });
        txn.append_event(ParkingEvent::entry(reservation_id, ctx.now));
        self.store.commit(txn).await?;

        Ok(EntryTicket {
            reservation_id,
            allocation_code: code,
            parking_id: sector.parking_id,
            sector_id: sector.id,
            sector_name: sector.name,
            entered_at: ctx.now,
        })
    }

    /// Drive in without a booking. The parking's policy picks the sector and
    /// an implicit reservation records the stay.
    pub async fn enter_without_reservation(
        &self,
        ctx: &ExecutionContext,
        parking_id: Ulid,
        anonymous: bool,
    ) -> Result<EntryTicket, EngineError> {
        let started = Instant::now();
        let client_id = if anonymous { None } else { ctx.caller.client_id() };
        let result = self
            .with_contention_retry("enter_without_reservation", || {
                self.enter_unbooked_once(ctx, parking_id, client_id)
            })
            .await;
        observe("enter_without_reservation", started, &result);
        match &result {
            Ok(t) => info!(
                "drive-in {} allocated sector {} of parking {parking_id}",
                t.reservation_id, t.sector_name
            ),
            Err(e) => debug!("drive-in to parking {parking_id} refused: {e}"),
        }
        result
    }

    async fn enter_unbooked_once(
        &self,
        ctx: &ExecutionContext,
        parking_id: Ulid,
        client_id: Option<Ulid>,
    ) -> Result<EntryTicket, EngineError> {
        let parking = self
            .store
            .parking(&parking_id)
            .ok_or(EngineError::NotFound(Entity::Parking, parking_id))?;
        let sectors = self.store.sectors_of(&parking);
        let sector = choose(parking.policy, &sectors, ctx.now)
            .ok_or(EngineError::CannotEnterParking(parking_id))?;
        let taken = reserve_slot(sector, ctx.now)?;
        let code = allocation_code();

        let mut txn = Txn::new();
        txn.update_sector(taken);
        let reservation = txn.insert_reservation(Reservation {
            id: Ulid::new(),
            client_id,
            parking_id,
            sector_id: sector.id,
            window: Span::new(ctx.now, ctx.now + self.config.max_reservation_ms),
            status: ReservationStatus::Created,
            booked: false,
            allocation_code: Some(code.clone()),
            version: 0,
        });
        txn.append_event(ParkingEvent::entry(reservation.id, ctx.now));
        self.store.commit(txn).await?;

        Ok(EntryTicket {
            reservation_id: reservation.id,
            allocation_code: code,
            parking_id,
            sector_id: sector.id,
            sector_name: sector.name.clone(),
            entered_at: ctx.now,
        })
    }

    // ── Exit ─────────────────────────────────────────────────

    /// Drive out. Frees the place; ends the reservation when asked to, or
    /// always for drive-ins. A booked stay left open can be re-entered
    /// within its window.
    pub async fn exit_parking(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
        allocation_code: Option<&str>,
        end_reservation: bool,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self
            .with_contention_retry("exit_parking", || {
                self.exit_once(ctx, reservation_id, allocation_code, end_reservation)
            })
            .await;
        observe("exit_parking", started, &result);
        if let Ok(r) = &result {
            info!("reservation {reservation_id} exited, status {}", r.status);
        }
        result
    }

    async fn exit_once(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
        allocation_code: Option<&str>,
        end_reservation: bool,
    ) -> Result<Reservation, EngineError> {
        let reservation = self.load_reservation(reservation_id)?;
        authorize_exit(ctx, &reservation, allocation_code)?;
        if reservation.status != ReservationStatus::Created {
            return Err(EngineError::InvalidStatus {
                id: reservation_id,
                status: reservation.status,
                action: "exit",
            });
        }
        if !is_occupying(&reservation, &self.store.events(&reservation_id)) {
            return Err(EngineError::NotOccupying(reservation_id));
        }

        let sector = self.load_sector(reservation.sector_id)?;
        let freed = release_slot(&sector)?;
        let status = if end_reservation || !reservation.booked {
            ReservationStatus::Ended
        } else {
            reservation.status
        };

        let mut txn = Txn::new();
        txn.update_sector(freed);
        let updated = txn.update_reservation(Reservation {
            status,
            ..reservation
        });
        txn.append_event(ParkingEvent::exit(reservation_id, ctx.now, false));
        self.store.commit(txn).await?;
        Ok(updated)
    }

    // ── Termination paths used by the sweeper ────────────────
    //
    // Each re-reads and re-checks its precondition, so a reservation that a
    // user moved on in the meantime is skipped (`Ok(false)`), and running
    // the same pass twice changes nothing.

    /// CREATED, never entered, window over → EXPIRED.
    pub async fn expire_reservation(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<bool, EngineError> {
        require_privileged(ctx)?;
        let expired = self
            .with_contention_retry("expire_reservation", || {
                self.expire_once(ctx, reservation_id)
            })
            .await?;
        if let Some(reservation) = &expired {
            self.notify(
                reservation.client_id,
                Notification::ReservationExpired { reservation_id },
            )
            .await;
        }
        Ok(expired.is_some())
    }

    async fn expire_once(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<Option<Reservation>, EngineError> {
        let Some(reservation) = self.store.reservation(&reservation_id) else {
            return Ok(None);
        };
        if reservation.status != ReservationStatus::Created
            || reservation.window.end >= ctx.now
            || has_entered(&self.store.events(&reservation_id))
        {
            return Ok(None);
        }

        let mut txn = Txn::new();
        let expired = txn.update_reservation(Reservation {
            status: ReservationStatus::Expired,
            ..reservation
        });
        self.store.commit(txn).await?;
        Ok(Some(expired))
    }

    /// Still inside past `end + grace` → synthesized EXIT, place freed, ENDED.
    pub async fn force_exit(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<bool, EngineError> {
        require_privileged(ctx)?;
        let forced = self
            .with_contention_retry("force_exit", || self.force_exit_once(ctx, reservation_id))
            .await?;
        if let Some(reservation) = &forced {
            self.notify(
                reservation.client_id,
                Notification::ForcedExit {
                    reservation_id,
                    sector_id: reservation.sector_id,
                    at: ctx.now,
                },
            )
            .await;
        }
        Ok(forced.is_some())
    }

    async fn force_exit_once(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<Option<Reservation>, EngineError> {
        let Some(reservation) = self.store.reservation(&reservation_id) else {
            return Ok(None);
        };
        if !is_occupying(&reservation, &self.store.events(&reservation_id))
            || ctx.now <= reservation.window.end + self.config.grace_ms
        {
            return Ok(None);
        }

        let sector = self.load_sector(reservation.sector_id)?;
        let freed = release_slot(&sector)?;
        let mut txn = Txn::new();
        txn.update_sector(freed);
        let ended = txn.update_reservation(Reservation {
            status: ReservationStatus::Ended,
            ..reservation
        });
        txn.append_event(ParkingEvent::exit(reservation_id, ctx.now, true));
        self.store.commit(txn).await?;
        Ok(Some(ended))
    }

    /// Booked stay that was entered and left without ending, window over → ENDED.
    pub async fn close_finished(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<bool, EngineError> {
        require_privileged(ctx)?;
        self.with_contention_retry("close_finished", || self.close_finished_once(ctx, reservation_id))
            .await
    }

    async fn close_finished_once(
        &self,
        ctx: &ExecutionContext,
        reservation_id: Ulid,
    ) -> Result<bool, EngineError> {
        let Some(reservation) = self.store.reservation(&reservation_id) else {
            return Ok(false);
        };
        let events = self.store.events(&reservation_id);
        if reservation.status != ReservationStatus::Created
            || reservation.window.end >= ctx.now
            || !has_entered(&events)
            || is_occupying(&reservation, &events)
        {
            return Ok(false);
        }

        let mut txn = Txn::new();
        txn.update_reservation(Reservation {
            status: ReservationStatus::Ended,
            ..reservation
        });
        self.store.commit(txn).await?;
        Ok(true)
    }
}
