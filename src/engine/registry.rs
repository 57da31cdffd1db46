use std::time::Instant;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::observe;

use super::store::Txn;
use super::{check_version, require_privileged, Engine, EngineError, Entity, FieldViolation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSector {
    pub name: String,
    pub kind: SectorType,
    pub max_places: u32,
    pub weight: u32,
}

/// Full replacement of a sector's editable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorUpdate {
    pub name: String,
    pub kind: SectorType,
    pub max_places: u32,
    pub weight: u32,
}

fn address_violations(address: &Address) -> Vec<FieldViolation> {
    let mut v = Vec::new();
    for (field, value, max) in [
        ("city", &address.city, MAX_CITY_LEN),
        ("zip", &address.zip, MAX_ZIP_LEN),
        ("street", &address.street, MAX_STREET_LEN),
    ] {
        if value.trim().is_empty() {
            v.push(FieldViolation::new(field, "must not be blank"));
        } else if value.len() > max {
            v.push(FieldViolation::new(field, format!("at most {max} characters")));
        }
    }
    if !address
        .zip
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == ' ')
    {
        v.push(FieldViolation::new("zip", "letters, digits, dashes and spaces only"));
    }
    v
}

fn sector_violations(name: &str, max_places: u32, weight: u32) -> Vec<FieldViolation> {
    let mut v = Vec::new();
    if !is_valid_sector_name(name) {
        v.push(FieldViolation::new("name", "expected two letters, a dash and two digits, e.g. AB-01"));
    }
    if max_places == 0 || max_places > MAX_PLACES_PER_SECTOR {
        v.push(FieldViolation::new(
            "max_places",
            format!("must be between 1 and {MAX_PLACES_PER_SECTOR}"),
        ));
    }
    if weight == 0 || weight > MAX_SECTOR_WEIGHT {
        v.push(FieldViolation::new(
            "weight",
            format!("must be between 1 and {MAX_SECTOR_WEIGHT}"),
        ));
    }
    v
}

fn reject_invalid(violations: Vec<FieldViolation>) -> Result<(), EngineError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Invalid(violations))
    }
}

impl Engine {
    fn load_parking(&self, id: Ulid) -> Result<Parking, EngineError> {
        self.store
            .parking(&id)
            .ok_or(EngineError::NotFound(Entity::Parking, id))
    }

    fn sector_row(&self, id: Ulid) -> Result<Sector, EngineError> {
        self.store
            .sector(&id)
            .ok_or(EngineError::NotFound(Entity::Sector, id))
    }

    fn ensure_unique_name(
        &self,
        parking: &Parking,
        name: &str,
        except: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let taken = self
            .store
            .sectors_of(parking)
            .iter()
            .any(|s| s.name == name && Some(s.id) != except);
        if taken {
            Err(EngineError::SectorNameTaken(name.to_string()))
        } else {
            Ok(())
        }
    }

    // ── Parkings ─────────────────────────────────────────────

    pub async fn create_parking(
        &self,
        ctx: &ExecutionContext,
        address: Address,
        policy: Option<AllocationPolicy>,
    ) -> Result<Parking, EngineError> {
        let started = Instant::now();
        let result: Result<Parking, EngineError> = async {
            require_privileged(ctx)?;
            reject_invalid(address_violations(&address))?;

            let mut txn = Txn::new();
            let id = Ulid::new();
            txn.claim_address(address.key(), id);
            let parking = txn.insert_parking(Parking {
                id,
                address,
                sectors: Vec::new(),
                policy: policy.unwrap_or(self.config.default_policy),
                version: 0,
            });
            self.store.commit(txn).await?;
            Ok(parking)
        }
        .await;
        observe("create_parking", started, &result);
        if let Ok(p) = &result {
            info!("parking {} created at {}", p.id, p.address);
        }
        result
    }

    pub async fn update_parking(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
        expected_version: Version,
        address: Address,
        policy: AllocationPolicy,
    ) -> Result<Parking, EngineError> {
        let started = Instant::now();
        let result: Result<Parking, EngineError> = async {
            require_privileged(ctx)?;
            reject_invalid(address_violations(&address))?;
            let parking = self.load_parking(id)?;
            check_version(Entity::Parking, id, expected_version, parking.version)?;

            let mut txn = Txn::new();
            txn.claim_address(address.key(), id);
            let updated = txn.update_parking(Parking {
                address,
                policy,
                ..parking
            });
            self.store.commit(txn).await?;
            Ok(updated)
        }
        .await;
        observe("update_parking", started, &result);
        result
    }

    /// Removes the parking and all its sectors. Refused once any sector has
    /// seen a reservation.
    pub async fn delete_parking(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
        expected_version: Version,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result: Result<(), EngineError> = async {
            require_privileged(ctx)?;
            let parking = self.load_parking(id)?;
            check_version(Entity::Parking, id, expected_version, parking.version)?;
            let sectors = self.store.sectors_of(&parking);
            if sectors.iter().any(|s| self.store.sector_has_history(&s.id)) {
                return Err(EngineError::HasReservationHistory(Entity::Parking, id));
            }

            let mut txn = Txn::new();
            for sector in &sectors {
                txn.delete_sector(sector);
            }
            txn.delete_parking(&parking);
            self.store.commit(txn).await?;
            Ok(())
        }
        .await;
        observe("delete_parking", started, &result);
        if result.is_ok() {
            info!("parking {id} deleted");
        }
        result
    }

    // ── Sectors ──────────────────────────────────────────────

    /// New sectors start active and empty.
    pub async fn add_sector(
        &self,
        ctx: &ExecutionContext,
        parking_id: Ulid,
        new: NewSector,
    ) -> Result<Sector, EngineError> {
        let started = Instant::now();
        let result: Result<Sector, EngineError> = async {
            require_privileged(ctx)?;
            reject_invalid(sector_violations(&new.name, new.max_places, new.weight))?;
            let parking = self.load_parking(parking_id)?;
            if parking.sectors.len() >= MAX_SECTORS_PER_PARKING {
                return Err(EngineError::LimitExceeded("too many sectors in parking"));
            }
            self.ensure_unique_name(&parking, &new.name, None)?;

            let sector = Sector {
                id: Ulid::new(),
                parking_id,
                name: new.name,
                kind: new.kind,
                max_places: new.max_places,
                available_places: new.max_places,
                weight: new.weight,
                active: true,
                deactivation_time: None,
                version: 0,
            };
            let mut parking = parking;
            parking.sectors.push(sector.id);

            // The parking row's version guards name uniqueness.
            let mut txn = Txn::new();
            txn.update_parking(parking);
            let sector = txn.insert_sector(sector);
            self.store.commit(txn).await?;
            Ok(sector)
        }
        .await;
        observe("add_sector", started, &result);
        if let Ok(s) = &result {
            info!("sector {} ({}) added to parking {parking_id}", s.name, s.id);
        }
        result
    }

    /// Type and max places are frozen while the sector is active. A new max
    /// keeps current occupancy and must not drop below it.
    pub async fn update_sector(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
        expected_version: Version,
        update: SectorUpdate,
    ) -> Result<Sector, EngineError> {
        let started = Instant::now();
        let result: Result<Sector, EngineError> = async {
            require_privileged(ctx)?;
            reject_invalid(sector_violations(&update.name, update.max_places, update.weight))?;
            let sector = self.sector_row(id)?;
            check_version(Entity::Sector, id, expected_version, sector.version)?;

            let reshaped = update.kind != sector.kind || update.max_places != sector.max_places;
            if reshaped && sector.is_active_at(ctx.now) {
                return Err(EngineError::SectorEditOfTypeOrMaxPlacesWhenActive(id));
            }
            let occupied = sector.occupied();
            if update.max_places < occupied {
                return Err(EngineError::OccupancyAboveMaxPlaces { sector: id, occupied });
            }

            let mut txn = Txn::new();
            if update.name != sector.name {
                let parking = self.load_parking(sector.parking_id)?;
                self.ensure_unique_name(&parking, &update.name, Some(id))?;
                txn.update_parking(parking);
            }
            let updated = txn.update_sector(Sector {
                name: update.name,
                kind: update.kind,
                max_places: update.max_places,
                available_places: update.max_places - occupied,
                weight: update.weight,
                ..sector
            });
            self.store.commit(txn).await?;
            Ok(updated)
        }
        .await;
        observe("update_sector", started, &result);
        result
    }

    pub async fn activate_sector(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
        expected_version: Version,
    ) -> Result<Sector, EngineError> {
        let started = Instant::now();
        let result: Result<Sector, EngineError> = async {
            require_privileged(ctx)?;
            let sector = self.sector_row(id)?;
            check_version(Entity::Sector, id, expected_version, sector.version)?;
            if sector.is_active_at(ctx.now) {
                return Err(EngineError::SectorAlreadyActive(id));
            }

            let mut txn = Txn::new();
            let activated = txn.update_sector(Sector {
                active: true,
                deactivation_time: None,
                ..sector
            });
            self.store.commit(txn).await?;
            Ok(activated)
        }
        .await;
        observe("activate_sector", started, &result);
        if result.is_ok() {
            info!("sector {id} activated");
        }
        result
    }

    /// Stop allocating from `at` on. `at == now` takes effect immediately;
    /// a later `at` is applied by the sweeper once it passes. Cars already
    /// inside stay until they leave.
    pub async fn deactivate_sector(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
        expected_version: Version,
        at: Ms,
    ) -> Result<Sector, EngineError> {
        let started = Instant::now();
        let result: Result<Sector, EngineError> = async {
            require_privileged(ctx)?;
            let sector = self.sector_row(id)?;
            check_version(Entity::Sector, id, expected_version, sector.version)?;
            if at < ctx.now {
                return Err(EngineError::SectorInvalidDeactivationTime);
            }
            if at > MAX_VALID_TIMESTAMP_MS {
                return Err(EngineError::LimitExceeded("timestamp out of range"));
            }
            if !sector.is_active_at(ctx.now) {
                return Err(EngineError::SectorAlreadyInactive(id));
            }

            let mut txn = Txn::new();
            let deactivated = txn.update_sector(Sector {
                active: at > ctx.now,
                deactivation_time: Some(at),
                ..sector
            });
            self.store.commit(txn).await?;
            Ok(deactivated)
        }
        .await;
        observe("deactivate_sector", started, &result);
        if result.is_ok() {
            info!("sector {id} deactivates at {at}");
        }
        result
    }

    pub async fn delete_sector(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
        expected_version: Version,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result: Result<(), EngineError> = async {
            require_privileged(ctx)?;
            let sector = self.sector_row(id)?;
            check_version(Entity::Sector, id, expected_version, sector.version)?;
            if self.store.sector_has_history(&id) {
                return Err(EngineError::HasReservationHistory(Entity::Sector, id));
            }
            let mut parking = self.load_parking(sector.parking_id)?;
            parking.sectors.retain(|s| *s != id);

            let mut txn = Txn::new();
            txn.update_parking(parking);
            txn.delete_sector(&sector);
            self.store.commit(txn).await?;
            Ok(())
        }
        .await;
        observe("delete_sector", started, &result);
        if result.is_ok() {
            info!("sector {id} deleted");
        }
        result
    }

    /// Clear the active flag of a sector whose deactivation time has passed.
    /// Used by the sweeper; a no-op when there is nothing to finalize.
    pub async fn finalize_deactivation(
        &self,
        ctx: &ExecutionContext,
        id: Ulid,
    ) -> Result<bool, EngineError> {
        require_privileged(ctx)?;
        let Some(sector) = self.store.sector(&id) else {
            return Ok(false);
        };
        if !sector.active || sector.deactivation_time.is_none_or(|t| t > ctx.now) {
            return Ok(false);
        }
        let mut txn = Txn::new();
        txn.update_sector(Sector {
            active: false,
            ..sector
        });
        self.store.commit(txn).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_rules() {
        assert!(address_violations(&Address::new("Lodz", "90-001", "Piotrkowska 1")).is_empty());

        let v = address_violations(&Address::new(" ", "90-001", ""));
        let fields: Vec<_> = v.iter().map(|f| f.field).collect();
        assert_eq!(fields, vec!["city", "street"]);

        let v = address_violations(&Address::new("Lodz", "90_001", "x"));
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].field, "zip");

        let long = "x".repeat(MAX_STREET_LEN + 1);
        assert_eq!(address_violations(&Address::new("Lodz", "1", &long))[0].field, "street");
    }

    #[test]
    fn sector_rules() {
        assert!(sector_violations("AB-01", 10, 1).is_empty());
        let v = sector_violations("ab1", 0, 0);
        let fields: Vec<_> = v.iter().map(|f| f.field).collect();
        assert_eq!(fields, vec!["name", "max_places", "weight"]);
        assert_eq!(sector_violations("AB-01", MAX_PLACES_PER_SECTOR + 1, 1).len(), 1);
    }

    #[test]
    fn invalid_carries_violations() {
        let err = reject_invalid(sector_violations("nope", 1, 1)).unwrap_err();
        assert_eq!(err.kind(), crate::engine::ErrorKind::Validation);
        assert_eq!(err.violations().len(), 1);
        assert!(err.to_string().contains("name"));
    }
}
