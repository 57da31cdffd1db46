use ulid::Ulid;

use crate::model::{Ms, ReservationStatus, Version};

use super::store::{RowKey, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Parking,
    Sector,
    Reservation,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Parking => "parking",
            Entity::Sector => "sector",
            Entity::Reservation => "reservation",
        })
    }
}

/// Coarse error category seen by the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    StatusViolation,
    TimeViolation,
    OwnershipViolation,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StatusViolation => "status_violation",
            ErrorKind::TimeViolation => "time_violation",
            ErrorKind::OwnershipViolation => "ownership_violation",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: &'static str,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Entity, Ulid),

    // conflicts
    AddressTaken(String),
    SectorNameTaken(String),
    SectorAlreadyActive(Ulid),
    SectorAlreadyInactive(Ulid),
    SectorInactive(Ulid),
    SectorEditOfTypeOrMaxPlacesWhenActive(Ulid),
    OccupancyAboveMaxPlaces { sector: Ulid, occupied: u32 },
    HasReservationHistory(Entity, Ulid),
    CapacityExhausted(Ulid),
    CannotEnterParking(Ulid),
    VersionMismatch {
        entity: Entity,
        id: Ulid,
        expected: Option<Version>,
        actual: Option<Version>,
    },

    // status
    InvalidStatus {
        id: Ulid,
        status: ReservationStatus,
        action: &'static str,
    },
    AlreadyEntered(Ulid),
    AlreadyOccupying(Ulid),
    NotOccupying(Ulid),

    // time
    InvalidTimeframe,
    DurationExceeded { max: Ms },
    BeginInPast,
    ReservationNotStarted(Ulid),
    ReservationExpired(Ulid),
    SectorInvalidDeactivationTime,

    // ownership
    NotOwner(Ulid),
    AllocationCodeMismatch(Ulid),
    Forbidden(&'static str),

    // validation
    Invalid(Vec<FieldViolation>),
    LimitExceeded(&'static str),

    // internal
    CapacityOverflow(Ulid),
    Wal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            NotFound(..) => ErrorKind::NotFound,
            AddressTaken(_)
            | SectorNameTaken(_)
            | SectorAlreadyActive(_)
            | SectorAlreadyInactive(_)
            | SectorInactive(_)
            | SectorEditOfTypeOrMaxPlacesWhenActive(_)
            | OccupancyAboveMaxPlaces { .. }
            | HasReservationHistory(..)
            | CapacityExhausted(_)
            | CannotEnterParking(_)
            | VersionMismatch { .. } => ErrorKind::Conflict,
            InvalidStatus { .. } | AlreadyEntered(_) | AlreadyOccupying(_) | NotOccupying(_) => {
                ErrorKind::StatusViolation
            }
            InvalidTimeframe
            | DurationExceeded { .. }
            | BeginInPast
            | ReservationNotStarted(_)
            | ReservationExpired(_)
            | SectorInvalidDeactivationTime => ErrorKind::TimeViolation,
            NotOwner(_) | AllocationCodeMismatch(_) | Forbidden(_) => {
                ErrorKind::OwnershipViolation
            }
            Invalid(_) | LimitExceeded(_) => ErrorKind::Validation,
            CapacityOverflow(_) | Wal(_) => ErrorKind::Internal,
        }
    }

    /// Field-level details, if any.
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            EngineError::Invalid(v) => v,
            _ => &[],
        }
    }

    /// Lost a compare-and-swap on a sector or reservation row that still exists.
    pub(super) fn is_row_contention(&self) -> bool {
        matches!(
            self,
            EngineError::VersionMismatch {
                entity: Entity::Sector | Entity::Reservation,
                actual: Some(_),
                ..
            }
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use EngineError::*;
        match self {
            NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            AddressTaken(addr) => write!(f, "a parking already exists at {addr}"),
            SectorNameTaken(name) => write!(f, "sector name {name} already used in this parking"),
            SectorAlreadyActive(id) => write!(f, "sector {id} is already active"),
            SectorAlreadyInactive(id) => write!(f, "sector {id} is already inactive"),
            SectorInactive(id) => write!(f, "sector {id} is not accepting reservations"),
            SectorEditOfTypeOrMaxPlacesWhenActive(id) => {
                write!(f, "cannot change type or max places of active sector {id}")
            }
            OccupancyAboveMaxPlaces { sector, occupied } => {
                write!(f, "sector {sector} has {occupied} occupied places, above the new maximum")
            }
            HasReservationHistory(entity, id) => {
                write!(f, "cannot delete {entity} {id}: it has reservation history")
            }
            CapacityExhausted(id) => write!(f, "no free places in sector {id}"),
            CannotEnterParking(id) => write!(f, "no sector of parking {id} can take a car"),
            VersionMismatch { entity, id, expected, actual } => write!(
                f,
                "{entity} {id} was modified concurrently (expected version {expected:?}, found {actual:?})"
            ),
            InvalidStatus { id, status, action } => {
                write!(f, "cannot {action} reservation {id} in status {status}")
            }
            AlreadyEntered(id) => write!(f, "reservation {id} has already been used to enter"),
            AlreadyOccupying(id) => write!(f, "reservation {id} is already inside the parking"),
            NotOccupying(id) => write!(f, "reservation {id} is not inside the parking"),
            InvalidTimeframe => write!(f, "reservation must begin before it ends"),
            DurationExceeded { max } => write!(f, "reservation longer than {max} ms"),
            BeginInPast => write!(f, "reservation cannot begin in the past"),
            ReservationNotStarted(id) => write!(f, "reservation {id} has not started yet"),
            ReservationExpired(id) => write!(f, "reservation {id} has expired"),
            SectorInvalidDeactivationTime => write!(f, "deactivation time cannot be in the past"),
            NotOwner(id) => write!(f, "reservation {id} belongs to another client"),
            AllocationCodeMismatch(id) => write!(f, "wrong allocation code for reservation {id}"),
            Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Invalid(violations) => {
                write!(f, "invalid request:")?;
                for v in violations {
                    write!(f, " {}: {};", v.field, v.message)?;
                }
                Ok(())
            }
            LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            CapacityOverflow(id) => {
                write!(f, "sector {id} would exceed its max places on release")
            }
            Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionMismatch { key, expected, actual } => {
                let (entity, id) = match key {
                    RowKey::Parking(id) => (Entity::Parking, id),
                    RowKey::Sector(id) => (Entity::Sector, id),
                    RowKey::Reservation(id) => (Entity::Reservation, id),
                    RowKey::Address(addr) => return EngineError::AddressTaken(addr),
                };
                EngineError::VersionMismatch { entity, id, expected, actual }
            }
            StoreError::AddressTaken(addr) => EngineError::AddressTaken(addr),
            StoreError::Wal(e) => EngineError::Wal(e),
        }
    }
}
