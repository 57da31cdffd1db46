use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Optimistic-concurrency row version. Fresh rows start at 1.
pub type Version = u64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Reservation window `[start, end]`. Both bounds are valid entry instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn covers(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

// ── Registry rows ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub city: String,
    pub zip: String,
    pub street: String,
}

impl Address {
    pub fn new(city: impl Into<String>, zip: impl Into<String>, street: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            zip: zip.into(),
            street: street.into(),
        }
    }

    /// Normalized uniqueness key: trimmed, case-insensitive.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.city.trim().to_lowercase(),
            self.zip.trim().to_lowercase(),
            self.street.trim().to_lowercase()
        )
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {} {}", self.street, self.zip, self.city)
    }
}

/// How an unbooked entry picks a sector. Stored per parking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationPolicy {
    /// Spread load: fewest occupied places wins.
    #[default]
    LeastOccupied,
    /// Consolidate load so other sectors can drain for deactivation.
    MostOccupied,
    /// Fewest occupied places per unit of weight wins.
    LeastOccupiedWeighted,
}

impl AllocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPolicy::LeastOccupied => "least_occupied",
            AllocationPolicy::MostOccupied => "most_occupied",
            AllocationPolicy::LeastOccupiedWeighted => "least_occupied_weighted",
        }
    }
}

impl FromStr for AllocationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "least_occupied" => Ok(AllocationPolicy::LeastOccupied),
            "most_occupied" => Ok(AllocationPolicy::MostOccupied),
            "least_occupied_weighted" => Ok(AllocationPolicy::LeastOccupiedWeighted),
            other => Err(format!("unknown allocation policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parking {
    pub id: Ulid,
    pub address: Address,
    /// Sector ids in creation order. Allocation ties resolve in this order.
    pub sectors: Vec<Ulid>,
    pub policy: AllocationPolicy,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectorType {
    Covered,
    Uncovered,
    Underground,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    pub id: Ulid,
    pub parking_id: Ulid,
    pub name: String,
    pub kind: SectorType,
    pub max_places: u32,
    pub available_places: u32,
    /// Priority factor for weighted allocation. Always > 0.
    pub weight: u32,
    pub active: bool,
    /// Scheduled (or past) moment the sector stops accepting allocations.
    pub deactivation_time: Option<Ms>,
    pub version: Version,
}

impl Sector {
    pub fn occupied(&self) -> u32 {
        self.max_places.saturating_sub(self.available_places)
    }

    pub fn is_active_at(&self, now: Ms) -> bool {
        self.active && self.deactivation_time.is_none_or(|t| now < t)
    }
}

/// Sector names look like `AB-01`: two uppercase letters, a dash, two digits.
pub fn is_valid_sector_name(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() == 5
        && b[0].is_ascii_uppercase()
        && b[1].is_ascii_uppercase()
        && b[2] == b'-'
        && b[3].is_ascii_digit()
        && b[4].is_ascii_digit()
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Created,
    Cancelled,
    Expired,
    Ended,
}

impl ReservationStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Created)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Created => "CREATED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Expired => "EXPIRED",
            ReservationStatus::Ended => "ENDED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    /// `None` for anonymous drive-ins; those exit with the allocation code.
    pub client_id: Option<Ulid>,
    pub parking_id: Ulid,
    pub sector_id: Ulid,
    pub window: Span,
    pub status: ReservationStatus,
    /// False for reservations created implicitly by an unbooked entry.
    pub booked: bool,
    pub allocation_code: Option<String>,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Entry,
    Exit,
}

/// Append-only gate log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingEvent {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub at: Ms,
    pub kind: EventKind,
    /// Exit synthesized by the sweeper rather than observed at the gate.
    pub forced: bool,
}

impl ParkingEvent {
    pub fn entry(reservation_id: Ulid, at: Ms) -> Self {
        Self {
            id: Ulid::new(),
            reservation_id,
            at,
            kind: EventKind::Entry,
            forced: false,
        }
    }

    pub fn exit(reservation_id: Ulid, at: Ms, forced: bool) -> Self {
        Self {
            id: Ulid::new(),
            reservation_id,
            at,
            kind: EventKind::Exit,
            forced,
        }
    }
}

/// A reservation occupies a place while it is CREATED and its latest gate
/// event is an ENTRY. Never stored; always derived from the log.
pub fn is_occupying(reservation: &Reservation, events: &[ParkingEvent]) -> bool {
    reservation.status == ReservationStatus::Created
        && events.last().is_some_and(|e| e.kind == EventKind::Entry)
}

pub fn has_entered(events: &[ParkingEvent]) -> bool {
    events.iter().any(|e| e.kind == EventKind::Entry)
}

// ── Execution context ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Client(Ulid),
    Admin(Ulid),
    Anonymous,
    /// Scheduled jobs. Carries no end-user identity.
    System,
}

impl Caller {
    pub fn client_id(&self) -> Option<Ulid> {
        match self {
            Caller::Client(id) | Caller::Admin(id) => Some(*id),
            Caller::Anonymous | Caller::System => None,
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, Caller::Admin(_) | Caller::System)
    }
}

/// Who is calling and at what instant. Passed into every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub caller: Caller,
    pub now: Ms,
}

impl ExecutionContext {
    pub fn new(caller: Caller, now: Ms) -> Self {
        Self { caller, now }
    }

    pub fn client(id: Ulid) -> Self {
        Self::new(Caller::Client(id), now_ms())
    }

    pub fn admin(id: Ulid) -> Self {
        Self::new(Caller::Admin(id), now_ms())
    }

    pub fn anonymous() -> Self {
        Self::new(Caller::Anonymous, now_ms())
    }

    pub fn system(now: Ms) -> Self {
        Self::new(Caller::System, now)
    }

    /// Same caller, different clock reading.
    pub fn at(self, now: Ms) -> Self {
        Self { now, ..self }
    }
}

// ── WAL record format ────────────────────────────────────────────

/// One row-level write. A committed transaction is a list of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Write {
    PutParking(Parking),
    DeleteParking { id: Ulid },
    PutSector(Sector),
    DeleteSector { id: Ulid },
    PutReservation(Reservation),
    AppendEvent(ParkingEvent),
}

/// The WAL record: every write of one transaction, replayed all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub writes: Vec<Write>,
}

// ── Query result types ───────────────────────────────────────────

/// Returned by both entry paths. The code is needed to exit anonymously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryTicket {
    pub reservation_id: Ulid,
    pub allocation_code: String,
    pub parking_id: Ulid,
    pub sector_id: Ulid,
    pub sector_name: String,
    pub entered_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: usize,
    pub size: usize,
}

impl Page {
    pub fn new(number: usize, size: usize) -> Self {
        let size = size.clamp(1, crate::limits::MAX_PAGE_SIZE);
        Self { number, size }
    }

    pub fn first() -> Self {
        Self::new(0, crate::limits::DEFAULT_PAGE_SIZE)
    }

    pub fn slice<T: Clone>(&self, all: &[T]) -> Paged<T> {
        let start = self.number.saturating_mul(self.size).min(all.len());
        let end = (start + self.size).min(all.len());
        Paged {
            items: all[start..end].to_vec(),
            total: all.len(),
            page: *self,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: Page,
}
