use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

/// Lockable unit of a transaction. Ordering gives the global lock order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowKey {
    Parking(Ulid),
    Sector(Ulid),
    Reservation(Ulid),
    /// Normalized address; guards the uniqueness index, carries no version.
    Address(String),
}

#[derive(Debug)]
pub enum StoreError {
    /// The row changed (or appeared/vanished) since it was read.
    VersionMismatch {
        key: RowKey,
        expected: Option<Version>,
        actual: Option<Version>,
    },
    AddressTaken(String),
    Wal(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::VersionMismatch { key, expected, actual } => {
                write!(f, "version mismatch on {key:?}: expected {expected:?}, found {actual:?}")
            }
            StoreError::AddressTaken(key) => write!(f, "address already registered: {key}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ── Transactions ─────────────────────────────────────────────────

/// Staged writes plus the row versions they were computed from.
///
/// Nothing touches the tables until `Store::commit`, which either applies
/// every write or none.
#[derive(Debug, Default)]
pub struct Txn {
    expects: Vec<(RowKey, Option<Version>)>,
    claims: Vec<(String, Ulid)>,
    writes: Vec<Write>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_parking(&mut self, mut parking: Parking) -> Parking {
        self.expects.push((RowKey::Parking(parking.id), None));
        parking.version = 1;
        self.writes.push(Write::PutParking(parking.clone()));
        parking
    }

    pub fn update_parking(&mut self, mut parking: Parking) -> Parking {
        self.expects.push((RowKey::Parking(parking.id), Some(parking.version)));
        parking.version += 1;
        self.writes.push(Write::PutParking(parking.clone()));
        parking
    }

    pub fn delete_parking(&mut self, parking: &Parking) {
        self.expects.push((RowKey::Parking(parking.id), Some(parking.version)));
        self.writes.push(Write::DeleteParking { id: parking.id });
    }

    pub fn insert_sector(&mut self, mut sector: Sector) -> Sector {
        self.expects.push((RowKey::Sector(sector.id), None));
        sector.version = 1;
        self.writes.push(Write::PutSector(sector.clone()));
        sector
    }

    pub fn update_sector(&mut self, mut sector: Sector) -> Sector {
        self.expects.push((RowKey::Sector(sector.id), Some(sector.version)));
        sector.version += 1;
        self.writes.push(Write::PutSector(sector.clone()));
        sector
    }

    pub fn delete_sector(&mut self, sector: &Sector) {
        self.expects.push((RowKey::Sector(sector.id), Some(sector.version)));
        self.writes.push(Write::DeleteSector { id: sector.id });
    }

    pub fn insert_reservation(&mut self, mut reservation: Reservation) -> Reservation {
        self.expects.push((RowKey::Reservation(reservation.id), None));
        reservation.version = 1;
        self.writes.push(Write::PutReservation(reservation.clone()));
        reservation
    }

    pub fn update_reservation(&mut self, mut reservation: Reservation) -> Reservation {
        self.expects.push((
            RowKey::Reservation(reservation.id),
            Some(reservation.version),
        ));
        reservation.version += 1;
        self.writes.push(Write::PutReservation(reservation.clone()));
        reservation
    }

    /// Events are only appended next to a write of their reservation row,
    /// so the reservation's lock and version cover the log too. Read the row
    /// before its events to rely on that.
    pub fn append_event(&mut self, event: ParkingEvent) {
        self.writes.push(Write::AppendEvent(event));
    }

    /// Require that `address_key` is free or already owned by `owner`.
    pub fn claim_address(&mut self, address_key: String, owner: Ulid) {
        self.claims.push((address_key, owner));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn lock_keys(&self) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = self
            .expects
            .iter()
            .map(|(k, _)| k.clone())
            .chain(self.claims.iter().map(|(a, _)| RowKey::Address(a.clone())))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

// ── Group-commit WAL channel ─────────────────────────────────────

enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Drains every queued append into one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Option<WalCommand> = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                for (_, tx) in batch {
                    let r = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    let _ = tx.send(r);
                }
            }
            WalCommand::Compact { snapshot, response } => {
                let _ = response.send(wal.compact(&snapshot));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
    tracing::debug!("wal writer for {} stopped", wal.path().display());
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so stray bytes don't prefix the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

// ── Store ────────────────────────────────────────────────────────

/// Row tables with optimistic versioning and atomic multi-row commits.
///
/// Reads are lock-free snapshots. Only `commit` locks, and only the row keys
/// its transaction touches, so commits on unrelated rows run in parallel.
pub struct Store {
    parkings: DashMap<Ulid, Parking>,
    sectors: DashMap<Ulid, Sector>,
    reservations: DashMap<Ulid, Reservation>,
    /// Append-only gate log, grouped by reservation.
    events: DashMap<Ulid, Vec<ParkingEvent>>,
    addresses: DashMap<String, Ulid>,
    by_sector: DashMap<Ulid, Vec<Ulid>>,
    by_client: DashMap<Ulid, Vec<Ulid>>,
    row_locks: DashMap<RowKey, Arc<Mutex<()>>>,
    /// Commits hold it shared; compaction holds it exclusively while it
    /// snapshots, so no commit lands between snapshot and swap.
    compaction: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Store {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            parkings: DashMap::new(),
            sectors: DashMap::new(),
            reservations: DashMap::new(),
            events: DashMap::new(),
            addresses: DashMap::new(),
            by_sector: DashMap::new(),
            by_client: DashMap::new(),
            row_locks: DashMap::new(),
            compaction: RwLock::new(()),
            wal_tx,
        };
        for commit in &commits {
            store.apply(commit);
        }
        tracing::debug!("replayed {} commits from {}", commits.len(), wal_path.display());
        Ok(store)
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn parking(&self, id: &Ulid) -> Option<Parking> {
        self.parkings.get(id).map(|e| e.value().clone())
    }

    pub fn sector(&self, id: &Ulid) -> Option<Sector> {
        self.sectors.get(id).map(|e| e.value().clone())
    }

    pub fn reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    pub fn events(&self, reservation_id: &Ulid) -> Vec<ParkingEvent> {
        self.events
            .get(reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// All parkings ordered by id.
    pub fn parkings(&self) -> Vec<Parking> {
        let mut all: Vec<Parking> = self.parkings.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    /// Sectors of a parking, in the parking's sector-list order.
    pub fn sectors_of(&self, parking: &Parking) -> Vec<Sector> {
        parking.sectors.iter().filter_map(|id| self.sector(id)).collect()
    }

    pub fn sectors(&self) -> Vec<Sector> {
        let mut all: Vec<Sector> = self.sectors.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|r| r.id);
        all
    }

    pub fn reservations_for_sector(&self, sector_id: &Ulid) -> Vec<Reservation> {
        let ids = self
            .by_sector
            .get(sector_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.reservation(id)).collect()
    }

    pub fn reservations_for_client(&self, client_id: &Ulid) -> Vec<Reservation> {
        let ids = self
            .by_client
            .get(client_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.reservation(id)).collect()
    }

    pub fn sector_has_history(&self, sector_id: &Ulid) -> bool {
        self.by_sector
            .get(sector_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    fn current_version(&self, key: &RowKey) -> Option<Version> {
        match key {
            RowKey::Parking(id) => self.parkings.get(id).map(|r| r.version),
            RowKey::Sector(id) => self.sectors.get(id).map(|r| r.version),
            RowKey::Reservation(id) => self.reservations.get(id).map(|r| r.version),
            RowKey::Address(_) => None,
        }
    }

    // ── Commit ───────────────────────────────────────────────

    /// Compare-and-swap every staged row, log the transaction, apply it.
    pub async fn commit(&self, txn: Txn) -> Result<(), StoreError> {
        if txn.is_empty() {
            return Ok(());
        }
        let keys = txn.lock_keys();
        let result = self.commit_locked(&keys, txn).await;
        self.release_locks(&keys);
        result
    }

    async fn commit_locked(&self, keys: &[RowKey], txn: Txn) -> Result<(), StoreError> {
        let _shared = self.compaction.read().await;

        // Sorted acquisition: two commits touching overlapping rows can't deadlock.
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = Arc::clone(&self.row_locks.entry(key.clone()).or_default());
            guards.push(lock.lock_owned().await);
        }

        for (key, expected) in &txn.expects {
            let actual = self.current_version(key);
            if actual != *expected {
                return Err(StoreError::VersionMismatch {
                    key: key.clone(),
                    expected: *expected,
                    actual,
                });
            }
        }
        for (address_key, owner) in &txn.claims {
            let holder = self.addresses.get(address_key).map(|e| *e.value());
            if holder.is_some_and(|h| h != *owner) {
                return Err(StoreError::AddressTaken(address_key.clone()));
            }
        }

        let commit = Commit { writes: txn.writes };
        self.wal_append(commit.clone()).await?;
        self.apply(&commit);
        Ok(())
    }

    /// Drop lock entries nobody else holds or waits on.
    fn release_locks(&self, keys: &[RowKey]) {
        for key in keys {
            self.row_locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    async fn wal_append(&self, commit: Commit) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Apply writes to tables and indexes. Caller holds the row locks, or
    /// is replaying at startup.
    ///
    /// Readers take no locks, so events land before any row: whoever sees a
    /// reservation at version N also sees every event committed with it.
    fn apply(&self, commit: &Commit) {
        for write in &commit.writes {
            if let Write::AppendEvent(event) = write {
                self.events
                    .entry(event.reservation_id)
                    .or_default()
                    .push(event.clone());
            }
        }
        for write in &commit.writes {
            match write {
                Write::PutParking(parking) => {
                    let previous_key = self.parkings.get(&parking.id).map(|p| p.address.key());
                    let key = parking.address.key();
                    if let Some(old) = previous_key
                        && old != key
                    {
                        self.addresses.remove(&old);
                    }
                    self.addresses.insert(key, parking.id);
                    self.parkings.insert(parking.id, parking.clone());
                }
                Write::DeleteParking { id } => {
                    if let Some((_, parking)) = self.parkings.remove(id) {
                        self.addresses.remove(&parking.address.key());
                    }
                }
                Write::PutSector(sector) => {
                    self.sectors.insert(sector.id, sector.clone());
                }
                Write::DeleteSector { id } => {
                    self.sectors.remove(id);
                    self.by_sector.remove(id);
                }
                Write::PutReservation(reservation) => {
                    let is_new = self
                        .reservations
                        .insert(reservation.id, reservation.clone())
                        .is_none();
                    if is_new {
                        self.by_sector
                            .entry(reservation.sector_id)
                            .or_default()
                            .push(reservation.id);
                        if let Some(client_id) = reservation.client_id {
                            self.by_client.entry(client_id).or_default().push(reservation.id);
                        }
                    }
                }
                Write::AppendEvent(_) => {}
            }
        }
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL as the minimal commits that rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.compaction.write().await;

        let mut snapshot = Vec::new();
        for parking in self.parkings() {
            let mut writes = vec![Write::PutParking(parking.clone())];
            writes.extend(self.sectors_of(&parking).into_iter().map(Write::PutSector));
            snapshot.push(Commit { writes });
        }
        for reservation in self.reservations() {
            let events = self.events(&reservation.id);
            let mut writes = vec![Write::PutReservation(reservation)];
            writes.extend(events.into_iter().map(Write::AppendEvent));
            snapshot.push(Commit { writes });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
