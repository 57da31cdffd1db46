use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use parkd::config::EngineConfig;
use parkd::engine::{choose, Engine, EngineError, ErrorKind, NewSector};
use parkd::model::*;
use parkd::notify::NotifyHub;
use parkd::sweeper::Sweeper;

const T: Ms = 1_800_000_000_000;

// ── Test infrastructure ──────────────────────────────────────

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("parkd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn open(path: PathBuf) -> Arc<Engine> {
    Arc::new(Engine::open(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap())
}

fn admin() -> ExecutionContext {
    ExecutionContext::new(Caller::Admin(Ulid::new()), T)
}

async fn facility(engine: &Engine, max_places: u32) -> (Ulid, Ulid) {
    let ctx = admin();
    let parking = engine
        .create_parking(&ctx, Address::new("Warszawa", "00-001", "Marszalkowska 1"), None)
        .await
        .unwrap();
    let sector = engine
        .add_sector(
            &ctx,
            parking.id,
            NewSector {
                name: "UG-01".into(),
                kind: SectorType::Underground,
                max_places,
                weight: 1,
            },
        )
        .await
        .unwrap();
    (parking.id, sector.id)
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_drive_ins_on_one_sector() {
    let engine = open(wal_path("a.wal"));
    let (parking_id, sector_id) = facility(&engine, 10).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let ctx = ExecutionContext::new(Caller::Anonymous, T);
            engine.enter_without_reservation(&ctx, parking_id, true).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(engine.get_sector(sector_id).unwrap().available_places, 8);
}

#[tokio::test]
async fn full_sector_turns_cars_away() {
    let engine = open(wal_path("b.wal"));
    let (parking_id, sector_id) = facility(&engine, 1).await;
    let ctx = ExecutionContext::new(Caller::Anonymous, T);
    engine
        .enter_without_reservation(&ctx, parking_id, true)
        .await
        .unwrap();

    let err = engine
        .enter_without_reservation(&ctx, parking_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CannotEnterParking(id) if id == parking_id));
    assert_eq!(engine.get_sector(sector_id).unwrap().available_places, 0);
}

#[tokio::test]
async fn missed_booking_expires_on_sweep() {
    let engine = open(wal_path("c.wal"));
    let (_, sector_id) = facility(&engine, 3).await;
    let client = ExecutionContext::new(Caller::Client(Ulid::new()), T);
    let r = engine
        .make_reservation(&client, sector_id, T, T + HOUR)
        .await
        .unwrap();

    let err = engine
        .enter_with_reservation(&client.at(T + 2 * HOUR), r.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimeViolation);

    let sweeper = Sweeper::new(engine.clone());
    let report = sweeper.sweep(T + 2 * HOUR).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(
        engine.get_reservation(&client, r.id).unwrap().status,
        ReservationStatus::Expired
    );
    assert_eq!(sweeper.sweep(T + 3 * HOUR).await.unwrap().transitions(), 0);
}

#[tokio::test]
async fn past_deactivation_leaves_sector_alone() {
    let engine = open(wal_path("d.wal"));
    let (_, sector_id) = facility(&engine, 3).await;
    let before = engine.get_sector(sector_id).unwrap();

    let err = engine
        .deactivate_sector(&admin(), sector_id, before.version, T - 1)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SectorInvalidDeactivationTime));
    assert_eq!(engine.get_sector(sector_id).unwrap(), before);
}

#[tokio::test]
async fn exit_with_end_frees_place_and_ends() {
    let engine = open(wal_path("e.wal"));
    let (_, sector_id) = facility(&engine, 2).await;
    let client = ExecutionContext::new(Caller::Client(Ulid::new()), T);
    let r = engine
        .make_reservation(&client, sector_id, T, T + HOUR)
        .await
        .unwrap();
    let ticket = engine.enter_with_reservation(&client, r.id).await.unwrap();
    assert_eq!(engine.get_sector(sector_id).unwrap().available_places, 1);

    let ended = engine
        .exit_parking(&client.at(T + 10 * MINUTE), r.id, Some(&ticket.allocation_code), true)
        .await
        .unwrap();
    assert_eq!(ended.status, ReservationStatus::Ended);
    assert_eq!(engine.get_sector(sector_id).unwrap().available_places, 2);
}

// ── Properties ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ledger_matches_gate_log_under_load() {
    let engine = open(wal_path("load.wal"));
    let (parking_id, sector_id) = facility(&engine, 5).await;

    let mut handles = Vec::new();
    for i in 0..30 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let ctx = ExecutionContext::new(Caller::Anonymous, T + i);
            let Ok(ticket) = engine.enter_without_reservation(&ctx, parking_id, true).await else {
                return;
            };
            if i % 2 == 0 {
                let _ = engine
                    .exit_parking(&ctx, ticket.reservation_id, Some(&ticket.allocation_code), true)
                    .await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let sector = engine.get_sector(sector_id).unwrap();
    assert!(sector.available_places <= sector.max_places);
    assert_eq!(engine.sector_occupancy(sector_id).unwrap(), sector.occupied());
}

#[test]
fn allocation_is_a_pure_function_of_the_snapshot() {
    let sector = |name: &str, available: u32, weight: u32| Sector {
        id: Ulid::new(),
        parking_id: Ulid::nil(),
        name: name.into(),
        kind: SectorType::Covered,
        max_places: 10,
        available_places: available,
        weight,
        active: true,
        deactivation_time: None,
        version: 1,
    };
    let snapshot = vec![sector("AA-01", 4, 1), sector("AA-02", 8, 1), sector("AA-03", 2, 4)];

    for policy in [
        AllocationPolicy::LeastOccupied,
        AllocationPolicy::MostOccupied,
        AllocationPolicy::LeastOccupiedWeighted,
    ] {
        let first = choose(policy, &snapshot, T).map(|s| s.id);
        let second = choose(policy, &snapshot, T).map(|s| s.id);
        assert_eq!(first, second);
    }
    let name = |p| choose(p, &snapshot, T).map(|s| s.name.clone());
    assert_eq!(name(AllocationPolicy::LeastOccupied).as_deref(), Some("AA-02"));
    assert_eq!(name(AllocationPolicy::MostOccupied).as_deref(), Some("AA-03"));
    assert_eq!(name(AllocationPolicy::LeastOccupiedWeighted).as_deref(), Some("AA-02"));
}

#[tokio::test]
async fn restart_replays_the_log() {
    let path = wal_path("restart.wal");
    let engine = open(path.clone());
    let (parking_id, sector_id) = facility(&engine, 4).await;
    let client = ExecutionContext::new(Caller::Client(Ulid::new()), T);
    let ticket = engine
        .enter_without_reservation(&client, parking_id, false)
        .await
        .unwrap();
    let sector = engine.get_sector(sector_id).unwrap();
    let reservation = engine.get_reservation(&client, ticket.reservation_id).unwrap();
    drop(engine);

    let reopened = open(path);
    assert_eq!(reopened.get_sector(sector_id).unwrap(), sector);
    assert_eq!(
        reopened.get_reservation(&client, ticket.reservation_id).unwrap(),
        reservation
    );
    assert!(reopened.is_occupying(ticket.reservation_id).unwrap());
    assert_eq!(reopened.list_parkings(Page::first()).total, 1);
}
