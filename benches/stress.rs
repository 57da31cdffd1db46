use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ulid::Ulid;

use parkd::config::EngineConfig;
use parkd::engine::{Engine, NewSector};
use parkd::model::*;
use parkd::notify::NotifyHub;
use parkd::sweeper::Sweeper;

const T: Ms = 1_800_000_000_000;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn admin() -> ExecutionContext {
    ExecutionContext::new(Caller::Admin(Ulid::new()), T)
}

/// One parking per call, with `sectors` sectors of `max_places` each.
async fn setup(engine: &Engine, street: &str, sectors: usize, max_places: u32) -> (Ulid, Vec<Ulid>) {
    let ctx = admin();
    let parking = engine
        .create_parking(&ctx, Address::new("Krakow", "30-001", street), None)
        .await
        .unwrap();
    let mut ids = Vec::new();
    for i in 0..sectors {
        let sector = engine
            .add_sector(
                &ctx,
                parking.id,
                NewSector {
                    name: format!("ST-{i:02}"),
                    kind: SectorType::Covered,
                    max_places,
                    weight: 1 + i as u32 % 3,
                },
            )
            .await
            .unwrap();
        ids.push(sector.id);
    }
    (parking.id, ids)
}

async fn phase1_sequential(engine: &Engine) {
    let (parking_id, _) = setup(engine, "Sequential 1", 4, 1_000).await;
    let ctx = ExecutionContext::new(Caller::Anonymous, T);

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        let ticket = engine
            .enter_without_reservation(&ctx, parking_id, true)
            .await
            .unwrap();
        engine
            .exit_parking(&ctx, ticket.reservation_id, Some(&ticket.allocation_code), true)
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} entry+exit pairs in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("entry+exit latency", &mut latencies);
}

async fn phase2_hot_sector(engine: Arc<Engine>) {
    let (parking_id, sector_ids) = setup(&engine, "Hot 1", 1, 50).await;
    let n_tasks = 200;

    let admitted = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = engine.clone();
        let admitted = admitted.clone();
        handles.push(tokio::spawn(async move {
            let ctx = ExecutionContext::new(Caller::Anonymous, T);
            if engine.enter_without_reservation(&ctx, parking_id, true).await.is_ok() {
                admitted.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let sector = engine.get_sector(sector_ids[0]).unwrap();
    let ok = admitted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} drive-ins on one 50-place sector: {ok} admitted in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    assert!(ok <= 50);
    assert_eq!(sector.occupied() as usize, ok);
    assert_eq!(engine.sector_occupancy(sector.id).unwrap() as usize, ok);
}

async fn phase3_spread_load(engine: Arc<Engine>) {
    let n_parkings = 10;
    let n_per_parking = 200;

    let mut parkings = Vec::new();
    for p in 0..n_parkings {
        parkings.push(setup(&engine, &format!("Spread {p}"), 5, 100).await.0);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for parking_id in parkings {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_per_parking);
            for i in 0..n_per_parking {
                let ctx = ExecutionContext::new(Caller::Anonymous, T + i as Ms);
                let t = Instant::now();
                if let Ok(ticket) = engine.enter_without_reservation(&ctx, parking_id, true).await {
                    let _ = engine
                        .exit_parking(&ctx, ticket.reservation_id, Some(&ticket.allocation_code), true)
                        .await;
                }
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let total = n_parkings * n_per_parking;
    println!(
        "  {n_parkings} parkings x {n_per_parking} stays = {total} in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    print_latency("stay latency", &mut all);
}

async fn phase4_sweep_under_load(engine: Arc<Engine>) {
    let (_, sector_ids) = setup(&engine, "Sweep 1", 2, 10_000).await;

    // Bookings that will all be overdue at sweep time.
    for i in 0..1_000 {
        let ctx = ExecutionContext::new(Caller::Client(Ulid::new()), T);
        engine
            .make_reservation(&ctx, sector_ids[i % 2], T + HOUR, T + 2 * HOUR)
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..4 {
        let engine = engine.clone();
        let stop = stop.clone();
        let sector_id = sector_ids[w % 2];
        writers.push(tokio::spawn(async move {
            let ctx = ExecutionContext::new(Caller::Client(Ulid::new()), T + 3 * HOUR);
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let begin = T + 4 * HOUR + i * MINUTE;
                let _ = engine.make_reservation(&ctx, sector_id, begin, begin + HOUR).await;
                i += 1;
            }
        }));
    }

    let sweeper = Sweeper::new(engine.clone());
    let start = Instant::now();
    let report = sweeper.sweep(T + 3 * HOUR).await.unwrap();
    let elapsed = start.elapsed();

    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    println!(
        "  sweep expired {} ({} failed) in {:.2}s while writers ran",
        report.expired,
        report.failed,
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("parkd_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::open(dir.join("bench.wal"), Arc::new(NotifyHub::new()), EngineConfig::default())
            .unwrap(),
    );

    println!("=== parkd stress benchmark ===");
    println!("wal: {}\n", dir.display());

    println!("[phase 1] sequential entry/exit throughput");
    phase1_sequential(&engine).await;

    println!("\n[phase 2] contention on a single sector");
    phase2_hot_sector(engine.clone()).await;

    println!("\n[phase 3] parallel load across parkings");
    phase3_spread_load(engine.clone()).await;

    println!("\n[phase 4] sweep under concurrent bookings");
    phase4_sweep_under_load(engine.clone()).await;

    let _ = std::fs::remove_dir_all(&dir);
    println!("\ndone");
}
