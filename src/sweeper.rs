use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{now_ms, ExecutionContext, Ms};
use crate::observability::{SWEEP_FAILURES_TOTAL, SWEEP_SKIPPED_TOTAL, SWEEP_TRANSITIONS_TOTAL};

/// What one pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub force_ended: usize,
    pub closed: usize,
    pub deactivated: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn transitions(&self) -> usize {
        self.expired + self.force_ended + self.closed + self.deactivated
    }
}

/// Periodic cleanup of stale reservations and lapsed sector deactivations.
/// At most one pass runs at a time.
pub struct Sweeper {
    engine: Arc<Engine>,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Sweeper {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            in_flight: AtomicBool::new(false),
        }
    }

    /// One pass as of `now`. Returns `None` when another pass is still running.
    pub async fn sweep(&self, now: Ms) -> Option<SweepReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::counter!(SWEEP_SKIPPED_TOTAL).increment(1);
            debug!("sweep already in flight, skipping");
            return None;
        }
        let _guard = InFlight(&self.in_flight);

        let ctx = ExecutionContext::system(now);
        let engine = &self.engine;
        let mut report = SweepReport::default();

        for id in engine.collect_expirable(now) {
            let outcome = engine.expire_reservation(&ctx, id).await;
            tally(&mut report.expired, &mut report.failed, "expired", id, outcome);
        }
        for id in engine.collect_overstayed(now) {
            let outcome = engine.force_exit(&ctx, id).await;
            tally(&mut report.force_ended, &mut report.failed, "force_ended", id, outcome);
        }
        for id in engine.collect_finished(now) {
            let outcome = engine.close_finished(&ctx, id).await;
            tally(&mut report.closed, &mut report.failed, "closed", id, outcome);
        }
        for id in engine.collect_lapsed_sectors(now) {
            let outcome = engine.finalize_deactivation(&ctx, id).await;
            tally(&mut report.deactivated, &mut report.failed, "deactivated", id, outcome);
        }

        if report.transitions() > 0 || report.failed > 0 {
            info!(
                expired = report.expired,
                force_ended = report.force_ended,
                closed = report.closed,
                deactivated = report.deactivated,
                failed = report.failed,
                "sweep finished"
            );
        }
        Some(report)
    }
}

fn tally(
    done: &mut usize,
    failed: &mut usize,
    kind: &'static str,
    id: Ulid,
    outcome: Result<bool, EngineError>,
) {
    match outcome {
        Ok(true) => {
            *done += 1;
            metrics::counter!(SWEEP_TRANSITIONS_TOTAL, "kind" => kind).increment(1);
        }
        // Someone else moved it on first.
        Ok(false) => debug!("sweep skip {id}"),
        Err(e) => {
            *failed += 1;
            metrics::counter!(SWEEP_FAILURES_TOTAL).increment(1);
            warn!("sweep {kind} {id} failed: {e}");
        }
    }
}

/// Background task: trigger a sweep every `every`. Each pass runs on its own
/// task so a slow pass shows up as skipped ticks, not a stalled timer.
pub async fn run_sweeper(sweeper: Arc<Sweeper>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let sweeper = sweeper.clone();
        tokio::spawn(async move {
            sweeper.sweep(now_ms()).await;
        });
    }
}

/// Background task: rewrite the WAL once enough appends piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
