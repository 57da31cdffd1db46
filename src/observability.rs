use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "parkd_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "parkd_operation_duration_seconds";

/// Counter: lost row compare-and-swaps that were retried. Labels: op.
pub const CONTENTION_RETRIES_TOTAL: &str = "parkd_contention_retries_total";

/// Counter: notifications that failed to deliver.
pub const NOTIFY_FAILURES_TOTAL: &str = "parkd_notify_failures_total";

// ── Sweeper ─────────────────────────────────────────────────────

/// Counter: transitions made by the sweeper. Labels: kind.
pub const SWEEP_TRANSITIONS_TOTAL: &str = "parkd_sweep_transitions_total";

/// Counter: per-item sweep failures.
pub const SWEEP_FAILURES_TOTAL: &str = "parkd_sweep_failures_total";

/// Counter: triggers skipped because a sweep was already running.
pub const SWEEP_SKIPPED_TOTAL: &str = "parkd_sweep_skipped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record outcome and latency of one engine operation.
pub fn observe<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
