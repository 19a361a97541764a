use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── Request-driven metrics ──────────────────────────────────────

/// Counter: reservation create/cancel calls. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "parkd_reservations_total";

/// Counter: per-space lock waits that timed out (`Busy`).
pub const LOCK_TIMEOUTS_TOTAL: &str = "parkd_lock_timeouts_total";

/// Counter: space status changes. Labels: cause, to.
pub const SPACE_TRANSITIONS_TOTAL: &str = "parkd_space_transitions_total";

/// Counter: uplinks received. Labels: result.
pub const UPLINKS_TOTAL: &str = "parkd_uplinks_total";

// ── Background work ─────────────────────────────────────────────

/// Gauge: uplinks waiting in the spool.
pub const SPOOL_DEPTH: &str = "parkd_spool_depth";

/// Counter: spooled uplinks moved to the dead-letter set.
pub const DEAD_LETTERS_TOTAL: &str = "parkd_dead_letters_total";

/// Counter: scheduler job runs. Labels: job, status.
pub const JOB_RUNS_TOTAL: &str = "parkd_job_runs_total";

/// Histogram: scheduler job duration in seconds. Labels: job.
pub const JOB_DURATION_SECONDS: &str = "parkd_job_duration_seconds";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
