use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{MAX_RESERVATIONS_PER_SPACE, MAX_SPOOL_ENTRIES, MAX_UNJOURNALED_RECORDS};
use crate::model::Ms;

const MINUTE_MS: Ms = 60_000;
const HOUR_MS: Ms = 60 * MINUTE_MS;
const DAY_MS: Ms = 24 * HOUR_MS;

/// Limits on what a booking request may ask for, plus lock wait bounds.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Longest single reservation.
    pub max_duration_ms: Ms,
    /// How far in the past a reservation may start (clock skew, walk-ups).
    pub max_past_skew_ms: Ms,
    /// How far ahead a reservation may start.
    pub max_advance_ms: Ms,
    /// Cap on active reservations per space. Cancelled and expired ones do not count.
    pub max_active_per_space: usize,
    /// Bounded wait on a per-space or per-key lock before `Busy`.
    pub lock_timeout: Duration,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            max_duration_ms: 7 * DAY_MS,
            max_past_skew_ms: 5 * MINUTE_MS,
            max_advance_ms: 365 * DAY_MS,
            max_active_per_space: MAX_RESERVATIONS_PER_SPACE,
            lock_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestPolicy {
    /// Shared HMAC secret for webhook signatures. Without one every uplink is rejected.
    pub webhook_secret: Option<String>,
    pub spool_base_backoff_ms: Ms,
    pub spool_max_backoff_ms: Ms,
    /// Retries before a spooled uplink is dead-lettered.
    pub spool_max_retries: u32,
    pub dedup_retention_ms: Ms,
    pub reading_retention_ms: Ms,
    /// Backward frame-counter jump that counts as a new epoch instead of a replay.
    pub fcnt_rollover_gap: u32,
    /// Spool size at which the oldest entry is dead-lettered to admit a new one.
    pub max_spool_entries: usize,
    /// Accepted records kept in memory while the journal is failing.
    pub max_unjournaled: usize,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            spool_base_backoff_ms: 30_000,
            spool_max_backoff_ms: HOUR_MS,
            spool_max_retries: 8,
            dedup_retention_ms: 7 * DAY_MS,
            reading_retention_ms: 90 * DAY_MS,
            fcnt_rollover_gap: 16_384,
            max_spool_entries: MAX_SPOOL_ENTRIES,
            max_unjournaled: MAX_UNJOURNALED_RECORDS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobIntervals {
    pub expire_reservations: Duration,
    pub process_spool: Duration,
    pub inventory_sync: Duration,
    pub compact_journals: Duration,
    pub prune_retention: Duration,
}

impl Default for JobIntervals {
    fn default() -> Self {
        Self {
            expire_reservations: Duration::from_secs(60),
            process_spool: Duration::from_secs(60),
            inventory_sync: Duration::from_secs(300),
            compact_journals: Duration::from_secs(300),
            prune_retention: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    /// Subjects granted platform-admin membership at startup.
    pub platform_admins: Vec<String>,
    pub booking: BookingPolicy,
    pub ingest: IngestPolicy,
    pub jobs: JobIntervals,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            platform_admins: Vec::new(),
            booking: BookingPolicy::default(),
            ingest: IngestPolicy::default(),
            jobs: JobIntervals::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparsable {key}={raw:?}");
            None
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

impl Config {
    /// Read `PARKD_*` variables over the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(dir) = std::env::var("PARKD_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        cfg.metrics_port = env_parse("PARKD_METRICS_PORT");
        if let Some(v) = env_parse("PARKD_COMPACT_THRESHOLD") {
            cfg.compact_threshold = v;
        }
        if let Ok(admins) = std::env::var("PARKD_PLATFORM_ADMINS") {
            cfg.platform_admins = admins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        let b = &mut cfg.booking;
        if let Some(v) = env_parse("PARKD_MAX_RESERVATION_MS") {
            b.max_duration_ms = v;
        }
        if let Some(v) = env_parse("PARKD_MAX_PAST_SKEW_MS") {
            b.max_past_skew_ms = v;
        }
        if let Some(v) = env_parse("PARKD_MAX_ADVANCE_MS") {
            b.max_advance_ms = v;
        }
        if let Some(v) = env_parse("PARKD_MAX_ACTIVE_RESERVATIONS") {
            b.max_active_per_space = v;
        }
        if let Some(v) = env_parse::<u64>("PARKD_LOCK_TIMEOUT_MS") {
            b.lock_timeout = Duration::from_millis(v);
        }

        let i = &mut cfg.ingest;
        i.webhook_secret = std::env::var("PARKD_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        if let Some(v) = env_parse("PARKD_SPOOL_BASE_BACKOFF_MS") {
            i.spool_base_backoff_ms = v;
        }
        if let Some(v) = env_parse("PARKD_SPOOL_MAX_BACKOFF_MS") {
            i.spool_max_backoff_ms = v;
        }
        if let Some(v) = env_parse("PARKD_SPOOL_MAX_RETRIES") {
            i.spool_max_retries = v;
        }
        if let Some(v) = env_parse("PARKD_DEDUP_RETENTION_MS") {
            i.dedup_retention_ms = v;
        }
        if let Some(v) = env_parse("PARKD_READING_RETENTION_MS") {
            i.reading_retention_ms = v;
        }
        if let Some(v) = env_parse("PARKD_FCNT_ROLLOVER_GAP") {
            i.fcnt_rollover_gap = v;
        }
        if let Some(v) = env_parse("PARKD_MAX_SPOOL_ENTRIES") {
            i.max_spool_entries = v;
        }

        let j = &mut cfg.jobs;
        if let Some(v) = env_secs("PARKD_EXPIRE_INTERVAL_SECS") {
            j.expire_reservations = v;
        }
        if let Some(v) = env_secs("PARKD_SPOOL_INTERVAL_SECS") {
            j.process_spool = v;
        }
        if let Some(v) = env_secs("PARKD_INVENTORY_SYNC_INTERVAL_SECS") {
            j.inventory_sync = v;
        }
        if let Some(v) = env_secs("PARKD_COMPACT_INTERVAL_SECS") {
            j.compact_journals = v;
        }
        if let Some(v) = env_secs("PARKD_PRUNE_INTERVAL_SECS") {
            j.prune_retention = v;
        }

        cfg
    }

    pub fn state_wal_path(&self) -> PathBuf {
        self.data_dir.join("state.wal")
    }

    pub fn uplink_wal_path(&self) -> PathBuf {
        self.data_dir.join("uplink.wal")
    }
}
