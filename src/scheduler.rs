use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::config::JobIntervals;
use crate::engine::Engine;
use crate::observability::{JOB_DURATION_SECONDS, JOB_RUNS_TOTAL};
use crate::tenant::TenantContext;
use crate::uplink::Ingestor;

pub type JobError = Box<dyn Error + Send + Sync>;

const TICK: Duration = Duration::from_secs(1);

/// Pulls device inventory from an external system into the engine.
#[async_trait]
pub trait InventorySync: Send + Sync {
    /// Returns how many devices were synced.
    async fn sync(&self, engine: &Engine) -> Result<usize, JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    ExpireReservations,
    ProcessSpool,
    InventorySync,
    CompactJournals,
    PruneRetention,
}

impl Job {
    pub const ALL: [Job; 5] = [
        Job::ExpireReservations,
        Job::ProcessSpool,
        Job::InventorySync,
        Job::CompactJournals,
        Job::PruneRetention,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Job::ExpireReservations => "expire_reservations",
            Job::ProcessSpool => "process_spool",
            Job::InventorySync => "inventory_sync",
            Job::CompactJournals => "compact_journals",
            Job::PruneRetention => "prune_retention",
        }
    }

    pub fn from_name(name: &str) -> Option<Job> {
        Job::ALL.into_iter().find(|j| j.name() == name)
    }

    fn interval(&self, intervals: &JobIntervals) -> Duration {
        match self {
            Job::ExpireReservations => intervals.expire_reservations,
            Job::ProcessSpool => intervals.process_spool,
            Job::InventorySync => intervals.inventory_sync,
            Job::CompactJournals => intervals.compact_journals,
            Job::PruneRetention => intervals.prune_retention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(String),
    Failed(String),
    Panicked,
    /// The previous run of the same job was still going.
    Skipped,
}

impl JobOutcome {
    fn status(&self) -> &'static str {
        match self {
            JobOutcome::Completed(_) => "ok",
            JobOutcome::Failed(_) => "error",
            JobOutcome::Panicked => "panic",
            JobOutcome::Skipped => "skipped",
        }
    }
}

struct Jobs {
    engine: Arc<Engine>,
    ingestor: Arc<Ingestor>,
    inventory: Option<Arc<dyn InventorySync>>,
    clock: Arc<dyn Clock>,
    intervals: JobIntervals,
    compact_threshold: u64,
    /// Single-flight guard per job.
    running: HashMap<Job, Arc<Mutex<()>>>,
}

impl Jobs {
    fn enabled(&self, job: Job) -> bool {
        job != Job::InventorySync || self.inventory.is_some()
    }

    async fn execute(self: Arc<Self>, job: Job) -> Result<String, JobError> {
        match job {
            Job::ExpireReservations => {
                let report = self.engine.expire_old(&TenantContext::system()).await?;
                Ok(format!(
                    "expired {}, busy {}",
                    report.expired.len(),
                    report.busy_spaces.len()
                ))
            }
            Job::ProcessSpool => {
                let report = self.ingestor.process_spool().await?;
                Ok(format!(
                    "journaled {}, replayed {}, retried {}, dead-lettered {}",
                    report.journaled, report.replayed, report.retried, report.dead_lettered
                ))
            }
            Job::InventorySync => match &self.inventory {
                Some(inventory) => {
                    let synced = inventory.sync(&self.engine).await?;
                    Ok(format!("synced {synced} devices"))
                }
                None => Ok("no inventory source".into()),
            },
            Job::CompactJournals => {
                let mut done = Vec::new();
                if self.engine.appends_since_compact().await >= self.compact_threshold {
                    let spaces = self.engine.compact_journal().await?;
                    done.push(format!("state ({spaces} spaces)"));
                }
                if self.ingestor.appends_since_compact().await >= self.compact_threshold {
                    self.ingestor.compact_journal().await?;
                    done.push("uplink".to_string());
                }
                if done.is_empty() {
                    Ok("below threshold".into())
                } else {
                    Ok(format!("compacted {}", done.join(", ")))
                }
            }
            Job::PruneRetention => {
                let report = self.ingestor.prune(self.clock.now_ms()).await?;
                Ok(format!(
                    "pruned {} cursors, {} readings",
                    report.cursors, report.readings
                ))
            }
        }
    }
}

/// Run one job under its single-flight guard. Errors and panics end here.
async fn run_job(jobs: Arc<Jobs>, job: Job) -> JobOutcome {
    let Some(lock) = jobs.running.get(&job).cloned() else {
        return JobOutcome::Skipped;
    };
    let Ok(_guard) = lock.try_lock_owned() else {
        tracing::debug!("job {} still running, skipping", job.name());
        metrics::counter!(JOB_RUNS_TOTAL, "job" => job.name(), "status" => "skipped").increment(1);
        return JobOutcome::Skipped;
    };

    let started = Instant::now();
    // A separate task so a panicking job surfaces as a JoinError.
    let outcome = match tokio::spawn(jobs.clone().execute(job)).await {
        Ok(Ok(summary)) => {
            tracing::debug!("job {} done: {summary}", job.name());
            JobOutcome::Completed(summary)
        }
        Ok(Err(e)) => {
            tracing::error!("job {} failed: {e}", job.name());
            JobOutcome::Failed(e.to_string())
        }
        Err(e) => {
            tracing::error!("job {} panicked: {e}", job.name());
            JobOutcome::Panicked
        }
    };
    metrics::counter!(JOB_RUNS_TOTAL, "job" => job.name(), "status" => outcome.status())
        .increment(1);
    metrics::histogram!(JOB_DURATION_SECONDS, "job" => job.name())
        .record(started.elapsed().as_secs_f64());
    outcome
}

/// Single periodic driver for the background jobs.
pub struct Scheduler {
    jobs: Arc<Jobs>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<Engine>,
        ingestor: Arc<Ingestor>,
        inventory: Option<Arc<dyn InventorySync>>,
        clock: Arc<dyn Clock>,
        intervals: JobIntervals,
        compact_threshold: u64,
    ) -> Self {
        let running = Job::ALL
            .into_iter()
            .map(|job| (job, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            jobs: Arc::new(Jobs {
                engine,
                ingestor,
                inventory,
                clock,
                intervals,
                compact_threshold,
                running,
            }),
            cancel: CancellationToken::new(),
            driver: Mutex::new(None),
        }
    }

    /// Spawn the driver. Every enabled job runs on the first tick, then on its interval.
    pub async fn start(&self) {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            return;
        }
        let jobs = self.jobs.clone();
        let cancel = self.cancel.clone();
        *driver = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            let mut last_run: HashMap<Job, Instant> = HashMap::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = Instant::now();
                for job in Job::ALL {
                    if !jobs.enabled(job) {
                        continue;
                    }
                    let interval = job.interval(&jobs.intervals);
                    let due = last_run
                        .get(&job)
                        .is_none_or(|last| now.duration_since(*last) >= interval);
                    if due {
                        last_run.insert(job, now);
                        tokio::spawn(run_job(jobs.clone(), job));
                    }
                }
            }
            info!("scheduler stopped");
        }));
        info!("scheduler started");
    }

    /// Run a job now and wait for it. `None` for an unknown or disabled job.
    pub async fn trigger(&self, name: &str) -> Option<JobOutcome> {
        let job = Job::from_name(name).filter(|j| self.jobs.enabled(*j))?;
        Some(run_job(self.jobs.clone(), job).await)
    }

    /// Stop the driver and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("scheduler driver ended abnormally: {e}");
            }
        }
        for lock in self.jobs.running.values() {
            let _ = lock.lock().await;
        }
    }
}
