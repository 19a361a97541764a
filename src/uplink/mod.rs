mod dedup;
mod envelope;
mod records;
pub mod signature;

pub use dedup::{FrameCheck, FrameCursor, check_frame};
pub use envelope::{Uplink, decode_occupancy, parse_webhook};
pub use records::{
    DeadLetter, OrphanDevice, SensorReading, SpoolEntry, UplinkRecord, UplinkSnapshot,
};

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::IngestPolicy;
use crate::engine::{Engine, SensorOutcome};
use crate::journal::{Journal, WalJournal};
use crate::limits::{KEY_LOCK_STRIPES, MAX_UPLINK_PAYLOAD_LEN, MAX_WEBHOOK_BODY_LEN};
use crate::locks::StripedLocks;
use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::observability::{DEAD_LETTERS_TOTAL, SPOOL_DEPTH, UPLINKS_TOTAL};
use crate::tenant::{AccessError, TenantContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Bad or missing signature. Nothing was recorded.
    Unauthenticated,
    /// The uplink journal could not be written. Background passes only; an
    /// authenticated uplink is always accepted.
    Storage(String),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Unauthenticated => write!(f, "invalid webhook signature"),
            IngestError::Storage(e) => write!(f, "uplink storage error: {e}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<io::Error> for IngestError {
    fn from(e: io::Error) -> Self {
        IngestError::Storage(e.to_string())
    }
}

/// What happened to an authenticated uplink. All variants are success to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    Applied(SensorOutcome),
    /// Recorded; the payload carried no occupancy signal.
    NoSignal,
    Duplicate,
    /// Recorded against an unassigned device.
    Orphan,
    /// Accepted; the transition failed or the journal write did, and the
    /// spool pass retries it.
    Spooled,
    /// Could not be parsed.
    Discarded,
}

impl Receipt {
    fn as_str(&self) -> &'static str {
        match self {
            Receipt::Applied(_) => "applied",
            Receipt::NoSignal => "no_signal",
            Receipt::Duplicate => "duplicate",
            Receipt::Orphan => "orphan",
            Receipt::Spooled => "spooled",
            Receipt::Discarded => "discarded",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpoolReport {
    /// Held records that reached the journal.
    pub journaled: usize,
    pub replayed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Another pass was already running.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub cursors: usize,
    pub readings: usize,
}

/// `min(base · 2^(retry_count−1), max)`.
pub fn backoff_ms(policy: &IngestPolicy, retry_count: u32) -> Ms {
    let shift = retry_count.saturating_sub(1).min(32);
    policy
        .spool_base_backoff_ms
        .saturating_mul(1_i64 << shift)
        .min(policy.spool_max_backoff_ms)
}

pub struct Ingestor {
    engine: Arc<Engine>,
    journal: Arc<dyn Journal<UplinkRecord>>,
    policy: IngestPolicy,
    clock: Arc<dyn Clock>,
    notify: Arc<NotifyHub>,
    device_locks: StripedLocks,
    spool_pass: Mutex<()>,
    gate: RwLock<()>,
    cursors: DashMap<DevEui, FrameCursor>,
    readings: DashMap<DevEui, Vec<SensorReading>>,
    spool: DashMap<Ulid, SpoolEntry>,
    dead_letters: DashMap<Ulid, DeadLetter>,
    orphans: DashMap<DevEui, OrphanDevice>,
    /// Applied in memory, not yet in the journal. Lost on crash.
    unjournaled: Mutex<VecDeque<UplinkRecord>>,
}

impl Ingestor {
    /// Open the uplink journal at `path` and rebuild dedup, spool and orphan state.
    /// Must be called from within a Tokio runtime.
    pub fn open(
        path: &Path,
        engine: Arc<Engine>,
        policy: IngestPolicy,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let (journal, records) = WalJournal::<UplinkRecord>::open(path)?;
        Ok(Self::with_journal(
            Arc::new(journal),
            records,
            engine,
            policy,
            clock,
            notify,
        ))
    }

    pub fn with_journal(
        journal: Arc<dyn Journal<UplinkRecord>>,
        records: Vec<UplinkRecord>,
        engine: Arc<Engine>,
        policy: IngestPolicy,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        let ingestor = Self {
            engine,
            journal,
            policy,
            clock,
            notify,
            device_locks: StripedLocks::new(KEY_LOCK_STRIPES),
            spool_pass: Mutex::new(()),
            gate: RwLock::new(()),
            cursors: DashMap::new(),
            readings: DashMap::new(),
            spool: DashMap::new(),
            dead_letters: DashMap::new(),
            orphans: DashMap::new(),
            unjournaled: Mutex::new(VecDeque::new()),
        };
        for record in &records {
            ingestor.apply(record);
        }
        if !ingestor.spool.is_empty() {
            tracing::info!("{} uplinks waiting in spool", ingestor.spool.len());
        }
        metrics::gauge!(SPOOL_DEPTH).set(ingestor.spool.len() as f64);
        ingestor
    }

    fn apply(&self, record: &UplinkRecord) {
        match record {
            UplinkRecord::Accepted { reading, cursor } => {
                self.cursors.insert(reading.dev_eui.clone(), *cursor);
                self.readings
                    .entry(reading.dev_eui.clone())
                    .or_default()
                    .push(reading.clone());
                if reading.space_id.is_none() {
                    self.orphans
                        .entry(reading.dev_eui.clone())
                        .and_modify(|o| {
                            o.last_seen = reading.received_at;
                            o.message_count += 1;
                            o.last_frame_counter = reading.frame_counter;
                        })
                        .or_insert_with(|| OrphanDevice {
                            dev_eui: reading.dev_eui.clone(),
                            first_seen: reading.received_at,
                            last_seen: reading.received_at,
                            message_count: 1,
                            last_frame_counter: reading.frame_counter,
                        });
                } else if reading.occupancy.is_some() {
                    self.spool.insert(
                        reading.id,
                        SpoolEntry {
                            reading: reading.clone(),
                            retry_count: 0,
                            next_retry_at: reading.received_at,
                            last_error: None,
                            spooled_at: reading.received_at,
                        },
                    );
                }
            }
            UplinkRecord::Cleared { id } => {
                self.spool.remove(id);
            }
            UplinkRecord::Retried {
                id,
                retry_count,
                next_retry_at,
                last_error,
            } => {
                if let Some(mut entry) = self.spool.get_mut(id) {
                    entry.retry_count = *retry_count;
                    entry.next_retry_at = *next_retry_at;
                    entry.last_error = Some(last_error.clone());
                }
            }
            UplinkRecord::DeadLettered {
                id,
                retry_count,
                last_error,
                at,
            } => {
                if let Some((_, mut entry)) = self.spool.remove(id) {
                    entry.retry_count = *retry_count;
                    entry.last_error = Some(last_error.clone());
                    self.dead_letters.insert(
                        *id,
                        DeadLetter {
                            entry,
                            dead_at: *at,
                        },
                    );
                }
            }
            UplinkRecord::Pruned {
                cursors_before,
                readings_before,
            } => {
                self.cursors.retain(|_, c| c.seen_at >= *cursors_before);
                self.readings.retain(|_, list| {
                    list.retain(|r| r.received_at >= *readings_before);
                    !list.is_empty()
                });
            }
            UplinkRecord::Snapshot(snapshot) => {
                self.cursors.clear();
                self.readings.clear();
                self.spool.clear();
                self.dead_letters.clear();
                self.orphans.clear();
                for (dev_eui, cursor) in &snapshot.cursors {
                    self.cursors.insert(dev_eui.clone(), *cursor);
                }
                for reading in &snapshot.readings {
                    self.readings
                        .entry(reading.dev_eui.clone())
                        .or_default()
                        .push(reading.clone());
                }
                for entry in &snapshot.spool {
                    self.spool.insert(entry.id(), entry.clone());
                }
                for dead in &snapshot.dead_letters {
                    self.dead_letters.insert(dead.entry.id(), dead.clone());
                }
                for orphan in &snapshot.orphans {
                    self.orphans.insert(orphan.dev_eui.clone(), orphan.clone());
                }
            }
        }
    }

    async fn persist_and_apply(&self, record: &UplinkRecord) -> Result<(), IngestError> {
        let _gate = self.gate.read().await;
        self.journal.append(record).await?;
        self.apply(record);
        Ok(())
    }

    /// Journal and apply `record`. If the journal refuses, apply it anyway and
    /// hold it for the next spool pass. Returns false when held.
    async fn persist_or_hold(&self, record: UplinkRecord) -> bool {
        let _gate = self.gate.read().await;
        let err = match self.journal.append(&record).await {
            Ok(()) => {
                self.apply(&record);
                return true;
            }
            Err(e) => e,
        };
        self.apply(&record);
        let mut held = self.unjournaled.lock().await;
        if held.len() >= self.policy.max_unjournaled {
            held.pop_front();
            metrics::counter!(UPLINKS_TOTAL, "result" => "lost").increment(1);
            tracing::error!("unjournaled uplink buffer full, dropped the oldest record");
        }
        held.push_back(record);
        tracing::warn!(
            "uplink journal write failed, {} records held in memory: {err}",
            held.len()
        );
        false
    }

    /// Write held records in arrival order, stopping at the first failure.
    async fn flush_unjournaled(&self) -> usize {
        let _gate = self.gate.read().await;
        let mut held = self.unjournaled.lock().await;
        let mut written = 0;
        while let Some(record) = held.front() {
            if let Err(e) = self.journal.append(record).await {
                tracing::warn!("uplink journal still failing, {} held: {e}", held.len());
                break;
            }
            held.pop_front();
            written += 1;
        }
        if written > 0 {
            tracing::info!("journaled {written} held uplink records");
        }
        written
    }

    pub async fn unjournaled_depth(&self) -> usize {
        self.unjournaled.lock().await.len()
    }

    /// Ingest a raw uplink. `signature` covers `payload`.
    pub async fn receive(
        &self,
        payload: &[u8],
        signature: &str,
        dev_eui: &str,
        frame_counter: u32,
    ) -> Result<Receipt, IngestError> {
        self.authenticate(payload, signature)?;
        let receipt = match DevEui::parse(dev_eui) {
            Some(dev_eui) if payload.len() <= MAX_UPLINK_PAYLOAD_LEN => {
                self.ingest(Uplink {
                    dev_eui,
                    frame_counter,
                    payload: payload.to_vec(),
                })
                .await
            }
            _ => Receipt::Discarded,
        };
        metrics::counter!(UPLINKS_TOTAL, "result" => receipt.as_str()).increment(1);
        Ok(receipt)
    }

    /// Ingest a network-server webhook. `signature` covers the raw body.
    pub async fn receive_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<Receipt, IngestError> {
        self.authenticate(body, signature)?;
        let parsed = if body.len() <= MAX_WEBHOOK_BODY_LEN {
            parse_webhook(body)
        } else {
            None
        };
        let receipt = match parsed {
            Some(uplink) => self.ingest(uplink).await,
            None => {
                tracing::warn!("discarding malformed webhook body ({} bytes)", body.len());
                Receipt::Discarded
            }
        };
        metrics::counter!(UPLINKS_TOTAL, "result" => receipt.as_str()).increment(1);
        Ok(receipt)
    }

    fn authenticate(&self, body: &[u8], signature: &str) -> Result<(), IngestError> {
        if signature::verify(self.policy.webhook_secret.as_deref(), body, signature) {
            Ok(())
        } else {
            metrics::counter!(UPLINKS_TOTAL, "result" => "unauthenticated").increment(1);
            tracing::warn!("rejected uplink with invalid signature");
            Err(IngestError::Unauthenticated)
        }
    }

    async fn ingest(&self, uplink: Uplink) -> Receipt {
        let _device = self.device_locks.lock(&uplink.dev_eui).await;
        let now = self.clock.now_ms();

        let cursor = self.cursors.get(&uplink.dev_eui).map(|c| *c);
        let epoch = match check_frame(
            cursor.as_ref(),
            uplink.frame_counter,
            self.policy.fcnt_rollover_gap,
        ) {
            FrameCheck::Duplicate => {
                tracing::debug!(
                    "duplicate uplink {} fcnt {}",
                    uplink.dev_eui,
                    uplink.frame_counter
                );
                return Receipt::Duplicate;
            }
            FrameCheck::Fresh { epoch } => epoch,
            FrameCheck::Rollover { epoch } => {
                tracing::info!(
                    "frame counter of {} restarted at {} (epoch {epoch})",
                    uplink.dev_eui,
                    uplink.frame_counter
                );
                epoch
            }
        };

        let occupancy = decode_occupancy(&uplink.payload);
        let target = self.engine.resolve_sensor(&uplink.dev_eui);
        let spooling = target.is_some() && occupancy.is_some();
        if spooling && self.spool.len() >= self.policy.max_spool_entries {
            self.evict_oldest(now).await;
        }

        let reading = SensorReading {
            id: Ulid::new(),
            dev_eui: uplink.dev_eui.clone(),
            epoch,
            frame_counter: uplink.frame_counter,
            occupancy,
            received_at: now,
            space_id: target.map(|(space_id, _)| space_id),
            tenant_id: target.map(|(_, tenant_id)| tenant_id),
        };
        let record = UplinkRecord::Accepted {
            reading: reading.clone(),
            cursor: FrameCursor {
                epoch,
                last_fcnt: uplink.frame_counter,
                seen_at: now,
            },
        };
        if !self.persist_or_hold(record).await {
            return Receipt::Spooled;
        }

        let Some((space_id, _)) = target else {
            tracing::info!("uplink from unassigned device {}", uplink.dev_eui);
            return Receipt::Orphan;
        };
        let Some(occupancy) = occupancy else {
            return Receipt::NoSignal;
        };

        match self
            .engine
            .apply_occupancy(space_id, occupancy, reading.received_at)
            .await
        {
            Ok(outcome) => {
                self.clear(reading.id).await;
                Receipt::Applied(outcome)
            }
            Err(e) => {
                tracing::warn!("spooling uplink {} for space {space_id}: {e}", reading.id);
                let record = UplinkRecord::Retried {
                    id: reading.id,
                    retry_count: 0,
                    next_retry_at: now,
                    last_error: e.to_string(),
                };
                // The Accepted record already holds the spool entry.
                if let Err(e) = self.persist_and_apply(&record).await {
                    tracing::warn!("could not record spool error for {}: {e}", reading.id);
                }
                metrics::gauge!(SPOOL_DEPTH).set(self.spool.len() as f64);
                Receipt::Spooled
            }
        }
    }

    /// Make room in a full spool by dead-lettering its oldest entry.
    async fn evict_oldest(&self, now: Ms) {
        let oldest = self
            .spool
            .iter()
            .min_by_key(|e| e.id())
            .map(|e| e.value().clone());
        if let Some(entry) = oldest {
            tracing::warn!(
                "uplink spool full at {} entries, evicting {}",
                self.spool.len(),
                entry.id()
            );
            self.dead_letter(&entry, entry.retry_count, "spool full".into(), now)
                .await;
        }
    }

    /// Drop a spool entry whose transition went through. If the clear itself is
    /// lost, the entry replays later as an unchanged signal.
    async fn clear(&self, id: Ulid) {
        if let Err(e) = self.persist_and_apply(&UplinkRecord::Cleared { id }).await {
            tracing::warn!("could not clear spool entry {id}: {e}");
        }
    }

    /// Journal held records, then replay due spool entries. Only one pass runs
    /// at a time.
    pub async fn process_spool(&self) -> Result<SpoolReport, IngestError> {
        let Ok(_pass) = self.spool_pass.try_lock() else {
            return Ok(SpoolReport {
                skipped: true,
                ..SpoolReport::default()
            });
        };
        let mut report = SpoolReport {
            journaled: self.flush_unjournaled().await,
            ..SpoolReport::default()
        };
        if !self.unjournaled.lock().await.is_empty() {
            // Journal still down. Settled entries could not be cleared.
            return Ok(report);
        }
        let now = self.clock.now_ms();
        let mut due: Vec<SpoolEntry> = self
            .spool
            .iter()
            .filter(|e| e.next_retry_at <= now)
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|e| e.id());

        for entry in due {
            let _device = self.device_locks.lock(&entry.reading.dev_eui).await;
            // The live path may have settled it meanwhile.
            let Some(entry) = self.spool.get(&entry.id()).map(|e| e.value().clone()) else {
                continue;
            };
            let reading = &entry.reading;
            let (Some(space_id), Some(occupancy)) = (reading.space_id, reading.occupancy) else {
                self.clear(entry.id()).await;
                continue;
            };

            match self
                .engine
                .apply_occupancy(space_id, occupancy, entry.reading.received_at)
                .await
            {
                Ok(outcome) => {
                    tracing::info!("replayed spooled uplink {}: {outcome:?}", entry.id());
                    self.persist_and_apply(&UplinkRecord::Cleared { id: entry.id() })
                        .await?;
                    report.replayed += 1;
                }
                Err(e) => {
                    let retry_count = entry.retry_count + 1;
                    if retry_count > self.policy.spool_max_retries {
                        self.dead_letter(&entry, retry_count, e.to_string(), now)
                            .await;
                        report.dead_lettered += 1;
                    } else {
                        let next_retry_at = now + backoff_ms(&self.policy, retry_count);
                        tracing::debug!(
                            "spooled uplink {} failed again ({e}), retry {retry_count} at \
                             {next_retry_at}",
                            entry.id()
                        );
                        let record = UplinkRecord::Retried {
                            id: entry.id(),
                            retry_count,
                            next_retry_at,
                            last_error: e.to_string(),
                        };
                        self.persist_and_apply(&record).await?;
                        report.retried += 1;
                    }
                }
            }
        }

        metrics::gauge!(SPOOL_DEPTH).set(self.spool.len() as f64);
        Ok(report)
    }

    async fn dead_letter(&self, entry: &SpoolEntry, retry_count: u32, error: String, now: Ms) {
        let record = UplinkRecord::DeadLettered {
            id: entry.id(),
            retry_count,
            last_error: error.clone(),
            at: now,
        };
        self.persist_or_hold(record).await;
        tracing::error!(
            "uplink {} from {} dead-lettered after {retry_count} attempts: {error}",
            entry.id(),
            entry.reading.dev_eui
        );
        metrics::counter!(DEAD_LETTERS_TOTAL).increment(1);
        self.notify.alert(
            entry.reading.tenant_id,
            Notice::UplinkDeadLettered {
                spool_id: entry.id(),
                dev_eui: entry.reading.dev_eui.clone(),
                retries: retry_count,
                error,
                at: now,
            },
        );
    }

    /// Drop frame cursors and readings older than their retention windows.
    pub async fn prune(&self, now: Ms) -> Result<PruneReport, IngestError> {
        let cursors_before = now - self.policy.dedup_retention_ms;
        let readings_before = now - self.policy.reading_retention_ms;
        let report = PruneReport {
            cursors: self
                .cursors
                .iter()
                .filter(|c| c.seen_at < cursors_before)
                .count(),
            readings: self
                .readings
                .iter()
                .map(|list| {
                    list.iter()
                        .filter(|r| r.received_at < readings_before)
                        .count()
                })
                .sum(),
        };
        if report.cursors == 0 && report.readings == 0 {
            return Ok(report);
        }
        let record = UplinkRecord::Pruned {
            cursors_before,
            readings_before,
        };
        self.persist_and_apply(&record).await?;
        tracing::info!(
            "pruned {} frame cursors and {} readings",
            report.cursors,
            report.readings
        );
        Ok(report)
    }

    /// Rewrite the uplink journal as a single snapshot.
    pub async fn compact_journal(&self) -> Result<(), IngestError> {
        let _gate = self.gate.write().await;
        let snapshot = UplinkSnapshot {
            cursors: self
                .cursors
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            readings: self
                .readings
                .iter()
                .flat_map(|e| e.value().clone())
                .collect(),
            spool: self.spool.iter().map(|e| e.value().clone()).collect(),
            dead_letters: self
                .dead_letters
                .iter()
                .map(|e| e.value().clone())
                .collect(),
            orphans: self.orphans.iter().map(|e| e.value().clone()).collect(),
        };
        self.journal.compact(vec![UplinkRecord::Snapshot(snapshot)]).await?;
        // The snapshot already covers whatever was held.
        let mut held = self.unjournaled.lock().await;
        if !held.is_empty() {
            tracing::info!("snapshot absorbed {} held uplink records", held.len());
            held.clear();
        }
        tracing::info!("compacted uplink journal");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    pub fn spool_depth(&self) -> usize {
        self.spool.len()
    }

    /// Readings of one device the caller may see, oldest first.
    pub fn readings(&self, ctx: &TenantContext, dev_eui: &DevEui) -> Vec<SensorReading> {
        self.readings
            .get(dev_eui)
            .map(|list| {
                list.iter()
                    .filter(|r| visible(ctx, r.tenant_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn spool_entries(&self, ctx: &TenantContext) -> Vec<SpoolEntry> {
        let mut out: Vec<SpoolEntry> = self
            .spool
            .iter()
            .filter(|e| visible(ctx, e.reading.tenant_id))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| e.id());
        out
    }

    pub fn dead_letters(&self, ctx: &TenantContext) -> Vec<DeadLetter> {
        let mut out: Vec<DeadLetter> = self
            .dead_letters
            .iter()
            .filter(|e| visible(ctx, e.entry.reading.tenant_id))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|d| d.entry.id());
        out
    }

    /// Unassigned devices. Platform admins only: orphans belong to no tenant.
    pub fn orphans(&self, ctx: &TenantContext) -> Result<Vec<OrphanDevice>, AccessError> {
        if !ctx.is_platform_admin {
            return Err(AccessError::Forbidden);
        }
        let mut out: Vec<OrphanDevice> = self.orphans.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.dev_eui.cmp(&b.dev_eui));
        Ok(out)
    }
}

/// Tenant-less records are visible to platform admins only.
fn visible(ctx: &TenantContext, tenant_id: Option<TenantId>) -> bool {
    match tenant_id {
        Some(t) => ctx.can_access(t),
        None => ctx.is_platform_admin,
    }
}
