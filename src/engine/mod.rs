mod conflict;
mod error;
mod reservations;
mod spaces;
mod transitions;

pub use error::EngineError;
pub use reservations::{Booking, Cancellation, ExpiryReport, ReservationRequest};
pub use spaces::SensorOutcome;
pub use transitions::{Transition, Trigger, next_status};

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::journal::{Journal, WalJournal};
use crate::limits::KEY_LOCK_STRIPES;
use crate::locks::StripedLocks;
use crate::model::*;
use crate::notify::{Notice, NotifyHub};
use crate::tenant::TenantContext;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

/// Write access to one space. Holds the persist gate for as long as the space
/// lock, so compaction never runs between a journal append and its apply.
pub(crate) struct SpaceWrite {
    guard: OwnedRwLockWriteGuard<SpaceState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for SpaceWrite {
    type Target = SpaceState;
    fn deref(&self) -> &SpaceState {
        &self.guard
    }
}

impl DerefMut for SpaceWrite {
    fn deref_mut(&mut self) -> &mut SpaceState {
        &mut self.guard
    }
}

/// Owns every space and reservation. All access goes through tenant-checked
/// operations; the per-space state itself is not reachable from outside the crate.
///
/// ```compile_fail
/// # async fn revert(engine: &parkd::engine::Engine, space: ulid::Ulid) {
/// engine.get_space_state(&space).unwrap().write().await.status =
///     parkd::model::SpaceStatus::Free;
/// # }
/// ```
pub struct Engine {
    pub(super) spaces: DashMap<Ulid, SharedSpaceState>,
    /// Space → owning tenant, checked before any lock is taken.
    pub(super) space_tenants: DashMap<Ulid, TenantId>,
    /// Reservation → space.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// (tenant, request_id) → reservation.
    pub(super) requests: DashMap<(TenantId, String), Ulid>,
    /// Assigned sensor → space.
    pub(super) sensors: DashMap<DevEui, Ulid>,
    pub(super) request_locks: StripedLocks,
    pub(super) policy: BookingPolicy,
    pub(super) clock: Arc<dyn Clock>,
    pub(crate) notify: Arc<NotifyHub>,
    journal: Arc<dyn Journal<Event>>,
    gate: Arc<RwLock<()>>,
}

/// Apply an event directly to a SpaceState (caller holds the lock).
fn apply_to_space(ss: &mut SpaceState, event: &Event) {
    match event {
        Event::SpaceRegistered { .. } => {}
        Event::SpaceSnapshot { state } => *ss = state.clone(),
        Event::SensorAssigned { dev_eui, at, .. } => {
            ss.sensor = Some(dev_eui.clone());
            ss.last_update = *at;
        }
        Event::SensorUnassigned { at, .. } => {
            ss.sensor = None;
            ss.last_update = *at;
        }
        Event::Booked { reservation, status } => {
            ss.last_update = reservation.created_at;
            ss.status = *status;
            ss.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { id, at, status, .. } => {
            finish_reservation(ss, *id, ReservationStatus::Cancelled, *at, *status);
        }
        Event::ReservationExpired { id, at, status, .. } => {
            finish_reservation(ss, *id, ReservationStatus::Expired, *at, *status);
        }
        Event::OccupancyReported {
            occupancy,
            observed_at,
            at,
            status,
            ..
        } => {
            ss.occupancy = Some(*occupancy);
            ss.occupancy_observed_at = Some(*observed_at);
            ss.status = *status;
            ss.last_update = *at;
        }
        Event::MaintenanceSet { at, .. } => {
            ss.status = SpaceStatus::Maintenance;
            ss.last_update = *at;
        }
        Event::MaintenanceCleared { at, .. } => {
            ss.status = SpaceStatus::Unknown;
            ss.occupancy = None;
            ss.last_update = *at;
        }
    }
}

fn finish_reservation(
    ss: &mut SpaceState,
    id: Ulid,
    final_status: ReservationStatus,
    at: Ms,
    space_status: SpaceStatus,
) {
    if let Some(r) = ss.reservation_mut(id) {
        r.status = final_status;
        r.updated_at = at;
    }
    ss.status = space_status;
    ss.last_update = at;
}

impl Engine {
    /// Open the state journal at `path` and rebuild spaces from it.
    /// Must be called from within a Tokio runtime.
    pub fn open(
        path: &Path,
        policy: BookingPolicy,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let (journal, events) = WalJournal::<Event>::open(path)?;
        Ok(Self::with_journal(
            Arc::new(journal),
            events,
            policy,
            clock,
            notify,
        ))
    }

    /// Build an engine over an already-opened journal and its replayed events.
    pub fn with_journal(
        journal: Arc<dyn Journal<Event>>,
        events: Vec<Event>,
        policy: BookingPolicy,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        let engine = Self {
            spaces: DashMap::new(),
            space_tenants: DashMap::new(),
            reservation_index: DashMap::new(),
            requests: DashMap::new(),
            sensors: DashMap::new(),
            request_locks: StripedLocks::new(KEY_LOCK_STRIPES),
            policy,
            clock,
            notify,
            journal,
            gate: Arc::new(RwLock::new(())),
        };

        // Replay into plain maps first; nothing else can observe the engine yet.
        let mut states: HashMap<Ulid, SpaceState> = HashMap::new();
        for event in &events {
            match event {
                Event::SpaceRegistered {
                    id,
                    tenant_id,
                    label,
                    at,
                } => {
                    states.insert(*id, SpaceState::new(*id, *tenant_id, label.clone(), *at));
                }
                Event::SpaceSnapshot { state } => {
                    states.insert(state.id, state.clone());
                }
                other => {
                    if let Some(ss) = states.get_mut(&other.space_id()) {
                        apply_to_space(ss, other);
                    }
                }
            }
        }

        for (id, ss) in states {
            engine.index_space(&ss);
            engine.spaces.insert(id, Arc::new(RwLock::new(ss)));
        }
        engine
    }

    fn index_space(&self, ss: &SpaceState) {
        self.space_tenants.insert(ss.id, ss.tenant_id);
        if let Some(dev_eui) = &ss.sensor {
            self.sensors.insert(dev_eui.clone(), ss.id);
        }
        for r in &ss.reservations {
            self.reservation_index.insert(r.id, ss.id);
            self.requests.insert((r.tenant_id, r.request_id.clone()), r.id);
        }
    }

    pub(crate) fn get_space_state(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    /// Owner of a space, if the caller may see it. Foreign spaces read as absent.
    pub(super) fn space_owner(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
    ) -> Result<TenantId, EngineError> {
        match self.space_tenants.get(&space_id).map(|t| *t) {
            Some(tenant_id) if ctx.can_access(tenant_id) => Ok(tenant_id),
            _ => Err(EngineError::NotFound(space_id)),
        }
    }

    /// Take the persist gate and the space write lock, bounded by the policy timeout.
    pub(super) async fn lock_space(&self, space_id: Ulid) -> Result<SpaceWrite, EngineError> {
        let rs = self
            .get_space_state(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        let gate = self.gate.clone();
        let acquire = async move {
            let gate = gate.read_owned().await;
            let guard = rs.write_owned().await;
            SpaceWrite { guard, _gate: gate }
        };
        match tokio::time::timeout(self.policy.lock_timeout, acquire).await {
            Ok(write) => Ok(write),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::debug!("lock wait timed out on space {space_id}");
                Err(EngineError::Busy(space_id))
            }
        }
    }

    /// `lock_space` after a tenant ownership check.
    pub(super) async fn lock_space_for(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
    ) -> Result<SpaceWrite, EngineError> {
        self.space_owner(ctx, space_id)?;
        self.lock_space(space_id).await
    }

    /// Read access to a space the caller may see.
    pub(super) async fn read_space(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<SpaceState>, EngineError> {
        self.space_owner(ctx, space_id)?;
        let rs = self
            .get_space_state(&space_id)
            .ok_or(EngineError::NotFound(space_id))?;
        tokio::time::timeout(self.policy.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| EngineError::Busy(space_id))
    }

    /// Spaces visible under an optional tenant filter.
    pub(super) fn spaces_for(&self, tenant: Option<TenantId>) -> Vec<(Ulid, SharedSpaceState)> {
        self.spaces
            .iter()
            .filter(|e| {
                tenant.is_none()
                    || self.space_tenants.get(e.key()).map(|t| *t) == tenant
            })
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Journal-append + apply + index + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut SpaceState,
        event: &Event,
        cause: TransitionCause,
    ) -> Result<(), EngineError> {
        self.journal.append(event).await?;

        let from = ss.status;
        apply_to_space(ss, event);
        match event {
            Event::SensorAssigned { dev_eui, space_id, .. } => {
                self.sensors.insert(dev_eui.clone(), *space_id);
            }
            Event::SensorUnassigned { dev_eui, .. } => {
                self.sensors.remove(dev_eui);
            }
            Event::Booked { reservation, .. } => {
                self.reservation_index
                    .insert(reservation.id, reservation.space_id);
                self.requests.insert(
                    (reservation.tenant_id, reservation.request_id.clone()),
                    reservation.id,
                );
            }
            _ => {}
        }

        if ss.status != from {
            metrics::counter!(
                crate::observability::SPACE_TRANSITIONS_TOTAL,
                "cause" => cause.as_str(),
                "to" => ss.status.as_str()
            )
            .increment(1);
            tracing::debug!("space {} {from} -> {} ({})", ss.id, ss.status, cause.as_str());
            self.notify.send(
                ss.tenant_id,
                Notice::SpaceChanged {
                    space_id: ss.id,
                    from,
                    to: ss.status,
                    cause,
                    at: ss.last_update,
                },
            );
        }
        Ok(())
    }

    /// Rewrite the state journal as one snapshot per space.
    pub async fn compact_journal(&self) -> Result<usize, EngineError> {
        let _gate = self.gate.write().await;
        let shared: Vec<SharedSpaceState> =
            self.spaces.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(shared.len());
        for rs in shared {
            let state = rs.read().await.clone();
            events.push(Event::SpaceSnapshot { state });
        }
        let count = events.len();
        self.journal.compact(events).await?;
        tracing::info!("compacted state journal to {count} space snapshots");
        Ok(count)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }
}
