use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::tenant::{Role, Scope, TenantContext};

use super::transitions::{Transition, Trigger, next_status};
use super::{Engine, EngineError};

/// Result of feeding one sensor observation into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorOutcome {
    Changed { from: SpaceStatus, to: SpaceStatus },
    /// Occupancy recorded, status unchanged.
    Recorded,
    /// Same signal as already applied. Nothing written.
    Unchanged,
    IgnoredMaintenance,
    /// Observed before the last applied reading.
    Stale,
}

impl Engine {
    pub async fn register_space(
        &self,
        ctx: &TenantContext,
        id: Ulid,
        label: Option<String>,
    ) -> Result<SpaceInfo, EngineError> {
        ctx.require(Role::Admin)?;
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("space label too long"));
        }
        if self.spaces.len() >= MAX_SPACES {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }

        // Claim the id before the journal write so a concurrent register loses.
        match self.space_tenants.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(ctx.tenant_id);
            }
        }

        let at = self.clock.now_ms();
        let event = Event::SpaceRegistered {
            id,
            tenant_id: ctx.tenant_id,
            label: label.clone(),
            at,
        };
        let gate = self.gate.read().await;
        if let Err(e) = self.journal.append(&event).await {
            self.space_tenants.remove(&id);
            return Err(e.into());
        }
        let ss = SpaceState::new(id, ctx.tenant_id, label, at);
        let info = SpaceInfo::from(&ss);
        self.spaces.insert(id, Arc::new(RwLock::new(ss)));
        drop(gate);

        tracing::info!("registered space {id} for tenant {}", ctx.tenant_id);
        Ok(info)
    }

    /// Bind a sensor to a space, replacing any sensor the space already had.
    pub async fn assign_sensor(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
        dev_eui: DevEui,
    ) -> Result<SpaceInfo, EngineError> {
        ctx.require(Role::Admin)?;
        let mut space = self.lock_space_for(ctx, space_id).await?;
        if space.sensor.as_ref() == Some(&dev_eui) {
            return Ok(SpaceInfo::from(&*space));
        }

        match self.sensors.entry(dev_eui.clone()) {
            Entry::Occupied(e) => {
                let holder = *e.get();
                let visible = self
                    .space_tenants
                    .get(&holder)
                    .is_some_and(|t| ctx.can_access(*t));
                return Err(EngineError::SensorInUse(visible.then_some(holder)));
            }
            Entry::Vacant(v) => {
                v.insert(space_id);
            }
        }

        let at = self.clock.now_ms();
        if let Some(previous) = space.sensor.clone() {
            let event = Event::SensorUnassigned {
                space_id,
                dev_eui: previous,
                at,
            };
            if let Err(e) = self
                .persist_and_apply(&mut space, &event, TransitionCause::Sensor)
                .await
            {
                self.sensors.remove(&dev_eui);
                return Err(e);
            }
        }

        let event = Event::SensorAssigned {
            space_id,
            dev_eui: dev_eui.clone(),
            at,
        };
        if let Err(e) = self
            .persist_and_apply(&mut space, &event, TransitionCause::Sensor)
            .await
        {
            self.sensors.remove(&dev_eui);
            return Err(e);
        }
        tracing::info!("sensor {dev_eui} assigned to space {space_id}");
        Ok(SpaceInfo::from(&*space))
    }

    /// Returns the sensor that was bound, if any.
    pub async fn unassign_sensor(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
    ) -> Result<Option<DevEui>, EngineError> {
        ctx.require(Role::Admin)?;
        let mut space = self.lock_space_for(ctx, space_id).await?;
        let Some(dev_eui) = space.sensor.clone() else {
            return Ok(None);
        };
        let event = Event::SensorUnassigned {
            space_id,
            dev_eui: dev_eui.clone(),
            at: self.clock.now_ms(),
        };
        self.persist_and_apply(&mut space, &event, TransitionCause::Sensor)
            .await?;
        Ok(Some(dev_eui))
    }

    pub async fn set_maintenance(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
    ) -> Result<SpaceInfo, EngineError> {
        ctx.require(Role::Admin)?;
        let mut space = self.lock_space_for(ctx, space_id).await?;
        if let Transition::Move(_) = next_status(space.status, Trigger::MaintenanceSet, false) {
            let event = Event::MaintenanceSet {
                space_id,
                at: self.clock.now_ms(),
            };
            self.persist_and_apply(&mut space, &event, TransitionCause::Maintenance)
                .await?;
        }
        Ok(SpaceInfo::from(&*space))
    }

    /// Leave maintenance. The space returns to `unknown` until the next signal.
    pub async fn clear_maintenance(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
    ) -> Result<SpaceInfo, EngineError> {
        ctx.require(Role::Admin)?;
        let mut space = self.lock_space_for(ctx, space_id).await?;
        if let Transition::Move(_) =
            next_status(space.status, Trigger::MaintenanceCleared, false)
        {
            let event = Event::MaintenanceCleared {
                space_id,
                at: self.clock.now_ms(),
            };
            self.persist_and_apply(&mut space, &event, TransitionCause::MaintenanceCleared)
                .await?;
        }
        Ok(SpaceInfo::from(&*space))
    }

    /// Feed a sensor observation into the state machine. Only uplink ingestion calls this.
    pub(crate) async fn apply_occupancy(
        &self,
        space_id: Ulid,
        occupancy: Occupancy,
        observed_at: Ms,
    ) -> Result<SensorOutcome, EngineError> {
        let mut space = self.lock_space(space_id).await?;
        if space
            .occupancy_observed_at
            .is_some_and(|last| observed_at < last)
        {
            return Ok(SensorOutcome::Stale);
        }

        let now = self.clock.now_ms();
        let booked = space.has_active_booking(now, None);
        let from = space.status;
        let to = match next_status(from, Trigger::Sensor(occupancy), booked) {
            Transition::Ignored => return Ok(SensorOutcome::IgnoredMaintenance),
            Transition::Stay if space.occupancy == Some(occupancy) => {
                return Ok(SensorOutcome::Unchanged);
            }
            t => t.resolve(from),
        };

        let event = Event::OccupancyReported {
            space_id,
            occupancy,
            observed_at,
            at: now,
            status: to,
        };
        self.persist_and_apply(&mut space, &event, TransitionCause::Sensor)
            .await?;
        if from == to {
            Ok(SensorOutcome::Recorded)
        } else {
            Ok(SensorOutcome::Changed { from, to })
        }
    }

    /// Space and owning tenant for an assigned sensor.
    pub(crate) fn resolve_sensor(&self, dev_eui: &DevEui) -> Option<(Ulid, TenantId)> {
        let space_id = *self.sensors.get(dev_eui)?;
        let tenant_id = *self.space_tenants.get(&space_id)?;
        Some((space_id, tenant_id))
    }

    pub async fn get_space(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
    ) -> Result<SpaceInfo, EngineError> {
        let guard = self.read_space(ctx, space_id).await?;
        Ok(SpaceInfo::from(&*guard))
    }

    pub async fn list_spaces(
        &self,
        ctx: &TenantContext,
        scope: Scope,
        status: Option<SpaceStatus>,
    ) -> Result<Vec<SpaceInfo>, EngineError> {
        let tenant = ctx.filter(scope)?;
        let mut out = Vec::new();
        for (_, rs) in self.spaces_for(tenant) {
            let guard = rs.read().await;
            if status.is_none_or(|s| guard.status == s) {
                out.push(SpaceInfo::from(&*guard));
            }
        }
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    pub async fn occupancy_stats(
        &self,
        ctx: &TenantContext,
        scope: Scope,
    ) -> Result<OccupancyStats, EngineError> {
        let tenant = ctx.filter(scope)?;
        let mut stats = OccupancyStats::default();
        for (_, rs) in self.spaces_for(tenant) {
            stats.record(rs.read().await.status);
        }
        Ok(stats)
    }
}
