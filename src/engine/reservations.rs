use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::tenant::{Role, Scope, TenantContext};

use super::conflict::{find_conflicts, validate_range};
use super::transitions::{Transition, Trigger, next_status};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub space_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub requester: String,
    /// Client-chosen idempotency key, unique per tenant.
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Booking {
    Created(Reservation),
    /// The request id was already used; this is the original reservation.
    Replayed(Reservation),
    Conflict(Vec<ConflictInfo>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellation {
    Cancelled(Reservation),
    AlreadyFinal(Reservation),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub expired: Vec<Ulid>,
    /// Spaces whose lock could not be taken in time. Retried next run.
    pub busy_spaces: Vec<Ulid>,
}

fn count(outcome: &'static str) {
    metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    pub async fn create_reservation(
        &self,
        ctx: &TenantContext,
        req: ReservationRequest,
    ) -> Result<Booking, EngineError> {
        ctx.require(Role::Operator)?;
        if req.request_id.is_empty() || req.request_id.len() > MAX_REQUEST_ID_LEN {
            return Err(EngineError::LimitExceeded("request id empty or too long"));
        }
        if req.requester.len() > MAX_REQUESTER_LEN {
            return Err(EngineError::LimitExceeded("requester too long"));
        }
        let now = self.clock.now_ms();
        let span = validate_range(&self.policy, req.start, req.end, now)?;
        let tenant_id = self.space_owner(ctx, req.space_id)?;

        let key = (tenant_id, req.request_id.clone());
        let Some(_key_guard) = self
            .request_locks
            .lock_timeout(&key, self.policy.lock_timeout)
            .await
        else {
            metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
            return Err(EngineError::Busy(req.space_id));
        };

        if let Some(existing) = self.replay_request(ctx, &key).await? {
            count("replayed");
            return Ok(Booking::Replayed(existing));
        }

        let mut space = self.lock_space(req.space_id).await?;
        if space.status == SpaceStatus::Maintenance {
            count("maintenance");
            return Err(EngineError::InMaintenance(req.space_id));
        }
        if space.active_count() >= self.policy.max_active_per_space {
            return Err(EngineError::LimitExceeded("too many active reservations on space"));
        }

        let conflicts = find_conflicts(&space, &span);
        if !conflicts.is_empty() {
            count("conflict");
            return Ok(Booking::Conflict(conflicts));
        }

        let status = match next_status(space.status, Trigger::Booked, true) {
            Transition::Refused => return Err(EngineError::InMaintenance(req.space_id)),
            t => t.resolve(space.status),
        };
        let reservation = Reservation {
            id: Ulid::new(),
            tenant_id,
            space_id: req.space_id,
            requester: req.requester,
            span,
            status: ReservationStatus::Confirmed,
            request_id: req.request_id,
            created_at: now,
            updated_at: now,
        };
        let event = Event::Booked {
            reservation: reservation.clone(),
            status,
        };
        self.persist_and_apply(&mut space, &event, TransitionCause::Booking)
            .await?;
        drop(space);

        count("created");
        self.notify_reservation(&reservation);
        tracing::info!(
            "reservation {} on space {} [{}, {})",
            reservation.id,
            reservation.space_id,
            span.start,
            span.end
        );
        Ok(Booking::Created(reservation))
    }

    /// Current state of the reservation already booked under `key`, if any.
    async fn replay_request(
        &self,
        ctx: &TenantContext,
        key: &(TenantId, String),
    ) -> Result<Option<Reservation>, EngineError> {
        let Some(reservation_id) = self.requests.get(key).map(|r| *r) else {
            return Ok(None);
        };
        self.get_reservation(ctx, reservation_id).await.map(Some)
    }

    pub async fn cancel_reservation(
        &self,
        ctx: &TenantContext,
        reservation_id: Ulid,
    ) -> Result<Cancellation, EngineError> {
        ctx.require(Role::Operator)?;
        let space_id = self
            .reservation_index
            .get(&reservation_id)
            .map(|s| *s)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let mut space = self
            .lock_space_for(ctx, space_id)
            .await
            .map_err(|e| match e {
                EngineError::NotFound(_) => EngineError::NotFound(reservation_id),
                other => other,
            })?;

        let Some(current) = space.reservation(reservation_id).cloned() else {
            return Err(EngineError::NotFound(reservation_id));
        };
        if !current.status.is_active() {
            count("already_final");
            return Ok(Cancellation::AlreadyFinal(current));
        }

        let now = self.clock.now_ms();
        let booked = space.has_active_booking(now, Some(reservation_id));
        let status = next_status(space.status, Trigger::Released, booked).resolve(space.status);
        let event = Event::ReservationCancelled {
            id: reservation_id,
            space_id,
            at: now,
            status,
        };
        self.persist_and_apply(&mut space, &event, TransitionCause::Cancellation)
            .await?;
        let cancelled = space
            .reservation(reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;
        drop(space);

        count("cancelled");
        self.notify_reservation(&cancelled);
        tracing::info!("reservation {reservation_id} cancelled");
        Ok(Cancellation::Cancelled(cancelled))
    }

    /// Expire every active reservation that has ended, within the caller's tenant
    /// (all tenants for a platform admin).
    pub async fn expire_old(&self, ctx: &TenantContext) -> Result<ExpiryReport, EngineError> {
        ctx.require(Role::Operator)?;
        let tenant = if ctx.is_platform_admin {
            None
        } else {
            Some(ctx.tenant_id)
        };
        let now = self.clock.now_ms();
        let mut report = ExpiryReport::default();

        for (space_id, rs) in self.spaces_for(tenant) {
            // Cheap pre-check; a contended space goes straight to the bounded lock.
            let due = match rs.try_read() {
                Ok(guard) => guard
                    .reservations
                    .iter()
                    .any(|r| r.status.is_active() && r.span.end <= now),
                Err(_) => true,
            };
            if due {
                self.expire_space(space_id, now, &mut report).await?;
            }
        }

        if !report.expired.is_empty() {
            tracing::info!("expired {} reservations", report.expired.len());
        }
        Ok(report)
    }

    async fn expire_space(
        &self,
        space_id: Ulid,
        now: Ms,
        report: &mut ExpiryReport,
    ) -> Result<(), EngineError> {
        let mut space = match self.lock_space(space_id).await {
            Ok(space) => space,
            Err(EngineError::Busy(_)) => {
                tracing::warn!("expiry skipped busy space {space_id}");
                report.busy_spaces.push(space_id);
                return Ok(());
            }
            Err(EngineError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let due: Vec<Ulid> = space
            .reservations
            .iter()
            .filter(|r| r.status.is_active() && r.span.end <= now)
            .map(|r| r.id)
            .collect();
        for id in due {
            let booked = space.has_active_booking(now, Some(id));
            let status = next_status(space.status, Trigger::Released, booked).resolve(space.status);
            let event = Event::ReservationExpired {
                id,
                space_id,
                at: now,
                status,
            };
            self.persist_and_apply(&mut space, &event, TransitionCause::Expiry)
                .await?;
            if let Some(r) = space.reservation(id) {
                self.notify_reservation(r);
            }
            report.expired.push(id);
        }
        Ok(())
    }

    fn notify_reservation(&self, r: &Reservation) {
        self.notify.send(
            r.tenant_id,
            Notice::ReservationChanged {
                reservation_id: r.id,
                space_id: r.space_id,
                status: r.status,
                at: r.updated_at,
            },
        );
    }

    pub async fn get_reservation(
        &self,
        ctx: &TenantContext,
        reservation_id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let not_found = EngineError::NotFound(reservation_id);
        let space_id = self
            .reservation_index
            .get(&reservation_id)
            .map(|s| *s)
            .ok_or_else(|| not_found.clone())?;
        let guard = self
            .read_space(ctx, space_id)
            .await
            .map_err(|e| match e {
                EngineError::NotFound(_) => not_found.clone(),
                other => other,
            })?;
        guard.reservation(reservation_id).cloned().ok_or(not_found)
    }

    /// Reservations visible under `scope`, optionally narrowed to one space and
    /// one status, ordered by start.
    pub async fn list_reservations(
        &self,
        ctx: &TenantContext,
        scope: Scope,
        space_id: Option<Ulid>,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let tenant = ctx.filter(scope)?;
        let mut out = Vec::new();
        for (id, rs) in self.spaces_for(tenant) {
            if space_id.is_some_and(|s| s != id) {
                continue;
            }
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        Ok(out)
    }

    /// Active reservations overlapping `[start, end)`. Empty means the space is free then.
    pub async fn check_availability(
        &self,
        ctx: &TenantContext,
        space_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<ConflictInfo>, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidRange("start must be before end"));
        }
        let guard = self.read_space(ctx, space_id).await?;
        Ok(find_conflicts(&guard, &Span::new(start, end)))
    }
}
