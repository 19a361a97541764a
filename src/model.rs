use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type TenantId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// LoRaWAN device EUI, normalized to 16 upper-case hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevEui(String);

impl DevEui {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != 16 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite physical + booking state of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceStatus {
    Free,
    Occupied,
    /// Booked, not yet physically occupied.
    Reserved,
    Maintenance,
    /// Initial state, and the state after a maintenance clear.
    Unknown,
}

impl SpaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceStatus::Free => "free",
            SpaceStatus::Occupied => "occupied",
            SpaceStatus::Reserved => "reserved",
            SpaceStatus::Maintenance => "maintenance",
            SpaceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SpaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical signal decoded from a sensor uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Occupancy {
    Occupied,
    Vacant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    /// Pending and confirmed reservations claim their interval.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub space_id: Ulid,
    pub requester: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub request_id: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Why a space changed state. Carried on notifications and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionCause {
    Sensor,
    Booking,
    Cancellation,
    Expiry,
    Maintenance,
    MaintenanceCleared,
}

impl TransitionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionCause::Sensor => "sensor",
            TransitionCause::Booking => "booking",
            TransitionCause::Cancellation => "cancellation",
            TransitionCause::Expiry => "expiry",
            TransitionCause::Maintenance => "maintenance",
            TransitionCause::MaintenanceCleared => "maintenance_cleared",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceState {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub label: Option<String>,
    pub sensor: Option<DevEui>,
    pub status: SpaceStatus,
    /// Last physical signal applied, independent of booking state.
    pub occupancy: Option<Occupancy>,
    pub occupancy_observed_at: Option<Ms>,
    pub last_update: Ms,
    /// All reservations ever made on this space, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl SpaceState {
    pub fn new(id: Ulid, tenant_id: TenantId, label: Option<String>, at: Ms) -> Self {
        Self {
            id,
            tenant_id,
            label,
            sensor: None,
            status: SpaceStatus::Unknown,
            occupancy: None,
            occupancy_observed_at: None,
            last_update: at,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// True if some active reservation other than `except` has not ended by `now`.
    pub fn has_active_booking(&self, now: Ms, except: Option<Ulid>) -> bool {
        self.reservations
            .iter()
            .any(|r| r.status.is_active() && r.span.end > now && Some(r.id) != except)
    }

    pub fn active_count(&self) -> usize {
        self.reservations
            .iter()
            .filter(|r| r.status.is_active())
            .count()
    }
}

/// The event types, flat with no nesting. This is the state WAL record format.
///
/// Events that change a space's status carry the resulting status so that
/// replay never re-runs the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceRegistered {
        id: Ulid,
        tenant_id: TenantId,
        label: Option<String>,
        at: Ms,
    },
    /// Full state of one space, written by compaction.
    SpaceSnapshot {
        state: SpaceState,
    },
    SensorAssigned {
        space_id: Ulid,
        dev_eui: DevEui,
        at: Ms,
    },
    SensorUnassigned {
        space_id: Ulid,
        dev_eui: DevEui,
        at: Ms,
    },
    Booked {
        reservation: Reservation,
        status: SpaceStatus,
    },
    ReservationCancelled {
        id: Ulid,
        space_id: Ulid,
        at: Ms,
        status: SpaceStatus,
    },
    ReservationExpired {
        id: Ulid,
        space_id: Ulid,
        at: Ms,
        status: SpaceStatus,
    },
    OccupancyReported {
        space_id: Ulid,
        occupancy: Occupancy,
        observed_at: Ms,
        at: Ms,
        status: SpaceStatus,
    },
    MaintenanceSet {
        space_id: Ulid,
        at: Ms,
    },
    MaintenanceCleared {
        space_id: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn space_id(&self) -> Ulid {
        match self {
            Event::SpaceRegistered { id, .. } => *id,
            Event::SpaceSnapshot { state } => state.id,
            Event::SensorAssigned { space_id, .. }
            | Event::SensorUnassigned { space_id, .. }
            | Event::ReservationCancelled { space_id, .. }
            | Event::ReservationExpired { space_id, .. }
            | Event::OccupancyReported { space_id, .. }
            | Event::MaintenanceSet { space_id, .. }
            | Event::MaintenanceCleared { space_id, .. } => *space_id,
            Event::Booked { reservation, .. } => reservation.space_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceInfo {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub label: Option<String>,
    pub sensor: Option<DevEui>,
    pub status: SpaceStatus,
    pub occupancy: Option<Occupancy>,
    pub last_update: Ms,
    pub active_reservations: usize,
}

impl From<&SpaceState> for SpaceInfo {
    fn from(ss: &SpaceState) -> Self {
        Self {
            id: ss.id,
            tenant_id: ss.tenant_id,
            label: ss.label.clone(),
            sensor: ss.sensor.clone(),
            status: ss.status,
            occupancy: ss.occupancy,
            last_update: ss.last_update,
            active_reservations: ss.active_count(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccupancyStats {
    pub total: usize,
    pub free: usize,
    pub occupied: usize,
    pub reserved: usize,
    pub maintenance: usize,
    pub unknown: usize,
}

impl OccupancyStats {
    pub fn record(&mut self, status: SpaceStatus) {
        self.total += 1;
        match status {
            SpaceStatus::Free => self.free += 1,
            SpaceStatus::Occupied => self.occupied += 1,
            SpaceStatus::Reserved => self.reserved += 1,
            SpaceStatus::Maintenance => self.maintenance += 1,
            SpaceStatus::Unknown => self.unknown += 1,
        }
    }

    /// Share of spaces physically occupied, in percent.
    pub fn occupancy_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.occupied as f64 * 100.0 / self.total as f64
    }
}

/// An interval already claimed on the space. Carries no requester identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictInfo {
    pub reservation_id: Ulid,
    pub span: Span,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            tenant_id: Ulid::new(),
            space_id: Ulid::new(),
            requester: "driver@example.com".into(),
            span: Span::new(start, end),
            status,
            request_id: Ulid::new().to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        assert!(!Span::new(10, 12).overlaps(&Span::new(12, 14)));
        assert!(!Span::new(12, 14).overlaps(&Span::new(10, 12)));
        assert!(Span::new(10, 12).overlaps(&Span::new(11, 13)));
        assert!(Span::new(11, 13).overlaps(&Span::new(10, 12)));
    }

    #[test]
    fn dev_eui_normalizes() {
        let eui = DevEui::parse(" 70b3d57ed0001a2b ").unwrap();
        assert_eq!(eui.as_str(), "70B3D57ED0001A2B");
        assert!(DevEui::parse("70b3d57ed0001a2").is_none());
        assert!(DevEui::parse("70b3d57ed0001a2z").is_none());
    }

    #[test]
    fn reservations_kept_sorted() {
        let mut ss = SpaceState::new(Ulid::new(), Ulid::new(), None, 0);
        ss.insert_reservation(reservation(300, 400, ReservationStatus::Confirmed));
        ss.insert_reservation(reservation(100, 200, ReservationStatus::Confirmed));
        ss.insert_reservation(reservation(200, 300, ReservationStatus::Cancelled));
        let starts: Vec<Ms> = ss.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ss = SpaceState::new(Ulid::new(), Ulid::new(), None, 0);
        ss.insert_reservation(reservation(100, 200, ReservationStatus::Confirmed));
        ss.insert_reservation(reservation(450, 600, ReservationStatus::Confirmed));
        ss.insert_reservation(reservation(1000, 1100, ReservationStatus::Confirmed));
        let hits: Vec<_> = ss.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ss = SpaceState::new(Ulid::new(), Ulid::new(), None, 0);
        ss.insert_reservation(reservation(100, 200, ReservationStatus::Confirmed));
        assert_eq!(ss.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn active_booking_ignores_final_and_ended() {
        let mut ss = SpaceState::new(Ulid::new(), Ulid::new(), None, 0);
        let ended = reservation(0, 100, ReservationStatus::Confirmed);
        let cancelled = reservation(500, 600, ReservationStatus::Cancelled);
        ss.insert_reservation(ended);
        ss.insert_reservation(cancelled);
        assert!(!ss.has_active_booking(200, None));

        let live = reservation(300, 400, ReservationStatus::Confirmed);
        let live_id = live.id;
        ss.insert_reservation(live);
        assert!(ss.has_active_booking(200, None));
        assert!(!ss.has_active_booking(200, Some(live_id)));
    }

    #[test]
    fn stats_rate() {
        let mut stats = OccupancyStats::default();
        assert_eq!(stats.occupancy_rate(), 0.0);
        stats.record(SpaceStatus::Occupied);
        stats.record(SpaceStatus::Free);
        stats.record(SpaceStatus::Reserved);
        stats.record(SpaceStatus::Occupied);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.occupancy_rate(), 50.0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::Booked {
            reservation: reservation(1_000, 2_000, ReservationStatus::Confirmed),
            status: SpaceStatus::Reserved,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
