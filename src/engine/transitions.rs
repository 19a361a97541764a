use crate::model::{Occupancy, SpaceStatus};

/// What happened to a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Sensor(Occupancy),
    Booked,
    /// A reservation was cancelled or expired.
    Released,
    MaintenanceSet,
    MaintenanceCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Move(SpaceStatus),
    Stay,
    /// Sensor signal dropped because the space is in maintenance.
    Ignored,
    /// Booking rejected because the space is in maintenance.
    Refused,
}

impl Transition {
    /// Status after the transition, given the status before it.
    pub fn resolve(self, current: SpaceStatus) -> SpaceStatus {
        match self {
            Transition::Move(to) => to,
            _ => current,
        }
    }
}

/// The space state machine. `booked` is whether the space still holds an
/// active reservation that has not ended.
pub fn next_status(current: SpaceStatus, trigger: Trigger, booked: bool) -> Transition {
    use SpaceStatus::*;

    let free_or_reserved = if booked { Reserved } else { Free };

    let to = match (current, trigger) {
        (Maintenance, Trigger::Sensor(_)) => return Transition::Ignored,
        (Maintenance, Trigger::Booked) => return Transition::Refused,
        (Maintenance, Trigger::MaintenanceCleared) => Unknown,
        (_, Trigger::MaintenanceSet) => Maintenance,
        (_, Trigger::MaintenanceCleared) => current,

        (_, Trigger::Sensor(Occupancy::Occupied)) => Occupied,
        (Unknown | Occupied, Trigger::Sensor(Occupancy::Vacant)) => free_or_reserved,
        (_, Trigger::Sensor(Occupancy::Vacant)) => current,

        (Unknown | Free, Trigger::Booked) => Reserved,
        (_, Trigger::Booked) => current,

        (Reserved, Trigger::Released) => free_or_reserved,
        (_, Trigger::Released) => current,
    };

    if to == current {
        Transition::Stay
    } else {
        Transition::Move(to)
    }
}
