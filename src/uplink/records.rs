use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{DevEui, Ms, Occupancy, TenantId};

use super::dedup::FrameCursor;

/// One accepted uplink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: Ulid,
    pub dev_eui: DevEui,
    pub epoch: u32,
    pub frame_counter: u32,
    /// `None` when the payload carried no recognizable signal.
    pub occupancy: Option<Occupancy>,
    pub received_at: Ms,
    /// Resolved at acceptance; absent for orphan devices.
    pub space_id: Option<Ulid>,
    pub tenant_id: Option<TenantId>,
}

/// Reading whose state transition has not gone through yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub reading: SensorReading,
    pub retry_count: u32,
    pub next_retry_at: Ms,
    pub last_error: Option<String>,
    pub spooled_at: Ms,
}

impl SpoolEntry {
    pub fn id(&self) -> Ulid {
        self.reading.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: SpoolEntry,
    pub dead_at: Ms,
}

/// A device that sends uplinks but is bound to no space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanDevice {
    pub dev_eui: DevEui,
    pub first_seen: Ms,
    pub last_seen: Ms,
    pub message_count: u64,
    pub last_frame_counter: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkSnapshot {
    pub cursors: Vec<(DevEui, FrameCursor)>,
    pub readings: Vec<SensorReading>,
    pub spool: Vec<SpoolEntry>,
    pub dead_letters: Vec<DeadLetter>,
    pub orphans: Vec<OrphanDevice>,
}

/// Uplink WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UplinkRecord {
    /// Reading stored and cursor advanced. A resolved reading with a signal is
    /// spooled in the same record until its transition is cleared.
    Accepted {
        reading: SensorReading,
        cursor: FrameCursor,
    },
    Cleared {
        id: Ulid,
    },
    Retried {
        id: Ulid,
        retry_count: u32,
        next_retry_at: Ms,
        last_error: String,
    },
    DeadLettered {
        id: Ulid,
        retry_count: u32,
        last_error: String,
        at: Ms,
    },
    Pruned {
        cursors_before: Ms,
        readings_before: Ms,
    },
    Snapshot(UplinkSnapshot),
}
