use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_SPACES: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_SPACE: usize = 100_000;
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_REQUEST_ID_LEN: usize = 128;
pub const MAX_REQUESTER_LEN: usize = 256;

/// LoRaWAN application payloads never exceed 242 bytes; leave headroom.
pub const MAX_UPLINK_PAYLOAD_LEN: usize = 512;
pub const MAX_WEBHOOK_BODY_LEN: usize = 64 * 1024;
pub const MAX_SPOOL_ENTRIES: usize = 100_000;
/// Uplink records held in memory while the uplink journal refuses writes.
pub const MAX_UNJOURNALED_RECORDS: usize = 10_000;

/// Largest WAL record. A longer length prefix is treated as a torn tail.
pub const MAX_WAL_RECORD_LEN: u32 = 256 * 1024 * 1024;

/// Stripes for idempotency-key and device-key serialization.
pub const KEY_LOCK_STRIPES: usize = 64;
