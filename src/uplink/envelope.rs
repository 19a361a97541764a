use serde::Deserialize;

use crate::limits::MAX_UPLINK_PAYLOAD_LEN;
use crate::model::{DevEui, Occupancy};

/// Network-server webhook body. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEnvelope {
    device_info: DeviceInfo,
    f_cnt: u32,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInfo {
    dev_eui: String,
}

/// An uplink reduced to what ingestion needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub dev_eui: DevEui,
    pub frame_counter: u32,
    pub payload: Vec<u8>,
}

pub fn parse_webhook(body: &[u8]) -> Option<Uplink> {
    let envelope: WebhookEnvelope = serde_json::from_slice(body).ok()?;
    let dev_eui = DevEui::parse(&envelope.device_info.dev_eui)?;
    let payload = hex::decode(envelope.data.trim()).ok()?;
    if payload.len() > MAX_UPLINK_PAYLOAD_LEN {
        return None;
    }
    Some(Uplink {
        dev_eui,
        frame_counter: envelope.f_cnt,
        payload,
    })
}

/// First payload byte: `0x01` occupied, `0x00` vacant. Anything else carries no signal.
pub fn decode_occupancy(payload: &[u8]) -> Option<Occupancy> {
    match payload.first()? {
        0x01 => Some(Occupancy::Occupied),
        0x00 => Some(Occupancy::Vacant),
        _ => None,
    }
}
