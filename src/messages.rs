//! Wire payloads shared by the edge publisher and the backend router.
//!
//! ```text
//! <prefix>/<device>/status   {"status":"online"}            retained, also the last-will
//! <prefix>/<room>/state      {"motion":false,"suction_on":true,"distance_cm":9.8}   retained
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_TOPIC_PREFIX: &str = "suction";

/// Field carrying the suction (airflow) state in a state payload.
pub const SUCTION_FIELD: &str = "suction_on";

/// Field carrying the occupancy (motion) state in a state payload.
pub const MOTION_FIELD: &str = "motion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: DeviceStatus,
}

impl StatusMessage {
    pub fn online() -> Self {
        Self {
            status: DeviceStatus::Online,
        }
    }

    pub fn offline() -> Self {
        Self {
            status: DeviceStatus::Offline,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// State message published by an edge device.
///
/// Boolean fields are flattened into the top-level object so a device with
/// a single flow sensor sends `{"suction_on":true}` and a combined device
/// sends `{"motion":false,"suction_on":true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatePayload {
    #[serde(flatten)]
    pub fields: BTreeMap<String, bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_cm: Option<f32>,
}

impl StatePayload {
    pub fn new(fields: BTreeMap<String, bool>, distance_cm: Option<f32>) -> Self {
        // One decimal is all an ultrasonic ranger resolves.
        let distance_cm = distance_cm
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| (d * 10.0).round() / 10.0);
        Self {
            fields,
            distance_cm,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Payload as seen by the ingestor. Every field is optional so the router
/// can tell "absent" from "explicitly false".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IngestPayload {
    #[serde(default)]
    pub suction_on: Option<bool>,

    #[serde(default)]
    pub motion: Option<bool>,

    #[serde(default)]
    pub distance_cm: Option<f64>,
}

impl IngestPayload {
    /// Only JSON objects are accepted; serde would otherwise also map an
    /// array onto the struct positionally.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(serde::de::Error::custom("payload is not a JSON object"));
        }
        serde_json::from_value(value)
    }
}

pub fn state_topic(prefix: &str, room: &str) -> String {
    format!("{}/{}/state", prefix, room)
}

pub fn status_topic(prefix: &str, device_id: &str) -> String {
    format!("{}/{}/status", prefix, device_id)
}

/// Single-level wildcard over the room segment.
pub fn state_filter(prefix: &str) -> String {
    format!("{}/+/state", prefix)
}
