// src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geo::ThrottleConfig;

/// Durable, unique identifier of a publishing device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// WGS-84 coordinates in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl GeoPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            captured_at: None,
        }
    }

    pub fn captured(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }
}

/// One row of the shared store. There is at most one per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub device_id: DeviceId,
    pub display_name: String,
    pub position: GeoPosition,
    pub server_timestamp: DateTime<Utc>,
}

/// Read-only projection of a record, as handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerView {
    pub device_id: DeviceId,
    pub display_name: String,
    pub position: GeoPosition,
    pub last_seen: DateTime<Utc>,
}

impl PeerView {
    /// Whole minutes since the peer last published, rounded.
    pub fn minutes_ago(&self, now: DateTime<Utc>) -> i64 {
        let secs = (now - self.last_seen).num_seconds().max(0);
        (secs + 30) / 60
    }
}

impl From<LocationRecord> for PeerView {
    fn from(record: LocationRecord) -> Self {
        Self {
            device_id: record.device_id,
            display_name: record.display_name,
            position: record.position,
            last_seen: record.server_timestamp,
        }
    }
}

/// Snapshot of the status surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub message: String,
    pub error: bool,
    pub sharing: bool,
    pub device_id: DeviceId,
    pub display_name: String,
    pub config: ThrottleConfig,
    pub position: Option<GeoPosition>,
    pub last_published: Option<GeoPosition>,
    pub last_published_at: Option<DateTime<Utc>>,
    pub peer_count: usize,
    pub subscription_active: bool,
    pub publish_in_flight: bool,
}

// ---------- HTTP DTOs ---------- //

#[derive(Debug, Default, Deserialize)]
pub struct ConfigReq {
    pub poll_interval_secs: Option<u64>,
    pub min_distance_m: Option<f64>,
    pub min_publish_interval_secs: Option<u64>,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfigRes {
    pub display_name: String,
    #[serde(flatten)]
    pub throttle: ThrottleConfig,
}

#[derive(Debug, Serialize)]
pub struct PeerRes {
    pub device_id: DeviceId,
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub last_seen: DateTime<Utc>,
    pub mins_ago: i64,
}
