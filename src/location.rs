//! One-shot position sampling.

use async_trait::async_trait;
use chrono::Utc;
use maxminddb::{geoip2, MaxMindDBError, Reader};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::LocationError;
use crate::types::GeoPosition;

pub const DEFAULT_GEOIP_URL: &str = "https://ipapi.co/json/";

/// Where the engine pulls its own position from.
#[async_trait]
pub trait GeolocationSource: Send + Sync {
    async fn sample(&self) -> Result<GeoPosition, LocationError>;
}

/// Always reports the same coordinates.
pub struct StaticSource {
    position: GeoPosition,
}

impl StaticSource {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            position: GeoPosition::new(latitude, longitude),
        }
    }
}

#[async_trait]
impl GeolocationSource for StaticSource {
    async fn sample(&self) -> Result<GeoPosition, LocationError> {
        Ok(self.position.captured(Utc::now()))
    }
}

/// Stand-in for a device without any location capability.
pub struct UnsupportedSource;

#[async_trait]
impl GeolocationSource for UnsupportedSource {
    async fn sample(&self) -> Result<GeoPosition, LocationError> {
        Err(LocationError::Unsupported)
    }
}

/// Resolves an address to coordinates with a local MaxMind City database.
pub struct GeoIpDatabaseSource {
    reader: Reader<Vec<u8>>,
    ip: IpAddr,
}

impl GeoIpDatabaseSource {
    pub fn open(path: impl AsRef<Path>, ip: IpAddr) -> Result<Self, LocationError> {
        let reader = Reader::open_readfile(path.as_ref()).map_err(|e| {
            debug!("cannot open GeoIP database {}: {e}", path.as_ref().display());
            LocationError::Unsupported
        })?;
        Ok(Self { reader, ip })
    }
}

#[async_trait]
impl GeolocationSource for GeoIpDatabaseSource {
    async fn sample(&self) -> Result<GeoPosition, LocationError> {
        let city: geoip2::City = self.reader.lookup(self.ip).map_err(|e| match e {
            MaxMindDBError::AddressNotFoundError(_) => {
                LocationError::unavailable(format!("{} not in GeoIP database", self.ip))
            }
            other => LocationError::unavailable(other.to_string()),
        })?;
        let location = city
            .location
            .ok_or_else(|| LocationError::unavailable("GeoIP entry has no location"))?;
        match (location.latitude, location.longitude) {
            (Some(lat), Some(lon)) => Ok(GeoPosition::new(lat, lon).captured(Utc::now())),
            _ => Err(LocationError::unavailable("GeoIP entry has no coordinates")),
        }
    }
}

/// Asks an HTTP GeoIP service (ipapi.co compatible) where we are.
pub struct HttpGeoIpSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct GeoIpBody {
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default)]
    error: bool,
    reason: Option<String>,
}

impl HttpGeoIpSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl GeolocationSource for HttpGeoIpSource {
    async fn sample(&self) -> Result<GeoPosition, LocationError> {
        let res = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(request_error)?;

        let status = res.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LocationError::PermissionDenied);
        }
        if !status.is_success() {
            return Err(LocationError::unavailable(format!("GeoIP service returned {status}")));
        }

        let body = res.json::<GeoIpBody>().await.map_err(request_error)?;
        position_from_body(body)
    }
}

fn request_error(e: reqwest::Error) -> LocationError {
    if e.is_timeout() {
        LocationError::Timeout
    } else {
        LocationError::unavailable(e.to_string())
    }
}

fn position_from_body(body: GeoIpBody) -> Result<GeoPosition, LocationError> {
    if body.error {
        return Err(LocationError::unavailable(
            body.reason.unwrap_or_else(|| "GeoIP lookup failed".into()),
        ));
    }
    match (body.latitude, body.longitude) {
        (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => {
            Ok(GeoPosition::new(lat, lon).captured(Utc::now()))
        }
        _ => Err(LocationError::unavailable("GeoIP response has no coordinates")),
    }
}
