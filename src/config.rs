use std::{env, fmt::Display, net::IpAddr, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use tracing::info;

use crate::error::ConfigError;
use crate::geo::ThrottleConfig;
use crate::location::DEFAULT_GEOIP_URL;
use crate::scheduler::EngineOptions;

/// Process settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub database_url: Option<String>,
    pub device_id_path: PathBuf,
    pub display_name: String,
    pub throttle: ThrottleConfig,
    pub retention: Duration,
    pub fixed_position: Option<(f64, f64)>,
    pub geoip_db: Option<PathBuf>,
    pub geoip_ip: Option<IpAddr>,
    pub geoip_url: Option<String>,
    pub geoip_timeout: Duration,
    pub locate_on_start: bool,
    pub share_on_start: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup; `from_env` uses the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let throttle = ThrottleConfig {
            poll_interval_secs: parse_or(&get, "POLL_INTERVAL_SECS", 5)?,
            min_distance_m: parse_or(&get, "MIN_DISTANCE_M", 0.0)?,
            min_publish_interval_secs: parse_or(&get, "MIN_PUBLISH_INTERVAL_SECS", 0)?,
        };
        throttle.validate()?;

        let display_name = get("DISPLAY_NAME").unwrap_or_else(|| "guest".to_string());
        if display_name.trim().is_empty() {
            return Err(ConfigError::EmptyDisplayName);
        }

        let fixed_position = match get("FIXED_POSITION") {
            Some(raw) => Some(parse_lat_lon(&raw)?),
            None => None,
        };
        let geoip_ip = match get("GEOIP_IP") {
            Some(raw) => Some(parse("GEOIP_IP", &raw)?),
            None => None,
        };

        Ok(Self {
            listen_addr: parse_or(&get, "LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            database_url: get("DATABASE_URL"),
            device_id_path: get("DEVICE_ID_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".locshare/device_id")),
            display_name: display_name.trim().to_string(),
            throttle,
            retention: Duration::from_secs(parse_or(&get, "RETENTION_SECS", 3600)?),
            fixed_position,
            geoip_db: get("GEOIP_DB").map(PathBuf::from),
            geoip_ip,
            geoip_url: get("GEOIP_URL"),
            geoip_timeout: Duration::from_millis(parse_or(&get, "GEOIP_TIMEOUT_MS", 3000)?),
            locate_on_start: parse_or(&get, "LOCATE_ON_START", true)?,
            share_on_start: parse_or(&get, "SHARE_ON_START", false)?,
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            throttle: self.throttle,
            display_name: self.display_name.clone(),
            retention: self.retention,
            locate_on_start: self.locate_on_start,
        }
    }

    pub fn geoip_url_or_default(&self) -> &str {
        self.geoip_url.as_deref().unwrap_or(DEFAULT_GEOIP_URL)
    }
}

fn parse<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T: FromStr + Display>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    match get(key) {
        Some(raw) => parse(key, &raw),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn parse_lat_lon(raw: &str) -> Result<(f64, f64), ConfigError> {
    let invalid = |reason: &str| ConfigError::Env {
        key: "FIXED_POSITION",
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| invalid("expected \"lat,lon\""))?;
    let lat: f64 = parse("FIXED_POSITION", lat)?;
    let lon: f64 = parse("FIXED_POSITION", lon)?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(invalid("coordinates out of range"));
    }
    Ok((lat, lon))
}
