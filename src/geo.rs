//! Great-circle distance and the publish throttle.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::types::GeoPosition;

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const POLL_INTERVAL_CHOICES: [u64; 6] = [5, 15, 30, 60, 120, 300];
pub const MIN_DISTANCE_CHOICES: [f64; 6] = [0.0, 5.0, 10.0, 25.0, 50.0, 100.0];
pub const MIN_PUBLISH_INTERVAL_CHOICES: [u64; 5] = [0, 15, 30, 60, 120];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub poll_interval_secs: u64,
    pub min_distance_m: f64,
    pub min_publish_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            min_distance_m: 0.0,
            min_publish_interval_secs: 0,
        }
    }
}

impl ThrottleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn min_publish_interval(&self) -> Duration {
        Duration::from_secs(self.min_publish_interval_secs)
    }

    /// Checks every field against the choices offered to the operator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !POLL_INTERVAL_CHOICES.contains(&self.poll_interval_secs) {
            return Err(invalid(
                "poll_interval_secs",
                self.poll_interval_secs,
                &POLL_INTERVAL_CHOICES,
            ));
        }
        if !self.min_distance_m.is_finite()
            || self.min_distance_m < 0.0
            || !MIN_DISTANCE_CHOICES.contains(&self.min_distance_m)
        {
            return Err(invalid(
                "min_distance_m",
                self.min_distance_m,
                &MIN_DISTANCE_CHOICES,
            ));
        }
        if !MIN_PUBLISH_INTERVAL_CHOICES.contains(&self.min_publish_interval_secs) {
            return Err(invalid(
                "min_publish_interval_secs",
                self.min_publish_interval_secs,
                &MIN_PUBLISH_INTERVAL_CHOICES,
            ));
        }
        Ok(())
    }
}

fn invalid<T: std::fmt::Display>(field: &'static str, value: T, allowed: &[T]) -> ConfigError {
    let allowed = allowed
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    ConfigError::InvalidChoice {
        field,
        value: value.to_string(),
        allowed: format!("{{{allowed}}}"),
    }
}

/// What was last written to the shared store by this device.
#[derive(Debug, Clone, Default)]
pub struct PublishState {
    pub last_published: Option<GeoPosition>,
    pub last_published_at: Option<Instant>,
}

impl PublishState {
    /// Records a successful publish. A sample not captured strictly after
    /// the current one is ignored.
    pub fn record(&mut self, position: GeoPosition, at: Instant) -> bool {
        if let (Some(prev), Some(next)) = (
            self.last_published.and_then(|p| p.captured_at),
            position.captured_at,
        ) {
            if next <= prev {
                return false;
            }
        }
        self.last_published = Some(position);
        self.last_published_at = Some(at);
        true
    }
}

/// Haversine distance between two points, in meters.
pub fn distance_m(a: &GeoPosition, b: &GeoPosition) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // rounding can push h a hair outside [0, 1] for antipodal points
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Outcome of the throttle, with the reason behind it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleDecision {
    First,
    Moved { meters: f64 },
    TooSoon { remaining: Duration },
    TooClose { meters: f64 },
}

impl ThrottleDecision {
    pub fn is_publish(&self) -> bool {
        matches!(self, Self::First | Self::Moved { .. })
    }
}

pub fn evaluate(
    candidate: &GeoPosition,
    state: &PublishState,
    config: &ThrottleConfig,
    now: Instant,
) -> ThrottleDecision {
    let Some(last) = state.last_published.as_ref() else {
        return ThrottleDecision::First;
    };

    if let Some(at) = state.last_published_at {
        let elapsed = now.saturating_duration_since(at);
        let min = config.min_publish_interval();
        if elapsed < min {
            return ThrottleDecision::TooSoon {
                remaining: min - elapsed,
            };
        }
    }

    let meters = distance_m(last, candidate);
    if meters < config.min_distance_m {
        ThrottleDecision::TooClose { meters }
    } else {
        ThrottleDecision::Moved { meters }
    }
}

pub fn should_publish(
    candidate: &GeoPosition,
    state: &PublishState,
    config: &ThrottleConfig,
    now: Instant,
) -> bool {
    evaluate(candidate, state, config, now).is_publish()
}
