//! Error types for the location sharing engine.

use serde::Serialize;
use thiserror::Error;

/// Why a one-shot position sample produced nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LocationError {
    #[error("geolocation is not supported on this device")]
    Unsupported,

    #[error("permission to read the device location was denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("timed out waiting for a position")]
    Timeout,
}

impl LocationError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// A location write that the shared store did not acknowledge.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store rejected the write: {0}")]
    Rejected(String),
}

/// Failure of the live location feed.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("listener failed: {0}")]
    Listener(String),

    #[error("live feed closed by the store")]
    Closed,
}

/// The device identifier could not be loaded or persisted.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("device identity storage failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("device identity storage failed: {0}")]
    Storage(String),
}

/// Invalid settings, either from the environment or from a runtime update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be one of {allowed}, got {value}")]
    InvalidChoice {
        field: &'static str,
        value: String,
        allowed: String,
    },

    #[error("invalid {key} value {value:?}: {reason}")]
    Env {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("display name must not be empty")]
    EmptyDisplayName,
}

/// Errors reported by the engine handle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sync engine is not running")]
    Stopped,
}
