// Device Identity Management
//
// Each installation owns one opaque device id. It is generated lazily on
// first use and kept in an injected persistence medium so that restarts
// publish under the same key.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;
use uuid::Uuid;

use crate::error::IdentityError;
use crate::types::DeviceId;

/// Get/set of a single string value that survives restarts.
#[async_trait]
pub trait DevicePersistence: Send + Sync {
    async fn load(&self) -> Result<Option<String>, IdentityError>;
    async fn store(&self, value: &str) -> Result<(), IdentityError>;
}

/// Keeps the id in a small text file.
pub struct FileDevicePersistence {
    path: PathBuf,
}

impl FileDevicePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DevicePersistence for FileDevicePersistence {
    async fn load(&self) -> Result<Option<String>, IdentityError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, value: &str) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, format!("{value}\n")).await?;
        Ok(())
    }
}

/// Process-local persistence, used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryDevicePersistence {
    value: Mutex<Option<String>>,
}

impl MemoryDevicePersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(value.into())),
        }
    }
}

#[async_trait]
impl DevicePersistence for MemoryDevicePersistence {
    async fn load(&self) -> Result<Option<String>, IdentityError> {
        Ok(self.value.lock().await.clone())
    }

    async fn store(&self, value: &str) -> Result<(), IdentityError> {
        *self.value.lock().await = Some(value.to_string());
        Ok(())
    }
}

/// Lazily resolved device id backed by a [`DevicePersistence`].
#[derive(Clone)]
pub struct DeviceIdentity {
    persistence: Arc<dyn DevicePersistence>,
    cached: Arc<OnceCell<DeviceId>>,
}

impl DeviceIdentity {
    pub fn new(persistence: Arc<dyn DevicePersistence>) -> Self {
        Self {
            persistence,
            cached: Arc::new(OnceCell::new()),
        }
    }

    /// Returns the persisted id, creating and storing one on first use.
    pub async fn get(&self) -> Result<DeviceId, IdentityError> {
        let id = self.cached.get_or_try_init(|| self.load_or_create()).await?;
        Ok(id.clone())
    }

    async fn load_or_create(&self) -> Result<DeviceId, IdentityError> {
        if let Some(existing) = self.persistence.load().await? {
            if !existing.is_empty() {
                return Ok(DeviceId::new(existing));
            }
        }
        let fresh = Uuid::new_v4().to_string();
        self.persistence.store(&fresh).await?;
        info!("generated new device id {fresh}");
        Ok(DeviceId::new(fresh))
    }
}
