//! Shared location store: one row per device plus a live, time-windowed feed.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::{PublishError, SubscriptionError};
use crate::types::{DeviceId, GeoPosition, LocationRecord};

mod memory;
mod postgres;

pub use memory::MemoryLocationStore;
pub use postgres::PgLocationStore;

/// Stream of full snapshots. The first item is the current state; every
/// later item follows a change notification. An `Err` item ends the feed.
pub type SnapshotStream = BoxStream<'static, Result<Vec<LocationRecord>, SubscriptionError>>;

#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Inserts or overwrites the row for `device_id`. The timestamp is
    /// assigned by the store, never by the caller.
    async fn upsert(
        &self,
        device_id: &DeviceId,
        display_name: &str,
        position: &GeoPosition,
    ) -> Result<LocationRecord, PublishError>;

    /// Opens a live query over rows written within `retention`.
    async fn watch(&self, retention: Duration) -> Result<SnapshotStream, SubscriptionError>;
}
