//! Glue between the engine and the shared store: publishing our own record
//! and following everybody else's.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PublishError, SubscriptionError};
use crate::store::LocationStore;
use crate::types::{DeviceId, GeoPosition, LocationRecord, PeerView};

/// Default retention window of the live feed.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct SyncPublisher {
    store: Arc<dyn LocationStore>,
}

impl SyncPublisher {
    pub fn new(store: Arc<dyn LocationStore>) -> Self {
        Self { store }
    }

    /// Upserts this device's record. Never retried here; the next tick is
    /// the retry.
    pub async fn publish(
        &self,
        device_id: &DeviceId,
        display_name: &str,
        position: &GeoPosition,
    ) -> Result<LocationRecord, PublishError> {
        let record = self.store.upsert(device_id, display_name, position).await?;
        debug!(
            "published {device_id} ({display_name}) at [{}, {}]",
            position.latitude, position.longitude
        );
        Ok(record)
    }
}

#[derive(Clone)]
pub struct SyncSubscriber {
    store: Arc<dyn LocationStore>,
}

impl SyncSubscriber {
    pub fn new(store: Arc<dyn LocationStore>) -> Self {
        Self { store }
    }

    /// Opens the live feed and forwards every snapshot to `on_update`.
    ///
    /// `on_update` sees full snapshots, never diffs. A feed failure is
    /// delivered once as `Err` and ends the subscription.
    pub async fn subscribe<F>(
        &self,
        retention: Duration,
        on_update: F,
    ) -> Result<SubscriptionHandle, SubscriptionError>
    where
        F: Fn(Result<Vec<PeerView>, SubscriptionError>) + Send + 'static,
    {
        let mut feed = self.store.watch(retention).await?;
        info!("location feed opened (retention {}s)", retention.as_secs());

        let task = tokio::spawn(async move {
            while let Some(item) = feed.next().await {
                match item {
                    Ok(records) => {
                        debug!("snapshot with {} devices", records.len());
                        on_update(Ok(records.into_iter().map(PeerView::from).collect()));
                    }
                    Err(e) => {
                        warn!("location feed failed: {e}");
                        on_update(Err(e));
                        return;
                    }
                }
            }
            on_update(Err(SubscriptionError::Closed));
        });

        Ok(SubscriptionHandle { task: Some(task) })
    }
}

/// Owns a live feed. Released by [`SubscriptionHandle::unsubscribe`] or,
/// failing that, on drop.
pub struct SubscriptionHandle {
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Stops the feed and waits until the store side has been released.
    pub async fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            debug!("location feed released");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLocationStore;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn two_publishes_leave_one_record() {
        let store = MemoryLocationStore::new();
        let publisher = SyncPublisher::new(Arc::new(store.clone()));
        let id = DeviceId::new("dev");

        publisher
            .publish(&id, "guest", &GeoPosition::new(35.6546, 139.6935))
            .await
            .unwrap();
        publisher
            .publish(&id, "guest", &GeoPosition::new(35.6646, 139.6935))
            .await
            .unwrap();

        let rows = store.records().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].position.latitude, 35.6646);
    }

    #[tokio::test]
    async fn subscriber_delivers_full_snapshots() {
        let store = MemoryLocationStore::new();
        let shared: Arc<dyn LocationStore> = Arc::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = SyncSubscriber::new(shared.clone())
            .subscribe(DEFAULT_RETENTION, move |update| {
                let _ = tx.send(update);
            })
            .await
            .unwrap();

        assert!(rx.recv().await.unwrap().unwrap().is_empty());

        let publisher = SyncPublisher::new(shared);
        publisher
            .publish(&DeviceId::new("a"), "A", &GeoPosition::new(1.0, 1.0))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().len(), 1);

        publisher
            .publish(&DeviceId::new("b"), "B", &GeoPosition::new(2.0, 2.0))
            .await
            .unwrap();
        let snapshot = rx.recv().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 2);

        handle.unsubscribe().await;
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn feed_failure_is_reported_once() {
        let store = MemoryLocationStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SyncSubscriber::new(Arc::new(store.clone()))
            .subscribe(DEFAULT_RETENTION, move |update| {
                let _ = tx.send(update);
            })
            .await
            .unwrap();
        rx.recv().await.unwrap().unwrap();

        store.fail_feeds("listener lost");
        assert!(matches!(
            rx.recv().await,
            Some(Err(SubscriptionError::Listener(_)))
        ));
        // the task ended and dropped the callback, closing the channel
        assert!(rx.recv().await.is_none());
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_the_feed() {
        let store = MemoryLocationStore::new();
        let handle = SyncSubscriber::new(Arc::new(store.clone()))
            .subscribe(DEFAULT_RETENTION, |_| {})
            .await
            .unwrap();
        assert_eq!(store.active_subscriptions(), 1);

        drop(handle);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.active_subscriptions(), 0);
    }
}
