use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use super::{LocationStore, SnapshotStream};
use crate::error::{PublishError, SubscriptionError};
use crate::types::{DeviceId, GeoPosition, LocationRecord};

/// In-process store with the same upsert and live-query semantics as the
/// database backend. Also lets tests inject write and feed failures.
#[derive(Clone, Default)]
pub struct MemoryLocationStore {
    inner: Arc<Inner>,
}

struct Inner {
    records: RwLock<HashMap<DeviceId, LocationRecord>>,
    version: watch::Sender<u64>,
    write_failure: Mutex<Option<String>>,
    feed_failure: Mutex<Option<(u64, String)>>,
    subscribers: AtomicUsize,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            records: RwLock::default(),
            version: watch::channel(0).0,
            write_failure: Mutex::default(),
            feed_failure: Mutex::default(),
            subscribers: AtomicUsize::new(0),
        }
    }
}

impl Inner {
    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    async fn snapshot(&self, retention: Duration) -> Vec<LocationRecord> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));
        let records = self.records.read().await;
        let mut out: Vec<_> = records
            .values()
            .filter(|r| threshold.map_or(true, |t| r.server_timestamp > t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    fn feed_failure_since(&self, epoch: u64) -> Option<String> {
        match self.feed_failure.lock().ok()?.as_ref() {
            Some((failed_at, message)) if *failed_at > epoch => Some(message.clone()),
            _ => None,
        }
    }

    fn feed_epoch(&self) -> u64 {
        *self.version.borrow()
    }
}

/// Decrements the live subscriber count when a feed is dropped.
struct SubscriberGuard(Arc<Inner>);

impl SubscriberGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.subscribers.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.subscribers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FeedState {
    guard: SubscriberGuard,
    rx: watch::Receiver<u64>,
    epoch: u64,
    first: bool,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, regardless of age, ordered by device.
    pub async fn records(&self) -> Vec<LocationRecord> {
        self.inner.snapshot(Duration::MAX).await
    }

    pub async fn get(&self, device_id: &DeviceId) -> Option<LocationRecord> {
        self.inner.records.read().await.get(device_id).cloned()
    }

    /// Number of live feeds that have not been released yet.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscribers.load(Ordering::SeqCst)
    }

    /// Makes every following write fail with `message`, or heals the store.
    pub fn set_write_failure(&self, message: Option<&str>) {
        if let Ok(mut failure) = self.inner.write_failure.lock() {
            *failure = message.map(str::to_string);
        }
    }

    /// Breaks every feed that is currently open. Feeds opened later work.
    pub fn fail_feeds(&self, message: &str) {
        let epoch = self.inner.feed_epoch() + 1;
        if let Ok(mut failure) = self.inner.feed_failure.lock() {
            *failure = Some((epoch, message.to_string()));
        }
        self.inner.notify();
    }

    /// Writes a row with an explicit timestamp, bypassing the store clock.
    pub async fn insert_at(&self, record: LocationRecord) {
        self.inner
            .records
            .write()
            .await
            .insert(record.device_id.clone(), record);
        self.inner.notify();
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn upsert(
        &self,
        device_id: &DeviceId,
        display_name: &str,
        position: &GeoPosition,
    ) -> Result<LocationRecord, PublishError> {
        if let Some(message) = self.inner.write_failure.lock().ok().and_then(|f| f.clone()) {
            return Err(PublishError::Rejected(message));
        }

        let record = LocationRecord {
            device_id: device_id.clone(),
            display_name: display_name.to_string(),
            position: *position,
            server_timestamp: Utc::now(),
        };
        self.inner
            .records
            .write()
            .await
            .insert(device_id.clone(), record.clone());
        self.inner.notify();
        Ok(record)
    }

    async fn watch(&self, retention: Duration) -> Result<SnapshotStream, SubscriptionError> {
        let inner = self.inner.clone();
        let state = FeedState {
            guard: SubscriberGuard::new(inner.clone()),
            rx: inner.version.subscribe(),
            epoch: inner.feed_epoch(),
            first: true,
        };

        let stream = futures::stream::unfold(Some(state), move |state| {
            let inner = inner.clone();
            async move {
                let mut state = state?;
                if !state.first && state.rx.changed().await.is_err() {
                    return None;
                }
                state.first = false;

                if let Some(message) = inner.feed_failure_since(state.epoch) {
                    drop(state.guard);
                    return Some((Err(SubscriptionError::Listener(message)), None));
                }
                let snapshot = inner.snapshot(retention).await;
                Some((Ok(snapshot), Some(state)))
            }
        });
        Ok(stream.boxed())
    }
}
