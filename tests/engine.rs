use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use locshare::{
    DeviceId, DeviceIdentity, DevicePersistence, EngineError, EngineHandle, EngineOptions,
    EngineStatus, GeoPosition, GeolocationSource, IdentityError, LocationError, LocationRecord,
    LocationStore, MemoryDevicePersistence, MemoryLocationStore, PeerSet, PollScheduler,
    PublishError, StaticSource, SubscriptionError, ThrottleConfig,
};
use locshare::store::SnapshotStream;

const WAIT: Duration = Duration::from_secs(600);
const LOCAL: &str = "local-device";

/// Hands out queued results, then keeps stepping north by ~1.1 km.
struct ScriptedSource {
    queue: Mutex<VecDeque<Result<GeoPosition, LocationError>>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn new(script: Vec<Result<GeoPosition, LocationError>>) -> Self {
        Self {
            queue: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeolocationSource for ScriptedSource {
    async fn sample(&self) -> Result<GeoPosition, LocationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        Ok(GeoPosition::new(35.6546 + 0.01 * n as f64, 139.6935))
    }
}

/// Blocks every sample until the test hands out a permit.
struct GatedSource {
    gate: Semaphore,
}

#[async_trait]
impl GeolocationSource for GatedSource {
    async fn sample(&self) -> Result<GeoPosition, LocationError> {
        self.gate.acquire().await.expect("gate open").forget();
        Ok(GeoPosition::new(35.6546, 139.6935))
    }
}

/// Memory store that counts write attempts and can hold writes back.
#[derive(Clone)]
struct CountingStore {
    inner: MemoryLocationStore,
    attempts: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryLocationStore::new(),
            attempts: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = Self {
            gate: Some(gate.clone()),
            ..Self::new()
        };
        (store, gate)
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationStore for CountingStore {
    async fn upsert(
        &self,
        device_id: &DeviceId,
        display_name: &str,
        position: &GeoPosition,
    ) -> Result<LocationRecord, PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        self.inner.upsert(device_id, display_name, position).await
    }

    async fn watch(&self, retention: Duration) -> Result<SnapshotStream, SubscriptionError> {
        self.inner.watch(retention).await
    }
}

struct BrokenPersistence;

#[async_trait]
impl DevicePersistence for BrokenPersistence {
    async fn load(&self) -> Result<Option<String>, IdentityError> {
        Err(IdentityError::Storage("read-only medium".into()))
    }

    async fn store(&self, _value: &str) -> Result<(), IdentityError> {
        Err(IdentityError::Storage("read-only medium".into()))
    }
}

fn options(throttle: ThrottleConfig) -> EngineOptions {
    EngineOptions {
        throttle,
        display_name: "tester".into(),
        locate_on_start: false,
        ..EngineOptions::default()
    }
}

fn every_5s(min_distance_m: f64) -> ThrottleConfig {
    ThrottleConfig {
        poll_interval_secs: 5,
        min_distance_m,
        min_publish_interval_secs: 0,
    }
}

async fn spawn(
    source: Arc<dyn GeolocationSource>,
    store: Arc<dyn LocationStore>,
    throttle: ThrottleConfig,
) -> EngineHandle {
    let identity = DeviceIdentity::new(Arc::new(MemoryDevicePersistence::with_value(LOCAL)));
    PollScheduler::spawn(&identity, source, store, options(throttle))
        .await
        .expect("engine starts")
}

async fn wait_status(engine: &EngineHandle, pred: impl FnMut(&EngineStatus) -> bool) -> EngineStatus {
    let mut rx = engine.subscribe_status();
    let result = tokio::time::timeout(WAIT, rx.wait_for(pred)).await;
    let status = result.expect("status never matched").expect("engine gone").clone();
    status
}

async fn wait_peers(engine: &EngineHandle, pred: impl FnMut(&PeerSet) -> bool) -> PeerSet {
    let mut rx = engine.subscribe_peers();
    let result = tokio::time::timeout(WAIT, rx.wait_for(pred)).await;
    let peers = result.expect("peers never matched").expect("engine gone").clone();
    peers
}

#[tokio::test(start_paused = true)]
async fn first_sample_is_published_when_sharing_starts() {
    let store = MemoryLocationStore::new();
    let engine = spawn(
        Arc::new(StaticSource::new(35.6546, 139.6935)),
        Arc::new(store.clone()),
        every_5s(100.0),
    )
    .await;

    engine.start_sharing().await.unwrap();
    let status = wait_status(&engine, |s| s.last_published.is_some()).await;
    assert!(status.sharing);
    assert!(!status.error);
    assert!(status.message.starts_with("Location shared"));

    let rows = store.records().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].device_id.as_str(), LOCAL);
    assert_eq!(rows[0].display_name, "tester");

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stationary_device_is_throttled_by_distance() {
    let store = CountingStore::new();
    let engine = spawn(
        Arc::new(StaticSource::new(35.6546, 139.6935)),
        Arc::new(store.clone()),
        every_5s(10.0),
    )
    .await;

    engine.start_sharing().await.unwrap();
    wait_status(&engine, |s| s.last_published.is_some()).await;

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(store.attempts(), 1);
    assert!(engine.status().message.starts_with("Not shared: moved 0.0 m"));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn moving_device_publishes_on_every_tick() {
    let store = CountingStore::new();
    let source = Arc::new(ScriptedSource::new(vec![]));
    let engine = spawn(source.clone(), Arc::new(store.clone()), every_5s(10.0)).await;

    engine.start_sharing().await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(source.calls(), 3);
    assert_eq!(store.attempts(), 3);
    let rows = store.inner.records().await;
    assert_eq!(rows.len(), 1);
    assert!((rows[0].position.latitude - (35.6546 + 0.02)).abs() < 1e-9);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn tick_during_outstanding_publish_skips_its_publish() {
    let (store, gate) = CountingStore::gated();
    let source = Arc::new(ScriptedSource::new(vec![]));
    let engine = spawn(source.clone(), Arc::new(store.clone()), every_5s(0.0)).await;

    engine.start_sharing().await.unwrap();
    wait_status(&engine, |s| s.publish_in_flight).await;

    // tick at 5s samples again but must not issue a second write
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(source.calls(), 2);
    assert_eq!(store.attempts(), 1);
    let status = engine.status();
    assert!(status.position.is_some());
    assert_eq!(status.message, "Not shared: previous share still in flight");
    assert!(!status.error);

    gate.add_permits(10);
    let status = wait_status(&engine, |s| s.last_published.is_some()).await;
    assert!(!status.publish_in_flight);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.attempts(), 2);
    assert_eq!(store.inner.records().await.len(), 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failures_do_not_break_the_schedule() {
    let store = MemoryLocationStore::new();
    let source = Arc::new(ScriptedSource::new(vec![Err(LocationError::unavailable(
        "no fix",
    ))]));
    let engine = spawn(source.clone(), Arc::new(store.clone()), every_5s(0.0)).await;

    engine.start_sharing().await.unwrap();
    let status = wait_status(&engine, |s| s.error).await;
    assert_eq!(status.message, "Failed to acquire location: position unavailable: no fix");
    assert!(status.sharing);

    let status = wait_status(&engine, |s| s.last_published.is_some()).await;
    assert!(!status.error);

    store.set_write_failure(Some("backend down"));
    let status = wait_status(&engine, |s| s.error).await;
    assert!(status.message.starts_with("Failed to share location"));
    let before = status.last_published;

    store.set_write_failure(None);
    let status = wait_status(&engine, |s| !s.error && s.last_published != before).await;
    assert!(status.sharing);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stopping_while_a_sample_is_pending_prevents_its_publish() {
    let store = MemoryLocationStore::new();
    let source = Arc::new(GatedSource {
        gate: Semaphore::new(0),
    });
    let engine = spawn(source.clone(), Arc::new(store.clone()), every_5s(0.0)).await;

    engine.start_sharing().await.unwrap();
    wait_status(&engine, |s| s.sharing).await;
    engine.stop_sharing().await.unwrap();
    wait_status(&engine, |s| !s.sharing).await;

    source.gate.add_permits(1);
    wait_status(&engine, |s| s.position.is_some()).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(store.records().await.is_empty());
    assert!(engine.status().last_published.is_none());

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stopped_engine_stops_ticking() {
    let store = CountingStore::new();
    let source = Arc::new(ScriptedSource::new(vec![]));
    let engine = spawn(source.clone(), Arc::new(store.clone()), every_5s(0.0)).await;

    engine.start_sharing().await.unwrap();
    wait_status(&engine, |s| s.last_published.is_some()).await;
    engine.stop_sharing().await.unwrap();
    wait_status(&engine, |s| !s.sharing).await;

    let calls = source.calls();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(source.calls(), calls);
    assert_eq!(store.attempts(), 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cached_position_is_shared_immediately_on_start() {
    let store = CountingStore::new();
    let source = Arc::new(ScriptedSource::new(vec![]));
    let engine = spawn(source.clone(), Arc::new(store.clone()), every_5s(0.0)).await;

    engine.locate().await.unwrap();
    wait_status(&engine, |s| s.position.is_some()).await;
    assert_eq!(store.attempts(), 0);

    engine.start_sharing().await.unwrap();
    wait_status(&engine, |s| s.last_published.is_some()).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(store.attempts(), 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn poll_interval_change_applies_from_the_next_tick() {
    let store = CountingStore::new();
    let source = Arc::new(ScriptedSource::new(vec![]));
    let engine = spawn(source.clone(), Arc::new(store.clone()), every_5s(0.0)).await;

    engine.start_sharing().await.unwrap();
    let slow = ThrottleConfig {
        poll_interval_secs: 60,
        ..every_5s(0.0)
    };
    engine.update_config(slow).await.unwrap();
    wait_status(&engine, |s| s.config.poll_interval_secs == 60).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(source.calls(), 1);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(source.calls(), 2);

    let invalid = ThrottleConfig {
        poll_interval_secs: 7,
        ..slow
    };
    assert!(matches!(
        engine.update_config(invalid).await,
        Err(EngineError::Config(_))
    ));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn peers_follow_the_feed_and_exclude_the_local_device() {
    let store = MemoryLocationStore::new();
    let shared: Arc<dyn LocationStore> = Arc::new(store.clone());
    shared
        .upsert(&DeviceId::new("peer-1"), "hanako", &GeoPosition::new(35.66, 139.70))
        .await
        .unwrap();

    let engine = spawn(
        Arc::new(StaticSource::new(35.6546, 139.6935)),
        shared.clone(),
        every_5s(0.0),
    )
    .await;
    wait_peers(&engine, |p| p.len() == 1).await;

    engine.start_sharing().await.unwrap();
    let peers = wait_peers(&engine, |p| p.len() == 2).await;
    let local = DeviceId::new(LOCAL);
    assert!(peers.get(&local).is_some());

    let visible = peers.visible(&local);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].display_name, "hanako");
    assert_eq!(engine.status().peer_count, 2);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn feed_failure_freezes_peers_until_resubscribed() {
    let store = MemoryLocationStore::new();
    let shared: Arc<dyn LocationStore> = Arc::new(store.clone());
    shared
        .upsert(&DeviceId::new("peer-1"), "hanako", &GeoPosition::new(35.66, 139.70))
        .await
        .unwrap();

    let engine = spawn(
        Arc::new(StaticSource::new(35.6546, 139.6935)),
        shared.clone(),
        every_5s(0.0),
    )
    .await;
    wait_peers(&engine, |p| p.len() == 1).await;

    store.fail_feeds("listener dropped");
    let status = wait_status(&engine, |s| !s.subscription_active).await;
    assert!(status.error);
    assert!(status.message.starts_with("Live location feed failed"));
    assert_eq!(store.active_subscriptions(), 0);

    shared
        .upsert(&DeviceId::new("peer-2"), "jiro", &GeoPosition::new(35.67, 139.71))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(engine.peers().len(), 1);

    engine.resubscribe().await.unwrap();
    wait_peers(&engine, |p| p.len() == 2).await;
    let status = wait_status(&engine, |s| s.subscription_active).await;
    assert!(!status.error);
    assert_eq!(store.active_subscriptions(), 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_the_subscription_exactly_once() {
    let store = MemoryLocationStore::new();
    let engine = spawn(
        Arc::new(StaticSource::new(35.6546, 139.6935)),
        Arc::new(store.clone()),
        every_5s(0.0),
    )
    .await;
    wait_status(&engine, |s| s.subscription_active).await;
    assert_eq!(store.active_subscriptions(), 1);

    engine.start_sharing().await.unwrap();
    engine.shutdown().await;
    assert_eq!(store.active_subscriptions(), 0);

    // a second shutdown is a no-op
    engine.shutdown().await;
    assert_eq!(store.active_subscriptions(), 0);
    assert!(matches!(engine.start_sharing().await, Err(EngineError::Stopped)));
}

#[tokio::test]
async fn identity_failure_prevents_the_engine_from_starting() {
    let identity = DeviceIdentity::new(Arc::new(BrokenPersistence));
    let result = PollScheduler::spawn(
        &identity,
        Arc::new(StaticSource::new(0.0, 0.0)),
        Arc::new(MemoryLocationStore::new()),
        EngineOptions::default(),
    )
    .await;
    assert!(matches!(result, Err(EngineError::Identity(_))));
}
