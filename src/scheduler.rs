//! The polling loop that samples, throttles and publishes this device's
//! position while keeping the peer view in sync.
//!
//! Everything that mutates engine state runs inside one task. Timer ticks,
//! geolocation samples, publish acknowledgements and feed snapshots all
//! arrive over a single event queue; operator commands come in over a
//! second one. `PublishState` and `PeerSet` therefore have one writer.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, EngineError, LocationError, PublishError, SubscriptionError};
use crate::geo::{self, PublishState, ThrottleConfig, ThrottleDecision};
use crate::identity::DeviceIdentity;
use crate::location::GeolocationSource;
use crate::peers::PeerSet;
use crate::store::LocationStore;
use crate::sync::{SubscriptionHandle, SyncPublisher, SyncSubscriber, DEFAULT_RETENTION};
use crate::types::{ConfigReq, ConfigRes, DeviceId, EngineStatus, GeoPosition, LocationRecord, PeerView};

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub throttle: ThrottleConfig,
    pub display_name: String,
    pub retention: Duration,
    /// Take one sample as soon as the engine starts, before sharing.
    pub locate_on_start: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            throttle: ThrottleConfig::default(),
            display_name: "guest".to_string(),
            retention: DEFAULT_RETENTION,
            locate_on_start: true,
        }
    }
}

#[derive(Debug)]
enum Command {
    StartSharing,
    StopSharing,
    Locate,
    UpdateConfig {
        patch: ConfigReq,
        reply: oneshot::Sender<Result<ConfigRes, ConfigError>>,
    },
    Resubscribe,
    Shutdown,
}

enum Event {
    Tick {
        session: u64,
    },
    Sampled {
        session: u64,
        result: Result<GeoPosition, LocationError>,
    },
    Published {
        position: GeoPosition,
        issued_at: Instant,
        result: Result<LocationRecord, PublishError>,
    },
    Feed {
        epoch: u64,
        update: Result<Vec<PeerView>, SubscriptionError>,
    },
}

/// Cloneable front end of a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    device_id: DeviceId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<EngineStatus>,
    peers: watch::Receiver<PeerSet>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub async fn start_sharing(&self) -> Result<(), EngineError> {
        self.send(Command::StartSharing).await
    }

    pub async fn stop_sharing(&self) -> Result<(), EngineError> {
        self.send(Command::StopSharing).await
    }

    /// Takes one position sample right away.
    pub async fn locate(&self) -> Result<(), EngineError> {
        self.send(Command::Locate).await
    }

    /// Merges `patch` into the running settings and returns what was
    /// applied. Unset fields keep their current value; nothing changes when
    /// any field is rejected. The next tick uses the new settings.
    pub async fn apply_config(&self, patch: ConfigReq) -> Result<ConfigRes, EngineError> {
        let (reply, applied) = oneshot::channel();
        self.send(Command::UpdateConfig { patch, reply }).await?;
        let applied = applied.await.map_err(|_| EngineError::Stopped)??;
        Ok(applied)
    }

    /// Replaces the throttle settings.
    pub async fn update_config(&self, config: ThrottleConfig) -> Result<(), EngineError> {
        self.apply_config(ConfigReq {
            poll_interval_secs: Some(config.poll_interval_secs),
            min_distance_m: Some(config.min_distance_m),
            min_publish_interval_secs: Some(config.min_publish_interval_secs),
            display_name: None,
        })
        .await?;
        Ok(())
    }

    pub async fn set_display_name(&self, name: &str) -> Result<(), EngineError> {
        self.apply_config(ConfigReq {
            display_name: Some(name.to_string()),
            ..ConfigReq::default()
        })
        .await?;
        Ok(())
    }

    /// Re-opens the live feed after it failed.
    pub async fn resubscribe(&self) -> Result<(), EngineError> {
        self.send(Command::Resubscribe).await
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    pub fn peers(&self) -> PeerSet {
        self.peers.borrow().clone()
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<PeerSet> {
        self.peers.clone()
    }

    /// Stops the loop, disarms the timer and releases the live feed.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("sync engine task failed: {e}");
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Stopped)
    }
}

pub struct PollScheduler {
    device_id: DeviceId,
    display_name: String,
    config: ThrottleConfig,
    retention: Duration,
    locate_on_start: bool,

    geolocation: Arc<dyn GeolocationSource>,
    publisher: SyncPublisher,
    subscriber: SyncSubscriber,

    enabled: bool,
    // bumped on every enable/disable; stale ticks and samples carry an old value
    session: u64,
    timer: Option<JoinHandle<()>>,

    position: Option<GeoPosition>,
    publish_state: PublishState,
    last_published_at: Option<DateTime<Utc>>,
    publish_in_flight: bool,

    peers: PeerSet,
    subscription: Option<SubscriptionHandle>,
    feed_epoch: u64,

    message: String,
    error: bool,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<EngineStatus>,
    peers_tx: watch::Sender<PeerSet>,
}

impl PollScheduler {
    /// Resolves the device identity and starts the engine task.
    ///
    /// Fails only when the identity cannot be loaded or created, or when
    /// the options are out of range. Sharing starts disabled.
    pub async fn spawn(
        identity: &DeviceIdentity,
        geolocation: Arc<dyn GeolocationSource>,
        store: Arc<dyn LocationStore>,
        options: EngineOptions,
    ) -> Result<EngineHandle, EngineError> {
        options.throttle.validate()?;
        let display_name = options.display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(ConfigError::EmptyDisplayName.into());
        }
        let device_id = identity.get().await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (peers_tx, peers_rx) = watch::channel(PeerSet::default());

        let scheduler = PollScheduler {
            device_id: device_id.clone(),
            display_name,
            config: options.throttle,
            retention: options.retention,
            locate_on_start: options.locate_on_start,
            geolocation,
            publisher: SyncPublisher::new(store.clone()),
            subscriber: SyncSubscriber::new(store),
            enabled: false,
            session: 0,
            timer: None,
            position: None,
            publish_state: PublishState::default(),
            last_published_at: None,
            publish_in_flight: false,
            peers: PeerSet::default(),
            subscription: None,
            feed_epoch: 0,
            message: String::new(),
            error: false,
            events_tx,
            events_rx,
            commands: commands_rx,
            status_tx: watch::channel(placeholder_status(&device_id)).0,
            peers_tx,
        };
        let status_rx = scheduler.status_tx.subscribe();
        scheduler.publish_status();

        let task = tokio::spawn(scheduler.run());

        Ok(EngineHandle {
            device_id,
            commands: commands_tx,
            status: status_rx,
            peers: peers_rx,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    async fn run(mut self) {
        info!("sync engine started for device {}", self.device_id);
        self.open_feed().await;
        if self.locate_on_start {
            self.request_sample();
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        self.disarm_timer();
        self.enabled = false;
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe().await;
        }
        self.set_status("Sync engine stopped", false);
        info!("sync engine stopped for device {}", self.device_id);
    }

    async fn handle_command(&mut self, command: Command) {
        debug!("command: {command:?}");
        match command {
            Command::StartSharing => self.enable(),
            Command::StopSharing => self.disable(),
            Command::Locate => self.request_sample(),
            Command::UpdateConfig { patch, reply } => {
                let _ = reply.send(self.apply_config(patch));
            }
            Command::Resubscribe => {
                if self.open_feed().await {
                    self.set_status("Live location feed restarted", false);
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Tick { session } => {
                if self.enabled && session == self.session {
                    self.request_sample();
                } else {
                    debug!("dropping tick from sharing session {session}");
                }
            }
            Event::Sampled { session, result } => self.on_sample(session, result),
            Event::Published {
                position,
                issued_at,
                result,
            } => self.on_published(position, issued_at, result),
            Event::Feed { epoch, update } => {
                if epoch == self.feed_epoch {
                    self.on_feed(update).await;
                }
            }
        }
    }

    fn apply_config(&mut self, patch: ConfigReq) -> Result<ConfigRes, ConfigError> {
        let config = ThrottleConfig {
            poll_interval_secs: patch.poll_interval_secs.unwrap_or(self.config.poll_interval_secs),
            min_distance_m: patch.min_distance_m.unwrap_or(self.config.min_distance_m),
            min_publish_interval_secs: patch
                .min_publish_interval_secs
                .unwrap_or(self.config.min_publish_interval_secs),
        };
        config.validate()?;
        let display_name = match patch.display_name {
            Some(name) if name.trim().is_empty() => return Err(ConfigError::EmptyDisplayName),
            Some(name) => Some(name.trim().to_string()),
            None => None,
        };

        if config != self.config {
            let rearm = self.enabled && config.poll_interval_secs != self.config.poll_interval_secs;
            self.config = config;
            info!(
                "throttle updated: every {}s, min {} m, min {}s between shares",
                config.poll_interval_secs, config.min_distance_m, config.min_publish_interval_secs
            );
            if rearm {
                self.arm_timer();
            }
        }
        if let Some(name) = display_name {
            info!("display name set to {name}");
            self.display_name = name;
        }
        self.publish_status();

        Ok(ConfigRes {
            display_name: self.display_name.clone(),
            throttle: self.config,
        })
    }

    fn enable(&mut self) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        self.session += 1;
        info!("location sharing started (session {})", self.session);
        self.set_status("Location sharing started", false);

        match self.position {
            Some(position) => self.consider_publish(position),
            None => self.request_sample(),
        }
        self.arm_timer();
    }

    fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        self.session += 1;
        self.disarm_timer();
        info!("location sharing stopped");
        self.set_status("Location sharing stopped", false);
    }

    fn arm_timer(&mut self) {
        self.disarm_timer();
        let session = self.session;
        let period = self.config.poll_interval();
        let events = self.events_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(Event::Tick { session }).is_err() {
                    break;
                }
            }
        }));
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn request_sample(&mut self) {
        self.message = "Acquiring location...".to_string();
        self.publish_status();

        let session = self.session;
        let source = self.geolocation.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = source.sample().await;
            let _ = events.send(Event::Sampled { session, result });
        });
    }

    fn on_sample(&mut self, session: u64, result: Result<GeoPosition, LocationError>) {
        match result {
            Ok(position) => {
                debug!("sampled [{}, {}]", position.latitude, position.longitude);
                self.position = Some(position);
                self.set_status("Location acquired", false);
                if self.enabled && session == self.session {
                    self.consider_publish(position);
                }
            }
            Err(e) => {
                warn!("failed to acquire location: {e}");
                self.set_status(format!("Failed to acquire location: {e}"), true);
            }
        }
    }

    fn consider_publish(&mut self, position: GeoPosition) {
        let now = Instant::now();
        match geo::evaluate(&position, &self.publish_state, &self.config, now) {
            ThrottleDecision::TooSoon { remaining } => {
                debug!("throttled: {}s until the next share", remaining.as_secs());
                self.set_status(
                    format!("Not shared: next share allowed in {}s", remaining.as_secs().max(1)),
                    false,
                );
            }
            ThrottleDecision::TooClose { meters } => {
                debug!("throttled: moved {meters:.1} m");
                self.set_status(
                    format!(
                        "Not shared: moved {meters:.1} m, below {} m",
                        self.config.min_distance_m
                    ),
                    false,
                );
            }
            ThrottleDecision::First | ThrottleDecision::Moved { .. } => {
                if self.publish_in_flight {
                    debug!("previous share still in flight, skipping this one");
                    self.set_status("Not shared: previous share still in flight", false);
                    return;
                }
                self.publish(position, now);
            }
        }
    }

    fn publish(&mut self, position: GeoPosition, issued_at: Instant) {
        self.publish_in_flight = true;
        self.publish_status();

        let publisher = self.publisher.clone();
        let device_id = self.device_id.clone();
        let display_name = self.display_name.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = publisher.publish(&device_id, &display_name, &position).await;
            let _ = events.send(Event::Published {
                position,
                issued_at,
                result,
            });
        });
    }

    fn on_published(
        &mut self,
        position: GeoPosition,
        issued_at: Instant,
        result: Result<LocationRecord, PublishError>,
    ) {
        self.publish_in_flight = false;
        match result {
            Ok(record) => {
                if self.publish_state.record(position, issued_at) {
                    self.last_published_at = Some(record.server_timestamp);
                }
                self.set_status(
                    format!(
                        "Location shared [{}]",
                        record.server_timestamp.format("%H:%M:%S")
                    ),
                    false,
                );
            }
            Err(e) => {
                warn!("failed to share location: {e}");
                self.set_status(format!("Failed to share location: {e}"), true);
            }
        }
    }

    /// Opens a fresh feed, releasing the previous one first.
    async fn open_feed(&mut self) -> bool {
        if let Some(previous) = self.subscription.take() {
            previous.unsubscribe().await;
        }
        self.feed_epoch += 1;
        let epoch = self.feed_epoch;
        let events = self.events_tx.clone();

        match self
            .subscriber
            .subscribe(self.retention, move |update| {
                let _ = events.send(Event::Feed { epoch, update });
            })
            .await
        {
            Ok(handle) => {
                self.subscription = Some(handle);
                self.publish_status();
                true
            }
            Err(e) => {
                error!("failed to open location feed: {e}");
                self.set_status(format!("Failed to set up the live location feed: {e}"), true);
                false
            }
        }
    }

    async fn on_feed(&mut self, update: Result<Vec<PeerView>, SubscriptionError>) {
        match update {
            Ok(snapshot) => {
                self.peers = PeerSet::from_snapshot(snapshot, Utc::now());
                debug!("{} devices sharing", self.peers.len());
                self.peers_tx.send_replace(self.peers.clone());
                self.publish_status();
            }
            Err(e) => {
                if let Some(subscription) = self.subscription.take() {
                    subscription.unsubscribe().await;
                }
                self.set_status(
                    format!("Live location feed failed: {e}. Restart it to try again."),
                    true,
                );
            }
        }
    }

    fn set_status(&mut self, message: impl Into<String>, error: bool) {
        self.message = message.into();
        self.error = error;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(EngineStatus {
            message: self.message.clone(),
            error: self.error,
            sharing: self.enabled,
            device_id: self.device_id.clone(),
            display_name: self.display_name.clone(),
            config: self.config,
            position: self.position,
            last_published: self.publish_state.last_published,
            last_published_at: self.last_published_at,
            peer_count: self.peers.len(),
            subscription_active: self.subscription.is_some(),
            publish_in_flight: self.publish_in_flight,
        });
    }
}

fn placeholder_status(device_id: &DeviceId) -> EngineStatus {
    EngineStatus {
        message: String::new(),
        error: false,
        sharing: false,
        device_id: device_id.clone(),
        display_name: String::new(),
        config: ThrottleConfig::default(),
        position: None,
        last_published: None,
        last_published_at: None,
        peer_count: 0,
        subscription_active: false,
        publish_in_flight: false,
    }
}
