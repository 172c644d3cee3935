// locshare - live location sharing between devices
//
// A device samples its own position on a schedule, publishes it to a shared
// store when it has moved far enough (or long enough has passed), and keeps
// a live view of every other device that shared within the last hour.

pub mod api;
pub mod config;
pub mod error;
pub mod geo;
pub mod identity;
pub mod location;
pub mod peers;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod types;

pub use config::Settings;
pub use error::{
    ConfigError, EngineError, IdentityError, LocationError, PublishError, SubscriptionError,
};
pub use geo::{distance_m, should_publish, PublishState, ThrottleConfig, ThrottleDecision};
pub use identity::{DeviceIdentity, DevicePersistence, FileDevicePersistence, MemoryDevicePersistence};
pub use location::{
    GeoIpDatabaseSource, GeolocationSource, HttpGeoIpSource, StaticSource, UnsupportedSource,
};
pub use peers::PeerSet;
pub use scheduler::{EngineHandle, EngineOptions, PollScheduler};
pub use store::{LocationStore, MemoryLocationStore, PgLocationStore};
pub use sync::{SubscriptionHandle, SyncPublisher, SyncSubscriber};
pub use types::{DeviceId, EngineStatus, GeoPosition, LocationRecord, PeerView};
