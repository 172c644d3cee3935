// src/main.rs
use std::{sync::Arc, time::Duration as StdDuration};

use locshare::{
    api, DeviceIdentity, FileDevicePersistence, GeoIpDatabaseSource, GeolocationSource,
    HttpGeoIpSource, LocationStore, MemoryLocationStore, PgLocationStore, PollScheduler, Settings,
    StaticSource, UnsupportedSource,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    let store: Arc<dyn LocationStore> = match &settings.database_url {
        Some(url) => {
            let db = PgPool::connect(url).await?;
            let store = PgLocationStore::new(db);
            store.ensure_schema().await?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, sharing through an in-memory store");
            Arc::new(MemoryLocationStore::new())
        }
    };

    let identity = DeviceIdentity::new(Arc::new(FileDevicePersistence::new(
        settings.device_id_path.clone(),
    )));
    let engine = PollScheduler::spawn(
        &identity,
        geolocation_source(&settings),
        store,
        settings.engine_options(),
    )
    .await?;
    info!("device id {}", engine.device_id());

    if settings.share_on_start {
        engine.start_sharing().await?;
    }

    let app = api::router(engine.clone()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(StdDuration::from_secs(10)))
            .layer(CorsLayer::permissive()),
    );

    info!("locshare listening on {}", settings.listen_addr);
    let listener = TcpListener::bind(settings.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    Ok(())
}

fn geolocation_source(settings: &Settings) -> Arc<dyn GeolocationSource> {
    if let Some((lat, lon)) = settings.fixed_position {
        info!("using fixed position [{lat}, {lon}]");
        return Arc::new(StaticSource::new(lat, lon));
    }
    if let (Some(path), Some(ip)) = (&settings.geoip_db, settings.geoip_ip) {
        match GeoIpDatabaseSource::open(path, ip) {
            Ok(source) => {
                info!("locating {ip} with GeoIP database {}", path.display());
                return Arc::new(source);
            }
            Err(e) => warn!("GeoIP database unusable: {e}"),
        }
    }
    if settings.geoip_url.is_some() || settings.geoip_db.is_none() {
        let url = settings.geoip_url_or_default();
        info!("locating through {url}");
        return Arc::new(HttpGeoIpSource::new(url, settings.geoip_timeout));
    }
    warn!("no usable geolocation source configured");
    Arc::new(UnsupportedSource)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
