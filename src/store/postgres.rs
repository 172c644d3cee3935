use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info};

use super::{LocationStore, SnapshotStream};
use crate::error::{PublishError, SubscriptionError};
use crate::types::{DeviceId, GeoPosition, LocationRecord};

const NOTIFY_CHANNEL: &str = "device_locations_changed";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS device_locations (
    device_id     TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    latitude      DOUBLE PRECISION NOT NULL,
    longitude     DOUBLE PRECISION NOT NULL,
    captured_at   TIMESTAMPTZ,
    updated_at    TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS device_locations_updated_at_idx ON device_locations (updated_at);

CREATE OR REPLACE FUNCTION notify_device_locations() RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify('device_locations_changed', NEW.device_id);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS device_locations_notify ON device_locations;
CREATE TRIGGER device_locations_notify
    AFTER INSERT OR UPDATE ON device_locations
    FOR EACH ROW EXECUTE FUNCTION notify_device_locations();
"#;

const SELECT_RECENT: &str = r#"
SELECT device_id, display_name, latitude, longitude, captured_at, updated_at
FROM device_locations
WHERE updated_at > now() - make_interval(secs => $1)
ORDER BY device_id ASC
"#;

#[derive(Debug, sqlx::FromRow)]
struct LocationRow {
    device_id: String,
    display_name: String,
    latitude: f64,
    longitude: f64,
    captured_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<LocationRow> for LocationRecord {
    fn from(row: LocationRow) -> Self {
        Self {
            device_id: DeviceId::new(row.device_id),
            display_name: row.display_name,
            position: GeoPosition {
                latitude: row.latitude,
                longitude: row.longitude,
                captured_at: row.captured_at,
            },
            server_timestamp: row.updated_at,
        }
    }
}

/// PostgreSQL backend. Writes carry `now()` from the database server and a
/// trigger fans every change out over LISTEN/NOTIFY.
#[derive(Clone)]
pub struct PgLocationStore {
    db: PgPool,
}

impl PgLocationStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA).execute(&self.db).await?;
        info!("device_locations schema ready");
        Ok(())
    }
}

async fn fetch_recent(db: &PgPool, retention_secs: f64) -> Result<Vec<LocationRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LocationRow>(SELECT_RECENT)
        .bind(retention_secs)
        .fetch_all(db)
        .await?;
    Ok(rows.into_iter().map(LocationRecord::from).collect())
}

#[async_trait]
impl LocationStore for PgLocationStore {
    async fn upsert(
        &self,
        device_id: &DeviceId,
        display_name: &str,
        position: &GeoPosition,
    ) -> Result<LocationRecord, PublishError> {
        let row = sqlx::query_as::<_, LocationRow>(
            r#"
            INSERT INTO device_locations (device_id, display_name, latitude, longitude, captured_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,now())
            ON CONFLICT(device_id) DO UPDATE
              SET display_name=EXCLUDED.display_name,
                  latitude=EXCLUDED.latitude,
                  longitude=EXCLUDED.longitude,
                  captured_at=EXCLUDED.captured_at,
                  updated_at=now()
            RETURNING device_id, display_name, latitude, longitude, captured_at, updated_at
            "#,
        )
        .bind(device_id.as_str())
        .bind(display_name)
        .bind(position.latitude)
        .bind(position.longitude)
        .bind(position.captured_at)
        .fetch_one(&self.db)
        .await?;

        Ok(row.into())
    }

    async fn watch(&self, retention: Duration) -> Result<SnapshotStream, SubscriptionError> {
        let mut listener = PgListener::connect_with(&self.db).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        debug!("listening on {NOTIFY_CHANNEL}");

        let db = self.db.clone();
        let retention_secs = retention.as_secs_f64();

        let stream = futures::stream::unfold(Some((listener, true)), move |state| {
            let db = db.clone();
            async move {
                let (mut listener, first) = state?;
                if !first {
                    if let Err(e) = listener.recv().await {
                        return Some((Err(SubscriptionError::from(e)), None));
                    }
                    // a burst of writes collapses into one snapshot
                    while listener.next_buffered().is_some() {}
                }
                match fetch_recent(&db, retention_secs).await {
                    Ok(records) => Some((Ok(records), Some((listener, false)))),
                    Err(e) => Some((Err(SubscriptionError::from(e)), None)),
                }
            }
        });
        Ok(stream.boxed())
    }
}
