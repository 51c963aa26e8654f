//! SQLite backend: one `connections` row per event, one `credentials` row per attempt

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{
    schema, timestamp_format, Aggregates, ConnectionEvent, CredentialAttempt, EventStore,
    LocationCount, StoreError,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Whether this exact event is already stored.
    ///
    /// Records match on timestamp, ip and source port, and also on duration,
    /// attempt count and client banner, so distinct connections that started
    /// in the same second from the same socket are still told apart.
    pub async fn contains_event(&self, event: &ConnectionEvent) -> Result<bool, StoreError> {
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM connections
                WHERE timestamp = ? AND ip = ? AND port = ?
                  AND duration = ? AND auth_attempts = ? AND client_banner IS ?
            )
            "#,
        )
        .bind(timestamp_format::to_string(&event.timestamp))
        .bind(&event.ip)
        .bind(event.port as i64)
        .bind(event.duration)
        .bind(event.credentials.len() as i64)
        .bind(&event.client_banner)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    pub async fn count_connections(&self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM connections")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn count_credentials(&self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM credentials")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Most recent events first, each with its credentials in submission order
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<ConnectionEvent>, StoreError> {
        let rows: Vec<(i64, String, String, i64, String, String, f64, f64, Option<String>, f64)> =
            sqlx::query_as(
                r#"
                SELECT id, timestamp, ip, port, country, city, lat, lon, client_banner, duration
                FROM connections
                ORDER BY id DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let ids: Vec<i64> = rows.iter().map(|row| row.0).collect();
        let mut credentials = self.credentials_for(&ids).await?;

        rows.into_iter()
            .map(|(id, ts, ip, port, country, city, lat, lon, client_banner, duration)| -> Result<ConnectionEvent, StoreError> {
                let timestamp = timestamp_format::parse(&ts).ok_or_else(|| {
                    StoreError::Corrupt(format!("connection {} has invalid timestamp '{}'", id, ts))
                })?;
                let port = u16::try_from(port).map_err(|_| {
                    StoreError::Corrupt(format!("connection {} has invalid port {}", id, port))
                })?;
                let event = ConnectionEvent {
                    timestamp,
                    ip,
                    port,
                    country,
                    city,
                    lat,
                    lon,
                    client_banner,
                    auth_attempts: 0,
                    duration,
                    credentials: Vec::new(),
                };
                Ok(event.with_credentials(credentials.remove(&id).unwrap_or_default()))
            })
            .collect()
    }

    async fn credentials_for(
        &self,
        connection_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<CredentialAttempt>>, StoreError> {
        let mut by_connection: HashMap<i64, Vec<CredentialAttempt>> = HashMap::new();
        for id in connection_ids {
            let rows: Vec<(String, String)> = sqlx::query_as(
                "SELECT username, password FROM credentials WHERE connection_id = ? ORDER BY id",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
            if !rows.is_empty() {
                by_connection.insert(
                    *id,
                    rows.into_iter()
                        .map(|(username, password)| CredentialAttempt { username, password })
                        .collect(),
                );
            }
        }
        Ok(by_connection)
    }

    async fn get_total_count(&self) -> Result<i64, StoreError> {
        self.count_connections().await
    }

    async fn get_unique_ips(&self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(DISTINCT ip) FROM connections")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    async fn get_location_stats(&self) -> Result<Vec<LocationCount>, StoreError> {
        let rows: Vec<(String, String, f64, f64, i64)> = sqlx::query_as(
            r#"
            SELECT ip, country, lat, lon, COUNT(*) as attempts
            FROM connections
            WHERE lat != 0 AND lon != 0
            GROUP BY ip, country, lat, lon
            ORDER BY ip, country, lat, lon
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ip, country, lat, lon, attempts)| LocationCount {
                ip,
                country,
                lat,
                lon,
                attempts,
            })
            .collect())
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn initialize_schema(&self) -> Result<(), StoreError> {
        for statement in [
            schema::CREATE_CONNECTIONS_TABLE,
            schema::CREATE_CREDENTIALS_TABLE,
            schema::CREATE_INDEX_IP,
            schema::CREATE_INDEX_IDENTITY,
            schema::CREATE_INDEX_CREDENTIALS_CONNECTION,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema initialized");
        Ok(())
    }

    async fn persist(&self, event: &ConnectionEvent) -> Result<(), StoreError> {
        // Dropping the transaction on any early return rolls it back
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(schema::INSERT_CONNECTION)
            .bind(timestamp_format::to_string(&event.timestamp))
            .bind(&event.ip)
            .bind(event.port as i64)
            .bind(&event.country)
            .bind(&event.city)
            .bind(event.lat)
            .bind(event.lon)
            .bind(&event.client_banner)
            .bind(event.credentials.len() as i64)
            .bind(event.duration)
            .execute(&mut *tx)
            .await?;
        let connection_id = result.last_insert_rowid();

        for credential in &event.credentials {
            sqlx::query(schema::INSERT_CREDENTIAL)
                .bind(connection_id)
                .bind(&credential.username)
                .bind(&credential.password)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            connection_id,
            credentials = event.credentials.len(),
            "Stored connection from {}", event.ip
        );
        Ok(())
    }

    async fn query_aggregates(&self) -> Result<Aggregates, StoreError> {
        let (total_attempts, unique_ips, total_credentials, locations) = tokio::try_join!(
            self.get_total_count(),
            self.get_unique_ips(),
            self.count_credentials(),
            self.get_location_stats()
        )?;

        Ok(Aggregates {
            total_attempts,
            unique_ips,
            total_credentials,
            locations,
        })
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
