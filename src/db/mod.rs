//! Event storage
//!
//! Every accepted connection becomes one [`ConnectionEvent`]. Two backends can
//! hold them: a JSON-lines append log ([`JsonlStore`]) and SQLite
//! ([`SqliteStore`]), with [`migrate`] moving a legacy log into SQLite.

mod jsonl;
mod migrate;
mod schema;
mod sqlite;

pub use jsonl::JsonlStore;
pub use migrate::{migrate, MigrationReport};
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{StorageBackend, StorageConfig};
use crate::geoip::GeoRecord;

pub const UNKNOWN: &str = "Unknown";

/// One username/password pair exactly as the client sent it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialAttempt {
    pub username: String,
    pub password: String,
}

impl CredentialAttempt {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Everything recorded about one accepted connection.
///
/// `auth_attempts` always equals `credentials.len()`: it is derived on
/// construction and on deserialization, never taken from input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawConnectionEvent")]
pub struct ConnectionEvent {
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub port: u16,
    pub country: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub client_banner: Option<String>,
    pub auth_attempts: u32,
    pub duration: f64,
    pub credentials: Vec<CredentialAttempt>,
}

impl ConnectionEvent {
    pub fn new(ip: String, port: u16) -> Self {
        Self {
            timestamp: Utc::now().trunc_subsecs(0),
            ip,
            port,
            country: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            lat: 0.0,
            lon: 0.0,
            client_banner: None,
            auth_attempts: 0,
            duration: 0.0,
            credentials: Vec::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Vec<CredentialAttempt>) -> Self {
        self.auth_attempts = credentials.len() as u32;
        self.credentials = credentials;
        self
    }

    pub fn with_geo(mut self, geo: &GeoRecord) -> Self {
        self.country = geo.country.clone();
        self.city = geo.city.clone();
        self.lat = geo.lat;
        self.lon = geo.lon;
        self
    }

    pub fn with_client_banner(mut self, banner: Option<String>) -> Self {
        self.client_banner = banner;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration.as_secs_f64();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(0);
        self
    }

    /// True when a geolocation lookup filled in coordinates
    pub fn is_geolocated(&self) -> bool {
        self.lat != 0.0 && self.lon != 0.0
    }
}

/// Wire shape of a log line; older lines lack the geolocation fields.
#[derive(Deserialize)]
struct RawConnectionEvent {
    #[serde(with = "timestamp_format")]
    timestamp: DateTime<Utc>,
    ip: String,
    port: u16,
    #[serde(default = "unknown")]
    country: String,
    #[serde(default = "unknown")]
    city: String,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
    #[serde(default)]
    client_banner: Option<String>,
    duration: f64,
    #[serde(default)]
    credentials: Vec<CredentialAttempt>,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

impl From<RawConnectionEvent> for ConnectionEvent {
    fn from(raw: RawConnectionEvent) -> Self {
        Self {
            timestamp: raw.timestamp,
            ip: raw.ip,
            port: raw.port,
            country: raw.country,
            city: raw.city,
            lat: raw.lat,
            lon: raw.lon,
            client_banner: raw.client_banner,
            auth_attempts: raw.credentials.len() as u32,
            duration: raw.duration.max(0.0),
            credentials: raw.credentials,
        }
    }
}

/// Timestamps are written as `2024-05-01T12:00:00Z`. Naive ISO-8601 strings
/// from older logs are read as UTC.
pub(crate) mod timestamp_format {
    use super::*;

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn to_string(ts: &DateTime<Utc>) -> String {
        ts.format(FORMAT).to_string()
    }

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc).trunc_subsecs(0));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc().trunc_subsecs(0))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_string(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", s)))
    }
}

/// Connection count for one geolocated `(ip, country, lat, lon)` group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationCount {
    pub ip: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    pub attempts: i64,
}

/// Summary statistics over everything persisted so far
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregates {
    pub total_attempts: i64,
    pub unique_ips: i64,
    pub total_credentials: i64,
    /// Only groups with non-zero coordinates
    pub locations: Vec<LocationCount>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Lock contention and interrupted I/O are worth retrying; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(sqlx::Error::Database(e)) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                let primary = e
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                matches!(primary, Some(5) | Some(6))
            }
            StoreError::Database(sqlx::Error::Io(e)) | StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create whatever the backend needs. Safe to call repeatedly.
    async fn initialize_schema(&self) -> Result<(), StoreError>;

    /// Durably record one event, or report why it could not be recorded.
    async fn persist(&self, event: &ConnectionEvent) -> Result<(), StoreError>;

    async fn query_aggregates(&self) -> Result<Aggregates, StoreError>;

    fn backend_name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn EventStore>;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            attempts: config.persist_attempts.max(1),
            backoff: Duration::from_millis(config.persist_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Persist `event`, retrying transient failures with linear backoff.
pub async fn persist_with_retry(
    store: &dyn EventStore,
    event: &ConnectionEvent,
    policy: RetryPolicy,
) -> Result<(), StoreError> {
    let mut attempt = 1;
    loop {
        match store.persist(event).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(
                    backend = store.backend_name(),
                    attempt,
                    "Transient persistence failure, retrying: {}", e
                );
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open the configured backend and make sure its schema exists.
pub async fn open(config: &StorageConfig) -> Result<SharedStore> {
    let store: SharedStore = match config.backend {
        StorageBackend::Jsonl => Arc::new(JsonlStore::new(&config.log_path)),
        StorageBackend::Sqlite => Arc::new(SqliteStore::connect(&config.database_path).await?),
    };
    store.initialize_schema().await?;
    info!("Event store ready ({})", store.backend_name());
    Ok(store)
}
