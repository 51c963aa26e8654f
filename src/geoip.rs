//! GeoIP enrichment backed by an ip-api.com style HTTP service
//!
//! Results are cached per address for a fixed TTL. A stale entry stays in the
//! cache until a refresh succeeds, so a flaky upstream never erases what we
//! already know.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::GeoIpConfig;
use crate::db::UNKNOWN;

/// Cached lookup result
#[derive(Debug, Clone, PartialEq)]
pub struct GeoRecord {
    pub ip: IpAddr,
    pub country: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Location fields returned by a successful lookup
#[derive(Debug, Clone, PartialEq)]
pub struct GeoLocation {
    pub country: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("lookup timed out")]
    Timeout,

    #[error("lookup failed with status '{status}': {message}")]
    Failed { status: String, message: String },
}

/// Remote source of locations
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError>;
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

/// Client for `GET {endpoint}/{ip}` returning ip-api.com JSON
pub struct IpApiClient {
    client: reqwest::Client,
    endpoint: String,
}

impl IpApiClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, GeoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpApiClient {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let url = format!("{}/{}", self.endpoint, ip);
        let response: IpApiResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != "success" {
            return Err(GeoError::Failed {
                status: response.status,
                message: response.message.unwrap_or_default(),
            });
        }

        Ok(GeoLocation {
            country: response.country.unwrap_or_else(|| UNKNOWN.to_string()),
            city: response.city.unwrap_or_else(|| UNKNOWN.to_string()),
            lat: response.lat.unwrap_or(0.0),
            lon: response.lon.unwrap_or(0.0),
        })
    }
}

/// TTL-cached geolocation shared by every capture session
pub struct GeoIp {
    lookup: Option<Arc<dyn GeoLookup>>,
    cache: RwLock<HashMap<IpAddr, GeoRecord>>,
    ttl: chrono::Duration,
    timeout: Duration,
}

impl GeoIp {
    pub fn new(lookup: Arc<dyn GeoLookup>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            lookup: Some(lookup),
            cache: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            timeout,
        }
    }

    /// Enrichment that always answers "no data"
    pub fn disabled() -> Self {
        Self {
            lookup: None,
            cache: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::zero(),
            timeout: Duration::ZERO,
        }
    }

    pub fn from_config(config: &GeoIpConfig) -> Result<Self, GeoError> {
        if !config.enabled {
            info!("GeoIP disabled by configuration");
            return Ok(Self::disabled());
        }
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = IpApiClient::new(&config.endpoint, timeout)?;
        info!("GeoIP enabled via {}", config.endpoint);
        Ok(Self::new(
            Arc::new(client),
            Duration::from_secs(config.cache_ttl_secs),
            timeout,
        ))
    }

    /// Check if lookups can happen at all
    pub fn is_available(&self) -> bool {
        self.lookup.is_some()
    }

    /// Look up an address, preferring a fresh cache entry.
    ///
    /// Returns `None` for private or unparseable addresses and whenever a
    /// lookup fails; a failed refresh leaves any stale entry untouched.
    pub async fn resolve(&self, ip: &str) -> Option<GeoRecord> {
        let ip_addr: IpAddr = ip.parse().ok()?;

        if is_private_ip(&ip_addr) {
            return None;
        }

        let lookup = self.lookup.as_ref()?;

        if let Some(record) = self.cache.read().await.get(&ip_addr) {
            if Utc::now() - record.fetched_at < self.ttl {
                return Some(record.clone());
            }
        }

        let location = match tokio::time::timeout(self.timeout, lookup.lookup(ip_addr)).await {
            Ok(Ok(location)) => location,
            Ok(Err(e)) => {
                debug!("GeoIP lookup for {} failed: {}", ip_addr, e);
                return None;
            }
            Err(_) => {
                debug!("GeoIP lookup for {} failed: {}", ip_addr, GeoError::Timeout);
                return None;
            }
        };

        let record = GeoRecord {
            ip: ip_addr,
            country: location.country,
            city: location.city,
            lat: location.lat,
            lon: location.lon,
            fetched_at: Utc::now(),
        };
        self.cache.write().await.insert(ip_addr, record.clone());
        Some(record)
    }

    pub async fn cached(&self, ip: &IpAddr) -> Option<GeoRecord> {
        self.cache.read().await.get(ip).cloned()
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Insert a record directly, replacing any existing entry for its address
    pub async fn insert(&self, record: GeoRecord) {
        self.cache.write().await.insert(record.ip, record);
    }
}

/// Check if an IP address is private/local
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
            || ipv4.is_loopback()
            || ipv4.is_link_local()
            || ipv4.is_broadcast()
            || ipv4.is_documentation()
            || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if let Some(mapped) = ipv6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            let first = ipv6.segments()[0];
            ipv6.is_loopback()
            || ipv6.is_unspecified()
            // fc00::/7 unique local
            || (first & 0xfe00) == 0xfc00
            // fe80::/10 link local
            || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Thread-safe GeoIP wrapper
pub type SharedGeoIp = Arc<GeoIp>;
