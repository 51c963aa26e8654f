//! Prometheus gauges recomputed from the event store

use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{Aggregates, EventStore, StoreError};

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Summary gauges over everything the store holds
pub struct MetricsAggregator {
    registry: Registry,
    pub total_attempts: IntGauge,
    pub unique_ips: IntGauge,
    pub total_credentials: IntGauge,
    pub attempts_by_location: IntGaugeVec,
}

impl MetricsAggregator {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let total_attempts = IntGauge::new(
            "honeypot_total_attempts",
            "Total number of SSH connection attempts",
        )?;
        registry.register(Box::new(total_attempts.clone()))?;

        let unique_ips = IntGauge::new(
            "honeypot_unique_ips",
            "Number of distinct source addresses",
        )?;
        registry.register(Box::new(unique_ips.clone()))?;

        let total_credentials = IntGauge::new(
            "honeypot_total_credentials",
            "Total number of captured username/password pairs",
        )?;
        registry.register(Box::new(total_credentials.clone()))?;

        let attempts_by_location = IntGaugeVec::new(
            Opts::new(
                "honeypot_attempts_by_location",
                "Connection attempts per geolocated source",
            ),
            &["ip", "country", "lat", "lon"],
        )?;
        registry.register(Box::new(attempts_by_location.clone()))?;

        Ok(Self {
            registry,
            total_attempts,
            unique_ips,
            total_credentials,
            attempts_by_location,
        })
    }

    /// Replace every published value with `aggregates`
    pub fn update(&self, aggregates: &Aggregates) {
        self.total_attempts.set(aggregates.total_attempts);
        self.unique_ips.set(aggregates.unique_ips);
        self.total_credentials.set(aggregates.total_credentials);

        // Sources that vanished from the store must not linger
        self.attempts_by_location.reset();
        for location in &aggregates.locations {
            let lat = location.lat.to_string();
            let lon = location.lon.to_string();
            self.attempts_by_location
                .with_label_values(&[&location.ip, &location.country, &lat, &lon])
                .set(location.attempts);
        }
    }

    /// Recompute from the store once
    pub async fn refresh(&self, store: &dyn EventStore) -> MetricsResult<()> {
        let aggregates = store.query_aggregates().await?;
        self.update(&aggregates);
        debug!(
            "Metrics refreshed: {} attempts from {} addresses, {} locations",
            aggregates.total_attempts,
            aggregates.unique_ips,
            aggregates.locations.len()
        );
        Ok(())
    }

    /// Refresh every `interval` until `shutdown` fires. Failed ticks keep the previous values.
    pub async fn run(&self, store: &dyn EventStore, interval: Duration, shutdown: CancellationToken) {
        info!("Metrics aggregator refreshing every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(store).await {
                        warn!("Metrics refresh failed: {}", e);
                    }
                }
            }
        }
        info!("Metrics aggregator stopped");
    }

    /// Prometheus text exposition of every gauge
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
