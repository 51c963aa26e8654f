//! SSH capture handlers

pub mod banner;
pub mod session;
pub mod ssh;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::db::{RetryPolicy, SharedStore};
use crate::gate::ConcurrencyGate;
use crate::geoip::SharedGeoIp;
use session::{RusshHandshake, SessionContext};
use ssh::Acceptor;

/// Shared state for all sessions, using the real SSH handshake
pub async fn session_context(config: &Config, geoip: SharedGeoIp, store: SharedStore) -> Result<SessionContext> {
    let host_key = ssh::load_or_generate_host_key(&config.emulation.host_key_path).await?;
    let handshake = RusshHandshake::new(host_key, &config.emulation.ssh_banner, config.handshake_timeout());

    Ok(SessionContext {
        handshake: Arc::new(handshake),
        geoip,
        store,
        gate: ConcurrencyGate::new(config.server.max_sessions),
        handshake_timeout: config.handshake_timeout(),
        retry: RetryPolicy::from_config(&config.storage),
    })
}

/// Run the SSH honeypot until `shutdown` fires
pub async fn start(config: &Config, geoip: SharedGeoIp, store: SharedStore, shutdown: CancellationToken) -> Result<()> {
    let ctx = session_context(config, geoip, store).await?;
    let acceptor = Acceptor::bind(
        &config.ssh_addr(),
        config.server.backlog,
        Arc::new(ctx),
        config.shutdown_grace(),
    )
    .await?;

    info!(
        "Spoofing banner '{}' on {}",
        config.emulation.ssh_banner,
        acceptor.local_addr()?
    );
    acceptor.run(shutdown).await
}
