//! SSH listener

use anyhow::{Context, Result};
use russh::keys::ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::session::{CaptureSession, SessionContext};

/// Load the persistent host key, creating an Ed25519 key on first run
pub async fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key from {}", path.display()))?;
        info!("Loaded SSH host key from {}", path.display());
        return Ok(key);
    }

    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .context("failed to generate SSH host key")?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("failed to encode SSH host key")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("failed to create SSH host key file {}", path.display()))?;
    file.write_all(encoded.as_bytes()).await?;
    file.sync_all().await?;

    info!("Generated new SSH host key at {}", path.display());
    Ok(key)
}

/// Accept loop for the SSH port. Every connection becomes a [`CaptureSession`].
pub struct Acceptor {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    grace: Duration,
}

impl Acceptor {
    pub async fn bind(addr: &str, backlog: u32, ctx: Arc<SessionContext>, grace: Duration) -> Result<Self> {
        let addr: SocketAddr = tokio::net::lookup_host(addr)
            .await
            .with_context(|| format!("cannot resolve SSH listen address {}", addr))?
            .next()
            .with_context(|| format!("no usable SSH listen address for {}", addr))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("cannot bind SSH to {}", addr))?;
        let listener = socket.listen(backlog)?;

        Ok(Self { listener, ctx, grace })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires, then give in-flight sessions up to the
    /// grace period to store their events.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self { listener, ctx, grace } = self;
        let tracker = TaskTracker::new();
        info!(
            "SSH honeypot listening on {} (max {} concurrent sessions)",
            listener.local_addr()?,
            ctx.gate.capacity()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!(
                            "SSH connection from {} ({} of {} slots free)",
                            peer,
                            ctx.gate.available(),
                            ctx.gate.capacity()
                        );
                        let ctx = ctx.clone();
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            // Failures are already logged by the session
                            let _ = CaptureSession::new(socket, peer).run(&ctx, shutdown).await;
                        });
                    }
                    Err(e) => {
                        warn!("SSH accept error: {}", e);
                        // Usually fd exhaustion; back off instead of spinning
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        drop(listener);
        tracker.close();
        info!("SSH listener closed, waiting for {} sessions", tracker.len());
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                "{} SSH sessions still running after {:?} grace period",
                tracker.len(),
                grace
            );
        }
        Ok(())
    }
}
