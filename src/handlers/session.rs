//! Per-connection capture session
//!
//! A [`CaptureSession`] turns exactly one accepted socket into exactly one
//! persisted [`ConnectionEvent`]. The SSH exchange itself is delegated to a
//! [`Handshake`]; whatever it manages to record before it finishes, fails,
//! times out or is cancelled ends up in the event.

use async_trait::async_trait;
use russh::keys::ssh_key::PrivateKey;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler};
use russh::Disconnect;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::banner::{BannerTap, ClientBanner};
use crate::auth::{AuthDecision, AuthObserver, CredentialRecorder};
use crate::db::{persist_with_retry, ConnectionEvent, RetryPolicy, SharedStore, StoreError};
use crate::gate::ConcurrencyGate;
use crate::geoip::SharedGeoIp;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("SSH session error: {0}")]
    Session(#[from] anyhow::Error),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake cancelled by shutdown")]
    Cancelled,
}

/// What a handshake managed to observe about its peer
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub credentials: CredentialRecorder,
    pub client_banner: ClientBanner,
}

/// The SSH protocol exchange for one connection
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Drive the exchange until the peer leaves or the protocol fails.
    /// Observations go into `capture` as they happen.
    async fn run(&self, stream: TcpStream, peer: SocketAddr, capture: Capture) -> Result<(), HandshakeError>;
}

/// Handshake backed by `russh`, rejecting every authentication attempt
pub struct RusshHandshake {
    config: Arc<russh::server::Config>,
}

impl RusshHandshake {
    /// `timeout` also bounds how long an idle session may linger
    pub fn new(host_key: PrivateKey, banner: &str, timeout: Duration) -> Self {
        let config = russh::server::Config {
            server_id: russh::SshId::Standard(banner.to_string()),
            keys: vec![host_key],
            // Short rejection delay so brute forcers show us more attempts per session
            auth_rejection_time: Duration::from_millis(250),
            auth_rejection_time_initial: Some(Duration::ZERO),
            max_auth_attempts: 64,
            inactivity_timeout: Some(timeout),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Handshake for RusshHandshake {
    async fn run(&self, stream: TcpStream, peer: SocketAddr, capture: Capture) -> Result<(), HandshakeError> {
        let stream = BannerTap::new(stream, capture.client_banner.clone());
        let handler = TrapHandler {
            peer,
            observer: capture.credentials,
        };
        let session = russh::server::run_stream(self.config.clone(), stream, handler).await?;

        // russh drives the connection on its own task; hang it up whenever this
        // future ends, including when it is dropped by a timeout or shutdown
        let hangup = CancellationToken::new();
        let _hangup_on_drop = hangup.clone().drop_guard();
        let handle = session.handle();
        tokio::spawn(async move {
            hangup.cancelled().await;
            let _ = handle
                .disconnect(Disconnect::ByApplication, String::new(), String::new())
                .await;
        });

        session.await?;
        Ok(())
    }
}

/// `russh` handler that hands every authentication decision to an [`AuthObserver`]
struct TrapHandler<O> {
    peer: SocketAddr,
    observer: O,
}

fn to_auth(decision: AuthDecision) -> Auth {
    match decision {
        AuthDecision::Reject => Auth::reject(),
    }
}

impl<O: AuthObserver + 'static> Handler for TrapHandler<O> {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user = %user, "Captured password attempt");
        Ok(to_auth(self.observer.observe_password(user, password)))
    }

    async fn auth_publickey_offered(&mut self, user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(to_auth(self.observer.observe_public_key(user)))
    }

    async fn auth_publickey(&mut self, user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(to_auth(self.observer.observe_public_key(user)))
    }
}

/// Dependencies shared by every session
pub struct SessionContext {
    pub handshake: Arc<dyn Handshake>,
    pub geoip: SharedGeoIp,
    pub store: SharedStore,
    pub gate: ConcurrencyGate,
    pub handshake_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Accepted,
    Handshaking,
    Closed,
}

pub struct CaptureSession {
    id: Uuid,
    socket: Option<TcpStream>,
    peer: SocketAddr,
    accepted_at: Instant,
    state: SessionState,
}

impl CaptureSession {
    pub fn new(socket: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            socket: Some(socket),
            peer,
            accepted_at: Instant::now(),
            state: SessionState::Accepted,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.id, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the session to completion and persist its event.
    ///
    /// The returned error means the event could not be stored; everything
    /// that goes wrong with the peer is absorbed into the event instead.
    pub async fn run(mut self, ctx: &SessionContext, shutdown: CancellationToken) -> Result<ConnectionEvent, StoreError> {
        let peer = self.peer;
        let capture = Capture::default();

        let permit = tokio::select! {
            permit = ctx.gate.acquire() => permit,
            _ = shutdown.cancelled() => None,
        };

        let socket = self.socket.take();
        let outcome = match (socket, permit.is_some()) {
            (Some(socket), true) => {
                self.transition(SessionState::Handshaking);
                let handshake = ctx.handshake.run(socket, peer, capture.clone());
                tokio::select! {
                    result = tokio::time::timeout(ctx.handshake_timeout, handshake) => {
                        result.unwrap_or(Err(HandshakeError::Timeout(ctx.handshake_timeout)))
                    }
                    _ = shutdown.cancelled() => Err(HandshakeError::Cancelled),
                }
            }
            // Shut down while still queued at the gate
            (socket, _) => {
                drop(socket);
                Err(HandshakeError::Cancelled)
            }
        };

        match &outcome {
            Ok(()) => debug!(session = %self.id, "Handshake with {} ended", peer),
            Err(e) => debug!(session = %self.id, "Handshake with {} ended early: {}", peer, e),
        }
        self.transition(SessionState::Closed);
        let credentials = capture.credentials.snapshot();

        let mut event = ConnectionEvent::new(peer.ip().to_string(), peer.port())
            .with_client_banner(capture.client_banner.get())
            .with_credentials(credentials)
            .with_duration(self.accepted_at.elapsed());
        if let Some(geo) = ctx.geoip.resolve(&event.ip).await {
            event = event.with_geo(&geo);
        }

        info!(
            session = %self.id,
            ip = %event.ip,
            port = event.port,
            attempts = event.auth_attempts,
            country = %event.country,
            "SSH connection closed after {:.2}s",
            event.duration
        );

        if let Err(e) = persist_with_retry(ctx.store.as_ref(), &event, ctx.retry).await {
            error!(
                session = %self.id,
                backend = ctx.store.backend_name(),
                "Lost SSH event from {} with {} credential attempts: {}",
                event.ip, event.auth_attempts, e
            );
            return Err(e);
        }
        drop(permit);
        Ok(event)
    }
}
