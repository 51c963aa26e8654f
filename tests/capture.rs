use async_trait::async_trait;
use ssh_honeypot::auth::AuthObserver;
use ssh_honeypot::db::{EventStore, JsonlStore, RetryPolicy, SharedStore, SqliteStore};
use ssh_honeypot::gate::ConcurrencyGate;
use ssh_honeypot::geoip::GeoIp;
use ssh_honeypot::handlers::session::{Capture, CaptureSession, Handshake, HandshakeError, SessionContext};
use ssh_honeypot::handlers::ssh::Acceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records a fixed list of passwords, then fails like a dropped connection
struct PartialHandshake {
    attempts: Vec<(&'static str, &'static str)>,
}

#[async_trait]
impl Handshake for PartialHandshake {
    async fn run(&self, _stream: TcpStream, _peer: SocketAddr, capture: Capture) -> Result<(), HandshakeError> {
        for (user, pass) in &self.attempts {
            capture.credentials.observe_password(user, pass);
        }
        Err(HandshakeError::Session(anyhow::anyhow!("connection reset by peer")))
    }
}

/// Records one password, then never finishes
struct StalledHandshake;

#[async_trait]
impl Handshake for StalledHandshake {
    async fn run(&self, _stream: TcpStream, _peer: SocketAddr, capture: Capture) -> Result<(), HandshakeError> {
        capture.credentials.observe_password("root", "hunter2");
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Announces itself, records one password, then waits for the client to hang up
struct EchoUntilEof {
    started: mpsc::UnboundedSender<SocketAddr>,
}

#[async_trait]
impl Handshake for EchoUntilEof {
    async fn run(&self, mut stream: TcpStream, peer: SocketAddr, capture: Capture) -> Result<(), HandshakeError> {
        capture.credentials.observe_password("admin", "admin");
        let _ = self.started.send(peer);
        let mut buf = [0u8; 64];
        while stream.read(&mut buf).await.map_err(anyhow::Error::from)? > 0 {}
        Ok(())
    }
}

fn context(handshake: impl Handshake + 'static, store: SharedStore, capacity: usize, timeout: Duration) -> SessionContext {
    SessionContext {
        handshake: Arc::new(handshake),
        geoip: Arc::new(GeoIp::disabled()),
        store,
        gate: ConcurrencyGate::new(capacity),
        handshake_timeout: timeout,
        retry: RetryPolicy::default(),
    }
}

/// One accepted loopback connection, plus the client end to keep it open
async fn loopback_pair() -> (TcpStream, SocketAddr, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    (server, peer, client)
}

async fn sqlite_store(dir: &TempDir) -> Arc<SqliteStore> {
    let store = SqliteStore::connect(&dir.path().join("connections.db")).await.unwrap();
    store.initialize_schema().await.unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn test_failed_handshake_still_yields_one_event() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let handshake = PartialHandshake {
        attempts: vec![("root", "toor"), ("ubuntu", "ubuntu")],
    };
    let ctx = context(handshake, store.clone(), 1, Duration::from_secs(5));

    let (socket, peer, _client) = loopback_pair().await;
    let event = CaptureSession::new(socket, peer)
        .run(&ctx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(event.auth_attempts, 2);
    assert_eq!(event.ip, "127.0.0.1");
    assert_eq!(event.port, peer.port());
    assert_eq!(event.country, "Unknown");

    assert_eq!(store.count_connections().await.unwrap(), 1);
    let stored = store.recent_events(10).await.unwrap();
    let credentials: Vec<(&str, &str)> = stored[0]
        .credentials
        .iter()
        .map(|c| (c.username.as_str(), c.password.as_str()))
        .collect();
    assert_eq!(credentials, vec![("root", "toor"), ("ubuntu", "ubuntu")]);
    assert_eq!(ctx.gate.available(), 1);
}

#[tokio::test]
async fn test_stalled_handshake_is_abandoned_after_timeout() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let timeout = Duration::from_millis(200);
    let ctx = context(StalledHandshake, store.clone(), 1, timeout);

    let (socket, peer, _client) = loopback_pair().await;
    let event = tokio::time::timeout(
        Duration::from_secs(5),
        CaptureSession::new(socket, peer).run(&ctx, CancellationToken::new()),
    )
    .await
    .expect("session must not outlive its handshake timeout")
    .unwrap();

    assert!(event.duration >= timeout.as_secs_f64());
    assert_eq!(event.credentials.len(), 1);
    assert_eq!(store.count_connections().await.unwrap(), 1);
    assert_eq!(ctx.gate.available(), 1);
}

#[tokio::test]
async fn test_shutdown_while_queued_records_empty_event() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let ctx = context(StalledHandshake, store.clone(), 1, Duration::from_secs(30));
    // Occupy the only slot so the session waits at the gate
    let _held = ctx.gate.acquire().await.unwrap();

    let shutdown = CancellationToken::new();
    let (socket, peer, _client) = loopback_pair().await;
    let canceller = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let event = CaptureSession::new(socket, peer).run(&ctx, shutdown).await.unwrap();
    assert!(event.credentials.is_empty());
    assert_eq!(store.count_connections().await.unwrap(), 1);
}

#[tokio::test]
async fn test_shutdown_interrupts_running_handshake() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let ctx = context(StalledHandshake, store.clone(), 1, Duration::from_secs(30));

    let shutdown = CancellationToken::new();
    let (socket, peer, _client) = loopback_pair().await;
    let canceller = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let event = tokio::time::timeout(Duration::from_secs(5), CaptureSession::new(socket, peer).run(&ctx, shutdown))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.credentials.len(), 1);
    assert_eq!(ctx.gate.available(), 1);
}

#[tokio::test]
async fn test_acceptor_records_every_connection() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(JsonlStore::new(dir.path().join("connections.jsonl")));
    log.initialize_schema().await.unwrap();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let ctx = context(
        EchoUntilEof { started: started_tx },
        log.clone(),
        2,
        Duration::from_secs(5),
    );
    let acceptor = Acceptor::bind("127.0.0.1:0", 16, Arc::new(ctx), Duration::from_secs(5))
        .await
        .unwrap();
    let addr = acceptor.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(acceptor.run(shutdown.clone()));

    // Two clients hold both slots; the third waits until one hangs up
    let first = TcpStream::connect(addr).await.unwrap();
    let second = TcpStream::connect(addr).await.unwrap();
    let third = TcpStream::connect(addr).await.unwrap();
    started_rx.recv().await.unwrap();
    started_rx.recv().await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), started_rx.recv())
            .await
            .is_err(),
        "third session must wait for a free slot"
    );

    drop(first);
    started_rx.recv().await.unwrap();
    drop(second);
    drop(third);

    // Wait until every session has stored its event
    for _ in 0..100 {
        if log.read_events().await.unwrap().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    server.await.unwrap().unwrap();

    let events = log.read_events().await.unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.auth_attempts == 1 && e.ip == "127.0.0.1"));
    assert!(TcpStream::connect(addr).await.is_err());
}
