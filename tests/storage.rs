use chrono::Utc;
use ssh_honeypot::db::{
    migrate, Aggregates, ConnectionEvent, CredentialAttempt, EventStore, JsonlStore, MigrationReport,
    SqliteStore,
};
use ssh_honeypot::geoip::GeoRecord;
use std::io::Write;
use tempfile::TempDir;

fn geo(ip: &str, country: &str, lat: f64, lon: f64) -> GeoRecord {
    GeoRecord {
        ip: ip.parse().unwrap(),
        country: country.to_string(),
        city: "Somewhere".to_string(),
        lat,
        lon,
        fetched_at: Utc::now(),
    }
}

/// A: two attempts, geolocated. B: none, not geolocated. C: one attempt, geolocated.
fn sample_events() -> Vec<ConnectionEvent> {
    vec![
        ConnectionEvent::new("8.8.8.8".to_string(), 40001)
            .with_credentials(vec![
                CredentialAttempt::new("root", "root"),
                CredentialAttempt::new("root", "123456"),
            ])
            .with_geo(&geo("8.8.8.8", "United States", 37.751, -97.822)),
        ConnectionEvent::new("9.9.9.9".to_string(), 40002),
        ConnectionEvent::new("1.1.1.1".to_string(), 40003)
            .with_credentials(vec![CredentialAttempt::new("admin", "admin")])
            .with_geo(&geo("1.1.1.1", "Australia", -33.494, 143.2104)),
    ]
}

fn assert_sample_aggregates(aggregates: &Aggregates) {
    assert_eq!(aggregates.total_attempts, 3);
    assert_eq!(aggregates.unique_ips, 3);
    assert_eq!(aggregates.total_credentials, 3);

    let mut located: Vec<(&str, i64)> = aggregates
        .locations
        .iter()
        .map(|l| (l.ip.as_str(), l.attempts))
        .collect();
    located.sort();
    assert_eq!(located, vec![("1.1.1.1", 1), ("8.8.8.8", 1)]);
}

#[tokio::test]
async fn test_sqlite_aggregates_exclude_ungeolocated() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::connect(&dir.path().join("connections.db")).await.unwrap();
    store.initialize_schema().await.unwrap();

    for event in sample_events() {
        store.persist(&event).await.unwrap();
    }

    assert_sample_aggregates(&store.query_aggregates().await.unwrap());
}

#[tokio::test]
async fn test_jsonl_aggregates_exclude_ungeolocated() {
    let dir = TempDir::new().unwrap();
    let store = JsonlStore::new(dir.path().join("connections.jsonl"));
    store.initialize_schema().await.unwrap();

    for event in sample_events() {
        store.persist(&event).await.unwrap();
    }

    assert_sample_aggregates(&store.query_aggregates().await.unwrap());
}

#[tokio::test]
async fn test_repeat_source_counts_per_location() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::connect(&dir.path().join("connections.db")).await.unwrap();
    store.initialize_schema().await.unwrap();

    let location = geo("8.8.8.8", "United States", 37.751, -97.822);
    for port in [50000, 50001, 50002] {
        let event = ConnectionEvent::new("8.8.8.8".to_string(), port).with_geo(&location);
        store.persist(&event).await.unwrap();
    }

    let aggregates = store.query_aggregates().await.unwrap();
    assert_eq!(aggregates.total_attempts, 3);
    assert_eq!(aggregates.unique_ips, 1);
    assert_eq!(aggregates.locations.len(), 1);
    assert_eq!(aggregates.locations[0].attempts, 3);
}

fn write_legacy_log(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("ssh_connections.jsonl");
    let mut file = std::fs::File::create(&path).unwrap();
    let lines = [
        // Full record
        r#"{"timestamp": "2024-03-01T10:15:00", "ip": "8.8.8.8", "port": 51234, "country": "United States", "city": "Mountain View", "lat": 37.4, "lon": -122.1, "client_banner": "SSH-2.0-Go", "auth_attempts": 2, "duration": 1.5, "credentials": [{"username": "root", "password": "root"}, {"username": "pi", "password": "raspberry"}]}"#,
        // Optional fields missing
        r#"{"timestamp": "2024-03-01T10:16:00", "ip": "9.9.9.9", "port": 40000, "duration": 0.2}"#,
        "",
        r#"{"timestamp": "2024-03-01T10:17:00Z", "ip": "1.1.1.1", "port": 40001, "duration": 3.0, "credentials": [{"username": "admin", "password": "admin"}]}"#,
        // Broken JSON
        r#"{"timestamp": "2024-03-01T10:18:00", "ip": "#,
        // Missing required field
        r#"{"timestamp": "2024-03-01T10:19:00", "port": 22, "duration": 0.1}"#,
    ];
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    path
}

#[tokio::test]
async fn test_migration_counts_good_and_bad_records() {
    let dir = TempDir::new().unwrap();
    let source = write_legacy_log(&dir);
    let store = SqliteStore::connect(&dir.path().join("connections.db")).await.unwrap();

    let report = migrate(&source, &store).await.unwrap();
    assert_eq!(
        report,
        MigrationReport {
            migrated: 3,
            failed: 2,
            skipped: 0
        }
    );
    assert_eq!(store.count_connections().await.unwrap(), 3);
    assert_eq!(store.count_credentials().await.unwrap(), 3);

    let events = store.recent_events(10).await.unwrap();
    let sparse = events.iter().find(|e| e.ip == "9.9.9.9").unwrap();
    assert_eq!(sparse.country, "Unknown");
    assert_eq!(sparse.city, "Unknown");
    assert_eq!((sparse.lat, sparse.lon), (0.0, 0.0));
    assert_eq!(sparse.client_banner, None);
    assert!(sparse.credentials.is_empty());

    let full = events.iter().find(|e| e.ip == "8.8.8.8").unwrap();
    assert_eq!(full.client_banner.as_deref(), Some("SSH-2.0-Go"));
    assert_eq!(full.credentials[1].password, "raspberry");
}

#[tokio::test]
async fn test_rerunning_migration_adds_nothing() {
    let dir = TempDir::new().unwrap();
    let source = write_legacy_log(&dir);
    let store = SqliteStore::connect(&dir.path().join("connections.db")).await.unwrap();

    migrate(&source, &store).await.unwrap();
    let second = migrate(&source, &store).await.unwrap();

    assert_eq!(second.migrated, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.failed, 2);
    assert_eq!(store.count_connections().await.unwrap(), 3);
    assert_eq!(store.count_credentials().await.unwrap(), 3);
}

#[tokio::test]
async fn test_migrating_missing_log_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::connect(&dir.path().join("connections.db")).await.unwrap();

    let report = migrate(&dir.path().join("nope.jsonl"), &store).await.unwrap();
    assert_eq!(report, MigrationReport::default());
}

#[tokio::test]
async fn test_jsonl_log_migrates_into_sqlite() {
    let dir = TempDir::new().unwrap();
    let log = JsonlStore::new(dir.path().join("connections.jsonl"));
    log.initialize_schema().await.unwrap();
    for event in sample_events() {
        log.persist(&event).await.unwrap();
    }

    let store = SqliteStore::connect(&dir.path().join("connections.db")).await.unwrap();
    let report = migrate(log.path(), &store).await.unwrap();
    assert_eq!(report.migrated, 3);
    assert_sample_aggregates(&store.query_aggregates().await.unwrap());
}

#[tokio::test]
async fn test_records_sharing_second_and_socket_both_migrate() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("ssh_connections.jsonl");
    std::fs::write(
        &source,
        concat!(
            r#"{"timestamp": "2024-03-01T10:15:00", "ip": "8.8.8.8", "port": 51234, "duration": 0.4}"#,
            "\n",
            r#"{"timestamp": "2024-03-01T10:15:00", "ip": "8.8.8.8", "port": 51234, "duration": 2.5, "credentials": [{"username": "root", "password": "1234"}]}"#,
            "\n",
        ),
    )
    .unwrap();
    let store = SqliteStore::connect(&dir.path().join("connections.db")).await.unwrap();

    let first = migrate(&source, &store).await.unwrap();
    assert_eq!(first.migrated, 2);
    assert_eq!(first.skipped, 0);

    let second = migrate(&source, &store).await.unwrap();
    assert_eq!(second.migrated, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(store.count_connections().await.unwrap(), 2);
}
