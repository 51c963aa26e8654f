//! Append-only JSON-lines backend

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Aggregates, ConnectionEvent, EventStore, LocationCount, StoreError};

/// One JSON object per line. Appends and scans are serialized through one
/// mutex, and every append is flushed and synced before `persist` returns.
pub struct JsonlStore {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl JsonlStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open_for_append(&self) -> Result<File, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(file)
    }

    /// Every parseable event in file order. Unreadable lines are skipped.
    pub async fn read_events(&self) -> Result<Vec<ConnectionEvent>, StoreError> {
        let _guard = self.writer.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ConnectionEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping unreadable line {} in {}: {}", index + 1, self.path.display(), e),
            }
        }
        Ok(events)
    }
}

/// Aggregate a slice of events the same way the SQLite queries do
pub(crate) fn aggregate(events: &[ConnectionEvent]) -> Aggregates {
    let mut ips = HashSet::new();
    let mut total_credentials = 0i64;
    // f64 is not Ord; group on the bit patterns, which is exact for equal values
    let mut groups: BTreeMap<(String, String, u64, u64), (f64, f64, i64)> = BTreeMap::new();

    for event in events {
        ips.insert(event.ip.as_str());
        total_credentials += event.credentials.len() as i64;

        if event.is_geolocated() {
            let key = (
                event.ip.clone(),
                event.country.clone(),
                event.lat.to_bits(),
                event.lon.to_bits(),
            );
            groups.entry(key).or_insert((event.lat, event.lon, 0)).2 += 1;
        }
    }

    Aggregates {
        total_attempts: events.len() as i64,
        unique_ips: ips.len() as i64,
        total_credentials,
        locations: groups
            .into_iter()
            .map(|((ip, country, _, _), (lat, lon, attempts))| LocationCount {
                ip,
                country,
                lat,
                lon,
                attempts,
            })
            .collect(),
    }
}

#[async_trait]
impl EventStore for JsonlStore {
    async fn initialize_schema(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(self.open_for_append().await?);
        }
        debug!("Append log ready at {}", self.path.display());
        Ok(())
    }

    async fn persist(&self, event: &ConnectionEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(self.open_for_append().await?);
        }
        if let Some(file) = writer.as_mut() {
            let written = async {
                file.write_all(&line).await?;
                file.flush().await?;
                file.sync_data().await
            }
            .await;
            if let Err(e) = written {
                // Reopen on the next call rather than reuse a handle in an unknown state
                *writer = None;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn query_aggregates(&self) -> Result<Aggregates, StoreError> {
        let events = self.read_events().await?;
        Ok(aggregate(&events))
    }

    fn backend_name(&self) -> &'static str {
        "jsonl"
    }
}
