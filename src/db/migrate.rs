//! One-time import of a legacy append log into SQLite

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::{ConnectionEvent, EventStore, SqliteStore, StoreError};

/// Outcome of a migration run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: usize,
    /// Records already present from an earlier run
    pub skipped: usize,
}

/// Copy every record of the log at `source` into `store`.
///
/// Missing optional fields take their defaults. A line that does not parse or
/// fails to insert is counted in `failed` and the run continues. Records that
/// are already stored (see [`SqliteStore::contains_event`]) are counted in
/// `skipped`, so running the migration twice does not duplicate rows.
/// A missing source file yields an empty report.
pub async fn migrate(source: &Path, store: &SqliteStore) -> Result<MigrationReport, StoreError> {
    let mut report = MigrationReport::default();

    let file = match File::open(source).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No file found at {}, nothing to migrate", source.display());
            return Ok(report);
        }
        Err(e) => return Err(e.into()),
    };

    store.initialize_schema().await?;

    let mut segments = BufReader::new(file).split(b'\n');
    let mut line_number = 0usize;
    while let Some(bytes) = segments.next_segment().await? {
        line_number += 1;
        let line = match std::str::from_utf8(&bytes) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!("Failed to migrate record on line {}: {}", line_number, e);
                report.failed += 1;
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        let event: ConnectionEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to migrate record on line {}: {}", line_number, e);
                report.failed += 1;
                continue;
            }
        };

        match store.contains_event(&event).await {
            Ok(true) => {
                report.skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to check record on line {}: {}", line_number, e);
                report.failed += 1;
                continue;
            }
        }

        match store.persist(&event).await {
            Ok(()) => report.migrated += 1,
            Err(e) => {
                warn!("Failed to migrate record on line {}: {}", line_number, e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Migration complete: {} records migrated, {} failed, {} already present",
        report.migrated, report.failed, report.skipped
    );
    Ok(report)
}
