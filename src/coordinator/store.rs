//! Statistics Persistence
//!
//! Aggregate statistics are the only state expected to survive a restart.
//! The backing store is an external collaborator; this module only defines
//! the seam and a file-backed implementation for hosts with a filesystem.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use super::game::AggregateStatistics;

/// Persistence failure. Saving is best-effort; callers log and move on.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("statistics store i/o: {0}")]
    Io(#[from] io::Error),
    /// Stored payload did not parse.
    #[error("statistics store corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Key-value persistence seam for aggregate statistics.
pub trait StatsStore: Send + Sync {
    /// Load persisted statistics. `Ok(None)` if nothing was ever saved.
    fn load_statistics(&self) -> Result<Option<AggregateStatistics>, StoreError>;

    /// Persist the statistics.
    fn save_statistics(&self, stats: &AggregateStatistics) -> Result<(), StoreError>;
}

/// JSON-file store.
#[derive(Debug, Clone)]
pub struct JsonStatsStore {
    path: PathBuf,
}

impl JsonStatsStore {
    /// Store statistics at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatsStore for JsonStatsStore {
    fn load_statistics(&self) -> Result<Option<AggregateStatistics>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no persisted statistics");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let stats = serde_json::from_slice(&bytes)?;
        Ok(Some(stats))
    }

    fn save_statistics(&self, stats: &AggregateStatistics) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(stats)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Save statistics, logging instead of propagating failure.
pub fn save_best_effort(store: &dyn StatsStore, stats: &AggregateStatistics) {
    if let Err(err) = store.save_statistics(stats) {
        warn!(%err, "failed to persist statistics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "laser-parcour-{}-{}.json",
            name,
            std::process::id()
        ));
        path
    }

    #[test]
    fn round_trip() {
        let path = temp_path("round-trip");
        let store = JsonStatsStore::new(&path);

        let stats = AggregateStatistics {
            total_games: 3,
            best_time_ms: 10_000,
            worst_time_ms: 60_000,
            avg_time_ms: 33_333,
            total_beam_breaks: 7,
            total_playtime_ms: 100_000,
        };
        store.save_statistics(&stats).unwrap();
        assert_eq!(store.load_statistics().unwrap(), Some(stats));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_loads_none() {
        let store = JsonStatsStore::new(temp_path("missing"));
        assert_eq!(store.load_statistics().unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"not json").unwrap();
        let store = JsonStatsStore::new(&path);
        assert!(matches!(
            store.load_statistics(),
            Err(StoreError::Corrupt(_))
        ));
        std::fs::remove_file(&path).ok();
    }
}
