//! Checkpoint management for incremental polling.
//!
//! A checkpoint is a single timestamp: the newest `last_modified` of any
//! object whose content was successfully emitted. It is stored as plain text
//! at `{timestamp_directory}/last_modified_timestamp.txt`.
//!
//! # Atomic Writes
//!
//! Checkpoint updates use atomic write pattern:
//! 1. Write to temp file: `last_modified_timestamp.txt.tmp`
//! 2. Rename to final path: `last_modified_timestamp.txt`
//!
//! This ensures checkpoints are never partially written.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use snafu::prelude::*;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{CheckpointError, CheckpointReadSnafu, CheckpointWriteSnafu};
use crate::metrics::events::CheckpointSaved;

/// File name of the checkpoint inside the timestamp directory.
pub const CHECKPOINT_FILE: &str = "last_modified_timestamp.txt";

/// Reads and writes the persisted checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Create a store for the checkpoint inside `timestamp_directory`.
    pub fn new(timestamp_directory: impl AsRef<Path>) -> Self {
        Self {
            path: timestamp_directory.as_ref().join(CHECKPOINT_FILE),
        }
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted checkpoint.
    ///
    /// Returns the Unix epoch when no checkpoint exists or when the file
    /// content cannot be parsed. Returns `Err` only for unexpected IO errors.
    pub async fn load(&self) -> Result<DateTime<Utc>, CheckpointError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No checkpoint found, starting from epoch");
                return Ok(DateTime::UNIX_EPOCH);
            }
            Err(e) => {
                return Err(e).context(CheckpointReadSnafu {
                    path: self.path.clone(),
                });
            }
        };

        match parse_timestamp(&content) {
            Some(ts) => Ok(ts),
            None => {
                warn!(
                    path = %self.path.display(),
                    content = content.trim(),
                    "Failed to parse checkpoint, starting from epoch"
                );
                Ok(DateTime::UNIX_EPOCH)
            }
        }
    }

    /// Persist `ts`, replacing any previous checkpoint atomically.
    pub async fn save(&self, ts: DateTime<Utc>) -> Result<(), CheckpointError> {
        let temp_path = self.path.with_file_name(format!("{CHECKPOINT_FILE}.tmp"));
        let content = ts.to_rfc3339_opts(SecondsFormat::AutoSi, true);

        let write = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &self.path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e).context(CheckpointWriteSnafu {
                path: self.path.clone(),
            });
        }

        Ok(())
    }
}

/// Parse a checkpoint in any of the accepted formats.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f] +ZZZZ`, `YYYY-MM-DD HH:MM:SS[.f] UTC`
/// and Unix seconds with an optional fraction.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(ts.with_timezone(&Utc));
    }
    if let Some(naive) = raw.strip_suffix(" UTC") {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f") {
            return Some(ts.and_utc());
        }
    }

    parse_unix_seconds(raw)
}

fn parse_unix_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match raw.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (raw, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    // Right-pad to nanoseconds; digits past the ninth are truncated.
    let nanos = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits.parse().ok()?
    };

    DateTime::from_timestamp(secs, nanos)
}

/// Owns the in-memory checkpoint for one source and its persistent store.
pub struct CheckpointManager {
    store: CheckpointStore,
    current: DateTime<Utc>,
    /// Pipeline key, used for log and metric labels.
    target: String,
}

impl CheckpointManager {
    /// Create a manager starting at the epoch. Call [`load`](Self::load) to restore.
    pub fn new(store: CheckpointStore, target: impl Into<String>) -> Self {
        Self {
            store,
            current: DateTime::UNIX_EPOCH,
            target: target.into(),
        }
    }

    /// Restore the in-memory value from the store.
    pub async fn load(&mut self) -> Result<DateTime<Utc>, CheckpointError> {
        self.current = self.store.load().await?;
        info!(
            target = %self.target,
            checkpoint = %self.current.to_rfc3339(),
            "Loaded checkpoint"
        );
        Ok(self.current)
    }

    /// Current checkpoint value.
    pub fn current(&self) -> DateTime<Utc> {
        self.current
    }

    /// Move the checkpoint forward to `candidate` if it is newer.
    ///
    /// Returns `true` if the checkpoint changed. Never moves it backwards.
    pub fn advance(&mut self, candidate: DateTime<Utc>) -> bool {
        if candidate > self.current {
            self.current = candidate;
            true
        } else {
            false
        }
    }

    /// Persist the current value.
    pub async fn save(&self) -> Result<(), CheckpointError> {
        self.store.save(self.current).await?;

        emit!(CheckpointSaved {
            timestamp: self.current.timestamp_micros() as f64 / 1_000_000.0,
            target: self.target.clone(),
        });

        debug!(
            target = %self.target,
            checkpoint = %self.current.to_rfc3339(),
            "Saved checkpoint"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_checkpoint_is_epoch() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());

        assert_eq!(store.load().await.unwrap(), DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_save_and_load_preserves_nanoseconds() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());

        let ts = Utc
            .with_ymd_and_hms(2024, 3, 5, 12, 30, 45)
            .unwrap()
            .with_nanosecond(123_456_789)
            .unwrap();
        store.save(ts).await.unwrap();

        assert_eq!(store.load().await.unwrap(), ts);
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw, "2024-03-05T12:30:45.123456789Z");
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());

        store.save(Utc::now()).await.unwrap();
        store.save(Utc::now()).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![CHECKPOINT_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_save_into_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path().join("missing"));

        let err = store.save(Utc::now()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::CheckpointWrite { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_epoch() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path());
        std::fs::write(store.path(), "not a timestamp").unwrap();

        assert_eq!(store.load().await.unwrap(), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_parse_legacy_formats() {
        let expected = Utc.with_ymd_and_hms(2023, 11, 2, 8, 15, 0).unwrap();

        assert_eq!(
            parse_timestamp("2023-11-02 08:15:00 +0000"),
            Some(expected)
        );
        assert_eq!(parse_timestamp("2023-11-02 08:15:00 UTC"), Some(expected));
        assert_eq!(
            parse_timestamp("2023-11-02 10:15:00 +0200\n"),
            Some(expected)
        );
        assert_eq!(
            parse_timestamp(&expected.timestamp().to_string()),
            Some(expected)
        );
    }

    #[test]
    fn test_parse_fractional_unix_seconds() {
        let ts = parse_timestamp("1700000000.25").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 250);

        assert_eq!(parse_timestamp("1700000000.x"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(CheckpointStore::new(temp_dir.path()), "test");

        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        assert!(manager.advance(t2));
        assert!(!manager.advance(t1));
        assert!(!manager.advance(t2));
        assert_eq!(manager.current(), t2);
    }

    #[tokio::test]
    async fn test_manager_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();

        let mut manager = CheckpointManager::new(CheckpointStore::new(temp_dir.path()), "test");
        manager.advance(ts);
        manager.save().await.unwrap();

        let mut restored = CheckpointManager::new(CheckpointStore::new(temp_dir.path()), "test");
        assert_eq!(restored.load().await.unwrap(), ts);
        assert_eq!(restored.current(), ts);
    }
}
