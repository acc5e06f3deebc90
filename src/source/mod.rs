//! Bucket source.
//!
//! One poll cycle lists the bucket, downloads and emits new objects,
//! reconciles the local mirror and persists the checkpoint:
//!
//! ```text
//! Idle -> Listing -> Downloading -> Reconciling -> Checkpointing -> Idle
//! ```
//!
//! A listing failure aborts the cycle before anything local is touched.
//! Object failures are contained by the downloader.

pub mod catalog;
pub mod compression;
pub mod downloader;
pub mod reconcile;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::config::SourceConfig;
use crate::emit;
use crate::error::{
    CheckpointSnafu, CreateDirectorySnafu, ListingSnafu, PipelineError, SourceError,
    StartupCheckpointSnafu,
};
use crate::event::EventRouter;
use crate::metrics::events::ObjectsListed;
use crate::polling::{IterationResult, PollingProcessor};

use catalog::{Catalog, Listing};
use downloader::Downloader;

/// Outcome of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub listed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub emitted: usize,
    pub deleted: usize,
    /// Checkpoint value after the cycle.
    pub checkpoint: DateTime<Utc>,
    pub checkpoint_advanced: bool,
}

/// A source that can be polled for new data.
#[async_trait]
pub trait Source: Send + Sync {
    /// Run one complete poll cycle.
    async fn poll(&self, shutdown: &CancellationToken) -> Result<CycleReport, SourceError>;
}

/// A listed cycle that holds the source's cycle guard until finished.
pub struct Cycle {
    _guard: OwnedMutexGuard<()>,
    listing: Listing,
}

/// Polls one bucket and mirrors it into a local directory.
pub struct S3Source {
    /// Pipeline key, used for log and metric labels.
    target: String,
    catalog: Arc<dyn Catalog>,
    downloader: Downloader,
    checkpoint: Mutex<CheckpointManager>,
    cycle_guard: Arc<Mutex<()>>,
    delete_local_files: bool,
    max_listed_objects: Option<usize>,
}

impl S3Source {
    /// Build a source, creating its directories and restoring its checkpoint.
    pub async fn from_config(
        target: impl Into<String>,
        config: &SourceConfig,
        catalog: Arc<dyn Catalog>,
        router: Arc<dyn EventRouter>,
    ) -> Result<Self, PipelineError> {
        let target = target.into();

        for dir in [&config.download_directory, &config.timestamp_directory] {
            tokio::fs::create_dir_all(dir)
                .await
                .context(CreateDirectorySnafu { path: dir })?;
        }

        let mut checkpoint = CheckpointManager::new(
            CheckpointStore::new(&config.timestamp_directory),
            target.clone(),
        );
        checkpoint.load().await.context(StartupCheckpointSnafu)?;

        let downloader = Downloader::new(
            catalog.clone(),
            router,
            config.compression.codec(),
            config.download_directory.clone(),
            config.tag.clone(),
            config.max_concurrent_downloads,
            config.skip_older_than_checkpoint,
            target.clone(),
        );

        Ok(Self {
            target,
            catalog,
            downloader,
            checkpoint: Mutex::new(checkpoint),
            cycle_guard: Arc::new(Mutex::new(())),
            delete_local_files: config.delete_local_files,
            max_listed_objects: config.max_listed_objects,
        })
    }

    /// Current checkpoint value.
    pub async fn checkpoint(&self) -> DateTime<Utc> {
        self.checkpoint.lock().await.current()
    }

    /// Acquire the cycle guard and list the bucket.
    ///
    /// Fails with [`SourceError::CycleInProgress`] if another cycle holds the
    /// guard, and with [`SourceError::Listing`] if the listing fails. Neither
    /// touches local files or the checkpoint.
    pub async fn begin_cycle(&self) -> Result<Cycle, SourceError> {
        let guard = self
            .cycle_guard
            .clone()
            .try_lock_owned()
            .map_err(|_| SourceError::CycleInProgress)?;

        let listing = self
            .catalog
            .list(self.max_listed_objects)
            .await
            .context(ListingSnafu)?;

        emit!(ObjectsListed {
            count: listing.objects.len() as u64,
            target: self.target.clone(),
        });
        debug!(
            target = %self.target,
            objects = listing.objects.len(),
            truncated = listing.truncated,
            "Listed bucket"
        );

        Ok(Cycle {
            _guard: guard,
            listing,
        })
    }

    /// Download, reconcile and checkpoint a listed cycle.
    pub async fn finish_cycle(
        &self,
        cycle: Cycle,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, SourceError> {
        let listing = &cycle.listing;
        let mut checkpoint = self.checkpoint.lock().await;

        let summary = self
            .downloader
            .download_all(&listing.objects, checkpoint.current(), shutdown)
            .await;

        let deleted = if self.delete_local_files {
            reconcile::reconcile(self.downloader.root(), listing, &self.target).await
        } else {
            0
        };

        let checkpoint_advanced = summary
            .newest_emitted
            .is_some_and(|newest| checkpoint.advance(newest));
        checkpoint.save().await.context(CheckpointSnafu)?;

        let report = CycleReport {
            listed: listing.objects.len(),
            downloaded: summary.downloaded,
            skipped: summary.skipped,
            failed: summary.failed,
            emitted: summary.emitted,
            deleted,
            checkpoint: checkpoint.current(),
            checkpoint_advanced,
        };

        info!(
            target = %self.target,
            listed = report.listed,
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed,
            emitted = report.emitted,
            deleted = report.deleted,
            checkpoint = %report.checkpoint.to_rfc3339(),
            "Poll cycle complete"
        );

        Ok(report)
    }
}

#[async_trait]
impl Source for S3Source {
    async fn poll(&self, shutdown: &CancellationToken) -> Result<CycleReport, SourceError> {
        let cycle = self.begin_cycle().await?;
        self.finish_cycle(cycle, shutdown).await
    }
}

/// Drives an [`S3Source`] from the polling loop.
pub struct SourceProcessor {
    source: Arc<S3Source>,
    shutdown: CancellationToken,
}

impl SourceProcessor {
    pub fn new(source: Arc<S3Source>, shutdown: CancellationToken) -> Self {
        Self { source, shutdown }
    }
}

#[async_trait]
impl PollingProcessor for SourceProcessor {
    type State = Cycle;
    type Error = SourceError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error> {
        if cold_start {
            let checkpoint = self.source.checkpoint().await;
            info!(
                target = %self.source.target,
                checkpoint = %checkpoint.to_rfc3339(),
                "Cold start"
            );
        }

        // An empty listing still needs reconciling and checkpointing
        self.source.begin_cycle().await.map(Some)
    }

    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error> {
        let report = self.source.finish_cycle(state, &self.shutdown).await?;

        if report.emitted > 0 {
            Ok(IterationResult::ProcessedItems)
        } else {
            Ok(IterationResult::NoItems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::event::ChannelRouter;
    use crate::source::catalog::{ByteStream, ObjectDescriptor};
    use crate::source::compression::{CompressionFormat, gzip};
    use crate::storage::StorageProvider;
    use bytes::Bytes;
    use chrono::TimeZone;
    use futures::stream::{self, StreamExt};
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::{ObjectStore, PutPayload};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn source_config(temp: &Path) -> SourceConfig {
        SourceConfig {
            bucket: "memory".to_string(),
            region: None,
            endpoint: None,
            storage_options: HashMap::new(),
            download_directory: temp.join("downloads"),
            timestamp_directory: temp.join("timestamps"),
            tag: "s3.test".to_string(),
            interval: 60,
            delete_local_files: true,
            compression: CompressionFormat::Gzip,
            max_concurrent_downloads: 2,
            max_listed_objects: None,
            skip_older_than_checkpoint: false,
        }
    }

    async fn put(store: &InMemory, key: &str, body: &str) {
        store
            .put(&ObjectPath::from(key), PutPayload::from(gzip(body.as_bytes())))
            .await
            .unwrap();
    }

    async fn build(
        temp: &Path,
        store: Arc<InMemory>,
        router: Arc<dyn EventRouter>,
    ) -> S3Source {
        let catalog = Arc::new(StorageProvider::from_object_store(store, "memory://test"));
        S3Source::from_config("test", &source_config(temp), catalog, router)
            .await
            .unwrap()
    }

    struct FailingCatalog;

    #[async_trait]
    impl Catalog for FailingCatalog {
        async fn list(&self, _limit: Option<usize>) -> Result<Listing, StorageError> {
            Err(StorageError::InvalidUrl {
                url: "unreachable".to_string(),
            })
        }

        async fn fetch(&self, _key: &str) -> Result<ByteStream, StorageError> {
            unreachable!("nothing is listed")
        }
    }

    /// Catalog over fixed descriptors that counts fetches.
    #[derive(Default)]
    struct ScriptedCatalog {
        objects: std::sync::Mutex<Vec<(ObjectDescriptor, Bytes)>>,
        fetches: AtomicUsize,
    }

    impl ScriptedCatalog {
        fn put(&self, key: &str, body: &str, last_modified: DateTime<Utc>) {
            let data = Bytes::from(gzip(body.as_bytes()));
            let descriptor = ObjectDescriptor {
                key: key.to_string(),
                size: data.len() as u64,
                last_modified,
            };
            self.objects.lock().unwrap().push((descriptor, data));
        }

        fn remove(&self, key: &str) {
            self.objects.lock().unwrap().retain(|(d, _)| d.key != key);
        }
    }

    #[async_trait]
    impl Catalog for ScriptedCatalog {
        async fn list(&self, _limit: Option<usize>) -> Result<Listing, StorageError> {
            let objects = self.objects.lock().unwrap();
            Ok(Listing {
                objects: objects.iter().map(|(d, _)| d.clone()).collect(),
                truncated: false,
            })
        }

        async fn fetch(&self, key: &str) -> Result<ByteStream, StorageError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let data = self
                .objects
                .lock()
                .unwrap()
                .iter()
                .find(|(d, _)| d.key == key)
                .map(|(_, data)| data.clone())
                .unwrap();
            Ok(stream::iter(vec![Ok(data)]).boxed())
        }
    }

    fn local_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_cycles_track_newest_object_and_mirror_deletions() {
        let temp = TempDir::new().unwrap();
        let older = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();

        let catalog = Arc::new(ScriptedCatalog::default());
        catalog.put("a.json.gz", "{\"a\":1}\n", newer);
        catalog.put("b.json.gz", "{\"b\":2}\n", older);

        let (router, mut rx) = ChannelRouter::new(8);
        let source = S3Source::from_config(
            "test",
            &source_config(temp.path()),
            catalog.clone(),
            Arc::new(router),
        )
        .await
        .unwrap();
        let shutdown = CancellationToken::new();
        let downloads = temp.path().join("downloads");
        let store = CheckpointStore::new(temp.path().join("timestamps"));

        // Cycle 1: both objects are fetched and emitted
        let first = source.poll(&shutdown).await.unwrap();
        assert_eq!(first.downloaded, 2);
        assert_eq!(first.emitted, 2);
        assert_eq!(first.checkpoint, newer);
        assert_eq!(store.load().await.unwrap(), newer);
        assert_eq!(local_files(&downloads), vec!["a.json.gz", "b.json.gz"]);
        assert_eq!(catalog.fetches.load(Ordering::SeqCst), 2);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        // Cycle 2: same listing, nothing fetched
        let second = source.poll(&shutdown).await.unwrap();
        assert_eq!(second.downloaded, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.checkpoint, newer);
        assert_eq!(catalog.fetches.load(Ordering::SeqCst), 2);

        // Cycle 3: b disappears from the bucket and from the local mirror
        catalog.remove("b.json.gz");
        let third = source.poll(&shutdown).await.unwrap();
        assert_eq!(third.deleted, 1);
        assert_eq!(third.emitted, 0);
        assert!(!third.checkpoint_advanced);
        assert_eq!(third.checkpoint, newer);
        assert_eq!(store.load().await.unwrap(), newer);
        assert_eq!(local_files(&downloads), vec!["a.json.gz"]);
        assert_eq!(catalog.fetches.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poll_emits_new_objects_and_advances_checkpoint() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        put(&store, "a.json.gz", "{\"a\":1}\n").await;
        put(&store, "nested/b.json.gz", "{\"b\":2}\n").await;

        let (router, mut rx) = ChannelRouter::new(8);
        let source = build(temp.path(), store, Arc::new(router)).await;
        let shutdown = CancellationToken::new();

        let report = source.poll(&shutdown).await.unwrap();
        assert_eq!(report.listed, 2);
        assert_eq!(report.emitted, 2);
        assert!(report.checkpoint_advanced);
        assert!(report.checkpoint > DateTime::UNIX_EPOCH);

        let mut payloads = vec![
            rx.recv().await.unwrap().payload,
            rx.recv().await.unwrap().payload,
        ];
        payloads.sort();
        assert_eq!(payloads, vec!["{\"a\":1}\n", "{\"b\":2}\n"]);

        let persisted = CheckpointStore::new(temp.path().join("timestamps"))
            .load()
            .await
            .unwrap();
        assert_eq!(persisted, report.checkpoint);
    }

    #[tokio::test]
    async fn test_second_poll_skips_downloaded_objects() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        put(&store, "a.json.gz", "{\"a\":1}\n").await;

        let (router, mut rx) = ChannelRouter::new(8);
        let source = build(temp.path(), store, Arc::new(router)).await;
        let shutdown = CancellationToken::new();

        let first = source.poll(&shutdown).await.unwrap();
        let second = source.poll(&shutdown).await.unwrap();

        assert_eq!(first.emitted, 1);
        assert_eq!(second.emitted, 0);
        assert_eq!(second.skipped, 1);
        assert!(!second.checkpoint_advanced);
        assert_eq!(second.checkpoint, first.checkpoint);

        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deleted_objects_are_removed_locally() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        put(&store, "keep.json.gz", "{}\n").await;
        put(&store, "old/gone.json.gz", "{}\n").await;

        let (router, _rx) = ChannelRouter::new(8);
        let source = build(temp.path(), store.clone(), Arc::new(router)).await;
        let shutdown = CancellationToken::new();

        source.poll(&shutdown).await.unwrap();
        let downloads = temp.path().join("downloads");
        assert!(downloads.join("old/gone.json.gz").exists());

        store.delete(&ObjectPath::from("old/gone.json.gz")).await.unwrap();
        let report = source.poll(&shutdown).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(downloads.join("keep.json.gz").exists());
        assert!(!downloads.join("old").exists());
    }

    #[tokio::test]
    async fn test_processor_runs_on_spawned_task() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        put(&store, "a.json.gz", "{}\n").await;

        let (router, mut rx) = ChannelRouter::new(8);
        let source = Arc::new(build(temp.path(), store, Arc::new(router)).await);
        let mut processor = SourceProcessor::new(source.clone(), CancellationToken::new());

        let result = tokio::spawn(async move {
            let cycle = processor.prepare(true).await.unwrap().unwrap();
            processor.process(cycle).await
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result, IterationResult::ProcessedItems);
        assert!(rx.recv().await.is_some());

        let polled = tokio::spawn(async move { source.poll(&CancellationToken::new()).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(polled.skipped, 1);
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        put(&store, "a.json.gz", "{}\n").await;

        let (router, _rx) = ChannelRouter::new(8);
        let source = build(temp.path(), store, Arc::new(router)).await;
        let shutdown = CancellationToken::new();

        let held = source.begin_cycle().await.unwrap();
        let err = source.poll(&shutdown).await.unwrap_err();
        assert!(matches!(err, SourceError::CycleInProgress));
        assert!(!temp.path().join("downloads/a.json.gz").exists());

        // Releasing the first cycle lets the next one run
        source.finish_cycle(held, &shutdown).await.unwrap();
        source.poll(&shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_cycle() {
        let temp = TempDir::new().unwrap();
        let (router, _rx) = ChannelRouter::new(1);
        let source = S3Source::from_config(
            "test",
            &source_config(temp.path()),
            Arc::new(FailingCatalog),
            Arc::new(router),
        )
        .await
        .unwrap();

        let err = source.poll(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SourceError::Listing { .. }));
        assert!(
            !temp
                .path()
                .join("timestamps/last_modified_timestamp.txt")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_failed_emit_keeps_checkpoint() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        put(&store, "a.json.gz", "{}\n").await;

        let (router, rx) = ChannelRouter::new(1);
        drop(rx);
        let source = build(temp.path(), store, Arc::new(router)).await;

        let report = source.poll(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.emitted, 0);
        assert!(!report.checkpoint_advanced);
        assert_eq!(report.checkpoint, DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_checkpoint_survives_restart() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        put(&store, "a.json.gz", "{}\n").await;

        let (router, _rx) = ChannelRouter::new(8);
        let source = build(temp.path(), store.clone(), Arc::new(router)).await;
        let report = source.poll(&CancellationToken::new()).await.unwrap();
        drop(source);

        let (router, _rx) = ChannelRouter::new(8);
        let restarted = build(temp.path(), store, Arc::new(router)).await;
        assert_eq!(restarted.checkpoint().await, report.checkpoint);
    }
}
