//! Incremental object download.
//!
//! Objects are mirrored under a local root directory at the path given by
//! their key. An object is considered already downloaded when a local file
//! of the same size exists.
//!
//! # Known Limitation
//!
//! The skip check compares sizes only. If an object is rewritten with new
//! content of exactly the same length, the stale local copy is kept and the
//! new content is never emitted.
//!
//! # Atomic Downloads
//!
//! Content is streamed into `.{name}.{uuid}.tmp` next to the destination,
//! synced, then renamed over the destination. A failed download removes its
//! temp file and leaves any previous copy untouched.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::{Catalog, ObjectDescriptor};
use super::compression::CompressionCodec;
use crate::emit;
use crate::error::{
    DecodeSnafu, DecompressionError, DecompressionTaskSnafu, EmitSnafu, FetchSnafu,
    FileSystemSnafu, SourceError,
};
use crate::event::{Event, EventRouter};
use crate::metrics::events::{
    BytesDownloaded, DownloadCompleted, EventEmitted, FailureStage, ObjectFailed,
    ObjectProcessed, ObjectStatus,
};

/// Map an object key to its path under `root`.
///
/// Rejects keys that could resolve outside `root` or that do not name a
/// regular file.
pub fn local_path(root: &Path, key: &str) -> Result<PathBuf, SourceError> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key.starts_with('/') {
        Some("absolute key")
    } else if key.ends_with('/') {
        Some("directory marker")
    } else if key.contains('\\') {
        Some("backslash in key")
    } else if key.contains('\0') {
        Some("NUL byte in key")
    } else {
        key.split('/').find_map(|segment| match segment {
            "" => Some("empty path segment"),
            "." => Some("current directory segment"),
            ".." => Some("parent directory segment"),
            _ => None,
        })
    };

    if let Some(reason) = reason {
        return Err(SourceError::InvalidKey {
            key: key.to_string(),
            reason,
        });
    }

    Ok(root.join(key))
}

/// Whether a regular file of `size` bytes already exists at `path`.
pub async fn is_downloaded(path: &Path, size: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() == size,
        Err(_) => false,
    }
}

/// What happened to one listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOutcome {
    /// Downloaded and emitted; contributes its `last_modified` to the checkpoint.
    Emitted { last_modified: DateTime<Utc> },
    Skipped,
    Failed { stage: FailureStage },
}

/// Aggregate outcome of downloading one listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Objects fetched and written to disk, whether or not emission succeeded.
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub emitted: usize,
    /// Newest `last_modified` among emitted objects.
    pub newest_emitted: Option<DateTime<Utc>>,
}

impl DownloadSummary {
    fn record(&mut self, outcome: ObjectOutcome) {
        match outcome {
            ObjectOutcome::Emitted { last_modified } => {
                self.downloaded += 1;
                self.emitted += 1;
                self.newest_emitted = self.newest_emitted.max(Some(last_modified));
            }
            ObjectOutcome::Skipped => self.skipped += 1,
            ObjectOutcome::Failed { stage } => {
                if matches!(stage, FailureStage::Decompress | FailureStage::Emit) {
                    self.downloaded += 1;
                }
                self.failed += 1;
            }
        }
    }
}

/// Downloads listed objects into a local directory and emits their content.
pub struct Downloader {
    catalog: Arc<dyn Catalog>,
    router: Arc<dyn EventRouter>,
    codec: Arc<dyn CompressionCodec>,
    root: PathBuf,
    tag: String,
    max_concurrent: usize,
    skip_older_than_checkpoint: bool,
    /// Pipeline key, used for log and metric labels.
    target: String,
}

impl Downloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        router: Arc<dyn EventRouter>,
        codec: Arc<dyn CompressionCodec>,
        root: PathBuf,
        tag: String,
        max_concurrent: usize,
        skip_older_than_checkpoint: bool,
        target: String,
    ) -> Self {
        Self {
            catalog,
            router,
            codec,
            root,
            tag,
            max_concurrent: max_concurrent.max(1),
            skip_older_than_checkpoint,
            target,
        }
    }

    /// Root directory objects are mirrored into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Download every object in `objects` that is not already present locally.
    ///
    /// Up to `max_concurrent` objects are in flight at once. Once `shutdown` is
    /// cancelled no new object is started; objects already in flight finish.
    pub async fn download_all(
        &self,
        objects: &[ObjectDescriptor],
        checkpoint: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> DownloadSummary {
        // Futures are lazy; `take_until` stops new ones from being polled
        let handles: Vec<_> = objects
            .iter()
            .map(|object| self.handle(object, checkpoint))
            .collect();
        let mut outcomes = std::pin::pin!(
            stream::iter(handles)
                .take_until(shutdown.cancelled())
                .buffer_unordered(self.max_concurrent)
        );

        let mut summary = DownloadSummary::default();
        while let Some(outcome) = outcomes.next().await {
            summary.record(outcome);
        }

        if shutdown.is_cancelled() {
            info!(target = %self.target, "Shutdown requested, stopped starting downloads");
        }

        summary
    }

    /// Handle one object, converting failures into a logged outcome.
    async fn handle(&self, object: &ObjectDescriptor, checkpoint: DateTime<Utc>) -> ObjectOutcome {
        let outcome = match self.try_handle(object, checkpoint).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let stage = failure_stage(&e);
                warn!(
                    target = %self.target,
                    key = %object.key,
                    stage = stage.as_str(),
                    error = %e,
                    "Skipping object"
                );
                emit!(ObjectFailed {
                    stage,
                    target: self.target.clone(),
                });
                ObjectOutcome::Failed { stage }
            }
        };

        let status = match outcome {
            ObjectOutcome::Emitted { .. } => ObjectStatus::Downloaded,
            ObjectOutcome::Skipped => ObjectStatus::Skipped,
            ObjectOutcome::Failed { .. } => ObjectStatus::Failed,
        };
        emit!(ObjectProcessed {
            status,
            target: self.target.clone(),
        });

        outcome
    }

    async fn try_handle(
        &self,
        object: &ObjectDescriptor,
        checkpoint: DateTime<Utc>,
    ) -> Result<ObjectOutcome, SourceError> {
        let path = local_path(&self.root, &object.key)?;

        if self.skip_older_than_checkpoint && object.last_modified <= checkpoint {
            debug!(target = %self.target, key = %object.key, "Skipping object not newer than checkpoint");
            return Ok(ObjectOutcome::Skipped);
        }

        if is_downloaded(&path, object.size).await {
            info!(target = %self.target, key = %object.key, "Skipping object (already downloaded)");
            return Ok(ObjectOutcome::Skipped);
        }

        info!(target = %self.target, key = %object.key, path = %path.display(), "Downloading object");
        let start = Instant::now();
        let bytes = self.download_to(&object.key, &path).await?;
        emit!(DownloadCompleted {
            duration: start.elapsed(),
            target: self.target.clone(),
        });
        emit!(BytesDownloaded {
            bytes,
            target: self.target.clone(),
        });

        let data = tokio::fs::read(&path)
            .await
            .context(FileSystemSnafu { path: &path })?;
        let content = decompress(self.codec.clone(), data)
            .await
            .context(DecodeSnafu { key: &object.key })?;

        let len = content.len() as u64;
        self.router
            .emit(Event::new(self.tag.clone(), content))
            .await
            .context(EmitSnafu { key: &object.key })?;

        emit!(EventEmitted {
            bytes: len,
            target: self.target.clone(),
        });
        info!(target = %self.target, key = %object.key, bytes = len, "Emitted object");

        Ok(ObjectOutcome::Emitted {
            last_modified: object.last_modified,
        })
    }

    /// Stream `key` into `dest` via a temp file and atomic rename.
    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64, SourceError> {
        let parent = dest.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent)
            .await
            .context(FileSystemSnafu { path: parent })?;

        let file_name = dest
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = match self.write_temp(key, &temp_path).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp_path, dest).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e).context(FileSystemSnafu { path: dest });
        }

        Ok(written)
    }

    async fn write_temp(&self, key: &str, temp_path: &Path) -> Result<u64, SourceError> {
        let mut chunks = self.catalog.fetch(key).await.context(FetchSnafu { key })?;
        let mut file = tokio::fs::File::create(temp_path)
            .await
            .context(FileSystemSnafu { path: temp_path })?;

        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.context(FetchSnafu { key })?;
            file.write_all(&chunk)
                .await
                .context(FileSystemSnafu { path: temp_path })?;
            written += chunk.len() as u64;
        }

        file.sync_all()
            .await
            .context(FileSystemSnafu { path: temp_path })?;

        Ok(written)
    }
}

/// Decompress on a blocking thread.
async fn decompress(
    codec: Arc<dyn CompressionCodec>,
    data: Vec<u8>,
) -> Result<Vec<u8>, DecompressionError> {
    tokio::task::spawn_blocking(move || codec.decompress(&data))
        .await
        .context(DecompressionTaskSnafu)?
}

fn failure_stage(error: &SourceError) -> FailureStage {
    match error {
        SourceError::InvalidKey { .. } => FailureStage::Key,
        SourceError::Decode { .. } => FailureStage::Decompress,
        SourceError::Emit { .. } => FailureStage::Emit,
        _ => FailureStage::Download,
    }
}
