//! Internal events for floe metrics emission.
//!
//! Each event struct represents a measurable occurrence in a pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.
//!
//! ## Target Labels
//!
//! Every pipeline-scoped metric carries a `target` label holding the pipeline
//! key (e.g., `"app-logs"`), so several pipelines can share one exporter.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Source events
// ============================================================================

/// Event emitted when a bucket listing completes.
pub struct ObjectsListed {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for ObjectsListed {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Objects listed");
        counter!("floe_objects_listed_total", "target" => self.target).increment(self.count);
    }
}

/// Outcome of handling a single listed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    Downloaded,
    Skipped,
    Failed,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Downloaded => "downloaded",
            ObjectStatus::Skipped => "skipped",
            ObjectStatus::Failed => "failed",
        }
    }
}

/// Event emitted when a listed object has been handled.
pub struct ObjectProcessed {
    pub status: ObjectStatus,
    pub target: String,
}

impl InternalEvent for ObjectProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), target = %self.target, "Object processed");
        counter!(
            "floe_objects_processed_total",
            "status" => self.status.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// Stage at which an object failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Key,
    Download,
    Decompress,
    Emit,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Key => "key",
            FailureStage::Download => "download",
            FailureStage::Decompress => "decompress",
            FailureStage::Emit => "emit",
        }
    }
}

/// Event emitted when an object fails processing.
pub struct ObjectFailed {
    pub stage: FailureStage,
    pub target: String,
}

impl InternalEvent for ObjectFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), target = %self.target, "Object failed");
        counter!(
            "floe_object_failures_total",
            "stage" => self.stage.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// Event emitted when compressed bytes land on local disk.
pub struct BytesDownloaded {
    pub bytes: u64,
    pub target: String,
}

impl InternalEvent for BytesDownloaded {
    fn emit(self) {
        trace!(bytes = self.bytes, target = %self.target, "Bytes downloaded");
        counter!("floe_bytes_downloaded_total", "target" => self.target).increment(self.bytes);
    }
}

/// Event emitted when an object download completes.
pub struct DownloadCompleted {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for DownloadCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            target = %self.target,
            "Download completed"
        );
        histogram!("floe_download_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when the reconciler removes stale local files.
pub struct LocalFilesDeleted {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for LocalFilesDeleted {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Local files deleted");
        counter!("floe_local_files_deleted_total", "target" => self.target).increment(self.count);
    }
}

/// Event emitted when a checkpoint is successfully saved.
pub struct CheckpointSaved {
    /// Checkpoint value as Unix seconds.
    pub timestamp: f64,
    pub target: String,
}

impl InternalEvent for CheckpointSaved {
    fn emit(self) {
        trace!(timestamp = self.timestamp, target = %self.target, "Checkpoint saved");
        counter!("floe_checkpoints_saved_total", "target" => self.target.clone()).increment(1);
        gauge!("floe_checkpoint_timestamp_seconds", "target" => self.target).set(self.timestamp);
    }
}

/// Event emitted when the source hands an event to the sink stage.
pub struct EventEmitted {
    pub bytes: u64,
    pub target: String,
}

impl InternalEvent for EventEmitted {
    fn emit(self) {
        trace!(bytes = self.bytes, target = %self.target, "Event emitted");
        counter!("floe_events_emitted_total", "target" => self.target).increment(1);
    }
}

// ============================================================================
// Sink events
// ============================================================================

/// Event emitted when NDJSON lines fail to parse and are dropped.
pub struct JsonLinesDropped {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for JsonLinesDropped {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "JSON lines dropped");
        counter!("floe_json_lines_dropped_total", "target" => self.target).increment(self.count);
    }
}

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Success,
    Rejected,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Success => "success",
            DeliveryStatus::Rejected => "rejected",
            DeliveryStatus::Error => "error",
        }
    }
}

/// Event emitted when a batch POST completes, successfully or not.
pub struct DeliveryCompleted {
    pub status: DeliveryStatus,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for DeliveryCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            target = %self.target,
            "Delivery completed"
        );
        counter!(
            "floe_deliveries_total",
            "status" => self.status.as_str(),
            "target" => self.target.clone()
        )
        .increment(1);
        histogram!("floe_delivery_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when the number of in-flight deliveries changes.
pub struct ActiveDeliveries {
    pub count: usize,
    pub target: String,
}

impl InternalEvent for ActiveDeliveries {
    fn emit(self) {
        trace!(count = self.count, target = %self.target, "Active deliveries");
        gauge!("floe_active_deliveries", "target" => self.target).set(self.count as f64);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    List,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::List => "list",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
///
/// Note: This is a storage-level metric without a target label since the
/// provider does not know which pipeline it serves.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "floe_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "floe_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Polling loop events
// ============================================================================

/// Result type for iteration metrics.
#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    NoItems,
    Error,
}

impl IterationResultType {
    fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
            IterationResultType::Error => "error",
        }
    }
}

/// Event emitted when a polling iteration completes.
pub struct IterationCompleted {
    pub result: IterationResultType,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        trace!(
            result = self.result.as_str(),
            duration_ms = self.duration.as_millis(),
            target = %self.target,
            "Iteration completed"
        );
        counter!(
            "floe_iterations_total",
            "result" => self.result.as_str(),
            "target" => self.target.clone()
        )
        .increment(1);
        histogram!("floe_iteration_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}
