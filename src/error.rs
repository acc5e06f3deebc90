//! Error types for floe using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase. Every error can be classified with
//! [`ErrorClass`] so callers know whether to skip an object, abort the
//! current poll cycle, or stop the process.

use snafu::prelude::*;
use std::path::PathBuf;

/// How far an error is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Log it, skip the offending unit (object, line, event) and continue.
    Recoverable,
    /// Abort the current poll cycle; the scheduler retries at the next interval.
    CycleFatal,
    /// Abort initialization; the process exits.
    StartupFatal,
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No pipelines are configured.
    #[snafu(display("Configuration must define at least one pipeline"))]
    NoPipelines,

    /// Bucket is empty for a specific pipeline.
    #[snafu(display("Pipeline '{pipeline}' has empty source bucket"))]
    EmptyBucket { pipeline: String },

    /// Tag is empty for a specific pipeline.
    #[snafu(display("Pipeline '{pipeline}' has empty source tag"))]
    EmptyTag { pipeline: String },

    /// Endpoint URL is empty for a specific pipeline.
    #[snafu(display("Pipeline '{pipeline}' has empty sink endpoint_url"))]
    EmptyEndpointUrl { pipeline: String },

    /// A numeric option that must be positive is zero.
    #[snafu(display("Pipeline '{pipeline}' has invalid {field}: must be greater than zero"))]
    ZeroValue {
        pipeline: String,
        field: &'static str,
    },

    /// Resource conflict detected (e.g., two pipelines sharing a download directory).
    #[snafu(display("Resource conflict: {message}"))]
    ResourceConflict { message: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Checkpoint Errors ============

/// Errors that can occur while persisting or restoring the checkpoint.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Failed to read the checkpoint file.
    #[snafu(display("Failed to read checkpoint {}: {source}", path.display()))]
    CheckpointRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write the checkpoint file.
    #[snafu(display("Failed to write checkpoint {}: {source}", path.display()))]
    CheckpointWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============ Decompression Errors ============

/// Errors that can occur while decompressing a downloaded file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecompressionError {
    /// The codec rejected the input stream.
    #[snafu(display("{codec} decompression failed: {source}"))]
    Codec {
        codec: &'static str,
        source: std::io::Error,
    },

    /// The blocking decompression task did not complete.
    #[snafu(display("Decompression task failed: {source}"))]
    DecompressionTask { source: tokio::task::JoinError },
}

// ============ Emit Errors ============

/// Errors returned by an event router.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EmitError {
    /// The downstream stage is no longer accepting events.
    #[snafu(display("Event router is closed"))]
    Closed,
}

// ============ Source Errors ============

/// Errors raised by the source stage.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// Listing the bucket failed.
    #[snafu(display("Failed to list objects: {source}"))]
    Listing { source: StorageError },

    /// Fetching an object failed.
    #[snafu(display("Failed to fetch {key}: {source}"))]
    Fetch { key: String, source: StorageError },

    /// The object key cannot be mapped to a path inside the download directory.
    #[snafu(display("Invalid object key {key:?}: {reason}"))]
    InvalidKey { key: String, reason: &'static str },

    /// Local filesystem operation failed while handling an object.
    #[snafu(display("Filesystem error on {}: {source}", path.display()))]
    FileSystem {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The downloaded file could not be decompressed.
    #[snafu(display("Failed to decode {key}: {source}"))]
    Decode {
        key: String,
        source: DecompressionError,
    },

    /// The decoded content could not be handed to the sink stage.
    #[snafu(display("Failed to emit {key}: {source}"))]
    Emit { key: String, source: EmitError },

    /// Persisting the checkpoint failed.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint { source: CheckpointError },

    /// Another poll cycle is still running for this source.
    #[snafu(display("A poll cycle is already in progress"))]
    CycleInProgress,
}

impl SourceError {
    /// Classify the error according to how far it may propagate.
    pub fn classify(&self) -> ErrorClass {
        match self {
            SourceError::Fetch { .. }
            | SourceError::InvalidKey { .. }
            | SourceError::FileSystem { .. }
            | SourceError::Decode { .. }
            | SourceError::Emit { .. } => ErrorClass::Recoverable,
            SourceError::Listing { .. }
            | SourceError::Checkpoint { .. }
            | SourceError::CycleInProgress => ErrorClass::CycleFatal,
        }
    }
}

// ============ Delivery Errors ============

/// Errors that can occur while delivering a batch over HTTP.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DeliveryError {
    /// Failed to build the HTTP client.
    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild { source: reqwest::Error },

    /// A configured header name or value is not valid HTTP.
    #[snafu(display("Invalid header {name:?}"))]
    InvalidHeader { name: String },

    /// Failed to serialize the batch envelope.
    #[snafu(display("Failed to serialize batch: {source}"))]
    Serialize { source: serde_json::Error },

    /// Connection, timeout or other transport failure.
    #[snafu(display("Transport error: {source}"))]
    Transport { source: reqwest::Error },

    /// The endpoint answered with a non-2xx status.
    #[snafu(display("Endpoint returned {status}: {body}"))]
    Status { status: u16, body: String },
}

impl DeliveryError {
    /// Classify the error according to how far it may propagate.
    pub fn classify(&self) -> ErrorClass {
        match self {
            DeliveryError::ClientBuild { .. } | DeliveryError::InvalidHeader { .. } => {
                ErrorClass::StartupFatal
            }
            _ => ErrorClass::Recoverable,
        }
    }
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// A required local directory could not be created.
    #[snafu(display("Failed to create directory {}: {source}", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Checkpoint could not be restored at startup.
    #[snafu(display("Checkpoint error: {source}"))]
    StartupCheckpoint { source: CheckpointError },

    /// The delivery client could not be constructed.
    #[snafu(display("Delivery error: {source}"))]
    Delivery { source: DeliveryError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },
}

impl PipelineError {
    /// Classify the error according to how far it may propagate.
    ///
    /// Everything that reaches the top level happened while assembling a
    /// pipeline, so it ends the process.
    pub fn classify(&self) -> ErrorClass {
        ErrorClass::StartupFatal
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}
