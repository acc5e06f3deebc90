//! Configuration loading and validation.
//!
//! A configuration file declares any number of pipelines, each pairing one
//! bucket source with one HTTP sink:
//!
//! ```yaml
//! metrics:
//!   address: "0.0.0.0:9090"
//! pipelines:
//!   app-logs:
//!     source:
//!       bucket: my-bucket
//!       tag: s3.app
//!     sink:
//!       endpoint_url: http://collector:8080/ingest
//! ```
//!
//! Values may reference environment variables (`$VAR`, `${VAR:-default}`).

mod vars;

use indexmap::IndexMap;
use serde::Deserialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyBucketSnafu, EmptyEndpointUrlSnafu, EmptyTagSnafu, EnvInterpolationSnafu,
    NoPipelinesSnafu, ReadFileSnafu, ResourceConflictSnafu, YamlParseSnafu, ZeroValueSnafu,
};
use crate::sink::batch::BatchFormat;
use crate::source::compression::CompressionFormat;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Metrics configuration (optional, enabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Pipelines keyed by name, in file order.
    #[serde(default)]
    pub pipelines: IndexMap<String, PipelineConfig>,
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// One source-to-sink pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
}

/// Bucket polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Bucket to poll: a bare S3 bucket name, `s3://bucket[/prefix]`,
    /// `file:///dir` or an absolute local path.
    pub bucket: String,

    /// AWS region (defaults to the AWS environment).
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3-compatible endpoint, e.g. `http://localhost:9000`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Storage options (credentials, etc.) passed to the object store.
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Local mirror of the bucket (default: /tmp/floe/downloads).
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,

    /// Directory holding the checkpoint file (default: /tmp/floe/timestamps).
    #[serde(default = "default_timestamp_directory")]
    pub timestamp_directory: PathBuf,

    /// Tag attached to every emitted event.
    pub tag: String,

    /// Seconds between polls (default: 60).
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Delete local files whose object is gone from the bucket (default: true).
    #[serde(default = "default_delete_local_files")]
    pub delete_local_files: bool,

    /// Compression format of the objects.
    #[serde(default)]
    pub compression: CompressionFormat,

    /// Maximum objects downloaded concurrently (default: 4).
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Stop listing after this many objects; the listing is then treated as
    /// truncated and local cleanup is skipped.
    #[serde(default)]
    pub max_listed_objects: Option<usize>,

    /// Skip objects whose `last_modified` is not newer than the checkpoint.
    #[serde(default)]
    pub skip_older_than_checkpoint: bool,
}

fn default_download_directory() -> PathBuf {
    PathBuf::from("/tmp/floe/downloads")
}

fn default_timestamp_directory() -> PathBuf {
    PathBuf::from("/tmp/floe/timestamps")
}

fn default_interval() -> u64 {
    60
}

fn default_delete_local_files() -> bool {
    true
}

fn default_max_concurrent_downloads() -> usize {
    4
}

impl SourceConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// HTTP delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// URL every batch is POSTed to.
    pub endpoint_url: String,

    /// Request timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum concurrent POSTs (default: 4).
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// Events buffered between source and sink (default: 16).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How parsed lines are placed in the batch.
    #[serde(default)]
    pub format: BatchFormat,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_deliveries() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    16
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text, interpolating
    /// environment variables first.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = vars::interpolate(content).map_err(|errors| {
            EnvInterpolationSnafu {
                message: errors.join("\n"),
            }
            .build()
        })?;

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.pipelines.is_empty(), NoPipelinesSnafu);

        for (key, pipeline) in &self.pipelines {
            let source = &pipeline.source;
            let sink = &pipeline.sink;

            ensure!(
                !source.bucket.trim().is_empty(),
                EmptyBucketSnafu { pipeline: key }
            );
            ensure!(!source.tag.trim().is_empty(), EmptyTagSnafu { pipeline: key });
            ensure!(
                !sink.endpoint_url.trim().is_empty(),
                EmptyEndpointUrlSnafu { pipeline: key }
            );

            for (field, value) in [
                ("interval", source.interval as usize),
                ("max_concurrent_downloads", source.max_concurrent_downloads),
                ("timeout_secs", sink.timeout_secs as usize),
                ("max_concurrent_deliveries", sink.max_concurrent_deliveries),
                ("queue_capacity", sink.queue_capacity),
            ] {
                ensure!(value > 0, ZeroValueSnafu { pipeline: key, field });
            }
            if source.max_listed_objects == Some(0) {
                return ZeroValueSnafu {
                    pipeline: key,
                    field: "max_listed_objects",
                }
                .fail();
            }

            ensure!(
                !(source.delete_local_files
                    && source
                        .timestamp_directory
                        .starts_with(&source.download_directory)),
                ResourceConflictSnafu {
                    message: format!(
                        "pipeline '{key}' keeps its timestamp directory inside its download \
                         directory, where local cleanup would delete the checkpoint"
                    ),
                }
            );
        }

        self.check_shared_directories()
    }

    /// Reject pipelines that would share a download or timestamp directory,
    /// or keep one inside another pipeline's cleaned download directory.
    fn check_shared_directories(&self) -> Result<(), ConfigError> {
        let pipelines: Vec<_> = self.pipelines.iter().collect();

        for (i, (key, pipeline)) in pipelines.iter().enumerate() {
            for (other, other_pipeline) in &pipelines[i + 1..] {
                let dirs = source_directories(&pipeline.source);
                let other_dirs = source_directories(&other_pipeline.source);

                if let Some(dir) = dirs.into_iter().find(|dir| other_dirs.contains(dir)) {
                    return ResourceConflictSnafu {
                        message: format!(
                            "directory '{}' is used by both '{key}' and '{other}'",
                            dir.display()
                        ),
                    }
                    .fail();
                }

                for (owner, cleaned, nested_key, nested) in [
                    (key, &pipeline.source, other, &other_dirs),
                    (other, &other_pipeline.source, key, &dirs),
                ] {
                    if !cleaned.delete_local_files {
                        continue;
                    }
                    if let Some(dir) = nested
                        .iter()
                        .find(|dir| dir.starts_with(&cleaned.download_directory))
                    {
                        return ResourceConflictSnafu {
                            message: format!(
                                "directory '{}' of '{nested_key}' is inside the download \
                                 directory of '{owner}', where local cleanup would delete it",
                                dir.display()
                            ),
                        }
                        .fail();
                    }
                }
            }
        }

        Ok(())
    }
}

fn source_directories(source: &SourceConfig) -> [&Path; 2] {
    [
        source.download_directory.as_path(),
        source.timestamp_directory.as_path(),
    ]
}
