//! Object storage abstraction.
//!
//! Wraps an `object_store` backend (S3 or local filesystem, plus any
//! caller-provided store) behind a provider that knows the configured key
//! prefix and hands out prefix-relative keys.

mod local;
mod s3;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

pub use local::LocalConfig;
pub use s3::S3Config;

/// Storage provider over a single bucket or directory.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) object_store: Arc<dyn ObjectStore>,
    /// Key prefix inside the bucket; listed keys are reported relative to it.
    pub(crate) prefix: Option<Path>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for supported storage backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_BUCKET_NAME: &str = r"^(?P<bucket>[a-z0-9][a-z0-9\-\.]{1,61}[a-z0-9])$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

static S3_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [S3_PATH, S3_VIRTUAL, S3_URL, S3_BUCKET_NAME]
        .into_iter()
        .map(|pattern| Regex::new(pattern).expect("valid S3 URL regex"))
        .collect()
});

static LOCAL_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [FILE_URI, FILE_PATH]
        .into_iter()
        .map(|pattern| Regex::new(pattern).expect("valid file URL regex"))
        .collect()
});

/// Backend configuration parsed from a bucket location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a bucket location into a backend configuration.
    ///
    /// Accepts a bare S3 bucket name, `s3://bucket[/prefix]`, the two HTTPS
    /// S3 URL styles, `file:///dir` and absolute local paths.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if let Some(captures) = S3_MATCHERS.iter().find_map(|r| r.captures(url)) {
            return Ok(Self::parse_s3(&captures));
        }
        if let Some(captures) = LOCAL_MATCHERS.iter().find_map(|r| r.captures(url)) {
            return Ok(Self::parse_local(&captures));
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(captures: &regex::Captures) -> Self {
        BackendConfig::S3(S3Config {
            bucket: captures["bucket"].to_string(),
            region: captures.name("region").map(|m| m.as_str().to_string()),
            endpoint: None,
            key: captures.name("key").map(|m| Path::from(m.as_str())),
        })
    }

    fn parse_local(captures: &regex::Captures) -> Self {
        let path = &captures["path"];
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        BackendConfig::Local(LocalConfig { path })
    }
}

impl StorageProvider {
    /// Create a storage provider for a bucket location.
    ///
    /// `region` and `endpoint` override whatever the location or the AWS
    /// environment specify; they are ignored for local paths.
    pub async fn for_bucket(
        bucket: &str,
        region: Option<&str>,
        endpoint: Option<&str>,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(bucket)? {
            BackendConfig::S3(mut config) => {
                if let Some(region) = region {
                    config.region = Some(region.to_string());
                }
                config.endpoint = endpoint.map(str::to_string);
                Self::construct_s3(config, options)
            }
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Wrap an already constructed object store.
    pub fn from_object_store(
        object_store: Arc<dyn ObjectStore>,
        canonical_url: impl Into<String>,
    ) -> Self {
        Self {
            object_store,
            prefix: None,
            canonical_url: canonical_url.into(),
        }
    }

    /// The URL this provider was built for.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// List every object under the configured prefix.
    ///
    /// The stream follows all result pages. Each item's `location` is relative
    /// to the configured prefix.
    pub fn list_objects(&self) -> impl Stream<Item = Result<ObjectMeta, StorageError>> + '_ {
        let prefix_part_count = self
            .prefix
            .as_ref()
            .map(|prefix| prefix.parts().count())
            .unwrap_or_default();

        self.object_store
            .list(self.prefix.as_ref())
            .map(move |result| {
                result
                    .map(|meta| ObjectMeta {
                        location: meta.location.parts().skip(prefix_part_count).collect(),
                        ..meta
                    })
                    .context(ObjectStoreSnafu)
            })
    }

    /// Open a byte stream for the object at `key` (relative to the prefix).
    pub async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, StorageError> {
        let path = Path::parse(key)
            .map_err(object_store::Error::from)
            .context(ObjectStoreSnafu)?;
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: if result.is_ok() {
                RequestStatus::Success
            } else {
                RequestStatus::Error
            },
            duration: start.elapsed(),
        });

        let stream = result
            .context(ObjectStoreSnafu)?
            .into_stream()
            .map(|chunk| chunk.context(ObjectStoreSnafu))
            .boxed();
        Ok(stream)
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match &self.prefix {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use object_store::PutPayload;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://my-bucket/logs/app").unwrap();
        assert_eq!(
            config,
            BackendConfig::S3(S3Config {
                bucket: "my-bucket".to_string(),
                region: None,
                endpoint: None,
                key: Some(Path::from("logs/app")),
            })
        );

        let config =
            BackendConfig::parse_url("https://s3.eu-west-1.amazonaws.com/my-bucket").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "my-bucket");
                assert_eq!(s3.region.as_deref(), Some("eu-west-1"));
                assert!(s3.key.is_none());
            }
            other => panic!("expected S3 config, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_bucket_name_is_s3() {
        let config = BackendConfig::parse_url("my-log-bucket").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "my-log-bucket");
                assert!(s3.key.is_none());
            }
            other => panic!("expected S3 config, got {other:?}"),
        }
    }

    #[test]
    fn test_local_url_parsing() {
        assert_eq!(
            BackendConfig::parse_url("file:///tmp/bucket").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/tmp/bucket".to_string()
            })
        );
        assert_eq!(
            BackendConfig::parse_url("/srv/mirror").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/srv/mirror".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_url() {
        let err = BackendConfig::parse_url("Not A Bucket").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_list_returns_relative_paths() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("logs/2024")).unwrap();
        std::fs::write(temp_dir.path().join("logs/2024/a.json.gz"), b"a").unwrap();
        std::fs::write(temp_dir.path().join("logs/b.json.gz"), b"bb").unwrap();

        let storage = StorageProvider::for_bucket(
            temp_dir.path().join("logs").to_str().unwrap(),
            None,
            None,
            HashMap::new(),
        )
        .await
        .unwrap();

        let mut keys: Vec<(String, u64)> = storage
            .list_objects()
            .map_ok(|meta| (meta.location.to_string(), meta.size))
            .try_collect()
            .await
            .unwrap();
        keys.sort();

        assert_eq!(
            keys,
            vec![
                ("2024/a.json.gz".to_string(), 1),
                ("b.json.gz".to_string(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn test_get_stream_reads_object() {
        let store = Arc::new(InMemory::new());
        store
            .put(&Path::from("dir/file.txt"), PutPayload::from_static(b"hello"))
            .await
            .unwrap();
        let storage = StorageProvider::from_object_store(store, "memory://test");

        let chunks: Vec<Bytes> = storage
            .get_stream("dir/file.txt")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"hello");

        let err = match storage.get_stream("dir/missing.txt").await {
            Ok(_) => panic!("missing object should not open"),
            Err(e) => e,
        };
        assert!(err.is_not_found());
    }
}
