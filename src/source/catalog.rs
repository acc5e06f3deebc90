//! Bucket listing and object fetching.
//!
//! [`Catalog`] is the seam between the source and the object store. The
//! production implementation is [`StorageProvider`]; tests substitute their
//! own to control listings and count fetches.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::time::Instant;

use crate::emit;
use crate::error::StorageError;
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};
use crate::storage::StorageProvider;

/// Remote object metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// Key within the bucket (relative to any configured prefix).
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Result of listing a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub objects: Vec<ObjectDescriptor>,
    /// True when the listing stopped at the object limit, so more keys may exist.
    pub truncated: bool,
}

/// Stream of object content chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// A listable, fetchable collection of objects.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// List the objects, stopping after `limit` objects if set.
    ///
    /// An error on any page fails the whole listing.
    async fn list(&self, limit: Option<usize>) -> Result<Listing, StorageError>;

    /// Open a byte stream for the object at `key`.
    async fn fetch(&self, key: &str) -> Result<ByteStream, StorageError>;
}

#[async_trait]
impl Catalog for StorageProvider {
    async fn list(&self, limit: Option<usize>) -> Result<Listing, StorageError> {
        let start = Instant::now();
        let mut stream = self.list_objects();
        let mut listing = Listing::default();
        let mut outcome = Ok(());

        while let Some(item) = stream.next().await {
            let meta = match item {
                Ok(meta) => meta,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };

            if limit.is_some_and(|limit| listing.objects.len() >= limit) {
                listing.truncated = true;
                break;
            }

            listing.objects.push(ObjectDescriptor {
                key: meta.location.to_string(),
                size: meta.size,
                last_modified: meta.last_modified,
            });
        }

        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: if outcome.is_ok() {
                RequestStatus::Success
            } else {
                RequestStatus::Error
            },
            duration: start.elapsed(),
        });

        outcome.map(|()| listing)
    }

    async fn fetch(&self, key: &str) -> Result<ByteStream, StorageError> {
        self.get_stream(key).await
    }
}
