//! Events flowing from the source stage to the sink stage.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::EmitError;

/// Decompressed content of one downloaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub tag: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: Bytes,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(tag: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: tag.into(),
            emitted_at: Utc::now(),
            payload: payload.into(),
        }
    }
}

/// Destination for events emitted by a source.
#[async_trait]
pub trait EventRouter: Send + Sync {
    /// Hand `event` downstream. `Ok` means the event was accepted.
    async fn emit(&self, event: Event) -> Result<(), EmitError>;
}

/// Router backed by a bounded channel; a full channel applies back-pressure.
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    tx: mpsc::Sender<Event>,
}

impl ChannelRouter {
    /// Create a router and the receiver the sink stage reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventRouter for ChannelRouter {
    async fn emit(&self, event: Event) -> Result<(), EmitError> {
        self.tx.send(event).await.map_err(|_| EmitError::Closed)
    }
}
