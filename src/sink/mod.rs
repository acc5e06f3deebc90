//! HTTP sink.
//!
//! Consumes events from the source's channel, turns each into one JSON
//! batch and POSTs it. Delivery is at-most-once: failures are logged and
//! counted, never retried.

pub mod batch;
pub mod http;

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::emit;
use crate::error::DeliveryError;
use crate::event::Event;
use crate::metrics::events::{ActiveDeliveries, DeliveryCompleted, DeliveryStatus, JsonLinesDropped};

use batch::{BatchFormat, format_batch};
use http::HttpDelivery;

/// Future type for in-flight deliveries.
type DeliveryFuture = Pin<Box<dyn Future<Output = DeliveryOutcome> + Send>>;

/// Result of delivering one event.
struct DeliveryOutcome {
    tag: String,
    events: usize,
    duration: Duration,
    result: Result<u16, DeliveryError>,
}

/// Counts reported when the runner exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub delivered: usize,
    pub failed: usize,
    pub lines_dropped: usize,
}

/// Pulls events off the channel and delivers them with bounded concurrency.
pub struct SinkRunner {
    delivery: HttpDelivery,
    format: BatchFormat,
    max_concurrent: usize,
    /// Pipeline key, used for log and metric labels.
    target: String,
}

impl SinkRunner {
    pub fn new(delivery: HttpDelivery, format: BatchFormat, max_concurrent: usize, target: String) -> Self {
        Self {
            delivery,
            format,
            max_concurrent: max_concurrent.max(1),
            target,
        }
    }

    /// Build a runner from configuration.
    pub fn from_config(config: &SinkConfig, target: impl Into<String>) -> Result<Self, DeliveryError> {
        let delivery = HttpDelivery::new(
            config.endpoint_url.clone(),
            Duration::from_secs(config.timeout_secs),
            &config.headers,
        )?;
        Ok(Self::new(
            delivery,
            config.format,
            config.max_concurrent_deliveries,
            target.into(),
        ))
    }

    /// Deliver events until the channel closes and all deliveries finish.
    ///
    /// Shutdown is driven by the sender side: once the source stops and drops
    /// its router, queued events are drained before this returns.
    pub async fn run(self, mut rx: mpsc::Receiver<Event>) -> SinkStats {
        let mut deliveries: FuturesUnordered<DeliveryFuture> = FuturesUnordered::new();
        let mut stats = SinkStats::default();
        let mut channel_open = true;

        info!(target = %self.target, endpoint = %self.delivery.endpoint_url(), "Sink started");

        loop {
            if !channel_open && deliveries.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some(outcome) = deliveries.next(), if !deliveries.is_empty() => {
                    emit!(ActiveDeliveries {
                        count: deliveries.len(),
                        target: self.target.clone(),
                    });
                    self.record(outcome, &mut stats);
                }

                received = rx.recv(), if channel_open && deliveries.len() < self.max_concurrent => {
                    match received {
                        Some(event) => {
                            deliveries.push(self.start_delivery(event, &mut stats));
                            emit!(ActiveDeliveries {
                                count: deliveries.len(),
                                target: self.target.clone(),
                            });
                        }
                        None => {
                            debug!(target = %self.target, "Event channel closed, draining deliveries");
                            channel_open = false;
                        }
                    }
                }
            }
        }

        info!(
            target = %self.target,
            delivered = stats.delivered,
            failed = stats.failed,
            lines_dropped = stats.lines_dropped,
            "Sink stopped"
        );

        stats
    }

    fn start_delivery(&self, event: Event, stats: &mut SinkStats) -> DeliveryFuture {
        let formatted = format_batch(&event.payload, self.format, &self.target);
        if formatted.dropped > 0 {
            stats.lines_dropped += formatted.dropped;
            emit!(JsonLinesDropped {
                count: formatted.dropped as u64,
                target: self.target.clone(),
            });
        }

        let delivery = self.delivery.clone();
        Box::pin(async move {
            let start = Instant::now();
            let result = delivery.deliver(&formatted.batch).await;
            DeliveryOutcome {
                tag: event.tag,
                events: formatted.batch.events.len(),
                duration: start.elapsed(),
                result,
            }
        })
    }

    fn record(&self, outcome: DeliveryOutcome, stats: &mut SinkStats) {
        let status = match &outcome.result {
            Ok(code) => {
                stats.delivered += 1;
                debug!(
                    target = %self.target,
                    tag = %outcome.tag,
                    events = outcome.events,
                    status = code,
                    "Delivered batch"
                );
                DeliveryStatus::Success
            }
            Err(e) => {
                stats.failed += 1;
                warn!(
                    target = %self.target,
                    tag = %outcome.tag,
                    events = outcome.events,
                    error = %e,
                    "Batch delivery failed, dropping"
                );
                match e {
                    DeliveryError::Status { .. } => DeliveryStatus::Rejected,
                    _ => DeliveryStatus::Error,
                }
            }
        };

        emit!(DeliveryCompleted {
            status,
            duration: outcome.duration,
            target: self.target.clone(),
        });
    }
}
