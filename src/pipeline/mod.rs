//! Pipeline assembly and orchestration.
//!
//! Each configured pipeline becomes a source polling loop feeding a sink
//! task through a bounded channel:
//!
//! ```text
//! S3Source --(ChannelRouter, mpsc)--> SinkRunner --POST--> endpoint
//! ```
//!
//! All pipelines share one cancellation token. On shutdown each source stops
//! polling and drops its router, which closes the channel and lets the sink
//! drain what is queued.

use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, PipelineConfig};
use crate::error::{
    AddressParseSnafu, DeliverySnafu, MetricsSnafu, PipelineError, StorageSnafu, TaskJoinSnafu,
};
use crate::event::{ChannelRouter, Event};
use crate::polling::run_polling_loop;
use crate::sink::{SinkRunner, SinkStats};
use crate::source::catalog::Catalog;
use crate::source::{S3Source, SourceProcessor};
use crate::storage::StorageProvider;

/// A fully constructed pipeline, ready to run.
pub struct Pipeline {
    key: String,
    source: Arc<S3Source>,
    sink: SinkRunner,
    events: mpsc::Receiver<Event>,
    poll_interval: Duration,
}

impl Pipeline {
    /// Build a pipeline against the bucket named in its configuration.
    pub async fn from_config(key: &str, config: &PipelineConfig) -> Result<Self, PipelineError> {
        let source = &config.source;
        let storage = StorageProvider::for_bucket(
            &source.bucket,
            source.region.as_deref(),
            source.endpoint.as_deref(),
            source.storage_options.clone(),
        )
        .await
        .context(StorageSnafu)?;

        info!(target = %key, bucket = %storage.canonical_url(), "Configured source bucket");
        Self::with_catalog(key, config, Arc::new(storage)).await
    }

    /// Build a pipeline reading from an existing catalog.
    pub async fn with_catalog(
        key: &str,
        config: &PipelineConfig,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Self, PipelineError> {
        let sink = SinkRunner::from_config(&config.sink, key).context(DeliverySnafu)?;
        let (router, events) = ChannelRouter::new(config.sink.queue_capacity);
        let source = S3Source::from_config(key, &config.source, catalog, Arc::new(router)).await?;

        Ok(Self {
            key: key.to_string(),
            source: Arc::new(source),
            sink,
            events,
            poll_interval: config.source.poll_interval(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Poll until `shutdown` is cancelled, then drain the sink.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SinkStats, PipelineError> {
        let Self {
            key,
            source,
            sink,
            events,
            poll_interval,
        } = self;

        let sink_handle = tokio::spawn(sink.run(events));

        let mut processor = SourceProcessor::new(source, shutdown.clone());
        run_polling_loop(&mut processor, poll_interval, shutdown, &key).await;

        // Dropping the source drops its router and closes the channel
        drop(processor);
        info!(target = %key, "Source stopped, waiting for sink to drain");

        sink_handle.await.context(TaskJoinSnafu)
    }
}

/// Build every configured pipeline and run them until `shutdown`.
///
/// Any failure while building a pipeline is returned before anything
/// starts polling. Once running, pipelines only stop on shutdown.
pub async fn run_pipelines(config: Config, shutdown: CancellationToken) -> Result<(), PipelineError> {
    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        crate::metrics::init(addr).context(MetricsSnafu)?;
        info!("Metrics endpoint listening on http://{}/metrics", config.metrics.address);
    }

    let mut pipelines = Vec::with_capacity(config.pipelines.len());
    for (key, pipeline_config) in &config.pipelines {
        pipelines.push(Pipeline::from_config(key, pipeline_config).await?);
    }

    run(pipelines, shutdown).await;
    Ok(())
}

/// Run already built pipelines to completion.
pub async fn run(pipelines: Vec<Pipeline>, shutdown: CancellationToken) {
    let mut handles: JoinSet<(String, Result<SinkStats, PipelineError>)> = JoinSet::new();

    for pipeline in pipelines {
        let shutdown = shutdown.clone();
        let key = pipeline.key().to_string();
        handles.spawn(async move { (key, pipeline.run(shutdown).await) });
    }

    info!("Spawned {} pipeline tasks", handles.len());

    while let Some(result) = handles.join_next().await {
        match result {
            Ok((key, Ok(stats))) => {
                info!(
                    target = %key,
                    delivered = stats.delivered,
                    failed = stats.failed,
                    "Pipeline completed"
                );
            }
            Ok((key, Err(e))) => {
                error!(target = %key, error = %e, "Pipeline failed");
            }
            Err(e) => {
                error!(error = %e, "Pipeline task panicked");
            }
        }
    }

    info!("All pipelines complete");
}
