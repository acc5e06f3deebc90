//! Generic polling loop trait and runner.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationResultType};

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Items were processed successfully.
    ProcessedItems,
    /// No items were available to process.
    NoItems,
}

/// Trait for implementing a polling-based processor.
#[async_trait]
pub trait PollingProcessor {
    /// The state type prepared for each iteration.
    type State: Send;
    /// The error type for this processor.
    type Error: std::error::Error + Send;

    /// Prepare state for a processing iteration.
    ///
    /// Returns `None` if there's no work to do.
    ///
    /// # Arguments
    /// * `cold_start` - True on the first iteration
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Process the prepared state.
    ///
    /// Called after `prepare` returns `Some(state)`. Not raced against
    /// shutdown: the processor is expected to observe the token itself and
    /// finish whatever it has started.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Run a polling loop with the given processor.
///
/// 1. Call `prepare()` (with `cold_start = true` on the first iteration)
/// 2. Call `process()` if there's work to do
/// 3. Wait for `poll_interval` or shutdown
/// 4. Repeat until shutdown
///
/// The first iteration starts immediately. An error from either step is
/// logged and ends only that iteration; the loop tries again after the
/// interval.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    shutdown: CancellationToken,
    name: &str,
) {
    let mut first_iteration = true;

    loop {
        let iteration_start = Instant::now();

        // Race preparation against shutdown signal
        let shutdown_clone = shutdown.clone();
        let prepared = tokio::select! {
            biased;

            _ = shutdown_clone.cancelled() => {
                info!(target = name, "Shutdown requested before poll");
                return;
            }

            result = async {
                let cold_start = first_iteration;
                first_iteration = false;
                processor.prepare(cold_start).await
            } => result,
        };

        let result = match prepared {
            Ok(Some(state)) => processor.process(state).await,
            Ok(None) => {
                debug!(target = name, "No items to process");
                Ok(IterationResult::NoItems)
            }
            Err(e) => Err(e),
        };

        let result_type = match result {
            Ok(IterationResult::ProcessedItems) => IterationResultType::Processed,
            Ok(IterationResult::NoItems) => IterationResultType::NoItems,
            Err(e) => {
                warn!(
                    target = name,
                    error = %e,
                    "Poll iteration failed, retrying in {}s",
                    poll_interval.as_secs()
                );
                IterationResultType::Error
            }
        };

        emit!(IterationCompleted {
            result: result_type,
            duration: iteration_start.elapsed(),
            target: name.to_string(),
        });
        debug!(
            target = name,
            "Iteration complete, waiting {}s before next poll",
            poll_interval.as_secs()
        );

        if shutdown
            .run_until_cancelled(tokio::time::sleep(poll_interval))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }
}
