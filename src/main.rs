//! floe: poll buckets for NDJSON log objects and deliver them over HTTP.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use floe::Config;
use floe::pipeline::run_pipelines;
use floe::signal::spawn_shutdown_handler;

/// Bucket to HTTP log shipper.
#[derive(Parser, Debug)]
#[command(name = "floe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without polling.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // RUST_LOG takes precedence over --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("floe starting");

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if args.dry_run {
        print_pipelines(&config);
        info!("Configuration is valid");
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let shutdown = CancellationToken::new();
        spawn_shutdown_handler(shutdown.clone());
        run_pipelines(config, shutdown).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, class = ?e.classify(), "floe failed");
            ExitCode::FAILURE
        }
    }
}

fn print_pipelines(config: &Config) {
    info!("Dry run mode - {} pipeline(s) configured", config.pipelines.len());
    for (key, pipeline) in &config.pipelines {
        let source = &pipeline.source;
        info!(
            target = %key,
            bucket = %source.bucket,
            tag = %source.tag,
            interval_secs = source.interval,
            download_directory = %source.download_directory.display(),
            timestamp_directory = %source.timestamp_directory.display(),
            endpoint_url = %pipeline.sink.endpoint_url,
            "Pipeline"
        );
    }
}
