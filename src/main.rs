//! CLI entry point for the GTFS-RT enrichment pipeline.
//!
//! Provides subcommands for running the streaming pipeline, replaying a
//! captured bus envelope through one pass, and sanity-checking the stop
//! reference table. All tuning comes from the environment (see
//! `Config::from_env`); the CLI only selects the mode.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gtfs_rt_enricher::{
    bus::{BusPublisher, channel_bus},
    config::Config,
    fetch::{BasicClient, FeedFetcher},
    pipeline::Pipeline,
    sink::{CsvTableSink, SinkWriter},
    stats::PipelineStats,
    stops::StopTable,
    window::WindowEngine,
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_enricher")]
#[command(about = "Streaming GTFS-RT flatten/window/enrich pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming pipeline: fetch feed snapshots, publish them to
    /// the in-process bus, and consume them across shard workers
    Run,
    /// Replay a captured JSON bus envelope file through one pipeline pass
    Replay {
        /// Path to a file containing one JSON feed envelope
        #[arg(value_name = "ENVELOPE_FILE")]
        file: String,
    },
    /// Load the stop reference table and report what it contains
    CheckStops,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_rt_enricher.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_enricher.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_streaming().await?,
        Commands::Replay { file } => replay(&file).await?,
        Commands::CheckStops => check_stops()?,
    }

    Ok(())
}

/// Wires fetcher, bus, and shard pipelines together and runs until
/// Ctrl-C. Configuration errors fail fast before anything is consumed.
async fn run_streaming() -> Result<()> {
    let config = Config::from_env()?;
    let feed_url = config
        .feed_url
        .clone()
        .context("missing required environment variable FEED_URL")?;

    let stops = Arc::new(StopTable::load(&config.stops_csv_path)?);
    info!(
        stops = stops.len(),
        path = %config.stops_csv_path,
        "Stop reference table loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    // One bus partition and one pipeline per shard; the only shared
    // mutable-free state is the stop table and the sink table file.
    let sink = Arc::new(CsvTableSink::new(&config.sink_table_path));
    let mut publishers = Vec::new();
    let mut shard_tasks = Vec::new();

    for shard in 0..config.shard_count {
        let (publisher, mut bus) = channel_bus(64);
        publishers.push(publisher);

        let stats = Arc::new(PipelineStats::default());
        let writer = SinkWriter::new(
            Arc::clone(&sink),
            config.sink_max_retries,
            config.sink_retry_backoff,
            Arc::clone(&stats),
        );
        let mut pipeline = Pipeline::new(
            shard,
            Arc::clone(&stops),
            WindowEngine::new(config.window.clone()),
            writer,
            stats,
            config.flush_on_shutdown,
        );

        let shutdown = shutdown_rx.clone();
        shard_tasks.push(tokio::spawn(async move {
            if let Err(e) = pipeline.run(&mut bus, shutdown).await {
                error!(shard, error = %e, "Pipeline shard failed");
            }
        }));
    }

    info!(
        subscription = %config.bus_subscription,
        shards = config.shard_count,
        feed_url = %feed_url,
        "Streaming pipeline started"
    );

    run_fetch_loop(&config, &feed_url, publishers, shutdown_rx).await;

    for task in shard_tasks {
        let _ = task.await;
    }

    info!("Streaming pipeline stopped");
    Ok(())
}

/// Periodically fetches feed snapshots and publishes envelopes round-robin
/// across shard partitions. Fetch failures are transient: logged and
/// retried on the next tick, exactly like an external scheduler would.
async fn run_fetch_loop(
    config: &Config,
    feed_url: &str,
    publishers: Vec<BusPublisher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match BasicClient::new(config.fetch_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build HTTP client, nothing to publish");
            return;
        }
    };
    let fetcher = FeedFetcher::new(client, feed_url);
    let mut ticker = tokio::time::interval(config.fetch_interval);
    let mut round = 0usize;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match fetcher.fetch_envelope().await {
                    Ok(payload) => {
                        let publisher = &publishers[round % publishers.len()];
                        round += 1;
                        if publisher.publish(payload).await.is_err() {
                            warn!("Bus partition closed, stopping fetch loop");
                            break;
                        }
                    }
                    Err(e) => {
                        // Retryable: next tick re-invokes the fetch.
                        warn!(error = %e, "Feed fetch failed, will retry");
                    }
                }
            }
        }
    }
    // Dropping the publishers closes the partitions so shard loops can
    // finish their flush.
}

/// Feeds one captured envelope through a single-shard pipeline and
/// flushes, so the enriched rows land in the sink table.
async fn replay(file: &str) -> Result<()> {
    let config = Config::from_env()?;
    let payload =
        std::fs::read(file).with_context(|| format!("failed to read envelope file {file}"))?;

    let stops = Arc::new(StopTable::load(&config.stops_csv_path)?);
    let stats = Arc::new(PipelineStats::default());
    let writer = SinkWriter::new(
        CsvTableSink::new(&config.sink_table_path),
        config.sink_max_retries,
        config.sink_retry_backoff,
        Arc::clone(&stats),
    );
    let mut pipeline = Pipeline::new(
        0,
        stops,
        WindowEngine::new(config.window.clone()),
        writer,
        Arc::clone(&stats),
        true, // always flush a replay
    );

    let (publisher, mut bus) = channel_bus(1);
    publisher.publish(payload).await?;
    drop(publisher); // bus closes after the one message

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    pipeline.run(&mut bus, shutdown_rx).await?;

    let s = stats.snapshot();
    info!(
        flattened = s.records_flattened,
        filtered = s.records_filtered,
        rows_written = s.rows_written,
        "Replay complete"
    );
    Ok(())
}

fn check_stops() -> Result<()> {
    let config = Config::from_env()?;
    let stops = StopTable::load(&config.stops_csv_path)?;

    info!(
        path = %config.stops_csv_path,
        stops = stops.len(),
        "Stop reference table loaded"
    );
    if stops.is_empty() {
        warn!("Table is empty: every enrichment lookup will miss");
    }
    Ok(())
}
