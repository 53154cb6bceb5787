//! Fathom archival daemon.
//!
//! This is the main entry point for the collection data archival service.
//! It backfills historical data points from the query endpoint since the
//! last run, then follows the live MQTT stream, persisting everything
//! into a local SQLite database.
//!
//! # Usage
//!
//! ```bash
//! # Credentials come from the environment
//! export FATHOM_API_TOKEN=...
//! export FATHOM_COLLECTION_ID=...
//!
//! # Run until Ctrl-C with default paths
//! fathom-ingest
//!
//! # Archive for two minutes, then exit
//! fathom-ingest --db-path /data/points.db --watch-secs 120
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon stops on SIGINT (Ctrl+C) or when the optional watch window
//! elapses:
//! 1. Lets any in-flight write finish
//! 2. Closes the live subscription
//! 3. Closes the data store
//! 4. Exits zero only if both closes succeeded

use anyhow::{Context, Result};
use clap::Parser;
use fathom_core::metrics::{init_metrics, start_metrics_server};
use fathom_ingest::{
    HttpCollectionClient, MqttSource, Settings, SqliteStore, StreamConfig, SyncOptions,
    Synchronizer,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Fathom archival daemon.
#[derive(Parser, Debug)]
#[command(name = "fathom-ingest")]
#[command(about = "Collection data archival daemon")]
#[command(version)]
struct Args {
    /// SQLite database path for archived data points
    #[arg(long, default_value = "./data.db")]
    db_path: PathBuf,

    /// Base URL of the collection service REST API
    #[arg(long, default_value = "https://api.fathom.dev/v1")]
    api_base_url: String,

    /// MQTT broker host for the live stream
    #[arg(long, default_value = "mqtt.fathom.dev")]
    mqtt_host: String,

    /// MQTT broker port (TLS)
    #[arg(long, default_value = "8883")]
    mqtt_port: u16,

    /// Stop after this many seconds of watching the live stream
    /// (0 = run until Ctrl-C)
    #[arg(long, default_value = "0")]
    watch_secs: u64,

    /// Per-run ceiling on backfilled records
    #[arg(long)]
    backfill_limit: Option<usize>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (shared by the HTTP client and the
    // MQTT transport).
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("fathom_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Fathom archival daemon starting...");

    // Settings are validated before any I/O happens.
    let settings = Settings::from_env()?;

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    // Set up graceful shutdown
    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        ctrlc_cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    if args.watch_secs > 0 {
        tracing::info!("Watching for data for {}s", args.watch_secs);
        let timer_cancel = cancel.clone();
        let watch = Duration::from_secs(args.watch_secs);
        tokio::spawn(async move {
            tokio::time::sleep(watch).await;
            tracing::info!("Watch window elapsed, stopping");
            timer_cancel.cancel();
        });
    }

    tracing::info!("Configuration:");
    tracing::info!("  Database:   {}", args.db_path.display());
    tracing::info!("  API:        {}", args.api_base_url);
    tracing::info!("  MQTT:       {}:{}", args.mqtt_host, args.mqtt_port);
    tracing::info!("  Collection: {}", settings.collection_id);

    let store = SqliteStore::open(&args.db_path)
        .with_context(|| format!("Failed to open data store at {:?}", args.db_path))?;
    let client = HttpCollectionClient::new(&args.api_base_url, &settings.api_token);
    let live = MqttSource::new(StreamConfig::new(
        &args.mqtt_host,
        args.mqtt_port,
        &settings.collection_id,
        &settings.api_token,
    ));

    let options = SyncOptions {
        collection_id: settings.collection_id.clone(),
        backfill_limit: args.backfill_limit,
    };

    let report = Synchronizer::new(store, client, live, options)
        .run(cancel)
        .await
        .context("Synchronization failed")?;

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Data points backfilled: {}", report.backfilled);
    tracing::info!("Data points streamed:   {}", report.streamed);

    Ok(())
}
