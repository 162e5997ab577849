//! listen-importer - CLI importer that publishes canonical play records
//! to a personal data server.
//!
//! Reads a pre-canonicalized JSON array of play records (parsing
//! scrobble exports or streaming-service dumps into that shape is out
//! of scope for this crate) and publishes them through
//! `listen-publisher-core`.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use listen_publisher_core::{bootstrap_publisher, AuthSession, CancelSignal, PlayRecord};
use tokio::signal;

use crate::config::ImporterConfig;

/// listen-importer - publishes canonical play records to a personal
/// data server's repository.
#[derive(Parser, Debug)]
#[command(name = "listen-importer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LISTEN_IMPORTER_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Path to a JSON file containing an array of canonicalized play records.
    #[arg(value_name = "RECORDS_FILE")]
    records_file: PathBuf,

    /// Decentralized identifier of the account to publish to.
    #[arg(long, env = "LISTEN_IMPORTER_ACCOUNT_DID")]
    account_did: String,

    /// Bearer access token for the account's personal data server.
    #[arg(long, env = "LISTEN_IMPORTER_ACCESS_TOKEN")]
    access_token: String,

    /// PDS base URL (overrides config file).
    #[arg(long, env = "LISTEN_IMPORTER_PDS_ENDPOINT")]
    pds_endpoint: Option<String>,

    /// Build batches and dedupe, but never actually publish (overrides config file).
    #[arg(long)]
    dry_run: bool,

    /// Multiplier on the governor's advertised remaining quota (overrides config file).
    #[arg(long)]
    safety_factor: Option<f64>,

    /// Use a looser 0.85 safety factor instead of the 0.75 default (overrides config file).
    #[arg(long)]
    aggressive: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("listen-importer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ImporterConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(pds_endpoint) = args.pds_endpoint {
        config.pds_endpoint = pds_endpoint;
    }
    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(safety_factor) = args.safety_factor {
        config.safety_factor = Some(safety_factor);
    }
    if args.aggressive {
        config.aggressive = true;
    }

    let records = load_records(&args.records_file)
        .await
        .with_context(|| format!("failed to load records from {}", args.records_file.display()))?;
    log::info!("loaded {} candidate records", records.len());

    let session = AuthSession::new(args.account_did, config.pds_endpoint.clone(), args.access_token);
    let core_config = config.to_core_config();

    let bootstrapped = bootstrap_publisher(session, &core_config, records.len())
        .await
        .context("failed to bootstrap publisher")?;
    let mut publisher = bootstrapped.publisher;
    let cancel = bootstrapped.cancel;

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_cancel).await;
    });

    let outcome = publisher.publish(records, &cancel).await.context("publish run failed")?;

    log::info!(
        "publish run finished: {} succeeded, {} failed, {} duplicates skipped, {} untried, cancelled={}",
        outcome.success_count,
        outcome.error_count,
        outcome.skipped_duplicates,
        outcome.untried,
        outcome.cancelled
    );

    if outcome.auth_failed {
        log::error!("authentication was rejected; re-run after refreshing credentials");
    }

    if outcome.cancelled {
        return Ok(ExitCode::from(130));
    }
    if outcome.error_count > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Reads and parses a JSON array of canonicalized [`PlayRecord`]s.
async fn load_records(path: &std::path::Path) -> Result<Vec<PlayRecord>> {
    let bytes = tokio::fs::read(path).await?;
    let records: Vec<PlayRecord> = serde_json::from_slice(&bytes)?;
    Ok(records)
}

/// Waits for shutdown signals (Ctrl+C or SIGTERM) and forwards them to
/// the publisher's cancellation signal. The first signal lets the
/// in-flight batch finish; a second escalates to a forced stop (§4.G).
async fn shutdown_signal(cancel: CancelSignal) {
    loop {
        wait_for_signal().await;
        cancel.cancel();
        if cancel.is_forced() {
            log::warn!("second shutdown signal received, forcing stop");
        } else {
            log::info!("shutdown signal received, stopping after the current batch");
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
