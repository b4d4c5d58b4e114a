//! # Cartelem
//!
//! Runs one telemetry session against the configured devices until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cartelem::bus::DistributionBus;
use cartelem::config::{Config, LoggingConfig};
use cartelem::serial::{list_available_ports, TokioSerialOpener};
use cartelem::session::SessionRuntime;
use cartelem::telemetry::{LastKnownValueStore, SessionId};
use cartelem::writer::{BatchWriter, JsonlStorage};

/// Default configuration file, relative to the working directory
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Session used when none is given on the command line
const DEFAULT_SESSION_ID: u64 = 1;

/// Seconds between status log lines
const STATUS_LOG_INTERVAL_SECS: u64 = 30;

/// Set up stdout logging plus an optional daily-rolling file
///
/// `RUST_LOG` takes precedence over `logging.level`. The returned guard
/// must be held for the file writer to flush.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cartelem.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
            None
        }
    }
}

fn parse_args(args: &[String]) -> Result<(String, SessionId)> {
    let config_path = args.get(1).cloned().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let session_id = match args.get(2) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("Invalid session id: {}", raw))?,
        None => DEFAULT_SESSION_ID,
    };
    Ok((config_path, SessionId(session_id)))
}

/// Main entry point for Cartelem
///
/// # Usage
///
/// ```bash
/// cartelem [CONFIG_PATH] [SESSION_ID]
/// ```
///
/// # Errors
///
/// Returns error if the configuration cannot be loaded or the storage
/// directory cannot be prepared. Device failures never end the process;
/// they show up in the reader status log.
#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (config_path, session_id) = parse_args(&args)?;

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    let _log_guard = init_logging(&config.logging);

    info!("Cartelem v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", config_path);
    info!("Serial ports present: {:?}", list_available_ports());

    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let storage = JsonlStorage::open(&config.storage).context("Failed to open storage")?;
    let store = Arc::new(LastKnownValueStore::new());
    let (batch_writer, writer) =
        BatchWriter::new(&config.writer, Arc::new(storage), Arc::clone(&store));
    let writer_task = tokio::spawn(batch_writer.run(cancel.clone()));

    let bus = DistributionBus::new(&config.bus);
    let heartbeat_task = tokio::spawn(bus.clone().run_heartbeat(cancel.clone()));

    let runtime = SessionRuntime::new(
        Arc::clone(&config),
        Arc::new(TokioSerialOpener),
        Arc::clone(&store),
        bus.clone(),
        writer.clone(),
    );
    runtime.start(session_id)?;
    info!("Press Ctrl+C to exit");

    let period = Duration::from_secs(STATUS_LOG_INTERVAL_SECS);
    let mut status_ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = status_ticker.tick() => {
                for report in runtime.reader_status(session_id).unwrap_or_default() {
                    info!(
                        "{} reader {:?}: {} received, {} parsed, {} failed, {} reconnects",
                        report.name, report.state, report.received, report.parsed,
                        report.failed, report.reconnects
                    );
                }
                if let Some(uplink) = runtime.uplink_stats(session_id) {
                    info!(
                        "Uplink: {} frames, {} bytes, {} transmission errors",
                        uplink.frames_published,
                        uplink.bytes_transmitted,
                        uplink.transmission_errors
                    );
                }
                let stats = writer.stats();
                info!(
                    "Writer: {} signals, {:.0}/min, {} drops, queue depth {}",
                    stats.signals_processed,
                    stats.signals_per_minute,
                    stats.queue_drops,
                    stats.queue_depth
                );
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    runtime.shutdown().await;
    bus.shutdown();
    cancel.cancel();

    if let Err(e) = writer_task.await {
        warn!("Writer task ended abnormally: {}", e);
    }
    if let Err(e) = heartbeat_task.await {
        warn!("Heartbeat task ended abnormally: {}", e);
    }

    info!("Cartelem stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args_defaults() {
        let (path, session) = parse_args(&args(&["cartelem"])).unwrap();
        assert_eq!(path, DEFAULT_CONFIG_PATH);
        assert_eq!(session, SessionId(DEFAULT_SESSION_ID));
    }

    #[test]
    fn test_parse_args_explicit() {
        let (path, session) = parse_args(&args(&["cartelem", "/etc/cartelem.toml", "42"])).unwrap();
        assert_eq!(path, "/etc/cartelem.toml");
        assert_eq!(session, SessionId(42));
    }

    #[test]
    fn test_parse_args_rejects_bad_session() {
        assert!(parse_args(&args(&["cartelem", "x.toml", "abc"])).is_err());
    }

    #[test]
    fn test_default_config_file_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml");
        assert!(Config::load(path).is_ok());
    }
}
