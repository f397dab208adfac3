//! EscrowSettle auto-release worker.
//!
//! Releases escrow for bookings whose client confirmation window lapsed.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use escrowsettle_common::{BookingId, SystemClock};
use escrowsettle_engine::{EngineConfig, EscrowService, PgStore, TracingNotifier};

/// EscrowSettle worker CLI
#[derive(Parser, Debug)]
#[command(name = "escrow-worker")]
#[command(about = "Escrow auto-release worker")]
struct Args {
    /// Create missing tables and indexes before running
    #[arg(long)]
    init_schema: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single auto-release sweep and print its summary
    RunOnce {
        /// Bookings settled in this sweep (capped at 100)
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Sweep periodically until interrupted
    Serve {
        /// Seconds between sweeps
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Return a held booking to the auto-release sweep
    ClearHold {
        /// Booking to release from hold
        booking_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = EngineConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting EscrowSettle worker");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let store = PgStore::connect(&config.database_url, config.max_connections).await?;
    if args.init_schema {
        store.ensure_schema().await?;
    }

    let service = Arc::new(EscrowService::new(
        config.clone(),
        Arc::new(store),
        Arc::new(TracingNotifier),
        Arc::new(SystemClock),
    ));

    match args.command {
        Command::RunOnce { batch_size } => {
            let summary = service.run_auto_release(batch_size).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Serve { interval_secs } => {
            let interval = interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(config.auto_release.interval);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                }
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            });

            info!(
                interval_secs = interval.as_secs(),
                batch_size = config.auto_release.batch_size,
                "Auto-release worker running"
            );

            service
                .scheduler()
                .run_forever(config.auto_release.batch_size, interval, shutdown_rx)
                .await;

            info!(metrics = ?service.metrics().snapshot(), "Worker shutdown complete");
        }
        Command::ClearHold { booking_id } => {
            let booking_id = BookingId::from_uuid(booking_id);
            if !service.clear_auto_release_hold(booking_id).await? {
                info!(booking_id = %booking_id, "Booking was not on hold");
            }
        }
    }

    Ok(())
}
