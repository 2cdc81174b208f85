//! ==============================================================================
//! main.rs - weather station host entry point
//! ==============================================================================
//!
//! purpose:
//!     polls the rs-485 weather sensors, derives display metrics, publishes
//!     a live snapshot and logs a snapshot to a dated csv every 30s.
//!
//! responsibilities:
//!     - load and validate station.toml (fatal on a bad file)
//!     - build the endpoint registry, bus client and reference lookups
//!     - start the acquisition loop, the persistence writer and the api
//!     - on ctrl-c: clear the running flag, join workers with a deadline
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                     rust host (this file)                    │
//!     │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────┐  │
//!     │  │ acquisition loop │  │ persistence      │  │ api server │  │
//!     │  │ (tokio task)     │  │ (blocking thread)│  │ (axum)     │  │
//!     │  └───┬─────────┬────┘  └────────▲─────────┘  └─────▲──────┘  │
//!     │      │         │ queue          │                  │         │
//!     │      │         └────────────────┘                  │         │
//!     │      │ publish Arc<Snapshot> ──────────────────────┘         │
//!     └──────┼───────────────────────────────────────────────────────┘
//!            │ modbus rtu
//!     ┌──────┴──────────────────────────────────────────┐
//!     │ env(1)  uv(2)  wind speed(4)  wind dir(5)  rain(6) │
//!     └─────────────────────────────────────────────────┘
//!
//! ==============================================================================

mod acquisition;
mod air_quality;
mod almanac;
mod bus;
mod config;
mod error;
mod metrics;
mod persistence;
mod sensors;
mod server;
mod snapshot;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing_subscriber::EnvFilter;

use crate::acquisition::{AcquisitionLoop, AcquisitionTiming};
use crate::air_quality::AirQualitySource;
use crate::almanac::SunAlmanac;
use crate::bus::{BusClient, RtuTransport};
use crate::config::StationConfig;
use crate::metrics::{CsvRainfallLedger, RainfallAccumulator};
use crate::persistence::{DailyCsvWriter, WriterSettings};

#[derive(Parser, Debug)]
#[command(version, about = "Weather station sensor host")]
struct Args {
    /// path to station.toml (default: config/station.toml, then ../config/station.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // startup banner
    println!("===========================================================");
    println!("  Weather Station Host");
    println!("  Modbus RTU sensors -> live snapshot + daily CSV");
    println!("===========================================================");

    // step 1: load configuration
    let config = match &args.config {
        Some(path) => {
            let config = StationConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?;
            println!("[CONFIG] Loaded from {}", path.display());
            config
        }
        None => StationConfig::load_or_default(),
    };
    init_logging(&config.logging.level);
    config.print_summary();
    if let Err(e) = config.validate() {
        eprintln!("[ERROR] Fatal: invalid configuration: {}", e);
        return Err(e);
    }

    // step 2: output directories
    for dir in [&config.storage.data_dir, &config.storage.rainfall_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    // step 3: reference data
    let sun_defaults = config
        .reference
        .default_sun_times()
        .ok_or_else(|| anyhow!("invalid default sun times"))?;
    let almanac = Arc::new(SunAlmanac::load_or_defaults(&config.reference.sun_file, sun_defaults));

    // step 4: field bus
    println!("\n[STARTUP] Opening field bus on {}...", config.bus.port);
    let transport = RtuTransport::new(&config.bus)?;
    let bus = BusClient::new(transport, config.bus.timeout());

    // step 5: wire the workers together
    let running = Arc::new(AtomicBool::new(true));
    let (publisher, reader) = snapshot::channel();
    let (producer, consumer) = persistence::snapshot_queue();

    let acquisition = AcquisitionLoop::new(
        bus,
        config.endpoint_registry(),
        AirQualitySource::new(&config.reference.air_quality_file),
        RainfallAccumulator::new(Box::new(CsvRainfallLedger::new(&config.storage.rainfall_dir))),
        publisher,
        producer,
        AcquisitionTiming::from(&config.acquisition),
    )
    .with_running(running.clone())
    .with_sensor_logging(config.logging.show_sensor_data);

    let writer = DailyCsvWriter::new(&config.storage.data_dir, config.storage.retention_days);
    let settings = WriterSettings {
        poll: config.storage.queue_poll(),
        permission_backoff: config.storage.permission_backoff(),
    };
    let writer_running = running.clone();
    let mut writer_task = tokio::task::spawn_blocking(move || {
        persistence::run_writer(writer, consumer, writer_running, settings)
    });
    println!("[STARTUP] ✓ Persistence writer -> {}", config.storage.data_dir.display());

    let mut acquisition_task = tokio::spawn(acquisition.run());
    println!(
        "[STARTUP] ✓ Acquisition loop ({}ms poll, {}s persist)",
        config.acquisition.poll_interval_ms, config.acquisition.persist_interval_secs
    );

    // step 6: api server in background
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let mut server_task = if config.server.enabled {
        let bind = config.server.bind.clone();
        let state = server::ApiState { snapshots: reader, almanac };
        println!("[STARTUP] ✓ API live at http://{}/api", bind);
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = server::run_server(&bind, state, shutdown).await {
                tracing::error!(error = %e, "api server error");
            }
        }))
    } else {
        None
    };

    println!("────────────────────────────────────────────────────────────");

    // step 7: run until ctrl-c
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for ctrl-c, shutting down");
    }
    println!("\n[SHUTDOWN] Stopping workers...");
    running.store(false, Ordering::SeqCst);
    shutdown_tx.send_replace(true);

    // one deadline shared by every join
    let deadline = Instant::now() + config.acquisition.shutdown_timeout();

    match time::timeout_at(deadline, &mut acquisition_task).await {
        Ok(Ok(())) => println!("[SHUTDOWN] ✓ Acquisition loop stopped, bus closed"),
        Ok(Err(e)) => tracing::error!(error = %e, "acquisition task failed"),
        Err(_) => {
            // dropping the aborted loop drops the serial port with it
            tracing::warn!("acquisition loop overran shutdown deadline, aborting");
            acquisition_task.abort();
        }
    }

    match time::timeout_at(deadline, &mut writer_task).await {
        Ok(Ok(())) => println!("[SHUTDOWN] ✓ Persistence writer drained"),
        Ok(Err(e)) => tracing::error!(error = %e, "persistence task failed"),
        Err(_) => tracing::warn!("persistence writer overran shutdown deadline"),
    }

    if let Some(task) = server_task.as_mut() {
        if time::timeout_at(deadline, task).await.is_err() {
            tracing::warn!("api server overran shutdown deadline");
        }
    }

    println!("[SHUTDOWN] Done");
    Ok(())
}

/// RUST_LOG wins; otherwise the configured level
fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}
