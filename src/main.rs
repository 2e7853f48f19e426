//! CarryTrack binary
//!
//! Wires config, storage, resolver, engine and scheduler together. Raw
//! ticks arrive as NDJSON on stdin (the upstream feed adapter is external);
//! spot ticks additionally drive resolver re-evaluation.

use anyhow::{anyhow, Context};
use carrytrack::config::Config;
use carrytrack::engine::{ComputationEngine, EngineParams};
use carrytrack::ingest::{Ingestor, RawTick};
use carrytrack::scheduler::ComputeScheduler;
use carrytrack::state::AppState;
use chrono::{Duration as ChronoDuration, Utc};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carrytrack=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CarryTrack...");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&PathBuf::from(path))?,
        None => Config::default(),
    };
    config.validate()?;

    let state = Arc::new(AppState::new(config.clone())?);

    // Optional instrument master load (stand-in for the external sync)
    if let Some(path) = &config.instrument_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read instrument file {}", path.display()))?;
        let instruments: Vec<carrytrack::db::models::Instrument> = serde_json::from_str(&raw)
            .with_context(|| format!("Bad instrument file {}", path.display()))?;
        state.sync_instruments(&instruments)?;
    }

    let ingestor = Arc::new(Ingestor::new(
        state.db.clone(),
        state.instruments.clone(),
        config.retry_policy(),
    ));

    let engine = Arc::new(ComputationEngine::new(
        state.db.clone(),
        state.resolver.clone(),
        EngineParams {
            risk_free_rate: config.risk_free_rate,
            staleness: ChronoDuration::seconds(config.staleness_secs),
            min_tte_years: config.min_tte_years,
        },
        config.retry_policy(),
    ));

    let scheduler = ComputeScheduler::new(
        engine,
        Duration::from_secs(config.compute_interval_secs),
    );
    let mut scheduler_handle = scheduler.start();

    // Fatal failures in the feed thread are reported back here; the sender
    // stays alive in main so recv() only ever yields real shutdown reasons
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<String>(1);

    // Feed thread: NDJSON ticks from stdin
    let feed_state = state.clone();
    let feed_ingestor = ingestor.clone();
    let feed_shutdown = shutdown_tx.clone();
    let spot_token = config.spot_token;
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) if !line.trim().is_empty() => line,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!("Feed read error: {}", e);
                    break;
                }
            };

            let tick: RawTick = match serde_json::from_str(&line) {
                Ok(tick) => tick,
                Err(e) => {
                    tracing::warn!("Malformed tick dropped: {}", e);
                    continue;
                }
            };

            match feed_ingestor.ingest(&tick) {
                Ok(_) => {
                    // Every spot update re-resolves the chain
                    if tick.instrument_token == spot_token {
                        if let Err(e) = feed_state.resolver.evaluate(tick.ltp, Utc::now()) {
                            tracing::warn!("Chain resolution failed: {}", e);
                        }
                    }
                }
                Err(carrytrack::error::AppError::Persistence(e)) => {
                    tracing::error!("Storage unavailable, feed stopping: {}", e);
                    let _ = feed_shutdown.blocking_send(format!("tick feed stopped: {}", e));
                    break;
                }
                Err(e) => {
                    tracing::warn!("Tick rejected: {}", e);
                }
            }
        }
        tracing::info!("Feed thread exiting");
    });

    tracing::info!(
        "Engine running for {} (spot token {})",
        config.underlying,
        config.spot_token
    );

    // Persistence exhaustion anywhere is fatal to the process
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
        reason = shutdown_rx.recv() => {
            Err(anyhow!(reason.unwrap_or_else(|| "shutdown requested".into())))
        }
        _ = &mut scheduler_handle => {
            Err(anyhow!("computation scheduler stopped: storage unavailable"))
        }
    };
    scheduler_handle.abort();

    result
}
