//! Computation scheduler
//!
//! Drives the engine on a fixed cadence with at most one cycle in flight.
//! A timer tick that fires while a cycle is still running is coalesced
//! (dropped), never queued, so snapshot writes cannot race each other.

use crate::engine::{ComputationEngine, CycleOutcome};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub struct ComputeScheduler {
    engine: Arc<ComputationEngine>,
    interval: Duration,
}

impl ComputeScheduler {
    pub fn new(engine: Arc<ComputationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Spawn the scheduler loop. Runs until aborted or a fatal storage
    /// error; the returned handle completes when the loop stops, so the
    /// binary can treat scheduler exit as process-fatal.
    pub fn start(self) -> JoinHandle<()> {
        let in_flight = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            info!("Computation scheduler started, cadence {:?}", self.interval);

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                // Coalesce: a tick during a running cycle is dropped
                if in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    warn!("Computation cycle still running, coalescing timer tick");
                    continue;
                }

                let engine = self.engine.clone();
                let guard = in_flight.clone();

                // rusqlite is synchronous; keep the cycle off the runtime
                let result = tokio::task::spawn_blocking(move || {
                    let outcome = engine.run_cycle(Utc::now());
                    guard.store(false, Ordering::Release);
                    outcome
                })
                .await;

                match result {
                    Ok(Ok(CycleOutcome::Computed(snap))) => {
                        tracing::debug!("Cycle complete at {}", snap.computed_at);
                    }
                    Ok(Ok(CycleOutcome::Skipped(reason))) => {
                        tracing::debug!("Cycle skipped: {:?}", reason);
                    }
                    Ok(Err(e)) => {
                        // Retry budget exhaustion means storage is gone
                        if matches!(e, crate::error::AppError::Persistence(_)) {
                            error!("Computation cycle failed fatally: {}", e);
                            break;
                        }
                        warn!("Computation cycle failed: {}", e);
                    }
                    Err(join_err) => {
                        in_flight.store(false, Ordering::Release);
                        error!("Computation cycle panicked: {}", join_err);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::OptionType;
    use crate::db::test_support::{option_instrument, spot_instrument};
    use crate::db::SqliteDb;
    use crate::engine::EngineParams;
    use crate::resolver::InstrumentResolver;
    use crate::retry::RetryPolicy;
    use chrono::{NaiveDate, TimeZone};

    #[tokio::test]
    async fn test_scheduler_stops_on_storage_loss() {
        let db = Arc::new(SqliteDb::new_in_memory().unwrap());
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        db.upsert_instruments(&[
            spot_instrument(256265),
            option_instrument(1000, 19500.0, OptionType::Call, expiry),
            option_instrument(1001, 19500.0, OptionType::Put, expiry),
        ])
        .unwrap();

        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let resolver = Arc::new(InstrumentResolver::new(
            db.clone(),
            "NIFTY",
            256265,
            retry.clone(),
        ));
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 5, 30, 0).unwrap();
        resolver.evaluate(19500.0, now).unwrap();

        let engine = Arc::new(ComputationEngine::new(
            db.clone(),
            resolver,
            EngineParams {
                risk_free_rate: 0.065,
                staleness: chrono::Duration::seconds(120),
                min_tte_years: 1.0 / (365.0 * 24.0),
            },
            retry,
        ));

        // Hold the pool's only connection: every cycle read now exhausts
        // the retry budget and surfaces as Persistence
        let _held = db.test_conn().unwrap();

        let handle = ComputeScheduler::new(engine, Duration::from_millis(10)).start();
        let joined = tokio::time::timeout(Duration::from_secs(10), handle).await;
        assert!(joined.expect("scheduler loop should stop, not idle").is_ok());
    }
}
