//! Market data ingestor
//!
//! Validates raw ticks and persists them as immutable market data points.
//! Multiple ingest paths may run concurrently; idempotency comes from the
//! natural key (instrument token, exchange timestamp), so a retried or
//! duplicated tick is a no-op rather than a conflict.

use crate::db::models::{FetchLog, FetchStatus, Instrument, MarketDataPoint};
use crate::db::SqliteDb;
use crate::error::{AppError, Result};
use crate::retry::{with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;

/// Raw tick as received from the upstream feed
#[derive(Debug, Clone, Deserialize)]
pub struct RawTick {
    pub instrument_token: i64,
    pub ltp: f64,
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    #[serde(default)]
    pub close: f64,
    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub oi: i64,
    #[serde(default)]
    pub bid_price: f64,
    #[serde(default)]
    pub bid_qty: i64,
    #[serde(default)]
    pub ask_price: f64,
    #[serde(default)]
    pub ask_qty: i64,
    pub exchange_timestamp: DateTime<Utc>,
}

/// Outcome of a single ingest call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    /// Natural key already present; the original row is untouched
    Duplicate,
}

pub struct Ingestor {
    db: Arc<SqliteDb>,
    /// Known instruments by token, kept warm by the caller
    instruments: Arc<DashMap<i64, Instrument>>,
    retry: RetryPolicy,
}

impl Ingestor {
    pub fn new(
        db: Arc<SqliteDb>,
        instruments: Arc<DashMap<i64, Instrument>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            instruments,
            retry,
        }
    }

    /// Validate and persist one tick.
    ///
    /// Out-of-order and duplicate ticks are accepted; a duplicate natural
    /// key reports [`IngestOutcome::Duplicate`] without touching the stored
    /// row. Transient storage failures are retried under the policy.
    pub fn ingest(&self, raw: &RawTick) -> Result<IngestOutcome> {
        self.validate(raw)?;

        let point = MarketDataPoint {
            instrument_token: raw.instrument_token,
            ltp: raw.ltp,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            oi: raw.oi,
            bid_price: raw.bid_price,
            bid_qty: raw.bid_qty,
            ask_price: raw.ask_price,
            ask_qty: raw.ask_qty,
            exchange_timestamp: raw.exchange_timestamp,
            received_at: Utc::now(),
        };

        let inserted = with_retry(&self.retry, "insert tick", || self.db.insert_tick(&point))?;

        if inserted {
            Ok(IngestOutcome::Inserted)
        } else {
            tracing::debug!(
                "Duplicate tick for token {} at {}, ignored",
                raw.instrument_token,
                raw.exchange_timestamp
            );
            Ok(IngestOutcome::Duplicate)
        }
    }

    /// Ingest a bulk historical range and record the outcome in the fetch
    /// log. Invalid records are counted, not fatal: a mix of good and bad
    /// records yields PARTIAL, all-bad yields FAILED.
    pub fn ingest_batch(
        &self,
        symbol: &str,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
        ticks: &[RawTick],
    ) -> Result<FetchLog> {
        let mut inserted: i64 = 0;
        let mut rejected: i64 = 0;
        let mut first_error: Option<String> = None;

        for raw in ticks {
            match self.ingest(raw) {
                Ok(IngestOutcome::Inserted) => inserted += 1,
                Ok(IngestOutcome::Duplicate) => {}
                Err(err @ AppError::Persistence(_)) => {
                    // Storage is down; log the aborted fetch and surface
                    let log = FetchLog {
                        symbol: symbol.to_string(),
                        from_ts,
                        to_ts,
                        record_count: inserted,
                        status: FetchStatus::Failed,
                        error: Some(err.to_string()),
                        created_at: Utc::now(),
                    };
                    let _ = self.db.insert_fetch_log(&log);
                    return Err(err);
                }
                Err(err) => {
                    rejected += 1;
                    if first_error.is_none() {
                        first_error = Some(err.to_string());
                    }
                }
            }
        }

        let status = if rejected == 0 {
            FetchStatus::Success
        } else if inserted > 0 {
            FetchStatus::Partial
        } else {
            FetchStatus::Failed
        };

        let log = FetchLog {
            symbol: symbol.to_string(),
            from_ts,
            to_ts,
            record_count: inserted,
            status,
            error: first_error,
            created_at: Utc::now(),
        };
        self.db.insert_fetch_log(&log)?;

        tracing::info!(
            "Batch ingest for {}: {} inserted, {} rejected, status {}",
            symbol,
            inserted,
            rejected,
            status.as_str()
        );

        Ok(log)
    }

    fn validate(&self, raw: &RawTick) -> Result<()> {
        if raw.instrument_token <= 0 {
            return Err(AppError::Validation(
                "Tick missing instrument token".into(),
            ));
        }
        if !self.instruments.contains_key(&raw.instrument_token) {
            return Err(AppError::Validation(format!(
                "Unknown instrument token: {}",
                raw.instrument_token
            )));
        }

        let prices = [
            ("ltp", raw.ltp),
            ("open", raw.open),
            ("high", raw.high),
            ("low", raw.low),
            ("close", raw.close),
            ("bid_price", raw.bid_price),
            ("ask_price", raw.ask_price),
        ];
        for (field, value) in prices {
            if value < 0.0 || !value.is_finite() {
                return Err(AppError::Validation(format!(
                    "Negative or non-finite {}: {}",
                    field, value
                )));
            }
        }

        let quantities = [
            ("volume", raw.volume),
            ("oi", raw.oi),
            ("bid_qty", raw.bid_qty),
            ("ask_qty", raw.ask_qty),
        ];
        for (field, value) in quantities {
            if value < 0 {
                return Err(AppError::Validation(format!(
                    "Negative {}: {}",
                    field, value
                )));
            }
        }

        Ok(())
    }
}
