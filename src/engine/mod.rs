//! Cost-of-carry computation engine
//!
//! One cycle reads the latest tick for the spot and the four resolved ATM
//! legs, derives synthetic futures by put-call parity, annualized cost of
//! carry, calendar spread, premiums and implied volatilities, and appends a
//! single immutable snapshot. A cycle with any missing or stale leg is
//! skipped whole; partial snapshots are never written.

pub mod pricing;

use crate::db::models::{ComputedSnapshot, MarketDataPoint};
use crate::db::SqliteDb;
use crate::error::{AppError, Result};
use crate::resolver::{InstrumentResolver, LegPair, ResolverSnapshot};
use crate::retry::{with_retry, RetryPolicy};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use pricing::OptionSide;
use std::sync::Arc;

const DAYS_PER_YEAR: f64 = 365.0;

/// Why a cycle produced no snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Resolver has not produced a chain yet
    NoResolution,
    /// A required leg has no market data at all
    MissingLeg(String),
    /// A required leg is older than the staleness threshold
    StaleLeg(String),
}

/// Outcome of one computation cycle
#[derive(Debug)]
pub enum CycleOutcome {
    Computed(ComputedSnapshot),
    Skipped(SkipReason),
}

/// Engine tunables, taken from [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub risk_free_rate: f64,
    pub staleness: Duration,
    /// Cost of carry is null below this time-to-expiry
    pub min_tte_years: f64,
}

pub struct ComputationEngine {
    db: Arc<SqliteDb>,
    resolver: Arc<InstrumentResolver>,
    params: EngineParams,
    retry: RetryPolicy,
}

impl ComputationEngine {
    pub fn new(
        db: Arc<SqliteDb>,
        resolver: Arc<InstrumentResolver>,
        params: EngineParams,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            resolver,
            params,
            retry,
        }
    }

    /// Run one computation cycle at the given wall-clock instant.
    ///
    /// The scheduler guarantees at most one cycle in flight, so this method
    /// takes `&self` without further coordination.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let chain = match self.resolver.snapshot() {
            Some(chain) => chain,
            None => {
                tracing::debug!("Cycle skipped: no resolved chain yet");
                return Ok(CycleOutcome::Skipped(SkipReason::NoResolution));
            }
        };

        let spot = match self.fetch_leg("spot", chain.spot_token, now)? {
            Ok(tick) => tick,
            Err(reason) => return Ok(CycleOutcome::Skipped(reason)),
        };
        let weekly_call = match self.fetch_leg("weekly call", chain.weekly.call_token, now)? {
            Ok(tick) => tick,
            Err(reason) => return Ok(CycleOutcome::Skipped(reason)),
        };
        let weekly_put = match self.fetch_leg("weekly put", chain.weekly.put_token, now)? {
            Ok(tick) => tick,
            Err(reason) => return Ok(CycleOutcome::Skipped(reason)),
        };
        let monthly_call = match self.fetch_leg("monthly call", chain.monthly.call_token, now)? {
            Ok(tick) => tick,
            Err(reason) => return Ok(CycleOutcome::Skipped(reason)),
        };
        let monthly_put = match self.fetch_leg("monthly put", chain.monthly.put_token, now)? {
            Ok(tick) => tick,
            Err(reason) => return Ok(CycleOutcome::Skipped(reason)),
        };

        let snapshot = self.compute(
            &chain,
            &spot,
            &weekly_call,
            &weekly_put,
            &monthly_call,
            &monthly_put,
            now,
        )?;

        with_retry(&self.retry, "insert computed snapshot", || {
            self.db.insert_snapshot(&snapshot)
        })?;

        tracing::info!(
            "Computed snapshot: spot {} atm {} weekly coc {:?} monthly coc {:?}",
            snapshot.spot_price,
            snapshot.atm_strike,
            snapshot.weekly_cost_of_carry,
            snapshot.monthly_cost_of_carry
        );

        Ok(CycleOutcome::Computed(snapshot))
    }

    /// Latest tick for a leg by server receipt timestamp, or the reason the
    /// cycle must be skipped. Receipt ordering keeps the freshest view of
    /// each leg even when ticks arrive out of exchange-timestamp order.
    fn fetch_leg(
        &self,
        label: &str,
        token: i64,
        now: DateTime<Utc>,
    ) -> Result<std::result::Result<MarketDataPoint, SkipReason>> {
        let tick = with_retry(&self.retry, "fetch latest tick", || {
            self.db.latest_tick(token)
        })?;

        let tick = match tick {
            Some(tick) => tick,
            None => {
                tracing::warn!("Cycle skipped: no market data for {} (token {})", label, token);
                return Ok(Err(SkipReason::MissingLeg(label.to_string())));
            }
        };

        let age = now - tick.received_at;
        if age > self.params.staleness {
            tracing::warn!(
                "Cycle skipped: {} (token {}) is stale, age {}s",
                label,
                token,
                age.num_seconds()
            );
            return Ok(Err(SkipReason::StaleLeg(label.to_string())));
        }

        Ok(Ok(tick))
    }

    #[allow(clippy::too_many_arguments)]
    fn compute(
        &self,
        chain: &ResolverSnapshot,
        spot: &MarketDataPoint,
        weekly_call: &MarketDataPoint,
        weekly_put: &MarketDataPoint,
        monthly_call: &MarketDataPoint,
        monthly_put: &MarketDataPoint,
        now: DateTime<Utc>,
    ) -> Result<ComputedSnapshot> {
        let spot_price = spot.ltp;
        if spot_price <= 0.0 {
            return Err(AppError::Validation(format!(
                "Non-positive spot price: {}",
                spot_price
            )));
        }

        let weekly = self.leg_metrics(
            &chain.weekly,
            spot_price,
            weekly_call.ltp,
            weekly_put.ltp,
            spot.exchange_timestamp,
        );
        let monthly = self.leg_metrics(
            &chain.monthly,
            spot_price,
            monthly_call.ltp,
            monthly_put.ltp,
            spot.exchange_timestamp,
        );

        let calendar_spread = match (monthly.cost_of_carry, weekly.cost_of_carry) {
            (Some(m), Some(w)) => Some(m - w),
            _ => None,
        };

        Ok(ComputedSnapshot {
            spot_price,
            atm_strike: chain.atm_strike,
            weekly_expiry: chain.weekly.expiry,
            monthly_expiry: chain.monthly.expiry,
            weekly_call_price: weekly_call.ltp,
            weekly_put_price: weekly_put.ltp,
            monthly_call_price: monthly_call.ltp,
            monthly_put_price: monthly_put.ltp,
            weekly_call_iv: weekly.call_iv,
            weekly_put_iv: weekly.put_iv,
            monthly_call_iv: monthly.call_iv,
            monthly_put_iv: monthly.put_iv,
            weekly_synthetic_future: weekly.synthetic_future,
            monthly_synthetic_future: monthly.synthetic_future,
            weekly_cost_of_carry: weekly.cost_of_carry,
            monthly_cost_of_carry: monthly.cost_of_carry,
            calendar_spread,
            weekly_call_premium: weekly.call_premium,
            weekly_put_premium: weekly.put_premium,
            monthly_call_premium: monthly.call_premium,
            monthly_put_premium: monthly.put_premium,
            computed_at: now,
            market_timestamp: spot.exchange_timestamp,
        })
    }

    /// Derived values for one expiry leg
    fn leg_metrics(
        &self,
        pair: &LegPair,
        spot_price: f64,
        call_price: f64,
        put_price: f64,
        market_ts: DateTime<Utc>,
    ) -> LegMetrics {
        // Put-call parity: F = K + C - P
        let synthetic_future = pair.strike + call_price - put_price;

        let tte = time_to_expiry_years(pair.expiry, market_ts);
        let cost_of_carry = if tte > self.params.min_tte_years {
            Some(((synthetic_future / spot_price) - 1.0) / tte * 100.0)
        } else {
            tracing::debug!(
                "Time to expiry {:.6}y at or below floor, cost of carry null for {}",
                tte,
                pair.expiry
            );
            None
        };

        let call_premium = call_price - pricing::call_intrinsic(spot_price, pair.strike);
        let put_premium = put_price - pricing::put_intrinsic(spot_price, pair.strike);

        let iv_tte = tte.max(0.0);
        let call_iv = pricing::implied_volatility(
            call_price,
            spot_price,
            pair.strike,
            iv_tte,
            self.params.risk_free_rate,
            OptionSide::Call,
        );
        let put_iv = pricing::implied_volatility(
            put_price,
            spot_price,
            pair.strike,
            iv_tte,
            self.params.risk_free_rate,
            OptionSide::Put,
        );

        LegMetrics {
            synthetic_future,
            cost_of_carry,
            call_premium,
            put_premium,
            call_iv,
            put_iv,
        }
    }
}

struct LegMetrics {
    synthetic_future: f64,
    cost_of_carry: Option<f64>,
    call_premium: f64,
    put_premium: f64,
    call_iv: Option<f64>,
    put_iv: Option<f64>,
}

/// Actual/365 year fraction from the market timestamp to 15:30 IST on expiry
fn time_to_expiry_years(expiry: NaiveDate, from: DateTime<Utc>) -> f64 {
    let cutoff = Kolkata
        .from_local_datetime(
            &expiry.and_time(NaiveTime::from_hms_opt(15, 30, 0).expect("static cutoff time")),
        )
        .single()
        .expect("IST has no DST gaps")
        .with_timezone(&Utc);
    (cutoff - from).num_seconds() as f64 / (DAYS_PER_YEAR * 86_400.0)
}
