//! Instrument resolver
//!
//! Maps the current spot price to the ATM option chain: the nearest listed
//! strike (ties toward the lower strike) and the call/put tokens for the
//! weekly and monthly expiries. Re-evaluated on every spot tick; strike and
//! expiry transitions are recorded exactly once per actual change.
//!
//! Resolved state is published as an atomically swapped `Arc` snapshot so the
//! computation engine always reads a consistent strike+expiry pair.

use crate::db::models::{ExpiryCadence, ExpiryChangeEvent, OptionType, StrikeChangeEvent};
use crate::db::SqliteDb;
use crate::error::{AppError, Result};
use crate::retry::{with_retry, RetryPolicy};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use parking_lot::RwLock;
use std::sync::Arc;

/// Contracts expire at 15:30 IST on the expiry date
const EXPIRY_CUTOFF: (u32, u32) = (15, 30);

/// One resolved expiry leg pair
#[derive(Debug, Clone, PartialEq)]
pub struct LegPair {
    pub expiry: NaiveDate,
    /// Strike the legs were actually resolved at; differs from the ATM
    /// strike only when a fallback substitution happened
    pub strike: f64,
    pub call_token: i64,
    pub put_token: i64,
}

/// Immutable view of the resolver state, version-stamped per publish
#[derive(Debug, Clone)]
pub struct ResolverSnapshot {
    pub version: u64,
    pub spot_token: i64,
    pub spot_price: f64,
    pub atm_strike: f64,
    pub weekly: LegPair,
    pub monthly: LegPair,
}

/// Instrument resolver, sole writer of its state
pub struct InstrumentResolver {
    db: Arc<SqliteDb>,
    underlying: String,
    spot_token: i64,
    retry: RetryPolicy,
    state: RwLock<Option<Arc<ResolverSnapshot>>>,
}

impl InstrumentResolver {
    pub fn new(db: Arc<SqliteDb>, underlying: &str, spot_token: i64, retry: RetryPolicy) -> Self {
        Self {
            db,
            underlying: underlying.to_string(),
            spot_token,
            retry,
            state: RwLock::new(None),
        }
    }

    /// Current snapshot; None until the first successful evaluation
    pub fn snapshot(&self) -> Option<Arc<ResolverSnapshot>> {
        self.state.read().clone()
    }

    /// Re-resolve the chain for a new spot price.
    ///
    /// Emits a strike change event only when the ATM strike differs from the
    /// previous resolution and an expiry change event only on rollover; the
    /// first evaluation establishes the baseline silently. The new snapshot
    /// is published before the events are written, so a transition is never
    /// recorded twice even when an event write fails mid-way.
    pub fn evaluate(&self, spot_price: f64, now: DateTime<Utc>) -> Result<Arc<ResolverSnapshot>> {
        if spot_price <= 0.0 {
            return Err(AppError::Validation(format!(
                "Spot price must be positive: {}",
                spot_price
            )));
        }

        let (weekly_expiry, monthly_expiry) = self.active_expiries(now)?;

        let strikes = with_retry(&self.retry, "list strikes", || {
            self.db.list_strikes(&self.underlying, weekly_expiry)
        })?;
        if strikes.is_empty() {
            return Err(AppError::Resolution(format!(
                "No listed strikes for {} expiry {}",
                self.underlying, weekly_expiry
            )));
        }
        let atm_strike = nearest_strike(spot_price, &strikes);

        let weekly = self.resolve_pair(weekly_expiry, atm_strike)?;
        let monthly = self.resolve_pair(monthly_expiry, atm_strike)?;

        let previous = self.state.read().clone();
        let version = previous.as_ref().map(|s| s.version + 1).unwrap_or(1);

        let snapshot = Arc::new(ResolverSnapshot {
            version,
            spot_token: self.spot_token,
            spot_price,
            atm_strike,
            weekly,
            monthly,
        });

        // Publish before logging: a failed event write must not leave the
        // old state in place, or the next evaluation would re-detect the
        // same transition and append a duplicate event.
        *self.state.write() = Some(snapshot.clone());

        if let Some(prev) = &previous {
            self.log_transitions(prev, &snapshot, now)?;
        }

        Ok(snapshot)
    }

    /// Weekly expiry: earliest expiry still before its 15:30 IST cutoff.
    /// Monthly expiry: last expiry within the weekly expiry's calendar month
    /// (the monthly contract is the final weekly of the month).
    fn active_expiries(&self, now: DateTime<Utc>) -> Result<(NaiveDate, NaiveDate)> {
        let expiries = with_retry(&self.retry, "list expiries", || {
            self.db.list_expiries(&self.underlying)
        })?;

        let live: Vec<NaiveDate> = expiries
            .into_iter()
            .filter(|d| expiry_cutoff(*d) > now)
            .collect();

        let weekly = *live.first().ok_or_else(|| {
            AppError::Resolution(format!("No live expiries for {}", self.underlying))
        })?;

        let monthly = live
            .iter()
            .filter(|d| d.format("%Y-%m").to_string() == weekly.format("%Y-%m").to_string())
            .max()
            .copied()
            .unwrap_or(weekly);

        Ok((weekly, monthly))
    }

    /// Resolve a call/put pair at the preferred strike, falling back to the
    /// nearest listed strike that carries both legs.
    fn resolve_pair(&self, expiry: NaiveDate, preferred_strike: f64) -> Result<LegPair> {
        let strikes = with_retry(&self.retry, "list strikes", || {
            self.db.list_strikes(&self.underlying, expiry)
        })?;
        if strikes.is_empty() {
            return Err(AppError::Resolution(format!(
                "No listed strikes for {} expiry {}",
                self.underlying, expiry
            )));
        }

        let mut candidates = strikes;
        // Nearest first; on equal distance the lower strike sorts first
        candidates.sort_by(|a, b| {
            let da = (a - preferred_strike).abs();
            let db = (b - preferred_strike).abs();
            da.partial_cmp(&db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        });

        for strike in candidates {
            let call = with_retry(&self.retry, "find call", || {
                self.db
                    .find_option(&self.underlying, strike, OptionType::Call, expiry)
            })?;
            let put = with_retry(&self.retry, "find put", || {
                self.db
                    .find_option(&self.underlying, strike, OptionType::Put, expiry)
            })?;

            if let (Some(call), Some(put)) = (call, put) {
                if strike != preferred_strike {
                    tracing::warn!(
                        "No listed pair at strike {} for {} {}, substituted nearest {}",
                        preferred_strike,
                        self.underlying,
                        expiry,
                        strike
                    );
                }
                return Ok(LegPair {
                    expiry,
                    strike,
                    call_token: call.token,
                    put_token: put.token,
                });
            }
        }

        Err(AppError::Resolution(format!(
            "No call/put pair listed for {} expiry {} near strike {}",
            self.underlying, expiry, preferred_strike
        )))
    }

    /// Append change events for any transition between two snapshots
    fn log_transitions(
        &self,
        prev: &ResolverSnapshot,
        next: &ResolverSnapshot,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if prev.atm_strike != next.atm_strike {
            tracing::info!(
                "ATM strike changed {} -> {} at spot {}",
                prev.atm_strike,
                next.atm_strike,
                next.spot_price
            );
            with_retry(&self.retry, "insert strike change", || {
                self.db.insert_strike_change(&StrikeChangeEvent {
                    old_strike: prev.atm_strike,
                    new_strike: next.atm_strike,
                    spot_price: next.spot_price,
                    changed_at: now,
                })
            })?;
        }

        if prev.weekly.expiry != next.weekly.expiry {
            tracing::info!(
                "Weekly expiry rolled {} -> {}",
                prev.weekly.expiry,
                next.weekly.expiry
            );
            with_retry(&self.retry, "insert expiry change", || {
                self.db.insert_expiry_change(&ExpiryChangeEvent {
                    cadence: ExpiryCadence::Weekly,
                    old_expiry: prev.weekly.expiry,
                    new_expiry: next.weekly.expiry,
                    reason: "expiry day rollover".into(),
                    changed_at: now,
                })
            })?;
        }

        if prev.monthly.expiry != next.monthly.expiry {
            tracing::info!(
                "Monthly expiry rolled {} -> {}",
                prev.monthly.expiry,
                next.monthly.expiry
            );
            with_retry(&self.retry, "insert expiry change", || {
                self.db.insert_expiry_change(&ExpiryChangeEvent {
                    cadence: ExpiryCadence::Monthly,
                    old_expiry: prev.monthly.expiry,
                    new_expiry: next.monthly.expiry,
                    reason: "expiry day rollover".into(),
                    changed_at: now,
                })
            })?;
        }

        Ok(())
    }
}

/// 15:30 IST on the expiry date, as UTC
fn expiry_cutoff(expiry: NaiveDate) -> DateTime<Utc> {
    let cutoff = expiry.and_time(NaiveTime::from_hms_opt(EXPIRY_CUTOFF.0, EXPIRY_CUTOFF.1, 0)
        .expect("static cutoff time"));
    Kolkata
        .from_local_datetime(&cutoff)
        .single()
        .expect("IST has no DST gaps")
        .with_timezone(&Utc)
}

/// Strike minimizing |strike - spot|; ties break toward the lower strike.
///
/// The grid is sorted ascending, so keeping the first strict minimum keeps
/// the lower strike on an exact tie.
fn nearest_strike(spot: f64, strikes: &[f64]) -> f64 {
    let mut best = strikes[0];
    let mut best_dist = (strikes[0] - spot).abs();
    for &strike in &strikes[1..] {
        let dist = (strike - spot).abs();
        if dist < best_dist {
            best = strike;
            best_dist = dist;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{option_instrument, spot_instrument};
    use chrono::TimeZone;

    fn setup() -> (Arc<SqliteDb>, InstrumentResolver) {
        let db = Arc::new(SqliteDb::new_in_memory().unwrap());
        db.upsert_instruments(&[spot_instrument(256265)]).unwrap();
        let resolver =
            InstrumentResolver::new(db.clone(), "NIFTY", 256265, RetryPolicy::default());
        (db, resolver)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
        }
    }

    fn seed_chain(db: &SqliteDb, expiry: NaiveDate, strikes: &[f64], base_token: i64) {
        let mut instruments = Vec::new();
        for (i, &strike) in strikes.iter().enumerate() {
            let token = base_token + (i as i64) * 2;
            instruments.push(option_instrument(token, strike, OptionType::Call, expiry));
            instruments.push(option_instrument(token + 1, strike, OptionType::Put, expiry));
        }
        db.upsert_instruments(&instruments).unwrap();
    }

    fn mid_session(date: NaiveDate) -> DateTime<Utc> {
        // 11:00 IST = 05:30 UTC
        Utc.from_utc_datetime(&date.and_hms_opt(5, 30, 0).unwrap())
    }

    #[test]
    fn test_nearest_strike_tie_breaks_lower() {
        let strikes = [19450.0, 19500.0, 19550.0];
        assert_eq!(nearest_strike(19500.0, &strikes), 19500.0);
        assert_eq!(nearest_strike(19520.0, &strikes), 19500.0);
        // Exactly equidistant between 19500 and 19550
        assert_eq!(nearest_strike(19525.0, &strikes), 19500.0);
        assert_eq!(nearest_strike(19400.0, &strikes), 19450.0);
        assert_eq!(nearest_strike(20000.0, &strikes), 19550.0);
    }

    #[test]
    fn test_resolves_atm_pair_for_both_cadences() {
        let (db, resolver) = setup();
        let weekly = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        let monthly = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        seed_chain(&db, weekly, &[19450.0, 19500.0, 19550.0], 1000);
        seed_chain(&db, monthly, &[19450.0, 19500.0, 19550.0], 2000);

        let now = mid_session(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let snap = resolver.evaluate(19500.0, now).unwrap();

        assert_eq!(snap.atm_strike, 19500.0);
        assert_eq!(snap.weekly.expiry, weekly);
        assert_eq!(snap.monthly.expiry, monthly);
        assert_eq!(snap.weekly.call_token, 1002);
        assert_eq!(snap.weekly.put_token, 1003);
        assert_eq!(snap.monthly.call_token, 2002);
        assert_eq!(snap.version, 1);
        // Baseline evaluation emits nothing
        assert!(db.list_strike_changes().unwrap().is_empty());
        assert!(db.list_expiry_changes().unwrap().is_empty());
    }

    #[test]
    fn test_strike_change_emitted_once_per_transition() {
        let (db, resolver) = setup();
        let weekly = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        seed_chain(&db, weekly, &[19450.0, 19500.0, 19550.0], 1000);

        let now = mid_session(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        resolver.evaluate(19500.0, now).unwrap();

        // Spot hovers across the midpoint without changing the resolution
        resolver.evaluate(19510.0, now).unwrap();
        resolver.evaluate(19520.0, now).unwrap();
        assert!(db.list_strike_changes().unwrap().is_empty());

        // Crosses to 19550
        resolver.evaluate(19540.0, now).unwrap();
        // Stays there, re-evaluated repeatedly with the same outcome
        resolver.evaluate(19545.0, now).unwrap();
        resolver.evaluate(19540.0, now).unwrap();

        // Back across to 19500
        resolver.evaluate(19510.0, now).unwrap();

        let events = db.list_strike_changes().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].old_strike, 19500.0);
        assert_eq!(events[0].new_strike, 19550.0);
        assert_eq!(events[1].old_strike, 19550.0);
        assert_eq!(events[1].new_strike, 19500.0);
    }

    #[test]
    fn test_expiry_rollover_emits_single_event_per_cadence() {
        let (db, resolver) = setup();
        let first = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        let second = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        seed_chain(&db, first, &[19500.0], 1000);
        seed_chain(&db, second, &[19500.0], 2000);

        // Before the 15:30 IST cutoff on expiry day both expiries are live
        let expiry_day_morning = mid_session(first);
        resolver.evaluate(19500.0, expiry_day_morning).unwrap();
        let snap = resolver.snapshot().unwrap();
        assert_eq!(snap.weekly.expiry, first);
        assert_eq!(snap.monthly.expiry, second);

        // After the cutoff the chain rolls to the next expiry
        let after_cutoff = Utc.from_utc_datetime(&first.and_hms_opt(10, 30, 0).unwrap());
        resolver.evaluate(19500.0, after_cutoff).unwrap();
        let snap = resolver.snapshot().unwrap();
        assert_eq!(snap.weekly.expiry, second);

        // Weekly rolled; monthly was already the 25th, so one event total
        let events = db.list_expiry_changes().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cadence, ExpiryCadence::Weekly);
        assert_eq!(events[0].old_expiry, first);
        assert_eq!(events[0].new_expiry, second);

        // Re-evaluation with unchanged inputs emits nothing further
        resolver.evaluate(19500.0, after_cutoff).unwrap();
        assert_eq!(db.list_expiry_changes().unwrap().len(), 1);
    }

    #[test]
    fn test_fallback_to_nearest_listed_pair() {
        let (db, resolver) = setup();
        let weekly = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        // 19550 lists only a call; no put pair exists there
        seed_chain(&db, weekly, &[19450.0, 19500.0], 1000);
        db.upsert_instruments(&[option_instrument(
            3000,
            19550.0,
            OptionType::Call,
            weekly,
        )])
        .unwrap();

        let now = mid_session(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        // ATM resolves to 19550 but only 19500 carries both legs
        let snap = resolver.evaluate(19560.0, now).unwrap();
        assert_eq!(snap.atm_strike, 19550.0);
        assert_eq!(snap.weekly.strike, 19500.0);
    }

    #[test]
    fn test_no_listed_pair_is_resolution_error() {
        let (db, resolver) = setup();
        let weekly = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        // Calls only, so no strike ever carries a pair
        db.upsert_instruments(&[option_instrument(
            3000,
            19500.0,
            OptionType::Call,
            weekly,
        )])
        .unwrap();

        let now = mid_session(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let result = resolver.evaluate(19500.0, now);
        assert!(matches!(result, Err(AppError::Resolution(_))));
    }

    #[test]
    fn test_storage_outage_surfaces_as_persistence() {
        let (db, _) = setup();
        let weekly = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        seed_chain(&db, weekly, &[19500.0], 1000);
        let resolver = InstrumentResolver::new(db.clone(), "NIFTY", 256265, fast_retry());

        // Hold the pool's only connection so every storage call times out
        let _held = db.test_conn().unwrap();

        let now = mid_session(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        let result = resolver.evaluate(19500.0, now);
        assert!(matches!(result, Err(AppError::Persistence(_))));
    }

    #[test]
    fn test_failed_event_write_does_not_duplicate_events() {
        let (db, resolver) = setup();
        let first = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        let second = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        seed_chain(&db, first, &[19500.0, 19550.0], 1000);
        seed_chain(&db, second, &[19500.0, 19550.0], 2000);

        // Baseline on expiry-day morning
        resolver.evaluate(19500.0, mid_session(first)).unwrap();

        // Break the expiry audit table so the second event insert fails
        db.test_conn()
            .unwrap()
            .execute_batch("ALTER TABLE expiry_changes RENAME TO expiry_changes_hidden")
            .unwrap();

        // After the cutoff with spot moved: strike change plus weekly
        // rollover. The strike event lands, the expiry event errors out.
        let after_cutoff = Utc.from_utc_datetime(&first.and_hms_opt(10, 30, 0).unwrap());
        assert!(resolver.evaluate(19560.0, after_cutoff).is_err());
        assert_eq!(db.list_strike_changes().unwrap().len(), 1);

        // State was published despite the failure: the same inputs resolve
        // identically and re-detect nothing
        db.test_conn()
            .unwrap()
            .execute_batch("ALTER TABLE expiry_changes_hidden RENAME TO expiry_changes")
            .unwrap();
        resolver.evaluate(19560.0, after_cutoff).unwrap();
        assert_eq!(db.list_strike_changes().unwrap().len(), 1);
        assert!(db.list_expiry_changes().unwrap().is_empty());
    }

    #[test]
    fn test_no_live_expiries_is_resolution_error() {
        let (_db, resolver) = setup();
        let now = mid_session(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert!(matches!(
            resolver.evaluate(19500.0, now),
            Err(AppError::Resolution(_))
        ));
    }
}
