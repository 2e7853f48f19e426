//! SQLite database module
//!
//! Storage interface for the engine. Append-only tables behind an r2d2
//! connection pool so concurrent ingest paths each get their own connection;
//! correctness under concurrent writers comes from the natural-key constraint
//! on `market_data`, not from locking.

pub mod models;
mod changes;
mod computed;
mod instruments;
mod market_data;
mod migrations;

use crate::error::Result;
use chrono::NaiveDate;
use models::*;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

/// SQLite database wrapper
pub struct SqliteDb {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteDb {
    /// Open (or create) the database and run migrations
    pub fn new(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            // WAL mode for concurrent readers alongside a writer
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
            )
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        let db = Self { pool };
        db.run_migrations()?;

        Ok(db)
    }

    /// In-memory database for tests
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self> {
        // A shared pool over :memory: would give each connection its own
        // database, so tests use a single-connection pool. The short checkout
        // timeout lets tests simulate a storage outage by holding the
        // connection.
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_millis(250))
            .build(manager)?;
        let db = Self { pool };
        db.run_migrations()?;
        Ok(db)
    }

    /// Raw pooled connection for test fixtures
    #[cfg(test)]
    pub(crate) fn test_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.pool.get()?;
        migrations::run_migrations(&conn)
    }

    // ========== Instrument Methods ==========

    /// Insert or update instruments by token
    pub fn upsert_instruments(&self, instruments: &[Instrument]) -> Result<()> {
        let mut conn = self.pool.get()?;
        instruments::upsert_instruments(&mut conn, instruments)
    }

    /// Get an instrument by token
    pub fn get_instrument(&self, token: i64) -> Result<Option<Instrument>> {
        let conn = self.pool.get()?;
        instruments::get_by_token(&conn, token)
    }

    /// Load all active instruments
    pub fn load_active_instruments(&self) -> Result<Vec<Instrument>> {
        let conn = self.pool.get()?;
        instruments::load_active(&conn)
    }

    /// Find a listed option for (underlying, strike, type, expiry)
    pub fn find_option(
        &self,
        name: &str,
        strike: f64,
        option_type: OptionType,
        expiry: NaiveDate,
    ) -> Result<Option<Instrument>> {
        let conn = self.pool.get()?;
        instruments::find_option(&conn, name, strike, option_type, expiry)
    }

    /// Distinct listed strikes for an underlying/expiry, ascending
    pub fn list_strikes(&self, name: &str, expiry: NaiveDate) -> Result<Vec<f64>> {
        let conn = self.pool.get()?;
        instruments::list_strikes(&conn, name, expiry)
    }

    /// Distinct active option expiries for an underlying, ascending
    pub fn list_expiries(&self, name: &str) -> Result<Vec<NaiveDate>> {
        let conn = self.pool.get()?;
        instruments::list_expiries(&conn, name)
    }

    /// Soft-deactivate an instrument
    pub fn deactivate_instrument(&self, token: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        instruments::deactivate(&conn, token)
    }

    /// Whether a token is known (active or not)
    pub fn instrument_exists(&self, token: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        instruments::token_exists(&conn, token)
    }

    // ========== Market Data Methods ==========

    /// Insert a tick; false means the natural key already existed
    pub fn insert_tick(&self, point: &MarketDataPoint) -> Result<bool> {
        let conn = self.pool.get()?;
        market_data::insert_tick(&conn, point)
    }

    /// Latest tick for an instrument by server receipt timestamp
    pub fn latest_tick(&self, token: i64) -> Result<Option<MarketDataPoint>> {
        let conn = self.pool.get()?;
        market_data::latest_tick(&conn, token)
    }

    /// Latest tick for a trading symbol by server receipt timestamp
    pub fn latest_by_symbol(&self, symbol: &str) -> Result<Option<MarketDataPoint>> {
        let conn = self.pool.get()?;
        market_data::latest_by_symbol(&conn, symbol)
    }

    /// Number of stored ticks for an instrument
    pub fn tick_count(&self, token: i64) -> Result<i64> {
        let conn = self.pool.get()?;
        market_data::tick_count(&conn, token)
    }

    // ========== Computed Snapshot Methods ==========

    /// Append one computed snapshot
    pub fn insert_snapshot(&self, snap: &ComputedSnapshot) -> Result<()> {
        let conn = self.pool.get()?;
        computed::insert_snapshot(&conn, snap)
    }

    /// Most recent snapshot by calculation timestamp
    pub fn current_snapshot(&self) -> Result<Option<ComputedSnapshot>> {
        let conn = self.pool.get()?;
        computed::current_snapshot(&conn)
    }

    /// Total number of stored snapshots
    pub fn snapshot_count(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        computed::snapshot_count(&conn)
    }

    // ========== Change Event Methods ==========

    /// Record an ATM strike transition
    pub fn insert_strike_change(&self, event: &StrikeChangeEvent) -> Result<()> {
        let conn = self.pool.get()?;
        changes::insert_strike_change(&conn, event)
    }

    /// Record an expiry rollover
    pub fn insert_expiry_change(&self, event: &ExpiryChangeEvent) -> Result<()> {
        let conn = self.pool.get()?;
        changes::insert_expiry_change(&conn, event)
    }

    /// All strike changes, oldest first
    pub fn list_strike_changes(&self) -> Result<Vec<StrikeChangeEvent>> {
        let conn = self.pool.get()?;
        changes::list_strike_changes(&conn)
    }

    /// All expiry changes, oldest first
    pub fn list_expiry_changes(&self) -> Result<Vec<ExpiryChangeEvent>> {
        let conn = self.pool.get()?;
        changes::list_expiry_changes(&conn)
    }

    // ========== Fetch Log Methods ==========

    /// Record a bulk fetch outcome
    pub fn insert_fetch_log(&self, log: &FetchLog) -> Result<()> {
        let conn = self.pool.get()?;
        changes::insert_fetch_log(&conn, log)
    }

    /// Fetch logs for a symbol, newest first
    pub fn list_fetch_logs(&self, symbol: &str) -> Result<Vec<FetchLog>> {
        let conn = self.pool.get()?;
        changes::list_fetch_logs(&conn, symbol)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carrytrack.db");

        let db = SqliteDb::new(&path).unwrap();
        drop(db);
        // Reopening re-runs the migration pass against applied migrations
        let db = SqliteDb::new(&path).unwrap();
        assert_eq!(db.snapshot_count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_tick_is_ignored_not_overwritten() {
        let db = SqliteDb::new_in_memory().unwrap();
        db.upsert_instruments(&[spot_instrument(256265)]).unwrap();

        let ts = Utc.with_ymd_and_hms(2024, 1, 25, 9, 15, 0).unwrap();
        assert!(db.insert_tick(&tick(256265, 19500.0, ts)).unwrap());

        // Same natural key, different LTP: rejected, first row wins
        assert!(!db.insert_tick(&tick(256265, 19510.0, ts)).unwrap());

        assert_eq!(db.tick_count(256265).unwrap(), 1);
        let stored = db.latest_tick(256265).unwrap().unwrap();
        assert_eq!(stored.ltp, 19500.0);
    }

    #[test]
    fn test_latest_tick_by_receipt_timestamp() {
        let db = SqliteDb::new_in_memory().unwrap();
        db.upsert_instruments(&[spot_instrument(256265)]).unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 1, 25, 9, 15, 0).unwrap();
        db.insert_tick(&tick(256265, 19500.0, t0)).unwrap();
        db.insert_tick(&tick(256265, 19520.0, t0 + Duration::seconds(2)))
            .unwrap();
        // Late arrival: older exchange timestamp, newest receipt
        let mut late = tick(256265, 19490.0, t0 + Duration::seconds(1));
        late.received_at = t0 + Duration::seconds(10);
        db.insert_tick(&late).unwrap();

        let latest = db.latest_tick(256265).unwrap().unwrap();
        assert_eq!(latest.ltp, 19490.0);
    }

    #[test]
    fn test_latest_by_symbol_uses_receipt_timestamp() {
        let db = SqliteDb::new_in_memory().unwrap();
        db.upsert_instruments(&[spot_instrument(256265)]).unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 1, 25, 9, 15, 0).unwrap();
        let mut early = tick(256265, 19500.0, t0);
        early.received_at = t0 + Duration::seconds(10); // arrived late
        let mut later = tick(256265, 19520.0, t0 + Duration::seconds(5));
        later.received_at = t0 + Duration::seconds(5);

        db.insert_tick(&early).unwrap();
        db.insert_tick(&later).unwrap();

        // Ordering by server receipt: the late-arriving older tick is newest
        let latest = db.latest_by_symbol("NIFTY 50").unwrap().unwrap();
        assert_eq!(latest.ltp, 19500.0);
    }

    #[test]
    fn test_upsert_rejects_malformed_instruments() {
        let db = SqliteDb::new_in_memory().unwrap();

        let mut bad = spot_instrument(1);
        bad.strike = Some(19500.0);
        assert!(db.upsert_instruments(&[bad]).is_err());
        assert!(!db.instrument_exists(1).unwrap());
    }

    #[test]
    fn test_soft_deactivation_keeps_row() {
        let db = SqliteDb::new_in_memory().unwrap();
        let expiry = chrono::NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        db.upsert_instruments(&[option_instrument(
            1001,
            19500.0,
            OptionType::Call,
            expiry,
        )])
        .unwrap();

        assert!(db.deactivate_instrument(1001).unwrap());
        assert!(db.instrument_exists(1001).unwrap());
        assert!(db
            .find_option("NIFTY", 19500.0, OptionType::Call, expiry)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_current_snapshot_is_most_recent_by_computed_at() {
        let db = SqliteDb::new_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 25, 10, 0, 0).unwrap();
        let expiry = chrono::NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();

        let base = ComputedSnapshot {
            spot_price: 19500.0,
            atm_strike: 19500.0,
            weekly_expiry: expiry,
            monthly_expiry: expiry,
            weekly_call_price: 120.0,
            weekly_put_price: 95.0,
            monthly_call_price: 210.0,
            monthly_put_price: 150.0,
            weekly_call_iv: Some(0.14),
            weekly_put_iv: None,
            monthly_call_iv: Some(0.15),
            monthly_put_iv: Some(0.16),
            weekly_synthetic_future: 19525.0,
            monthly_synthetic_future: 19560.0,
            weekly_cost_of_carry: Some(6.7),
            monthly_cost_of_carry: Some(3.7),
            calendar_spread: Some(-3.0),
            weekly_call_premium: 120.0,
            weekly_put_premium: 95.0,
            monthly_call_premium: 210.0,
            monthly_put_premium: 150.0,
            computed_at: t0,
            market_timestamp: t0,
        };
        db.insert_snapshot(&base).unwrap();

        let mut newer = base.clone();
        newer.spot_price = 19540.0;
        newer.computed_at = t0 + Duration::seconds(30);
        db.insert_snapshot(&newer).unwrap();

        assert_eq!(db.snapshot_count().unwrap(), 2);
        let current = db.current_snapshot().unwrap().unwrap();
        assert_eq!(current.spot_price, 19540.0);
        assert_eq!(current.weekly_put_iv, None);
    }

    #[test]
    fn test_change_event_roundtrip() {
        let db = SqliteDb::new_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 25, 10, 0, 0).unwrap();

        db.insert_strike_change(&StrikeChangeEvent {
            old_strike: 19500.0,
            new_strike: 19550.0,
            spot_price: 19532.0,
            changed_at: now,
        })
        .unwrap();

        db.insert_expiry_change(&ExpiryChangeEvent {
            cadence: ExpiryCadence::Weekly,
            old_expiry: chrono::NaiveDate::from_ymd_opt(2024, 1, 25).unwrap(),
            new_expiry: chrono::NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            reason: "expiry day rollover".into(),
            changed_at: now,
        })
        .unwrap();

        let strikes = db.list_strike_changes().unwrap();
        assert_eq!(strikes.len(), 1);
        assert_eq!(strikes[0].new_strike, 19550.0);

        let expiries = db.list_expiry_changes().unwrap();
        assert_eq!(expiries.len(), 1);
        assert_eq!(expiries[0].cadence, ExpiryCadence::Weekly);
    }
}
