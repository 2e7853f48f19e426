//! Computed snapshot storage
//!
//! One append-only row per computation cycle. The "current" snapshot is the
//! most recent row by calculation timestamp, replacing the
//! `current_computed_data` view.

use crate::db::models::{fmt_ts, parse_ts, ComputedSnapshot};
use crate::error::{AppError, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, Row};

const EXPIRY_FMT: &str = "%Y-%m-%d";

fn decode(row: &Row<'_>) -> Result<ComputedSnapshot> {
    let weekly_expiry: String = row.get(2)?;
    let monthly_expiry: String = row.get(3)?;
    let computed_at: String = row.get(21)?;
    let market_timestamp: String = row.get(22)?;

    let parse_date = |s: &str| {
        NaiveDate::parse_from_str(s, EXPIRY_FMT)
            .map_err(|e| AppError::Validation(format!("Bad expiry '{}': {}", s, e)))
    };

    Ok(ComputedSnapshot {
        spot_price: row.get(0)?,
        atm_strike: row.get(1)?,
        weekly_expiry: parse_date(&weekly_expiry)?,
        monthly_expiry: parse_date(&monthly_expiry)?,
        weekly_call_price: row.get(4)?,
        weekly_put_price: row.get(5)?,
        monthly_call_price: row.get(6)?,
        monthly_put_price: row.get(7)?,
        weekly_call_iv: row.get(8)?,
        weekly_put_iv: row.get(9)?,
        monthly_call_iv: row.get(10)?,
        monthly_put_iv: row.get(11)?,
        weekly_synthetic_future: row.get(12)?,
        monthly_synthetic_future: row.get(13)?,
        weekly_cost_of_carry: row.get(14)?,
        monthly_cost_of_carry: row.get(15)?,
        calendar_spread: row.get(16)?,
        weekly_call_premium: row.get(17)?,
        weekly_put_premium: row.get(18)?,
        monthly_call_premium: row.get(19)?,
        monthly_put_premium: row.get(20)?,
        computed_at: parse_ts(&computed_at)?,
        market_timestamp: parse_ts(&market_timestamp)?,
    })
}

/// Append one snapshot. Single atomic insert, prior rows are never touched.
pub fn insert_snapshot(conn: &Connection, snap: &ComputedSnapshot) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO computed_data
            (spot_price, atm_strike, weekly_expiry, monthly_expiry,
             weekly_call_price, weekly_put_price, monthly_call_price, monthly_put_price,
             weekly_call_iv, weekly_put_iv, monthly_call_iv, monthly_put_iv,
             weekly_synthetic_future, monthly_synthetic_future,
             weekly_cost_of_carry, monthly_cost_of_carry, calendar_spread,
             weekly_call_premium, weekly_put_premium, monthly_call_premium, monthly_put_premium,
             computed_at, market_timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
        "#,
        params![
            snap.spot_price,
            snap.atm_strike,
            snap.weekly_expiry.format(EXPIRY_FMT).to_string(),
            snap.monthly_expiry.format(EXPIRY_FMT).to_string(),
            snap.weekly_call_price,
            snap.weekly_put_price,
            snap.monthly_call_price,
            snap.monthly_put_price,
            snap.weekly_call_iv,
            snap.weekly_put_iv,
            snap.monthly_call_iv,
            snap.monthly_put_iv,
            snap.weekly_synthetic_future,
            snap.monthly_synthetic_future,
            snap.weekly_cost_of_carry,
            snap.monthly_cost_of_carry,
            snap.calendar_spread,
            snap.weekly_call_premium,
            snap.weekly_put_premium,
            snap.monthly_call_premium,
            snap.monthly_put_premium,
            fmt_ts(snap.computed_at),
            fmt_ts(snap.market_timestamp),
        ],
    )?;

    Ok(())
}

const SELECT_COLS: &str =
    "spot_price, atm_strike, weekly_expiry, monthly_expiry, \
     weekly_call_price, weekly_put_price, monthly_call_price, monthly_put_price, \
     weekly_call_iv, weekly_put_iv, monthly_call_iv, monthly_put_iv, \
     weekly_synthetic_future, monthly_synthetic_future, \
     weekly_cost_of_carry, monthly_cost_of_carry, calendar_spread, \
     weekly_call_premium, weekly_put_premium, monthly_call_premium, monthly_put_premium, \
     computed_at, market_timestamp";

/// Most recent snapshot by calculation timestamp
pub fn current_snapshot(conn: &Connection) -> Result<Option<ComputedSnapshot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM computed_data ORDER BY computed_at DESC LIMIT 1",
        SELECT_COLS
    ))?;

    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode(row)?)),
        None => Ok(None),
    }
}

/// Total number of stored snapshots
pub fn snapshot_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM computed_data", [], |row| row.get(0))?;
    Ok(count)
}
