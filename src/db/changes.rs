//! Change event and fetch log storage
//!
//! Append-only audit tables. Every write is a single insert so a crash
//! leaves either a complete record or nothing.

use crate::db::models::{
    fmt_ts, parse_ts, ExpiryCadence, ExpiryChangeEvent, FetchLog, FetchStatus, StrikeChangeEvent,
};
use crate::error::{AppError, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection};

const EXPIRY_FMT: &str = "%Y-%m-%d";

/// Record an ATM strike transition
pub fn insert_strike_change(conn: &Connection, event: &StrikeChangeEvent) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO strike_changes (old_strike, new_strike, spot_price, changed_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            event.old_strike,
            event.new_strike,
            event.spot_price,
            fmt_ts(event.changed_at),
        ],
    )?;
    Ok(())
}

/// Record an expiry rollover
pub fn insert_expiry_change(conn: &Connection, event: &ExpiryChangeEvent) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO expiry_changes (cadence, old_expiry, new_expiry, reason, changed_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            event.cadence.as_str(),
            event.old_expiry.format(EXPIRY_FMT).to_string(),
            event.new_expiry.format(EXPIRY_FMT).to_string(),
            event.reason,
            fmt_ts(event.changed_at),
        ],
    )?;
    Ok(())
}

/// All strike changes, oldest first
pub fn list_strike_changes(conn: &Connection) -> Result<Vec<StrikeChangeEvent>> {
    let mut stmt = conn.prepare(
        "SELECT old_strike, new_strike, spot_price, changed_at FROM strike_changes ORDER BY id",
    )?;

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let changed_at: String = row.get(3)?;
        out.push(StrikeChangeEvent {
            old_strike: row.get(0)?,
            new_strike: row.get(1)?,
            spot_price: row.get(2)?,
            changed_at: parse_ts(&changed_at)?,
        });
    }
    Ok(out)
}

/// All expiry changes, oldest first
pub fn list_expiry_changes(conn: &Connection) -> Result<Vec<ExpiryChangeEvent>> {
    let mut stmt = conn.prepare(
        "SELECT cadence, old_expiry, new_expiry, reason, changed_at FROM expiry_changes ORDER BY id",
    )?;

    let parse_date = |s: &str| {
        NaiveDate::parse_from_str(s, EXPIRY_FMT)
            .map_err(|e| AppError::Validation(format!("Bad expiry '{}': {}", s, e)))
    };

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let cadence: String = row.get(0)?;
        let old_expiry: String = row.get(1)?;
        let new_expiry: String = row.get(2)?;
        let changed_at: String = row.get(4)?;
        out.push(ExpiryChangeEvent {
            cadence: ExpiryCadence::parse(&cadence)?,
            old_expiry: parse_date(&old_expiry)?,
            new_expiry: parse_date(&new_expiry)?,
            reason: row.get(3)?,
            changed_at: parse_ts(&changed_at)?,
        });
    }
    Ok(out)
}

/// Record a bulk fetch outcome
pub fn insert_fetch_log(conn: &Connection, log: &FetchLog) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO data_fetch_logs (symbol, from_ts, to_ts, record_count, status, error, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            log.symbol,
            fmt_ts(log.from_ts),
            fmt_ts(log.to_ts),
            log.record_count,
            log.status.as_str(),
            log.error,
            fmt_ts(log.created_at),
        ],
    )?;
    Ok(())
}

/// Fetch logs for a symbol, newest first
pub fn list_fetch_logs(conn: &Connection, symbol: &str) -> Result<Vec<FetchLog>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT symbol, from_ts, to_ts, record_count, status, error, created_at
        FROM data_fetch_logs WHERE symbol = ?1 ORDER BY id DESC
        "#,
    )?;

    let mut rows = stmt.query(params![symbol])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let from_ts: String = row.get(1)?;
        let to_ts: String = row.get(2)?;
        let status: String = row.get(4)?;
        let created_at: String = row.get(6)?;
        out.push(FetchLog {
            symbol: row.get(0)?,
            from_ts: parse_ts(&from_ts)?,
            to_ts: parse_ts(&to_ts)?,
            record_count: row.get(3)?,
            status: FetchStatus::parse(&status)?,
            error: row.get(5)?,
            created_at: parse_ts(&created_at)?,
        });
    }
    Ok(out)
}
