//! Instrument master queries
//!
//! Instruments are keyed by the exchange-assigned token, which is immutable
//! once assigned. Rows are never deleted; deactivation is a soft flag so
//! historical market data keeps a valid referent.

use crate::db::models::{fmt_ts, Instrument, InstrumentType, OptionType};
use crate::error::{AppError, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const EXPIRY_FMT: &str = "%Y-%m-%d";

const SELECT_COLS: &str =
    "token, symbol, name, exchange, segment, instrument_type, strike, option_type, expiry, \
     lot_size, tick_size, active";

fn decode(row: &Row<'_>) -> Result<Instrument> {
    let instrument_type: String = row.get(5)?;
    let option_type: Option<String> = row.get(7)?;
    let expiry: Option<String> = row.get(8)?;

    Ok(Instrument {
        token: row.get(0)?,
        symbol: row.get(1)?,
        name: row.get(2)?,
        exchange: row.get(3)?,
        segment: row.get(4)?,
        instrument_type: InstrumentType::parse(&instrument_type)?,
        strike: row.get(6)?,
        option_type: option_type.as_deref().map(OptionType::parse).transpose()?,
        expiry: expiry
            .as_deref()
            .map(|s| {
                NaiveDate::parse_from_str(s, EXPIRY_FMT)
                    .map_err(|e| AppError::Validation(format!("Bad expiry '{}': {}", s, e)))
            })
            .transpose()?,
        lot_size: row.get(9)?,
        tick_size: row.get(10)?,
        active: row.get(11)?,
    })
}

/// Insert or update instruments by token. Validates the shape invariant
/// before touching the database.
pub fn upsert_instruments(conn: &mut Connection, instruments: &[Instrument]) -> Result<()> {
    for inst in instruments {
        inst.validate()?;
    }

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            r#"
            INSERT INTO instruments
                (token, symbol, name, exchange, segment, instrument_type,
                 strike, option_type, expiry, lot_size, tick_size, active, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(token) DO UPDATE SET
                symbol = excluded.symbol,
                name = excluded.name,
                exchange = excluded.exchange,
                segment = excluded.segment,
                instrument_type = excluded.instrument_type,
                strike = excluded.strike,
                option_type = excluded.option_type,
                expiry = excluded.expiry,
                lot_size = excluded.lot_size,
                tick_size = excluded.tick_size,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )?;

        let now = fmt_ts(Utc::now());
        for inst in instruments {
            stmt.execute(params![
                inst.token,
                inst.symbol,
                inst.name,
                inst.exchange,
                inst.segment,
                inst.instrument_type.as_str(),
                inst.strike,
                inst.option_type.map(|o| o.as_str()),
                inst.expiry.map(|d| d.format(EXPIRY_FMT).to_string()),
                inst.lot_size,
                inst.tick_size,
                inst.active,
                now,
            ])?;
        }
    }
    tx.commit()?;

    tracing::info!("Upserted {} instruments", instruments.len());
    Ok(())
}

/// Get an instrument by token
pub fn get_by_token(conn: &Connection, token: i64) -> Result<Option<Instrument>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM instruments WHERE token = ?1",
        SELECT_COLS
    ))?;

    let mut rows = stmt.query(params![token])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode(row)?)),
        None => Ok(None),
    }
}

/// Load all active instruments (startup cache fill)
pub fn load_active(conn: &Connection) -> Result<Vec<Instrument>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM instruments WHERE active = 1",
        SELECT_COLS
    ))?;

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(decode(row)?);
    }
    Ok(out)
}

/// Find the listed option instrument for (underlying, strike, type, expiry)
pub fn find_option(
    conn: &Connection,
    name: &str,
    strike: f64,
    option_type: OptionType,
    expiry: NaiveDate,
) -> Result<Option<Instrument>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {} FROM instruments
        WHERE name = ?1 AND instrument_type = 'OPTION'
          AND strike = ?2 AND option_type = ?3 AND expiry = ?4 AND active = 1
        "#,
        SELECT_COLS
    ))?;

    let mut rows = stmt.query(params![
        name,
        strike,
        option_type.as_str(),
        expiry.format(EXPIRY_FMT).to_string()
    ])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode(row)?)),
        None => Ok(None),
    }
}

/// Distinct listed strikes for an underlying/expiry, ascending
pub fn list_strikes(conn: &Connection, name: &str, expiry: NaiveDate) -> Result<Vec<f64>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT DISTINCT strike FROM instruments
        WHERE name = ?1 AND instrument_type = 'OPTION' AND expiry = ?2
          AND strike IS NOT NULL AND active = 1
        ORDER BY strike
        "#,
    )?;

    let strikes = stmt
        .query_map(params![name, expiry.format(EXPIRY_FMT).to_string()], |row| {
            row.get(0)
        })?
        .collect::<std::result::Result<Vec<f64>, _>>()?;

    Ok(strikes)
}

/// Distinct active option expiries for an underlying, ascending
pub fn list_expiries(conn: &Connection, name: &str) -> Result<Vec<NaiveDate>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT DISTINCT expiry FROM instruments
        WHERE name = ?1 AND instrument_type = 'OPTION'
          AND expiry IS NOT NULL AND active = 1
        ORDER BY expiry
        "#,
    )?;

    let raw: Vec<String> = stmt
        .query_map(params![name], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    raw.iter()
        .map(|s| {
            NaiveDate::parse_from_str(s, EXPIRY_FMT)
                .map_err(|e| AppError::Validation(format!("Bad expiry '{}': {}", s, e)))
        })
        .collect()
}

/// Soft-deactivate an instrument. Historical rows keep their referent.
pub fn deactivate(conn: &Connection, token: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE instruments SET active = 0, updated_at = ?1 WHERE token = ?2",
        params![fmt_ts(Utc::now()), token],
    )?;
    Ok(rows > 0)
}

/// Check whether a token exists at all (active or not)
pub fn token_exists(conn: &Connection, token: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT token FROM instruments WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
