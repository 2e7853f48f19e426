//! Market data storage
//!
//! Append-only tick snapshots. The natural key is
//! (instrument_token, exchange_timestamp): a retry of the same tick is a
//! no-op, and two conflicting payloads for the same key keep the first row.

use crate::db::models::{fmt_ts, parse_ts, MarketDataPoint};
use crate::error::Result;
use rusqlite::{params, Connection, Row};

const SELECT_COLS: &str =
    "instrument_token, ltp, open, high, low, close, volume, oi, \
     bid_price, bid_qty, ask_price, ask_qty, exchange_timestamp, received_at";

fn decode(row: &Row<'_>) -> Result<MarketDataPoint> {
    let exchange_timestamp: String = row.get(12)?;
    let received_at: String = row.get(13)?;

    Ok(MarketDataPoint {
        instrument_token: row.get(0)?,
        ltp: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume: row.get(6)?,
        oi: row.get(7)?,
        bid_price: row.get(8)?,
        bid_qty: row.get(9)?,
        ask_price: row.get(10)?,
        ask_qty: row.get(11)?,
        exchange_timestamp: parse_ts(&exchange_timestamp)?,
        received_at: parse_ts(&received_at)?,
    })
}

/// Insert a tick. Returns false when the natural key already exists
/// (duplicate or out-of-order retry), true when a row was written.
pub fn insert_tick(conn: &Connection, point: &MarketDataPoint) -> Result<bool> {
    let rows = conn.execute(
        r#"
        INSERT OR IGNORE INTO market_data
            (instrument_token, ltp, open, high, low, close, volume, oi,
             bid_price, bid_qty, ask_price, ask_qty, exchange_timestamp, received_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            point.instrument_token,
            point.ltp,
            point.open,
            point.high,
            point.low,
            point.close,
            point.volume,
            point.oi,
            point.bid_price,
            point.bid_qty,
            point.ask_price,
            point.ask_qty,
            fmt_ts(point.exchange_timestamp),
            fmt_ts(point.received_at),
        ],
    )?;

    Ok(rows > 0)
}

/// Latest tick for an instrument by server receipt timestamp.
///
/// Receipt ordering means a late-arriving tick is always the freshest view,
/// even when its exchange timestamp is older than a row already stored.
pub fn latest_tick(conn: &Connection, token: i64) -> Result<Option<MarketDataPoint>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {} FROM market_data
        WHERE instrument_token = ?1
        ORDER BY received_at DESC
        LIMIT 1
        "#,
        SELECT_COLS
    ))?;

    let mut rows = stmt.query(params![token])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode(row)?)),
        None => Ok(None),
    }
}

/// Latest tick for a trading symbol by server receipt timestamp.
///
/// Same ordering semantics as the `latest_market_data` view this replaces.
pub fn latest_by_symbol(conn: &Connection, symbol: &str) -> Result<Option<MarketDataPoint>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT m.instrument_token, m.ltp, m.open, m.high, m.low, m.close, m.volume, m.oi,
               m.bid_price, m.bid_qty, m.ask_price, m.ask_qty, m.exchange_timestamp, m.received_at
        FROM market_data m
        INNER JOIN instruments i ON i.token = m.instrument_token
        WHERE i.symbol = ?1
        ORDER BY m.received_at DESC
        LIMIT 1
        "#,
    )?;

    let mut rows = stmt.query(params![symbol])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode(row)?)),
        None => Ok(None),
    }
}

/// Number of stored ticks for an instrument
pub fn tick_count(conn: &Connection, token: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM market_data WHERE instrument_token = ?1",
        params![token],
        |row| row.get(0),
    )?;
    Ok(count)
}
