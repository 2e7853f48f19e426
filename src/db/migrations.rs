//! SQLite database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Create migrations table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    run_migration(conn, "001_instruments", CREATE_INSTRUMENTS_TABLE)?;
    run_migration(conn, "002_market_data", CREATE_MARKET_DATA_TABLE)?;
    run_migration(conn, "003_computed_data", CREATE_COMPUTED_DATA_TABLE)?;
    run_migration(conn, "004_strike_changes", CREATE_STRIKE_CHANGES_TABLE)?;
    run_migration(conn, "005_expiry_changes", CREATE_EXPIRY_CHANGES_TABLE)?;
    run_migration(conn, "006_data_fetch_logs", CREATE_DATA_FETCH_LOGS_TABLE)?;

    tracing::info!("Database migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    // Check if migration already applied
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

const CREATE_INSTRUMENTS_TABLE: &str = r#"
CREATE TABLE instruments (
    token INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    exchange TEXT NOT NULL,
    segment TEXT NOT NULL,
    instrument_type TEXT NOT NULL,
    strike REAL,
    option_type TEXT,
    expiry TEXT,
    lot_size INTEGER NOT NULL DEFAULT 1,
    tick_size REAL NOT NULL DEFAULT 0.05,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(exchange, symbol)
);
CREATE INDEX IF NOT EXISTS idx_instruments_name ON instruments(name);
CREATE INDEX IF NOT EXISTS idx_instruments_chain
    ON instruments(name, instrument_type, expiry, strike);
"#;

const CREATE_MARKET_DATA_TABLE: &str = r#"
CREATE TABLE market_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument_token INTEGER NOT NULL REFERENCES instruments(token),
    ltp REAL NOT NULL,
    open REAL NOT NULL DEFAULT 0,
    high REAL NOT NULL DEFAULT 0,
    low REAL NOT NULL DEFAULT 0,
    close REAL NOT NULL DEFAULT 0,
    volume INTEGER NOT NULL DEFAULT 0,
    oi INTEGER NOT NULL DEFAULT 0,
    bid_price REAL NOT NULL DEFAULT 0,
    bid_qty INTEGER NOT NULL DEFAULT 0,
    ask_price REAL NOT NULL DEFAULT 0,
    ask_qty INTEGER NOT NULL DEFAULT 0,
    exchange_timestamp TEXT NOT NULL,
    received_at TEXT NOT NULL,
    UNIQUE(instrument_token, exchange_timestamp)
);
CREATE INDEX IF NOT EXISTS idx_market_data_token_ts
    ON market_data(instrument_token, exchange_timestamp);
CREATE INDEX IF NOT EXISTS idx_market_data_token_received
    ON market_data(instrument_token, received_at);
"#;

const CREATE_COMPUTED_DATA_TABLE: &str = r#"
CREATE TABLE computed_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    spot_price REAL NOT NULL,
    atm_strike REAL NOT NULL,
    weekly_expiry TEXT NOT NULL,
    monthly_expiry TEXT NOT NULL,
    weekly_call_price REAL NOT NULL,
    weekly_put_price REAL NOT NULL,
    monthly_call_price REAL NOT NULL,
    monthly_put_price REAL NOT NULL,
    weekly_call_iv REAL,
    weekly_put_iv REAL,
    monthly_call_iv REAL,
    monthly_put_iv REAL,
    weekly_synthetic_future REAL NOT NULL,
    monthly_synthetic_future REAL NOT NULL,
    weekly_cost_of_carry REAL,
    monthly_cost_of_carry REAL,
    calendar_spread REAL,
    weekly_call_premium REAL NOT NULL,
    weekly_put_premium REAL NOT NULL,
    monthly_call_premium REAL NOT NULL,
    monthly_put_premium REAL NOT NULL,
    computed_at TEXT NOT NULL,
    market_timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_computed_data_at ON computed_data(computed_at);
"#;

const CREATE_STRIKE_CHANGES_TABLE: &str = r#"
CREATE TABLE strike_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    old_strike REAL NOT NULL,
    new_strike REAL NOT NULL,
    spot_price REAL NOT NULL,
    changed_at TEXT NOT NULL
);
"#;

const CREATE_EXPIRY_CHANGES_TABLE: &str = r#"
CREATE TABLE expiry_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cadence TEXT NOT NULL,
    old_expiry TEXT NOT NULL,
    new_expiry TEXT NOT NULL,
    reason TEXT NOT NULL,
    changed_at TEXT NOT NULL
);
"#;

const CREATE_DATA_FETCH_LOGS_TABLE: &str = r#"
CREATE TABLE data_fetch_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    from_ts TEXT NOT NULL,
    to_ts TEXT NOT NULL,
    record_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);
"#;
