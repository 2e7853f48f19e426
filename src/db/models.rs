//! Database models

use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Instrument kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentType {
    Spot,
    Future,
    Option,
}

impl InstrumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Spot => "SPOT",
            InstrumentType::Future => "FUTURE",
            InstrumentType::Option => "OPTION",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SPOT" => Ok(InstrumentType::Spot),
            "FUTURE" => Ok(InstrumentType::Future),
            "OPTION" => Ok(InstrumentType::Option),
            other => Err(AppError::Validation(format!(
                "Unknown instrument type: {}",
                other
            ))),
        }
    }
}

/// Option side (exchange notation: CE = call, PE = put)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "CE",
            OptionType::Put => "PE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "CE" => Ok(OptionType::Call),
            "PE" => Ok(OptionType::Put),
            other => Err(AppError::Validation(format!(
                "Unknown option type: {}",
                other
            ))),
        }
    }
}

/// Instrument master entry
///
/// The token is assigned by the exchange, globally unique and immutable.
/// Options carry strike, option type and expiry; spot and futures must not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub token: i64,
    pub symbol: String,
    /// Underlying name, e.g. "NIFTY"
    pub name: String,
    pub exchange: String,
    pub segment: String,
    pub instrument_type: InstrumentType,
    pub strike: Option<f64>,
    pub option_type: Option<OptionType>,
    pub expiry: Option<NaiveDate>,
    pub lot_size: i32,
    pub tick_size: f64,
    pub active: bool,
}

impl Instrument {
    /// Enforce the shape invariant before any write.
    pub fn validate(&self) -> Result<()> {
        if self.token <= 0 {
            return Err(AppError::Validation(format!(
                "Instrument token must be positive: {}",
                self.token
            )));
        }
        match self.instrument_type {
            InstrumentType::Option => {
                if self.strike.is_none() || self.option_type.is_none() || self.expiry.is_none() {
                    return Err(AppError::Validation(format!(
                        "Option {} must carry strike, option type and expiry",
                        self.symbol
                    )));
                }
            }
            InstrumentType::Spot | InstrumentType::Future => {
                if self.strike.is_some() || self.option_type.is_some() {
                    return Err(AppError::Validation(format!(
                        "Non-option {} must not carry strike or option type",
                        self.symbol
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Immutable tick snapshot, natural key (instrument_token, exchange_timestamp)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataPoint {
    pub instrument_token: i64,
    pub ltp: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub oi: i64,
    pub bid_price: f64,
    pub bid_qty: i64,
    pub ask_price: f64,
    pub ask_qty: i64,
    pub exchange_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// One row per computation cycle, never overwritten
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedSnapshot {
    pub spot_price: f64,
    pub atm_strike: f64,
    pub weekly_expiry: NaiveDate,
    pub monthly_expiry: NaiveDate,
    pub weekly_call_price: f64,
    pub weekly_put_price: f64,
    pub monthly_call_price: f64,
    pub monthly_put_price: f64,
    pub weekly_call_iv: Option<f64>,
    pub weekly_put_iv: Option<f64>,
    pub monthly_call_iv: Option<f64>,
    pub monthly_put_iv: Option<f64>,
    pub weekly_synthetic_future: f64,
    pub monthly_synthetic_future: f64,
    /// Annualized, in percent; None when time-to-expiry is at or below zero
    pub weekly_cost_of_carry: Option<f64>,
    pub monthly_cost_of_carry: Option<f64>,
    pub calendar_spread: Option<f64>,
    pub weekly_call_premium: f64,
    pub weekly_put_premium: f64,
    pub monthly_call_premium: f64,
    pub monthly_put_premium: f64,
    pub computed_at: DateTime<Utc>,
    /// Exchange timestamp of the spot tick the cycle was computed from
    pub market_timestamp: DateTime<Utc>,
}

/// Audit record of an ATM strike transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrikeChangeEvent {
    pub old_strike: f64,
    pub new_strike: f64,
    pub spot_price: f64,
    pub changed_at: DateTime<Utc>,
}

/// Expiry cadence for change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpiryCadence {
    Weekly,
    Monthly,
}

impl ExpiryCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryCadence::Weekly => "WEEKLY",
            ExpiryCadence::Monthly => "MONTHLY",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "WEEKLY" => Ok(ExpiryCadence::Weekly),
            "MONTHLY" => Ok(ExpiryCadence::Monthly),
            other => Err(AppError::Validation(format!(
                "Unknown expiry cadence: {}",
                other
            ))),
        }
    }
}

/// Audit record of an expiry rollover
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryChangeEvent {
    pub cadence: ExpiryCadence,
    pub old_expiry: NaiveDate,
    pub new_expiry: NaiveDate,
    pub reason: String,
    pub changed_at: DateTime<Utc>,
}

/// Bulk fetch outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchStatus {
    Success,
    Failed,
    Partial,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Success => "SUCCESS",
            FetchStatus::Failed => "FAILED",
            FetchStatus::Partial => "PARTIAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(FetchStatus::Success),
            "FAILED" => Ok(FetchStatus::Failed),
            "PARTIAL" => Ok(FetchStatus::Partial),
            other => Err(AppError::Validation(format!(
                "Unknown fetch status: {}",
                other
            ))),
        }
    }
}

/// Audit record of a bulk historical-data fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchLog {
    pub symbol: String,
    pub from_ts: DateTime<Utc>,
    pub to_ts: DateTime<Utc>,
    pub record_count: i64,
    pub status: FetchStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Timestamp storage helpers
// ============================================================================

/// Format a timestamp for storage. Fixed-width RFC 3339 UTC with millisecond
/// precision so lexicographic ordering matches chronological ordering.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp back
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Validation(format!("Bad timestamp '{}': {}", s, e)))
}
