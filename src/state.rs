//! Application state management

use crate::config::Config;
use crate::db::models::Instrument;
use crate::db::SqliteDb;
use crate::error::Result;
use crate::resolver::InstrumentResolver;
use dashmap::DashMap;
use std::sync::Arc;

/// Shared state wired up at startup
pub struct AppState {
    pub config: Config,

    /// SQLite database handle
    pub db: Arc<SqliteDb>,

    /// Instrument resolver, sole owner of the resolved chain
    pub resolver: Arc<InstrumentResolver>,

    /// Instrument cache (token -> instrument)
    pub instruments: Arc<DashMap<i64, Instrument>>,

    /// Reverse cache (trading symbol -> token)
    pub token_by_symbol: DashMap<String, i64>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let db = Arc::new(SqliteDb::new(&config.db_path)?);
        tracing::info!("Database opened at {:?}", config.db_path);

        let resolver = Arc::new(InstrumentResolver::new(
            db.clone(),
            &config.underlying,
            config.spot_token,
            config.retry_policy(),
        ));

        let state = Self {
            config,
            db,
            resolver,
            instruments: Arc::new(DashMap::new()),
            token_by_symbol: DashMap::new(),
        };
        state.reload_instrument_cache()?;

        Ok(state)
    }

    /// Fill the caches from the instrument master
    pub fn reload_instrument_cache(&self) -> Result<()> {
        let active = self.db.load_active_instruments()?;

        self.instruments.clear();
        self.token_by_symbol.clear();
        for inst in active {
            self.token_by_symbol.insert(inst.symbol.clone(), inst.token);
            self.instruments.insert(inst.token, inst);
        }

        tracing::info!("Loaded {} instruments into cache", self.instruments.len());
        Ok(())
    }

    /// Upsert instruments and refresh the caches
    pub fn sync_instruments(&self, instruments: &[Instrument]) -> Result<()> {
        self.db.upsert_instruments(instruments)?;
        self.reload_instrument_cache()
    }

    /// Get an instrument from the cache by token
    pub fn get_instrument(&self, token: i64) -> Option<Instrument> {
        self.instruments.get(&token).map(|r| r.clone())
    }

    /// Get a token by trading symbol
    pub fn get_token_by_symbol(&self, symbol: &str) -> Option<i64> {
        self.token_by_symbol.get(symbol).map(|r| *r)
    }
}
