//! CarryTrack - Options cost-of-carry analytics engine
//!
//! Ingests options-market ticks for an index underlying, resolves the ATM
//! chain across weekly and monthly expiries, and derives cost-of-carry
//! analytics (synthetic futures, annualized carry, calendar spread,
//! premiums, implied volatilities) into an append-only SQLite store.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod state;
