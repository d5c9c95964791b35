//! # perp-trader
//!
//! An automated perpetual-futures trading engine for Binance USDT-M.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: REST client, websockets, simulator, and the adapter facade
//! - `strategy`: Grid and volatility trader state machines plus the scanner
//! - `supervisor`: Slot allocation, cooldowns, and the single event loop
//! - `ledger`: In-memory performance and equity accounting
//! - `utils`: Decimal helpers shared across modules

pub mod config;
pub mod exchange;
pub mod ledger;
pub mod strategy;
pub mod supervisor;
pub mod utils;

pub use config::Config;
