//! Configuration management for the trading engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Execution mode: simulated fills or real exchange orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Test,
    Live,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exchange connectivity and credentials
    pub exchange: ExchangeConfig,
    /// Trader sizing and exit parameters
    pub trading: TradingConfig,
    /// Symbol scanner thresholds
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Simulated or live order routing
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub api_secret: String,
    /// REST base URL
    #[serde(default = "default_rest_url")]
    pub base_rest_url: String,
    /// WebSocket base URL
    #[serde(default = "default_ws_url")]
    pub base_ws_url: String,
    /// Signed-request receive window in milliseconds
    #[serde(default = "default_recv_window")]
    pub recv_window: u64,
    /// Taker fee rate applied by the simulator
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Simulated market-order slippage rate
    #[serde(default = "default_slippage_rate")]
    pub slippage_rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Maximum concurrently active traders
    #[serde(default = "default_max_traders")]
    pub max_traders: usize,
    /// Leverage applied per symbol before entry
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Paper balance used when mode = test
    #[serde(default = "default_starting_balance")]
    pub starting_balance_usdt: Decimal,
    /// Fraction of equity deployed across grid entries (0.0-1.0)
    #[serde(default = "default_equity_fraction")]
    pub equity_fraction: Decimal,
    /// Notional per grid order in USDT
    #[serde(default = "default_position_notional")]
    pub position_notional_usdt: Decimal,
    /// Notional per volatility leg in USDT
    #[serde(default = "default_volatility_notional")]
    pub volatility_position_notional_usdt: Decimal,
    /// Grid entry offset from base price, percent
    #[serde(default = "default_level_spacing")]
    pub level_spacing_percent: Decimal,
    /// Grid take-profit distance from entry, percent
    #[serde(default = "default_take_profit")]
    pub take_profit_percent: Decimal,
    /// Grid stop-loss distance from entry, percent
    #[serde(default = "default_stop_loss")]
    pub stop_loss_percent: Decimal,
    /// Volatility take-profit distance from base, percent
    #[serde(default = "default_volatility_take_profit")]
    pub volatility_take_profit_percent: Decimal,
    /// Volatility stop-loss distance from base, percent
    #[serde(default = "default_volatility_stop_loss")]
    pub volatility_stop_loss_percent: Decimal,
    /// Scan-and-launch cadence in milliseconds
    #[serde(default = "default_scanner_interval")]
    pub scanner_interval_ms: u64,
    /// Restrict launches to a daily UTC window
    #[serde(default)]
    pub enable_trading_window: bool,
    /// Trading window opening hour (UTC, inclusive)
    #[serde(default = "default_window_start")]
    pub trading_window_start_hour: u32,
    /// Trading window closing hour (UTC, exclusive)
    #[serde(default = "default_window_end")]
    pub trading_window_end_hour: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Apply the full filter pipeline; when false, rank by 24h change only
    #[serde(default = "default_enable_filters")]
    pub enable_scanner_filters: bool,
    /// Minimum absolute 24h change percent
    #[serde(default = "default_min_change")]
    pub min_change: Decimal,
    /// Maximum absolute 24h change percent
    #[serde(default = "default_max_change")]
    pub max_change: Decimal,
    /// Minimum 1h/24h volume ratio
    #[serde(default = "default_volume_ratio")]
    pub volume_ratio: Decimal,
    /// Minimum 4h high-low range percent
    #[serde(default = "default_min_range")]
    pub min_range_percent: Decimal,
    /// Minimum order-book depth notional in USDT
    #[serde(default = "default_depth_min")]
    pub depth_min: Decimal,
    /// Maximum order-book depth notional in USDT
    #[serde(default = "default_depth_max")]
    pub depth_max: Decimal,
    /// Minimum best bid/ask spread percent
    #[serde(default = "default_spread_min")]
    pub spread_min: Decimal,
    /// Maximum best bid/ask spread percent
    #[serde(default = "default_spread_max")]
    pub spread_max: Decimal,
}

// Default value functions

fn default_mode() -> Mode {
    Mode::Test
}

fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_recv_window() -> u64 {
    5_000
}

fn default_fee_rate() -> Decimal {
    Decimal::new(4, 4) // 0.0004 (0.04% taker)
}

fn default_slippage_rate() -> Decimal {
    Decimal::new(5, 4) // 0.0005
}

fn default_max_traders() -> usize {
    6
}

fn default_leverage() -> u32 {
    5
}

fn default_starting_balance() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_equity_fraction() -> Decimal {
    Decimal::new(90, 2) // 0.90
}

fn default_position_notional() -> Decimal {
    Decimal::new(100, 0)
}

fn default_volatility_notional() -> Decimal {
    Decimal::new(100, 0)
}

fn default_level_spacing() -> Decimal {
    Decimal::new(1, 0) // 1%
}

fn default_take_profit() -> Decimal {
    Decimal::new(1, 0)
}

fn default_stop_loss() -> Decimal {
    Decimal::new(1, 0)
}

fn default_volatility_take_profit() -> Decimal {
    Decimal::new(3, 0)
}

fn default_volatility_stop_loss() -> Decimal {
    Decimal::new(6, 0)
}

fn default_scanner_interval() -> u64 {
    60_000
}

fn default_window_start() -> u32 {
    3
}

fn default_window_end() -> u32 {
    9
}

fn default_enable_filters() -> bool {
    true
}

fn default_min_change() -> Decimal {
    Decimal::new(5, 0) // 5%
}

fn default_max_change() -> Decimal {
    Decimal::new(30, 0)
}

fn default_volume_ratio() -> Decimal {
    Decimal::new(8, 2) // 0.08
}

fn default_min_range() -> Decimal {
    Decimal::new(3, 0)
}

fn default_depth_min() -> Decimal {
    Decimal::new(50_000, 0)
}

fn default_depth_max() -> Decimal {
    Decimal::new(10_000_000, 0)
}

fn default_spread_min() -> Decimal {
    Decimal::new(1, 3) // 0.001%
}

fn default_spread_max() -> Decimal {
    Decimal::new(15, 2) // 0.15%
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("PT"),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.trading.max_traders >= 1,
            "max_traders must be at least 1"
        );

        anyhow::ensure!(
            self.trading.equity_fraction > Decimal::ZERO
                && self.trading.equity_fraction <= Decimal::ONE,
            "equity_fraction must be between 0 and 1"
        );

        anyhow::ensure!(self.trading.leverage >= 1, "leverage must be at least 1");

        anyhow::ensure!(
            self.trading.trading_window_start_hour < 24
                && self.trading.trading_window_end_hour <= 24
                && self.trading.trading_window_start_hour < self.trading.trading_window_end_hour,
            "trading window hours must satisfy start < end <= 24"
        );

        anyhow::ensure!(
            self.exchange.mode == Mode::Test || !self.exchange.api_key.is_empty(),
            "live mode requires an API key"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig {
                mode: default_mode(),
                api_key: String::new(),
                api_secret: String::new(),
                base_rest_url: default_rest_url(),
                base_ws_url: default_ws_url(),
                recv_window: default_recv_window(),
                fee_rate: default_fee_rate(),
                slippage_rate: default_slippage_rate(),
            },
            trading: TradingConfig {
                max_traders: default_max_traders(),
                leverage: default_leverage(),
                starting_balance_usdt: default_starting_balance(),
                equity_fraction: default_equity_fraction(),
                position_notional_usdt: default_position_notional(),
                volatility_position_notional_usdt: default_volatility_notional(),
                level_spacing_percent: default_level_spacing(),
                take_profit_percent: default_take_profit(),
                stop_loss_percent: default_stop_loss(),
                volatility_take_profit_percent: default_volatility_take_profit(),
                volatility_stop_loss_percent: default_volatility_stop_loss(),
                scanner_interval_ms: default_scanner_interval(),
                enable_trading_window: false,
                trading_window_start_hour: default_window_start(),
                trading_window_end_hour: default_window_end(),
            },
            scanner: ScannerConfig {
                enable_scanner_filters: default_enable_filters(),
                min_change: default_min_change(),
                max_change: default_max_change(),
                volume_ratio: default_volume_ratio(),
                min_range_percent: default_min_range(),
                depth_min: default_depth_min(),
                depth_max: default_depth_max(),
                spread_min: default_spread_min(),
                spread_max: default_spread_max(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_live_mode_requires_api_key() {
        let mut config = Config::default();
        config.exchange.mode = Mode::Live;
        assert!(config.validate().is_err());

        config.exchange.api_key = "key".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_hours_validated() {
        let mut config = Config::default();
        config.trading.trading_window_start_hour = 9;
        config.trading.trading_window_end_hour = 3;
        assert!(config.validate().is_err());
    }
}
