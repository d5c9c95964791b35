use anyhow::Result;
use perp_trader::config::Config;
use perp_trader::exchange::ExchangeAdapter;
use perp_trader::ledger::Ledger;
use perp_trader::strategy::MarketScanner;
use perp_trader::supervisor::Supervisor;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .init();

    info!("Starting perp-trader v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!(
        mode = ?config.exchange.mode,
        max_traders = config.trading.max_traders,
        leverage = config.trading.leverage,
        "Configuration loaded"
    );

    let adapter = Arc::new(ExchangeAdapter::new(&config)?);
    let ledger = Ledger::new(config.trading.starting_balance_usdt);
    let scanner = Arc::new(MarketScanner::new(
        Arc::clone(&adapter),
        config.scanner.clone(),
        config.trading.max_traders,
    ));
    let supervisor = Supervisor::new(config, adapter, ledger, scanner);

    tokio::select! {
        result = supervisor.run() => {
            if let Err(e) = &result {
                error!(error = %e, "Supervisor exited with error");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
            Ok(())
        }
    }
}
