//! Trading strategies and the trader state machines that run them.
//!
//! Contains the core logic for:
//! - Per-symbol trader lifecycle and position book-keeping
//! - Grid entries with paired TP/SL exits
//! - Volatility dual legs with the break-even rewrite
//! - Candidate scanning for the supervisor

mod grid;
mod scanner;
mod trader;
mod volatility;

pub use grid::GridTrader;
pub use scanner::{Candidate, CandidateSource, MarketScanner};
pub use trader::{
    CloseReason, PendingEntry, PendingExit, Position, StrategyKind, TradeRecord, TraderCore,
};
pub use volatility::VolatilityTrader;

use crate::config::Config;
use crate::exchange::{ExchangeAdapter, MarketEvent};
use crate::ledger::Ledger;
use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::error;

/// One running trader, dispatched by strategy.
pub enum Trader {
    Grid(GridTrader),
    Volatility(VolatilityTrader),
}

impl Trader {
    /// Construct and start a trader on a symbol.
    ///
    /// On a start failure the half-built trader is torn down with its
    /// positions closed before the error is returned.
    pub async fn start(
        kind: StrategyKind,
        symbol: String,
        adapter: Arc<ExchangeAdapter>,
        ledger: Ledger,
        config: &Config,
    ) -> Result<Self> {
        let core = TraderCore::new(
            symbol,
            kind,
            adapter,
            ledger,
            config.trading.clone(),
            config.exchange.fee_rate,
        );
        let mut trader = match kind {
            StrategyKind::Grid => Trader::Grid(GridTrader::new(core)),
            StrategyKind::Volatility => Trader::Volatility(VolatilityTrader::new(core)),
        };

        let started = match &mut trader {
            Trader::Grid(t) => t.init().await,
            Trader::Volatility(t) => t.init().await,
        };
        if let Err(e) = started {
            error!(
                symbol = %trader.core().symbol,
                strategy = %kind,
                error = %e,
                "Trader start failed, tearing down"
            );
            trader.core_mut().destroy("start-failure", true).await;
            return Err(e);
        }

        let snapshot = trader.core().snapshot();
        trader.core().ledger.upsert_trader(snapshot).await;
        Ok(trader)
    }

    pub fn core(&self) -> &TraderCore {
        match self {
            Trader::Grid(t) => &t.core,
            Trader::Volatility(t) => &t.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut TraderCore {
        match self {
            Trader::Grid(t) => &mut t.core,
            Trader::Volatility(t) => &mut t.core,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.core().kind
    }

    pub fn symbol(&self) -> &str {
        &self.core().symbol
    }

    pub fn is_active(&self) -> bool {
        self.core().active
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.core().realized_pnl
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.core().unrealized_pnl()
    }

    /// Advance the state machine on one event. Events for other symbols and
    /// events after termination are ignored.
    pub async fn on_event(&mut self, event: &MarketEvent) -> Result<()> {
        if !self.is_active() || event.symbol() != self.core().symbol {
            return Ok(());
        }
        match self {
            Trader::Grid(t) => t.on_event(event).await?,
            Trader::Volatility(t) => t.on_event(event).await?,
        }
        if self.is_active() {
            let snapshot = self.core().snapshot();
            self.core().ledger.upsert_trader(snapshot).await;
        }
        Ok(())
    }

    pub async fn destroy(&mut self, reason: &str, close_positions: bool) {
        self.core_mut().destroy(reason, close_positions).await;
    }
}
