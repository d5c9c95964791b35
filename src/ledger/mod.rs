//! In-memory performance and equity ledger.
//!
//! Shared by the supervisor (balance/equity/market status) and every trader
//! (trade records and snapshots). All state sits behind one `RwLock` so a
//! dashboard snapshot is a single consistent read.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Equity samples retained for the dashboard chart.
const EQUITY_SERIES_CAPACITY: usize = 500;
/// Closed-trader summaries retained for the history view.
const HISTORY_CAPACITY: usize = 200;

/// One timestamped equity sample.
#[derive(Debug, Clone, Serialize)]
pub struct EquitySample {
    pub time: DateTime<Utc>,
    pub equity: Decimal,
}

/// Aggregate trade statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Performance {
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub fees_paid: Decimal,
    pub net_profit: Decimal,
    /// Running maximum drawdown, percent. Never decreases.
    pub max_drawdown: Decimal,
}

/// Performance with live variants folding in open-position P&L.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    #[serde(flatten)]
    pub realized: Performance,
    pub gross_profit_live: Decimal,
    pub gross_loss_live: Decimal,
    pub net_profit_live: Decimal,
    pub pnl_today: Decimal,
}

/// Point-in-time state of one trader, published for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct TraderSnapshot {
    pub id: String,
    pub symbol: String,
    pub strategy: String,
    pub base_price: Decimal,
    pub last_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub open_positions: usize,
    pub pending_orders: usize,
    pub created_at: DateTime<Utc>,
}

/// Terminal summary of a destroyed trader.
#[derive(Debug, Clone, Serialize)]
pub struct TraderSummary {
    pub id: String,
    pub symbol: String,
    pub strategy: String,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub trades: u64,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
}

/// Exchange connectivity status surfaced to the dashboard.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MarketStatus {
    pub api: bool,
    pub ws: bool,
}

/// Top-level status block.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub balance: Decimal,
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub active_traders: usize,
    pub market_status: MarketStatus,
    pub pnl_today: Decimal,
}

/// Full dashboard payload, produced as one atomic snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardUpdate {
    pub status: StatusReport,
    pub traders: Vec<TraderSnapshot>,
    pub performance: PerformanceReport,
    pub equity_series: Vec<EquitySample>,
    pub history: Vec<TraderSummary>,
}

#[derive(Debug, Default)]
struct LedgerState {
    balance: Decimal,
    equity: Decimal,
    peak_equity: Decimal,
    pnl_today: Decimal,
    performance: Performance,
    equity_series: VecDeque<EquitySample>,
    traders: HashMap<String, TraderSnapshot>,
    history: VecDeque<TraderSummary>,
    market_status: MarketStatus,
}

/// Cloneable handle to the shared ledger.
#[derive(Clone, Default)]
pub struct Ledger {
    state: Arc<RwLock<LedgerState>>,
}

impl Ledger {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState {
                balance: starting_balance,
                equity: starting_balance,
                peak_equity: starting_balance,
                ..Default::default()
            })),
        }
    }

    pub async fn set_balance(&self, balance: Decimal) {
        self.state.write().await.balance = balance;
    }

    /// Record an equity sample, updating peak and maximum drawdown.
    pub async fn set_equity(&self, equity: Decimal) {
        let mut state = self.state.write().await;
        state.equity = equity;
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        if state.peak_equity > Decimal::ZERO {
            let drawdown = (state.peak_equity - equity) / state.peak_equity * dec!(100);
            if drawdown > state.performance.max_drawdown {
                state.performance.max_drawdown = drawdown;
                warn!(
                    drawdown = %drawdown,
                    peak = %state.peak_equity,
                    equity = %equity,
                    "New maximum drawdown recorded"
                );
            }
        }
        state.equity_series.push_back(EquitySample {
            time: Utc::now(),
            equity,
        });
        while state.equity_series.len() > EQUITY_SERIES_CAPACITY {
            state.equity_series.pop_front();
        }
    }

    /// Record one closed trade.
    pub async fn record_trade(&self, pnl: Decimal, fees: Decimal) {
        let mut state = self.state.write().await;
        let perf = &mut state.performance;
        perf.total_trades += 1;
        if pnl >= Decimal::ZERO {
            perf.wins += 1;
            perf.gross_profit += pnl;
        } else {
            perf.losses += 1;
            perf.gross_loss += pnl.abs();
        }
        perf.fees_paid += fees;
        perf.net_profit = perf.gross_profit - perf.gross_loss - perf.fees_paid;
        state.pnl_today += pnl - fees;

        info!(
            pnl = %pnl,
            fees = %fees,
            net = %state.performance.net_profit,
            trades = state.performance.total_trades,
            "Trade recorded"
        );
    }

    pub async fn upsert_trader(&self, snapshot: TraderSnapshot) {
        self.state
            .write()
            .await
            .traders
            .insert(snapshot.id.clone(), snapshot);
    }

    pub async fn remove_trader(&self, id: &str, summary: TraderSummary) {
        let mut state = self.state.write().await;
        state.traders.remove(id);
        state.history.push_back(summary);
        while state.history.len() > HISTORY_CAPACITY {
            state.history.pop_front();
        }
    }

    pub async fn set_market_status(&self, api: bool, ws: bool) {
        self.state.write().await.market_status = MarketStatus { api, ws };
    }

    pub async fn balance(&self) -> Decimal {
        self.state.read().await.balance
    }

    pub async fn net_profit(&self) -> Decimal {
        self.state.read().await.performance.net_profit
    }

    pub async fn status(&self) -> StatusReport {
        let state = self.state.read().await;
        StatusReport {
            balance: state.balance,
            equity: state.equity,
            peak_equity: state.peak_equity,
            active_traders: state.traders.len(),
            market_status: state.market_status,
            pnl_today: state.pnl_today,
        }
    }

    pub async fn traders(&self) -> Vec<TraderSnapshot> {
        let state = self.state.read().await;
        let mut traders: Vec<_> = state.traders.values().cloned().collect();
        traders.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        traders
    }

    /// Performance with live variants folding in unrealized P&L.
    pub async fn performance(&self) -> PerformanceReport {
        let state = self.state.read().await;
        Self::performance_from(&state)
    }

    fn performance_from(state: &LedgerState) -> PerformanceReport {
        let unrealized: Decimal = state.traders.values().map(|t| t.unrealized_pnl).sum();
        let realized = state.performance.clone();
        let gross_profit_live = realized.gross_profit + unrealized.max(Decimal::ZERO);
        let gross_loss_live = realized.gross_loss + (-unrealized).max(Decimal::ZERO);
        let net_profit_live = gross_profit_live - gross_loss_live - realized.fees_paid;
        PerformanceReport {
            realized,
            gross_profit_live,
            gross_loss_live,
            net_profit_live,
            pnl_today: state.pnl_today,
        }
    }

    /// One-read dashboard snapshot; no field can tear against another.
    pub async fn dashboard_update(&self) -> DashboardUpdate {
        let state = self.state.read().await;
        DashboardUpdate {
            status: StatusReport {
                balance: state.balance,
                equity: state.equity,
                peak_equity: state.peak_equity,
                active_traders: state.traders.len(),
                market_status: state.market_status,
                pnl_today: state.pnl_today,
            },
            traders: state.traders.values().cloned().collect(),
            performance: Self::performance_from(&state),
            equity_series: state.equity_series.iter().cloned().collect(),
            history: state.history.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, unrealized: Decimal) -> TraderSnapshot {
        TraderSnapshot {
            id: id.to_string(),
            symbol: format!("{id}USDT"),
            strategy: "GRID".to_string(),
            base_price: dec!(100),
            last_price: dec!(100),
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: unrealized,
            fees_paid: Decimal::ZERO,
            open_positions: 1,
            pending_orders: 2,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_trade_accounting_identity() {
        let ledger = Ledger::new(dec!(1000));
        ledger.record_trade(dec!(10), dec!(0.5)).await;
        ledger.record_trade(dec!(-4), dec!(0.3)).await;
        ledger.record_trade(dec!(2), dec!(0.2)).await;

        let report = ledger.performance().await;
        assert_eq!(report.realized.total_trades, 3);
        assert_eq!(report.realized.wins, 2);
        assert_eq!(report.realized.losses, 1);
        assert_eq!(report.realized.gross_profit, dec!(12));
        assert_eq!(report.realized.gross_loss, dec!(4));
        assert_eq!(report.realized.fees_paid, dec!(1.0));
        // net = gross profit - gross loss - fees
        assert_eq!(report.realized.net_profit, dec!(7.0));
        assert_eq!(report.pnl_today, dec!(7.0));
    }

    #[tokio::test]
    async fn test_zero_pnl_counts_as_win() {
        let ledger = Ledger::new(dec!(1000));
        ledger.record_trade(Decimal::ZERO, Decimal::ZERO).await;
        let report = ledger.performance().await;
        assert_eq!(report.realized.wins, 1);
        assert_eq!(report.realized.losses, 0);
    }

    #[tokio::test]
    async fn test_max_drawdown_is_monotonic() {
        let ledger = Ledger::new(dec!(1000));
        ledger.set_equity(dec!(1000)).await;
        ledger.set_equity(dec!(900)).await; // 10% drawdown
        let after_drop = ledger.performance().await.realized.max_drawdown;
        assert_eq!(after_drop, dec!(10));

        // Recovery must not shrink the running maximum
        ledger.set_equity(dec!(990)).await;
        assert_eq!(ledger.performance().await.realized.max_drawdown, dec!(10));

        // A deeper trough from a higher peak extends it
        ledger.set_equity(dec!(1100)).await;
        ledger.set_equity(dec!(880)).await; // 20% from the new peak
        assert_eq!(ledger.performance().await.realized.max_drawdown, dec!(20));
    }

    #[tokio::test]
    async fn test_peak_equity_is_monotonic() {
        let ledger = Ledger::new(dec!(1000));
        ledger.set_equity(dec!(1200)).await;
        ledger.set_equity(dec!(800)).await;
        assert_eq!(ledger.status().await.peak_equity, dec!(1200));
    }

    #[tokio::test]
    async fn test_equity_series_bounded_to_500() {
        let ledger = Ledger::new(dec!(1000));
        for i in 0..650 {
            ledger.set_equity(dec!(1000) + Decimal::from(i)).await;
        }
        let update = ledger.dashboard_update().await;
        assert_eq!(update.equity_series.len(), 500);
        // Oldest samples evicted first
        assert_eq!(update.equity_series[0].equity, dec!(1150));
    }

    #[tokio::test]
    async fn test_live_performance_folds_in_unrealized() {
        let ledger = Ledger::new(dec!(1000));
        ledger.record_trade(dec!(10), dec!(1)).await;
        ledger.upsert_trader(snapshot("ETH", dec!(5))).await;
        ledger.upsert_trader(snapshot("BTC", dec!(-8))).await;

        let report = ledger.performance().await;
        // Net unrealized = -3, entirely on the loss side
        assert_eq!(report.gross_profit_live, dec!(10));
        assert_eq!(report.gross_loss_live, dec!(3));
        assert_eq!(report.net_profit_live, dec!(6));
    }

    #[tokio::test]
    async fn test_remove_trader_keeps_history() {
        let ledger = Ledger::new(dec!(1000));
        ledger.upsert_trader(snapshot("ETH", Decimal::ZERO)).await;
        assert_eq!(ledger.status().await.active_traders, 1);

        ledger
            .remove_trader(
                "ETH",
                TraderSummary {
                    id: "ETH".to_string(),
                    symbol: "ETHUSDT".to_string(),
                    strategy: "GRID".to_string(),
                    realized_pnl: dec!(3),
                    fees_paid: dec!(0.1),
                    trades: 1,
                    reason: "take-profit".to_string(),
                    closed_at: Utc::now(),
                },
            )
            .await;

        let update = ledger.dashboard_update().await;
        assert_eq!(update.status.active_traders, 0);
        assert_eq!(update.history.len(), 1);
        assert_eq!(update.history[0].reason, "take-profit");
    }
}
