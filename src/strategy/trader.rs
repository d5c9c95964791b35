//! Common trader state shared by both strategies.
//!
//! A trader owns its positions, pending entry/exit books, and trade history.
//! Strategy modules drive this core: they decide *when* to enter and exit;
//! the core keeps the books consistent, settles closes into the ledger, and
//! guarantees destroy is idempotent.

use crate::config::TradingConfig;
use crate::exchange::{ExchangeAdapter, OrderCancel, OrderFill, PositionSide};
use crate::ledger::{Ledger, TraderSnapshot, TraderSummary};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Why a position was closed. The string form is what reaches the
/// trade history and the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    BaseClose,
    SlRejected,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take-profit",
            CloseReason::StopLoss => "stop-loss",
            CloseReason::BaseClose => "base-close",
            CloseReason::SlRejected => "sl-rejected",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy discipline of a trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Grid,
    Volatility,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Grid => f.write_str("GRID"),
            StrategyKind::Volatility => f.write_str("VOLATILITY"),
        }
    }
}

/// An open position leg.
#[derive(Debug, Clone)]
pub struct Position {
    pub pos_id: u64,
    pub direction: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub level_index: i32,
    pub is_closing: bool,
}

impl Position {
    /// Unrealized P&L at a given price.
    pub fn unrealized_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity * self.direction.sign()
    }
}

/// A resting entry order awaiting its fill.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub order_id: String,
    pub direction: PositionSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub level_index: i32,
}

/// A resting exit order bound to a position.
#[derive(Debug, Clone)]
pub struct PendingExit {
    pub order_id: String,
    pub position_id: u64,
    pub reason: CloseReason,
    pub price: Decimal,
}

/// One completed round trip.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub direction: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
}

/// Shared state and book-keeping for one trader.
pub struct TraderCore {
    pub id: String,
    pub symbol: String,
    pub kind: StrategyKind,
    pub base_price: Decimal,
    pub last_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub pending_entries: Vec<PendingEntry>,
    pub pending_exits: Vec<PendingExit>,
    pub positions: Vec<Position>,
    pub trade_history: Vec<TradeRecord>,
    pub active: bool,
    pub adapter: Arc<ExchangeAdapter>,
    pub ledger: Ledger,
    pub trading: TradingConfig,
    pub fee_rate: Decimal,
    pos_seq: u64,
    last_close_reason: Option<CloseReason>,
}

impl TraderCore {
    pub fn new(
        symbol: String,
        kind: StrategyKind,
        adapter: Arc<ExchangeAdapter>,
        ledger: Ledger,
        trading: TradingConfig,
        fee_rate: Decimal,
    ) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis();
        Self {
            id: format!("{symbol}-{millis}"),
            symbol,
            kind,
            base_price: Decimal::ZERO,
            last_price: Decimal::ZERO,
            created_at: Utc::now(),
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            pending_entries: Vec::new(),
            pending_exits: Vec::new(),
            positions: Vec::new(),
            trade_history: Vec::new(),
            active: true,
            adapter,
            ledger,
            trading,
            fee_rate,
            pos_seq: 0,
            last_close_reason: None,
        }
    }

    pub fn next_pos_id(&mut self) -> u64 {
        self.pos_seq += 1;
        self.pos_seq
    }

    /// Whether a stored order id matches any of a fill event's id spaces.
    pub fn id_matches_fill(stored: &str, fill: &OrderFill) -> bool {
        stored == fill.order_id
            || fill
                .numeric_order_id
                .is_some_and(|n| stored == n.to_string())
            || fill.client_order_id.as_deref() == Some(stored)
    }

    /// Whether a stored order id matches any of a cancel event's id spaces.
    pub fn id_matches_cancel(stored: &str, cancel: &OrderCancel) -> bool {
        stored == cancel.order_id
            || cancel
                .numeric_order_id
                .is_some_and(|n| stored == n.to_string())
            || cancel.client_order_id.as_deref() == Some(stored)
    }

    pub fn find_pending_entry(&self, fill: &OrderFill) -> Option<usize> {
        self.pending_entries
            .iter()
            .position(|e| Self::id_matches_fill(&e.order_id, fill))
    }

    pub fn find_pending_exit(&self, fill: &OrderFill) -> Option<usize> {
        self.pending_exits
            .iter()
            .position(|e| Self::id_matches_fill(&e.order_id, fill))
    }

    pub fn find_pending_exit_for_cancel(&self, cancel: &OrderCancel) -> Option<usize> {
        self.pending_exits
            .iter()
            .position(|e| Self::id_matches_cancel(&e.order_id, cancel))
    }

    pub fn position_index(&self, pos_id: u64) -> Option<usize> {
        self.positions.iter().position(|p| p.pos_id == pos_id)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| !p.is_closing)
    }

    /// Sum of unrealized P&L across open positions at the last seen price.
    pub fn unrealized_pnl(&self) -> Decimal {
        if self.last_price == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.open_positions()
            .map(|p| p.unrealized_at(self.last_price))
            .sum()
    }

    pub fn last_close_reason(&self) -> Option<CloseReason> {
        self.last_close_reason
    }

    /// Settle a closed position: cancel its sibling exits, compute P&L and
    /// fees, append history, and report to the ledger.
    ///
    /// `exit_numeric_id` identifies the closing order on the exchange, when
    /// known; in live mode its trade reports override the estimated P&L.
    pub async fn finalize_close(
        &mut self,
        pos_id: u64,
        exit_price: Decimal,
        reason: CloseReason,
        exit_numeric_id: Option<i64>,
    ) -> Result<()> {
        let Some(idx) = self.position_index(pos_id) else {
            return Ok(());
        };
        if self.positions[idx].is_closing {
            return Ok(());
        }
        self.positions[idx].is_closing = true;

        let position = self.positions[idx].clone();
        self.pending_exits.retain(|e| e.position_id != pos_id);

        // Cancel whichever exit orders are still resting. -2011 is absorbed
        // by the adapter, so a sibling that already filled is harmless.
        for order_id in [&position.tp_order_id, &position.sl_order_id]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.adapter.cancel_order(&self.symbol, order_id).await {
                warn!(
                    symbol = %self.symbol,
                    %order_id,
                    error = %e,
                    "Sibling exit cancel failed"
                );
            }
        }

        let mut pnl =
            (exit_price - position.entry_price) * position.quantity * position.direction.sign();
        let mut fees = (position.entry_price + exit_price) * position.quantity * self.fee_rate;

        // Live mode: prefer the exchange's own realised P&L and commission.
        if let Some(numeric_id) = exit_numeric_id {
            match self
                .adapter
                .get_order_trades(&self.symbol, &numeric_id.to_string())
                .await
            {
                Ok(trades) if !trades.is_empty() => {
                    let reported_pnl: Decimal = trades.iter().map(|t| t.realized_pnl).sum();
                    let commission: Decimal = trades.iter().map(|t| t.commission).sum();
                    pnl = reported_pnl;
                    // Entry-side commission is still an estimate.
                    fees = commission + position.entry_price * position.quantity * self.fee_rate;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        symbol = %self.symbol,
                        error = %e,
                        "Trade-report reconciliation failed, keeping estimate"
                    );
                }
            }
        }

        self.realized_pnl += pnl;
        self.fees_paid += fees;
        self.last_close_reason = Some(reason);
        self.trade_history.push(TradeRecord {
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            pnl,
            fees,
            reason,
            closed_at: Utc::now(),
        });
        self.ledger.record_trade(pnl, fees).await;
        self.positions.remove(idx);

        info!(
            trader = %self.id,
            symbol = %self.symbol,
            direction = %position.direction,
            entry = %position.entry_price,
            exit = %exit_price,
            pnl = %pnl,
            fees = %fees,
            reason = %reason,
            "Position closed"
        );
        Ok(())
    }

    /// Point-in-time snapshot for the ledger.
    pub fn snapshot(&self) -> TraderSnapshot {
        TraderSnapshot {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            strategy: self.kind.to_string(),
            base_price: self.base_price,
            last_price: self.last_price,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl(),
            fees_paid: self.fees_paid,
            open_positions: self.open_positions().count(),
            pending_orders: self.pending_entries.len() + self.pending_exits.len(),
            created_at: self.created_at,
        }
    }

    fn summary(&self, reason: &str) -> TraderSummary {
        TraderSummary {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            strategy: self.kind.to_string(),
            realized_pnl: self.realized_pnl,
            fees_paid: self.fees_paid,
            trades: self.trade_history.len() as u64,
            reason: reason.to_string(),
            closed_at: Utc::now(),
        }
    }

    /// Tear the trader down. Safe to call twice; the second call is a no-op.
    pub async fn destroy(&mut self, reason: &str, close_positions: bool) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Err(e) = self.adapter.cancel_all_open_orders(&self.symbol).await {
            warn!(symbol = %self.symbol, error = %e, "Cancel-all on destroy failed");
        }
        self.pending_entries.clear();
        self.pending_exits.clear();

        if close_positions {
            let open: Vec<(u64, PositionSide, Decimal)> = self
                .open_positions()
                .map(|p| (p.pos_id, p.direction, p.quantity))
                .collect();
            for (pos_id, direction, quantity) in open {
                match self
                    .adapter
                    .close_position_market(&self.symbol, direction, quantity)
                    .await
                {
                    Ok(ack) => {
                        let exit_price = ack.avg_fill_price.unwrap_or(self.last_price);
                        if let Err(e) = self
                            .finalize_close(pos_id, exit_price, CloseReason::StopLoss, ack.numeric_id)
                            .await
                        {
                            error!(symbol = %self.symbol, error = %e, "Finalize on destroy failed");
                        }
                    }
                    Err(e) => {
                        error!(
                            symbol = %self.symbol,
                            direction = %direction,
                            error = %e,
                            "Market close on destroy failed"
                        );
                    }
                }
            }
        }

        self.ledger.remove_trader(&self.id, self.summary(reason)).await;
        info!(
            trader = %self.id,
            symbol = %self.symbol,
            strategy = %self.kind,
            realized_pnl = %self.realized_pnl,
            %reason,
            "Trader destroyed"
        );
    }
}
