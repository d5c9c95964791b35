//! Volatility strategy: opposing market legs with a break-even rewrite.
//!
//! Both legs open at market immediately; exits are priced from the base
//! price, not the per-leg entries. The first leg to take profit rewrites the
//! survivor's take-profit to the base price, turning the losing leg into a
//! break-even exit while its original stop stays in place.

use crate::config::Mode;
use crate::exchange::{
    ExchangeError, MarketEvent, OrderCancel, OrderFill, PositionSide,
    ERR_WOULD_TRIGGER_IMMEDIATELY,
};
use crate::strategy::trader::{CloseReason, PendingExit, Position, TraderCore};
use crate::utils::decimal::{apply_percent, safe_div};
use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

/// Volatility trader over one symbol.
pub struct VolatilityTrader {
    pub core: TraderCore,
    /// Set once, by the first leg to reach its take-profit.
    pub tp_hit_side: Option<PositionSide>,
}

impl VolatilityTrader {
    pub fn new(core: TraderCore) -> Self {
        Self {
            core,
            tp_hit_side: None,
        }
    }

    /// Open both market legs and attach base-priced exits.
    pub async fn init(&mut self) -> Result<()> {
        let base = self.core.adapter.get_mark_price(&self.core.symbol).await?;
        self.core.base_price = base;
        self.core.last_price = base;

        let notional = self.core.trading.volatility_position_notional_usdt;
        let leverage = Decimal::from(self.core.trading.leverage);
        let quantity = safe_div(notional * leverage, base);
        let tp_pct = self.core.trading.volatility_take_profit_percent;
        let sl_pct = self.core.trading.volatility_stop_loss_percent;

        for direction in [PositionSide::Long, PositionSide::Short] {
            let ack = self
                .core
                .adapter
                .place_market_order(
                    &self.core.symbol,
                    direction,
                    direction.entry_side(),
                    quantity,
                    false,
                )
                .await?;
            let entry_price = ack.avg_fill_price.unwrap_or(base);
            let sign = direction.sign();
            let pos_id = self.core.next_pos_id();
            self.core.positions.push(Position {
                pos_id,
                direction,
                entry_price,
                quantity: ack.quantity,
                // Exits reference the base price, not the leg's own entry.
                take_profit_price: apply_percent(base, tp_pct * sign),
                stop_loss_price: apply_percent(base, -sl_pct * sign),
                tp_order_id: None,
                sl_order_id: None,
                level_index: 0,
                is_closing: false,
            });
        }

        let legs: Vec<(u64, PositionSide, Decimal, Decimal, Decimal)> = self
            .core
            .positions
            .iter()
            .map(|p| {
                (
                    p.pos_id,
                    p.direction,
                    p.quantity,
                    p.take_profit_price,
                    p.stop_loss_price,
                )
            })
            .collect();
        for (pos_id, direction, quantity, tp, sl) in legs {
            self.place_exit_pair(pos_id, direction, quantity, tp, sl)
                .await?;
        }

        info!(
            trader = %self.core.id,
            symbol = %self.core.symbol,
            base = %base,
            qty = %quantity,
            "Volatility legs opened"
        );
        Ok(())
    }

    pub async fn on_event(&mut self, event: &MarketEvent) -> Result<()> {
        match event {
            MarketEvent::MarkPrice { price, .. } => self.on_price(*price).await,
            MarketEvent::BookTicker { bid, ask, .. } => {
                self.on_price((*bid + *ask) / Decimal::TWO).await
            }
            MarketEvent::OrderFilled(fill) => self.on_fill(fill).await,
            MarketEvent::OrderCancelled(cancel) => self.on_cancel(cancel).await,
        }
    }

    async fn on_price(&mut self, price: Decimal) -> Result<()> {
        self.core.last_price = price;
        if self.core.adapter.mode() != Mode::Test {
            return Ok(());
        }

        // Test-mode sweep mirroring the grid's: exits whose level the price
        // crossed settle at that level. The recorded pending-exit reason is
        // used so a rewritten TP closes as base-close, not take-profit.
        let crossed: Vec<(u64, Decimal, CloseReason)> = self
            .core
            .open_positions()
            .filter_map(|p| {
                let tp_crossed = match p.direction {
                    PositionSide::Long => price >= p.take_profit_price,
                    PositionSide::Short => price <= p.take_profit_price,
                };
                let sl_crossed = match p.direction {
                    PositionSide::Long => price <= p.stop_loss_price,
                    PositionSide::Short => price >= p.stop_loss_price,
                };
                if tp_crossed {
                    let reason = self.exit_reason_for(p, p.tp_order_id.as_deref());
                    Some((p.pos_id, p.take_profit_price, reason))
                } else if sl_crossed {
                    Some((p.pos_id, p.stop_loss_price, CloseReason::StopLoss))
                } else {
                    None
                }
            })
            .collect();

        for (pos_id, level, reason) in crossed {
            self.handle_leg_closed(pos_id, level, reason, None).await?;
        }
        Ok(())
    }

    fn exit_reason_for(&self, position: &Position, order_id: Option<&str>) -> CloseReason {
        order_id
            .and_then(|id| {
                self.core
                    .pending_exits
                    .iter()
                    .find(|e| e.position_id == position.pos_id && e.order_id == id)
            })
            .map(|e| e.reason)
            .unwrap_or(CloseReason::TakeProfit)
    }

    async fn on_fill(&mut self, fill: &OrderFill) -> Result<()> {
        let Some(idx) = self.core.find_pending_exit(fill) else {
            debug!(order_id = %fill.order_id, "Fill for unknown order ignored");
            return Ok(());
        };
        let exit = self.core.pending_exits[idx].clone();
        self.handle_leg_closed(exit.position_id, fill.price, exit.reason, fill.numeric_order_id)
            .await
    }

    /// Settle a closed leg and run the rewrite protocol on the first TP.
    async fn handle_leg_closed(
        &mut self,
        pos_id: u64,
        exit_price: Decimal,
        reason: CloseReason,
        exit_numeric_id: Option<i64>,
    ) -> Result<()> {
        let direction = match self.core.position_index(pos_id) {
            Some(idx) => self.core.positions[idx].direction,
            None => return Ok(()),
        };
        self.core
            .finalize_close(pos_id, exit_price, reason, exit_numeric_id)
            .await?;

        if reason == CloseReason::TakeProfit && self.tp_hit_side.is_none() {
            self.tp_hit_side = Some(direction);
            info!(
                trader = %self.core.id,
                symbol = %self.core.symbol,
                side = %direction,
                "First take-profit hit, rewriting survivor to break even"
            );
            self.rewrite_survivor().await?;
        }

        self.maybe_destroy().await;
        Ok(())
    }

    /// Both legs gone: terminate with the reason of the last close.
    async fn maybe_destroy(&mut self) {
        if self.core.positions.is_empty() {
            let reason = self
                .core
                .last_close_reason()
                .map(|r| r.as_str())
                .unwrap_or("closed");
            self.core.destroy(reason, false).await;
        }
    }

    /// Cancel the surviving leg's exits and re-arm them: TP at the base
    /// price (break even), SL back at its original level.
    async fn rewrite_survivor(&mut self) -> Result<()> {
        let Some(idx) = self.core.positions.iter().position(|p| !p.is_closing) else {
            return Ok(());
        };
        let (pos_id, direction, quantity, sl_price) = {
            let p = &self.core.positions[idx];
            (p.pos_id, p.direction, p.quantity, p.stop_loss_price)
        };
        let base = self.core.base_price;
        let symbol = self.core.symbol.clone();

        // Drop the book entries first so the cancel echoes are not taken
        // for an external stop loss.
        self.core.pending_exits.retain(|e| e.position_id != pos_id);
        let stale: Vec<String> = {
            let p = &mut self.core.positions[idx];
            [p.tp_order_id.take(), p.sl_order_id.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for order_id in stale {
            if let Err(e) = self.core.adapter.cancel_order(&symbol, &order_id).await {
                warn!(%symbol, %order_id, error = %e, "Survivor exit cancel failed");
            }
        }

        // Price already back through the base: the break-even exit is
        // available right now, take it at market.
        let recovered = match direction {
            PositionSide::Long => self.core.last_price >= base,
            PositionSide::Short => self.core.last_price <= base,
        };
        if recovered {
            return self.market_close(pos_id, CloseReason::BaseClose).await;
        }

        match self
            .core
            .adapter
            .place_limit_order(&symbol, direction, direction.exit_side(), quantity, base, true)
            .await
        {
            Ok(ack) => {
                self.core.positions[idx].take_profit_price = base;
                self.core.positions[idx].tp_order_id = Some(ack.order_id.clone());
                self.core.pending_exits.push(PendingExit {
                    order_id: ack.order_id,
                    position_id: pos_id,
                    reason: CloseReason::BaseClose,
                    price: base,
                });
            }
            Err(e) => {
                warn!(%symbol, error = %e, "Break-even TP placement failed, closing at market");
                return self.market_close(pos_id, CloseReason::BaseClose).await;
            }
        }

        match self
            .core
            .adapter
            .place_stop_limit_order(
                &symbol,
                direction,
                direction.exit_side(),
                quantity,
                sl_price,
                sl_price,
                true,
            )
            .await
        {
            Ok(ack) => {
                self.core.positions[idx].sl_order_id = Some(ack.order_id.clone());
                self.core.pending_exits.push(PendingExit {
                    order_id: ack.order_id,
                    position_id: pos_id,
                    reason: CloseReason::StopLoss,
                    price: sl_price,
                });
                Ok(())
            }
            Err(e) => {
                let immediate_trigger = e
                    .downcast_ref::<ExchangeError>()
                    .is_some_and(|err| err.code == ERR_WOULD_TRIGGER_IMMEDIATELY);
                let reason = if immediate_trigger {
                    CloseReason::StopLoss
                } else {
                    CloseReason::SlRejected
                };
                warn!(%symbol, error = %e, %reason, "Survivor SL re-placement failed");
                self.market_close(pos_id, reason).await
            }
        }
    }

    /// Place the reduce-only TP limit and SL stop-limit for one leg.
    async fn place_exit_pair(
        &mut self,
        pos_id: u64,
        direction: PositionSide,
        quantity: Decimal,
        tp: Decimal,
        sl: Decimal,
    ) -> Result<()> {
        let symbol = self.core.symbol.clone();
        let exit_side = direction.exit_side();

        match self
            .core
            .adapter
            .place_limit_order(&symbol, direction, exit_side, quantity, tp, true)
            .await
        {
            Ok(ack) => {
                if let Some(idx) = self.core.position_index(pos_id) {
                    self.core.positions[idx].tp_order_id = Some(ack.order_id.clone());
                }
                self.core.pending_exits.push(PendingExit {
                    order_id: ack.order_id,
                    position_id: pos_id,
                    reason: CloseReason::TakeProfit,
                    price: tp,
                });
            }
            Err(e) => {
                warn!(%symbol, error = %e, "TP placement failed");
            }
        }

        match self
            .core
            .adapter
            .place_stop_limit_order(&symbol, direction, exit_side, quantity, sl, sl, true)
            .await
        {
            Ok(ack) => {
                if let Some(idx) = self.core.position_index(pos_id) {
                    self.core.positions[idx].sl_order_id = Some(ack.order_id.clone());
                }
                self.core.pending_exits.push(PendingExit {
                    order_id: ack.order_id,
                    position_id: pos_id,
                    reason: CloseReason::StopLoss,
                    price: sl,
                });
                Ok(())
            }
            Err(e) => {
                let immediate_trigger = e
                    .downcast_ref::<ExchangeError>()
                    .is_some_and(|err| err.code == ERR_WOULD_TRIGGER_IMMEDIATELY);
                let reason = if immediate_trigger {
                    CloseReason::StopLoss
                } else {
                    CloseReason::SlRejected
                };
                warn!(%symbol, error = %e, %reason, "SL placement failed, closing leg at market");
                self.market_close(pos_id, reason).await
            }
        }
    }

    async fn on_cancel(&mut self, cancel: &OrderCancel) -> Result<()> {
        let Some(idx) = self.core.find_pending_exit_for_cancel(cancel) else {
            return Ok(());
        };
        let exit = self.core.pending_exits.remove(idx);
        if exit.reason != CloseReason::StopLoss {
            return Ok(());
        }
        let Some(pidx) = self.core.position_index(exit.position_id) else {
            return Ok(());
        };
        if self.core.positions[pidx].is_closing {
            return Ok(());
        }
        self.core.positions[pidx].sl_order_id = None;
        warn!(
            symbol = %self.core.symbol,
            order_id = %exit.order_id,
            "Stop order cancelled while leg open, closing at market"
        );
        self.market_close(exit.position_id, CloseReason::SlRejected)
            .await
    }

    /// Close one leg at market and settle it.
    ///
    /// Market closes never carry the take-profit reason, so the rewrite
    /// hook in `handle_leg_closed` does not apply here.
    async fn market_close(&mut self, pos_id: u64, reason: CloseReason) -> Result<()> {
        let Some(idx) = self.core.position_index(pos_id) else {
            return Ok(());
        };
        let (direction, quantity) = {
            let p = &self.core.positions[idx];
            (p.direction, p.quantity)
        };
        let symbol = self.core.symbol.clone();
        let ack = self
            .core
            .adapter
            .close_position_market(&symbol, direction, quantity)
            .await?;
        let exit_price = ack.avg_fill_price.unwrap_or(self.core.last_price);
        self.core
            .finalize_close(pos_id, exit_price, reason, ack.numeric_id)
            .await?;
        self.maybe_destroy().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::ExchangeAdapter;
    use crate::ledger::Ledger;
    use crate::strategy::trader::StrategyKind;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const SYMBOL: &str = "ALTUSDT";

    struct Harness {
        adapter: Arc<ExchangeAdapter>,
        ledger: Ledger,
        config: Config,
    }

    /// Scenario config: 3% TP, 6% SL, 300 notional, zero fees/slippage.
    fn scenario_config() -> Config {
        let mut config = Config::default();
        config.trading.volatility_take_profit_percent = dec!(3);
        config.trading.volatility_stop_loss_percent = dec!(6);
        config.trading.volatility_position_notional_usdt = dec!(300);
        config.trading.leverage = 1;
        config.exchange.fee_rate = Decimal::ZERO;
        config.exchange.slippage_rate = Decimal::ZERO;
        config
    }

    fn harness() -> Harness {
        let config = scenario_config();
        let adapter = Arc::new(ExchangeAdapter::new(&config).unwrap());
        let ledger = Ledger::new(config.trading.starting_balance_usdt);
        Harness {
            adapter,
            ledger,
            config,
        }
    }

    async fn feed(h: &Harness, trader: &mut VolatilityTrader, price: Decimal) {
        let mut events = h.adapter.subscribe();
        h.adapter
            .process_market_event(MarketEvent::MarkPrice {
                symbol: SYMBOL.to_string(),
                price,
            })
            .await;
        while let Ok(event) = events.try_recv() {
            trader.on_event(&event).await.unwrap();
        }
    }

    async fn started_trader(h: &Harness) -> VolatilityTrader {
        h.adapter
            .process_market_event(MarketEvent::MarkPrice {
                symbol: SYMBOL.to_string(),
                price: dec!(100),
            })
            .await;
        let core = TraderCore::new(
            SYMBOL.to_string(),
            StrategyKind::Volatility,
            Arc::clone(&h.adapter),
            h.ledger.clone(),
            h.config.trading.clone(),
            h.config.exchange.fee_rate,
        );
        let mut trader = VolatilityTrader::new(core);
        trader.init().await.unwrap();
        trader
    }

    #[tokio::test]
    async fn test_init_opens_both_legs_with_base_exits() {
        let h = harness();
        let trader = started_trader(&h).await;

        assert_eq!(trader.core.base_price, dec!(100));
        assert_eq!(trader.core.positions.len(), 2);

        let long = trader
            .core
            .positions
            .iter()
            .find(|p| p.direction == PositionSide::Long)
            .unwrap();
        let short = trader
            .core
            .positions
            .iter()
            .find(|p| p.direction == PositionSide::Short)
            .unwrap();

        // qty = notional * leverage / base = 300 / 100
        assert_eq!(long.quantity, dec!(3));
        assert_eq!(long.take_profit_price, dec!(103));
        assert_eq!(long.stop_loss_price, dec!(94));
        assert_eq!(short.take_profit_price, dec!(97));
        assert_eq!(short.stop_loss_price, dec!(106));
        // Four resting exits: TP + SL per leg
        assert_eq!(trader.core.pending_exits.len(), 4);
    }

    #[tokio::test]
    async fn test_first_tp_rewrites_survivor_to_base() {
        let h = harness();
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(103)).await;

        // Long leg took profit
        assert_eq!(trader.tp_hit_side, Some(PositionSide::Long));
        assert_eq!(trader.core.trade_history.len(), 1);
        assert_eq!(trader.core.trade_history[0].reason, CloseReason::TakeProfit);

        // Survivor short: TP rewritten to base, SL untouched
        assert_eq!(trader.core.positions.len(), 1);
        let survivor = &trader.core.positions[0];
        assert_eq!(survivor.direction, PositionSide::Short);
        assert_eq!(survivor.take_profit_price, dec!(100));
        assert_eq!(survivor.stop_loss_price, dec!(106));

        let base_exit = trader
            .core
            .pending_exits
            .iter()
            .find(|e| e.reason == CloseReason::BaseClose)
            .unwrap();
        assert_eq!(base_exit.price, dec!(100));
        assert!(trader
            .core
            .pending_exits
            .iter()
            .any(|e| e.reason == CloseReason::StopLoss && e.price == dec!(106)));
    }

    #[tokio::test]
    async fn test_survivor_closes_at_base_and_trader_destroys() {
        let h = harness();
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(103)).await;
        feed(&h, &mut trader, dec!(100)).await;

        assert!(!trader.core.active);
        assert_eq!(trader.core.trade_history.len(), 2);
        let last = &trader.core.trade_history[1];
        assert_eq!(last.reason, CloseReason::BaseClose);
        assert_eq!(last.exit_price, dec!(100));
        // Break-even exit: short entered at 100, closed at 100
        assert_eq!(last.pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_second_tp_does_not_rewrite_again() {
        let h = harness();
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(103)).await;
        assert_eq!(trader.tp_hit_side, Some(PositionSide::Long));

        // Survivor closes at base; tp_hit_side keeps the first winner.
        feed(&h, &mut trader, dec!(100)).await;
        assert_eq!(trader.tp_hit_side, Some(PositionSide::Long));
    }

    #[tokio::test]
    async fn test_short_tp_first_mirrors_protocol() {
        let h = harness();
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(97)).await;

        assert_eq!(trader.tp_hit_side, Some(PositionSide::Short));
        let survivor = &trader.core.positions[0];
        assert_eq!(survivor.direction, PositionSide::Long);
        assert_eq!(survivor.take_profit_price, dec!(100));
        assert_eq!(survivor.stop_loss_price, dec!(94));
    }

    #[tokio::test]
    async fn test_deep_drop_settles_both_legs_in_one_sweep() {
        let h = harness();
        let mut trader = started_trader(&h).await;

        // 94 crosses the long leg's stop (94) and the short leg's TP (97)
        // in the same sweep: both legs settle, no survivor remains to
        // rewrite, and the trader terminates.
        feed(&h, &mut trader, dec!(94)).await;

        assert_eq!(trader.core.trade_history.len(), 2);
        assert_eq!(trader.core.trade_history[0].reason, CloseReason::StopLoss);
        assert_eq!(trader.core.trade_history[1].reason, CloseReason::TakeProfit);
        assert_eq!(trader.tp_hit_side, Some(PositionSide::Short));
        assert!(trader.core.positions.is_empty());
        assert!(!trader.core.active);
    }

    #[tokio::test]
    async fn test_pnl_symmetry_into_ledger() {
        let h = harness();
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(103)).await;
        feed(&h, &mut trader, dec!(100)).await;

        let report = h.ledger.performance().await;
        assert_eq!(report.realized.total_trades, 2);
        // +3/coin on the long TP (qty 3), break-even on the short
        assert_eq!(report.realized.gross_profit, dec!(9));
        assert_eq!(report.realized.gross_loss, Decimal::ZERO);
        assert_eq!(report.realized.net_profit, trader.core.realized_pnl);
    }
}
