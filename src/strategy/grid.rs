//! Grid strategy: symmetric limit entries with paired TP/SL exits.
//!
//! One level each side of the base price. An entry fill immediately grows a
//! take-profit and a stop-loss computed from the fill price; losing either
//! exit triggers a market close so the position is never left unprotected.

use crate::config::Mode;
use crate::exchange::{
    MarketEvent, OrderCancel, OrderFill, PositionSide, ERR_WOULD_TRIGGER_IMMEDIATELY,
    ExchangeError,
};
use crate::strategy::trader::{CloseReason, PendingEntry, PendingExit, Position, TraderCore};
use crate::utils::decimal::{apply_percent, percent_distance, safe_div};
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

/// Pre-check tolerance: skip the stop when price is this close to it.
const SL_PROXIMITY_PCT: Decimal = dec!(0.02);

/// Grid trader over one symbol.
pub struct GridTrader {
    pub core: TraderCore,
}

impl GridTrader {
    pub fn new(core: TraderCore) -> Self {
        Self { core }
    }

    /// Read the base price and ladder the two entry orders.
    pub async fn init(&mut self) -> Result<()> {
        let core = &mut self.core;
        let base = core.adapter.get_mark_price(&core.symbol).await?;
        core.base_price = base;
        core.last_price = base;

        let spacing = core.trading.level_spacing_percent;
        let equity = core.ledger.status().await.equity;
        let leverage = Decimal::from(core.trading.leverage);
        let max_traders = Decimal::from(core.trading.max_traders as u64);

        for (direction, price, level_index) in [
            (PositionSide::Long, apply_percent(base, -spacing), -1),
            (PositionSide::Short, apply_percent(base, spacing), 1),
        ] {
            let quantity = safe_div(
                equity * core.trading.equity_fraction * leverage,
                max_traders * Decimal::TWO * price,
            );
            let ack = core
                .adapter
                .place_limit_order(
                    &core.symbol,
                    direction,
                    direction.entry_side(),
                    quantity,
                    price,
                    false,
                )
                .await?;
            core.pending_entries.push(PendingEntry {
                order_id: ack.order_id,
                direction,
                price: ack.price.unwrap_or(price),
                quantity: ack.quantity,
                level_index,
            });
        }

        info!(
            trader = %core.id,
            symbol = %core.symbol,
            base = %base,
            spacing = %spacing,
            "Grid entries placed"
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

        // Test-mode complement to the simulator: any open position whose TP
        // or SL level the price crossed is finalized at that level, so
        // closures are observable even with no resting sim orders.
        if self.core.adapter.mode() == Mode::Test {
            let crossed: Vec<(u64, Decimal, CloseReason)> = self
                .core
                .open_positions()
                .filter_map(|p| match p.direction {
                    PositionSide::Long if price >= p.take_profit_price => {
                        Some((p.pos_id, p.take_profit_price, CloseReason::TakeProfit))
                    }
                    PositionSide::Long if price <= p.stop_loss_price => {
                        Some((p.pos_id, p.stop_loss_price, CloseReason::StopLoss))
                    }
                    PositionSide::Short if price <= p.take_profit_price => {
                        Some((p.pos_id, p.take_profit_price, CloseReason::TakeProfit))
                    }
                    PositionSide::Short if price >= p.stop_loss_price => {
                        Some((p.pos_id, p.stop_loss_price, CloseReason::StopLoss))
                    }
                    _ => None,
                })
                .collect();
            for (pos_id, level, reason) in crossed {
                self.close_and_maybe_destroy(pos_id, level, reason, None).await?;
            }
        }
        Ok(())
    }

    async fn on_fill(&mut self, fill: &OrderFill) -> Result<()> {
        if let Some(idx) = self.core.find_pending_entry(fill) {
            let entry = self.core.pending_entries.remove(idx);
            return self.on_entry_filled(entry, fill).await;
        }
        if let Some(idx) = self.core.find_pending_exit(fill) {
            let exit = self.core.pending_exits[idx].clone();
            return self
                .close_and_maybe_destroy(
                    exit.position_id,
                    fill.price,
                    exit.reason,
                    fill.numeric_order_id,
                )
                .await;
        }
        debug!(order_id = %fill.order_id, "Fill for unknown order ignored");
        Ok(())
    }

    /// An entry filled: open the position and attach its exit pair.
    async fn on_entry_filled(&mut self, entry: PendingEntry, fill: &OrderFill) -> Result<()> {
        let direction = entry.direction;
        let entry_price = fill.price;
        let sign = direction.sign();
        let tp = apply_percent(entry_price, self.core.trading.take_profit_percent * sign);
        let sl = apply_percent(entry_price, -self.core.trading.stop_loss_percent * sign);

        let pos_id = self.core.next_pos_id();
        self.core.positions.push(Position {
            pos_id,
            direction,
            entry_price,
            quantity: fill.quantity,
            take_profit_price: tp,
            stop_loss_price: sl,
            tp_order_id: None,
            sl_order_id: None,
            level_index: entry.level_index,
            is_closing: false,
        });

        info!(
            trader = %self.core.id,
            symbol = %self.core.symbol,
            direction = %direction,
            entry = %entry_price,
            tp = %tp,
            sl = %sl,
            "Entry filled"
        );

        // Stop already breached (or within tolerance): no point placing it.
        let last = self.core.last_price;
        let sl_breached = match direction {
            PositionSide::Long => last <= sl,
            PositionSide::Short => last >= sl,
        } || percent_distance(last, sl) <= SL_PROXIMITY_PCT;
        if sl_breached {
            warn!(
                symbol = %self.core.symbol,
                last = %last,
                sl = %sl,
                "Stop level already crossed at entry, closing at market"
            );
            return self.market_close(pos_id, CloseReason::StopLoss).await;
        }

        self.place_exit_pair(pos_id, direction, fill.quantity, tp, sl)
            .await
    }

    /// Place the reduce-only TP limit and SL stop-limit for a position.
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
                self.core.pending_exits.push(PendingExit {
                    order_id: ack.order_id.clone(),
                    position_id: pos_id,
                    reason: CloseReason::TakeProfit,
                    price: tp,
                });
                if let Some(idx) = self.core.position_index(pos_id) {
                    self.core.positions[idx].tp_order_id = Some(ack.order_id);
                }
            }
            Err(e) => {
                // The SL below still protects the position; keep going.
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
                self.core.pending_exits.push(PendingExit {
                    order_id: ack.order_id.clone(),
                    position_id: pos_id,
                    reason: CloseReason::StopLoss,
                    price: sl,
                });
                if let Some(idx) = self.core.position_index(pos_id) {
                    self.core.positions[idx].sl_order_id = Some(ack.order_id);
                }
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
                warn!(%symbol, error = %e, %reason, "SL placement failed, closing at market");
                self.market_close(pos_id, reason).await
            }
        }
    }

    async fn on_cancel(&mut self, cancel: &OrderCancel) -> Result<()> {
        if let Some(idx) = self.core.find_pending_exit_for_cancel(cancel) {
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
            // A live position just lost its stop; it must not stay naked.
            self.core.positions[pidx].sl_order_id = None;
            warn!(
                symbol = %self.core.symbol,
                order_id = %exit.order_id,
                "Stop order cancelled while position open, closing at market"
            );
            return self
                .market_close(exit.position_id, CloseReason::SlRejected)
                .await;
        }

        self.core
            .pending_entries
            .retain(|e| !TraderCore::id_matches_cancel(&e.order_id, cancel));
        Ok(())
    }

    /// Close a position at market and settle it.
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
        self.close_and_maybe_destroy(pos_id, exit_price, reason, ack.numeric_id)
            .await
    }

    /// Finalize a close; TP and SL closes terminate the trader.
    async fn close_and_maybe_destroy(
        &mut self,
        pos_id: u64,
        exit_price: Decimal,
        reason: CloseReason,
        exit_numeric_id: Option<i64>,
    ) -> Result<()> {
        self.core
            .finalize_close(pos_id, exit_price, reason, exit_numeric_id)
            .await?;
        if matches!(reason, CloseReason::TakeProfit | CloseReason::StopLoss) {
            self.core.destroy(reason.as_str(), false).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::{ExchangeAdapter, OrderSide};
    use crate::ledger::Ledger;
    use crate::strategy::trader::StrategyKind;
    use std::sync::Arc;

    const SYMBOL: &str = "ALTUSDT";

    struct Harness {
        adapter: Arc<ExchangeAdapter>,
        ledger: Ledger,
        config: Config,
    }

    fn harness(config: Config) -> Harness {
        let adapter = Arc::new(ExchangeAdapter::new(&config).unwrap());
        let ledger = Ledger::new(config.trading.starting_balance_usdt);
        Harness {
            adapter,
            ledger,
            config,
        }
    }

    /// Scenario config: 1% spacing/tp/sl, zero fees, leverage 1.
    fn scenario_config() -> Config {
        let mut config = Config::default();
        config.trading.level_spacing_percent = dec!(1);
        config.trading.take_profit_percent = dec!(1);
        config.trading.stop_loss_percent = dec!(1);
        config.trading.leverage = 1;
        config.trading.max_traders = 1;
        config.trading.equity_fraction = dec!(1);
        config.trading.starting_balance_usdt = dec!(200);
        config.exchange.fee_rate = Decimal::ZERO;
        config.exchange.slippage_rate = Decimal::ZERO;
        config
    }

    async fn feed(h: &Harness, trader: &mut GridTrader, price: Decimal) {
        // Push the price through the adapter so the simulator replays
        // resting orders, then hand every resulting event to the trader.
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

    async fn started_trader(h: &Harness) -> GridTrader {
        // Seed the simulator with the base price.
        h.adapter
            .process_market_event(MarketEvent::MarkPrice {
                symbol: SYMBOL.to_string(),
                price: dec!(100),
            })
            .await;
        let core = TraderCore::new(
            SYMBOL.to_string(),
            StrategyKind::Grid,
            Arc::clone(&h.adapter),
            h.ledger.clone(),
            h.config.trading.clone(),
            h.config.exchange.fee_rate,
        );
        let mut trader = GridTrader::new(core);
        trader.init().await.unwrap();
        trader
    }

    #[tokio::test]
    async fn test_init_places_symmetric_entries() {
        let h = harness(scenario_config());
        let trader = started_trader(&h).await;

        assert_eq!(trader.core.base_price, dec!(100));
        assert_eq!(trader.core.pending_entries.len(), 2);

        let long = &trader.core.pending_entries[0];
        let short = &trader.core.pending_entries[1];
        assert_eq!(long.direction, PositionSide::Long);
        assert_eq!(long.price, dec!(99));
        assert_eq!(long.level_index, -1);
        assert_eq!(short.direction, PositionSide::Short);
        assert_eq!(short.price, dec!(101));
        assert_eq!(short.level_index, 1);

        // qty = equity * fraction * leverage / (maxTraders * 2 * price),
        // then floored to the lot step by the adapter
        let expected = dec!(200) / (dec!(2) * dec!(99));
        assert!((expected - long.quantity).abs() < dec!(0.0000001));
    }

    #[tokio::test]
    async fn test_entry_fill_attaches_exit_pair() {
        let h = harness(scenario_config());
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(99)).await;

        assert_eq!(trader.core.pending_entries.len(), 1);
        assert_eq!(trader.core.positions.len(), 1);
        let position = &trader.core.positions[0];
        assert_eq!(position.direction, PositionSide::Long);
        assert_eq!(position.entry_price, dec!(99));
        // TP/SL measured from the entry fill, not the base
        assert_eq!(position.take_profit_price, dec!(99.99));
        assert_eq!(position.stop_loss_price, dec!(98.01));
        assert!(position.tp_order_id.is_some());
        assert!(position.sl_order_id.is_some());
        assert_eq!(trader.core.pending_exits.len(), 2);
    }

    #[tokio::test]
    async fn test_long_take_profit_round_trip() {
        let h = harness(scenario_config());
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(99)).await;
        let quantity = trader.core.positions[0].quantity;
        feed(&h, &mut trader, dec!(99.99)).await;

        assert!(!trader.core.active);
        assert_eq!(trader.core.trade_history.len(), 1);
        let trade = &trader.core.trade_history[0];
        assert_eq!(trade.reason, CloseReason::TakeProfit);
        assert_eq!(trade.pnl, (dec!(99.99) - dec!(99)) * quantity);
        assert!(trade.pnl > dec!(0.99) && trade.pnl < dec!(1.01));
    }

    #[tokio::test]
    async fn test_short_stop_loss_round_trip() {
        let h = harness(scenario_config());
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(101)).await;
        let position = &trader.core.positions[0];
        assert_eq!(position.direction, PositionSide::Short);
        assert_eq!(position.stop_loss_price, dec!(102.01));

        feed(&h, &mut trader, dec!(102.01)).await;

        assert!(!trader.core.active);
        let trade = &trader.core.trade_history[0];
        assert_eq!(trade.reason, CloseReason::StopLoss);
        assert!(trade.pnl < Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_exit_distances_match_percent_config() {
        let mut config = scenario_config();
        config.trading.take_profit_percent = dec!(2);
        config.trading.stop_loss_percent = dec!(3);
        let h = harness(config);
        let mut trader = started_trader(&h).await;

        feed(&h, &mut trader, dec!(99)).await;

        let position = &trader.core.positions[0];
        assert_eq!(position.take_profit_price - position.entry_price, dec!(1.98));
        assert_eq!(position.entry_price - position.stop_loss_price, dec!(2.97));
    }

    #[tokio::test]
    async fn test_sl_cancellation_forces_market_close() {
        let h = harness(scenario_config());
        let mut trader = started_trader(&h).await;
        feed(&h, &mut trader, dec!(99)).await;

        let sl_id = trader.core.positions[0].sl_order_id.clone().unwrap();
        let mut events = h.adapter.subscribe();
        h.adapter.cancel_order(SYMBOL, &sl_id).await.unwrap();
        while let Ok(event) = events.try_recv() {
            trader.on_event(&event).await.unwrap();
        }

        // Closed at market with the unsafe reason; trader survives.
        assert_eq!(trader.core.trade_history.len(), 1);
        assert_eq!(trader.core.trade_history[0].reason, CloseReason::SlRejected);
        assert!(trader.core.positions.is_empty());
        assert!(trader.core.active);
    }

    #[tokio::test]
    async fn test_entry_near_stop_closes_immediately() {
        let h = harness(scenario_config());
        let mut trader = started_trader(&h).await;

        // Synthesized fill while price sits below the would-be stop.
        trader.core.last_price = dec!(97);
        let entry = trader.core.pending_entries.remove(0);
        let fill = OrderFill {
            symbol: SYMBOL.to_string(),
            order_id: entry.order_id.clone(),
            numeric_order_id: None,
            client_order_id: None,
            price: dec!(99),
            quantity: entry.quantity,
            side: OrderSide::Buy,
        };
        trader.on_entry_filled(entry, &fill).await.unwrap();

        // No stop was placed; the position went straight to a market close.
        assert_eq!(trader.core.trade_history.len(), 1);
        assert_eq!(trader.core.trade_history[0].reason, CloseReason::StopLoss);
        assert!(!trader.core.active);
    }

    #[tokio::test]
    async fn test_sl_rejected_would_trigger_immediately() {
        let h = harness(scenario_config());
        let mut trader = started_trader(&h).await;

        // Drop the simulated price below the would-be stop (98.01) while the
        // trader still believes price is at the entry level: the pre-check
        // passes, and the SL placement itself comes back with -2021.
        h.adapter
            .process_market_event(MarketEvent::MarkPrice {
                symbol: SYMBOL.to_string(),
                price: dec!(97),
            })
            .await;
        trader.core.last_price = dec!(99);

        let entry = trader.core.pending_entries.remove(0);
        let fill = OrderFill {
            symbol: SYMBOL.to_string(),
            order_id: entry.order_id.clone(),
            numeric_order_id: None,
            client_order_id: None,
            price: dec!(99),
            quantity: entry.quantity,
            side: OrderSide::Buy,
        };
        trader.on_entry_filled(entry, &fill).await.unwrap();

        // No stop id was ever recorded; the close reason is stop-loss.
        assert_eq!(trader.core.trade_history.len(), 1);
        assert_eq!(trader.core.trade_history[0].reason, CloseReason::StopLoss);
        assert!(!trader.core.active);
    }

    #[tokio::test]
    async fn test_destroy_idempotent_no_duplicate_history() {
        let h = harness(scenario_config());
        let mut trader = started_trader(&h).await;
        feed(&h, &mut trader, dec!(99)).await;
        feed(&h, &mut trader, dec!(99.99)).await;

        assert!(!trader.core.active);
        // Second destroy: no cancels are re-issued, no second summary lands.
        let mut events = h.adapter.subscribe();
        trader.core.destroy("take-profit", false).await;
        assert!(events.try_recv().is_err());
        assert_eq!(h.ledger.dashboard_update().await.history.len(), 1);
    }

    #[tokio::test]
    async fn test_pnl_reaches_ledger() {
        let h = harness(scenario_config());
        let mut trader = started_trader(&h).await;
        feed(&h, &mut trader, dec!(99)).await;
        feed(&h, &mut trader, dec!(99.99)).await;

        let report = h.ledger.performance().await;
        assert_eq!(report.realized.total_trades, 1);
        assert_eq!(report.realized.wins, 1);
        assert_eq!(report.realized.net_profit, trader.core.realized_pnl);
    }
}
