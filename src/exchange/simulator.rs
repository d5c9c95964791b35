//! Deterministic fill engine used when mode = test.
//!
//! Keeps simulated open orders, positions, and a paper balance. Every price
//! sample (mark price or book mid) replays the symbol's resting orders and
//! fills any whose trigger condition is satisfied. Market orders fill
//! immediately at best bid/ask (mark fallback) adjusted by slippage.

use crate::exchange::types::{OrderSide, OrderType, PositionSide};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A resting simulated order.
#[derive(Debug, Clone)]
pub struct SimOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
}

impl SimOrder {
    /// Trigger check against one price sample.
    ///
    /// Limit orders fill when price reaches the limit from the favourable
    /// side; stop orders when price reaches the stop from the adverse side.
    fn triggers_at(&self, price: Decimal) -> bool {
        match self.order_type {
            OrderType::Limit => match (self.side, self.price) {
                (OrderSide::Buy, Some(limit)) => price <= limit,
                (OrderSide::Sell, Some(limit)) => price >= limit,
                _ => false,
            },
            OrderType::StopLimit | OrderType::StopMarket => {
                match (self.side, self.stop_price) {
                    (OrderSide::Buy, Some(stop)) => price >= stop,
                    (OrderSide::Sell, Some(stop)) => price <= stop,
                    _ => false,
                }
            }
            OrderType::Market => true,
        }
    }

    /// Fill price: the limit when present, else the stop.
    fn fill_price(&self) -> Option<Decimal> {
        self.price.or(self.stop_price)
    }

    /// Whether the prior tick had already carried price through the trigger,
    /// i.e. the sample gapped over the level instead of touching it.
    fn already_passed(&self, prev: Decimal, current: Decimal) -> bool {
        let Some(stop) = self.stop_price else {
            return false;
        };
        if !self.order_type.is_conditional() {
            return false;
        }
        match self.side {
            OrderSide::Buy => prev < stop && current > stop,
            OrderSide::Sell => prev > stop && current < stop,
        }
    }
}

/// One simulated position leg (hedge mode: long and short coexist).
#[derive(Debug, Clone, Default)]
pub struct SimPosition {
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

/// A produced fill, returned to the adapter for event emission.
#[derive(Debug, Clone)]
pub struct SimFill {
    pub order: SimOrder,
    pub price: Decimal,
    pub realized_pnl: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Default)]
struct SimState {
    orders: Vec<SimOrder>,
    positions: HashMap<(String, PositionSide), SimPosition>,
    balance: Decimal,
    realized_pnl: Decimal,
    fees_paid: Decimal,
    last_price: HashMap<String, Decimal>,
    best_book: HashMap<String, (Decimal, Decimal)>,
}

/// Simulated exchange state.
pub struct Simulator {
    fee_rate: Decimal,
    slippage_rate: Decimal,
    state: RwLock<SimState>,
    order_seq: AtomicU64,
}

impl Simulator {
    pub fn new(starting_balance: Decimal, fee_rate: Decimal, slippage_rate: Decimal) -> Self {
        Self {
            fee_rate,
            slippage_rate,
            state: RwLock::new(SimState {
                balance: starting_balance,
                ..Default::default()
            }),
            order_seq: AtomicU64::new(1),
        }
    }

    fn next_order_id(&self) -> String {
        format!("SIM-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Queue a resting order; market orders are not accepted here.
    pub async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        position_side: PositionSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
        reduce_only: bool,
    ) -> SimOrder {
        let order = SimOrder {
            order_id: self.next_order_id(),
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type,
            quantity,
            price,
            stop_price,
            reduce_only,
        };
        debug!(
            order_id = %order.order_id,
            %symbol,
            side = ?side,
            order_type = ?order_type,
            qty = %quantity,
            "Sim order queued"
        );
        self.state.write().await.orders.push(order.clone());
        order
    }

    /// Fill a market order immediately at best bid/ask plus slippage.
    ///
    /// Returns `None` when no price has been observed for the symbol yet.
    pub async fn execute_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        position_side: PositionSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Option<SimFill> {
        let mut state = self.state.write().await;

        let reference = match (state.best_book.get(symbol), state.last_price.get(symbol)) {
            (Some(&(bid, ask)), _) => match side {
                OrderSide::Buy => ask,
                OrderSide::Sell => bid,
            },
            (None, Some(&mark)) => mark,
            (None, None) => return None,
        };
        let fill_price = match side {
            OrderSide::Buy => reference * (Decimal::ONE + self.slippage_rate),
            OrderSide::Sell => reference * (Decimal::ONE - self.slippage_rate),
        };

        let order = SimOrder {
            order_id: self.next_order_id(),
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            reduce_only,
        };
        Some(Self::settle_fill(
            &mut state,
            order,
            fill_price,
            self.fee_rate,
        ))
    }

    /// Remove a resting order by id. Returns the order if it was live.
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Option<SimOrder> {
        let mut state = self.state.write().await;
        let idx = state
            .orders
            .iter()
            .position(|o| o.symbol == symbol && o.order_id == order_id)?;
        Some(state.orders.remove(idx))
    }

    /// Remove every resting order on a symbol.
    pub async fn cancel_all(&self, symbol: &str) -> Vec<SimOrder> {
        let mut state = self.state.write().await;
        let (cancelled, kept): (Vec<_>, Vec<_>) = state
            .orders
            .drain(..)
            .partition(|o| o.symbol == symbol);
        state.orders = kept;
        cancelled
    }

    /// Feed a book-ticker sample; replays orders against the mid price.
    pub async fn on_book_ticker(&self, symbol: &str, bid: Decimal, ask: Decimal) -> Vec<SimFill> {
        let mid = (bid + ask) / Decimal::TWO;
        {
            let mut state = self.state.write().await;
            state.best_book.insert(symbol.to_string(), (bid, ask));
        }
        self.on_price(symbol, mid).await
    }

    /// Feed a price sample and fill any triggered orders.
    pub async fn on_price(&self, symbol: &str, price: Decimal) -> Vec<SimFill> {
        let mut state = self.state.write().await;
        let prev = state.last_price.insert(symbol.to_string(), price);

        let triggered: Vec<SimOrder> = state
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .filter(|o| {
                o.triggers_at(price)
                    || prev.is_some_and(|p| o.already_passed(p, price))
            })
            .cloned()
            .collect();

        let mut fills = Vec::with_capacity(triggered.len());
        for order in triggered {
            if let Some(prev) = prev {
                if order.already_passed(prev, price) {
                    info!(
                        order_id = %order.order_id,
                        %symbol,
                        stop = ?order.stop_price,
                        prev = %prev,
                        current = %price,
                        "Sim stop already passed between ticks, filling at stop"
                    );
                }
            }
            let Some(fill_price) = order.fill_price() else {
                continue;
            };
            state.orders.retain(|o| o.order_id != order.order_id);
            fills.push(Self::settle_fill(
                &mut state,
                order,
                fill_price,
                self.fee_rate,
            ));
        }
        fills
    }

    /// Apply one fill to positions, balance, and fee totals.
    fn settle_fill(
        state: &mut SimState,
        order: SimOrder,
        fill_price: Decimal,
        fee_rate: Decimal,
    ) -> SimFill {
        let key = (order.symbol.clone(), order.position_side);
        let position = state.positions.entry(key.clone()).or_default();
        let is_increase = order.side == order.position_side.entry_side();

        let mut realized = Decimal::ZERO;
        if is_increase {
            // Weighted-average entry across adds of the same direction.
            let old_notional = position.quantity * position.entry_price;
            let add_notional = order.quantity * fill_price;
            position.quantity += order.quantity;
            if position.quantity > Decimal::ZERO {
                position.entry_price = (old_notional + add_notional) / position.quantity;
            }
        } else {
            let closed = order.quantity.min(position.quantity);
            realized = (fill_price - position.entry_price) * closed * order.position_side.sign();
            position.quantity -= closed;
            if position.quantity <= Decimal::ZERO {
                state.positions.remove(&key);
            }
        }

        let fee = (order.quantity * fill_price).abs() * fee_rate;
        state.balance += realized - fee;
        state.realized_pnl += realized;
        state.fees_paid += fee;

        info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = ?order.side,
            qty = %order.quantity,
            price = %fill_price,
            realized = %realized,
            fee = %fee,
            "Sim order filled"
        );

        SimFill {
            order,
            price: fill_price,
            realized_pnl: realized,
            fee,
        }
    }

    /// Paper balance after realised P&L and fees.
    pub async fn balance(&self) -> Decimal {
        self.state.read().await.balance
    }

    /// Simulated position for a symbol and side.
    pub async fn position(&self, symbol: &str, side: PositionSide) -> SimPosition {
        self.state
            .read()
            .await
            .positions
            .get(&(symbol.to_string(), side))
            .cloned()
            .unwrap_or_default()
    }

    /// Count of resting orders on a symbol.
    pub async fn open_order_count(&self, symbol: &str) -> usize {
        self.state
            .read()
            .await
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .count()
    }

    /// Most recent price sample for a symbol.
    pub async fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.state.read().await.last_price.get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sim() -> Simulator {
        Simulator::new(dec!(10000), Decimal::ZERO, Decimal::ZERO)
    }

    fn sim_with_fees() -> Simulator {
        Simulator::new(dec!(10000), dec!(0.0004), dec!(0.0005))
    }

    // =========================================================================
    // Trigger rules
    // =========================================================================

    #[tokio::test]
    async fn test_buy_limit_fills_at_or_below_limit() {
        let sim = sim();
        sim.place_order(
            "BTCUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            OrderType::Limit,
            dec!(1),
            Some(dec!(99)),
            None,
            false,
        )
        .await;

        assert!(sim.on_price("BTCUSDT", dec!(99.5)).await.is_empty());
        let fills = sim.on_price("BTCUSDT", dec!(99)).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(99));
    }

    #[tokio::test]
    async fn test_sell_limit_fills_at_or_above_limit() {
        let sim = sim();
        sim.place_order(
            "BTCUSDT",
            OrderSide::Sell,
            PositionSide::Short,
            OrderType::Limit,
            dec!(1),
            Some(dec!(101)),
            None,
            false,
        )
        .await;

        assert!(sim.on_price("BTCUSDT", dec!(100.5)).await.is_empty());
        let fills = sim.on_price("BTCUSDT", dec!(101.2)).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(101));
    }

    #[tokio::test]
    async fn test_sell_stop_fills_at_or_below_stop() {
        let sim = sim();
        sim.place_order(
            "BTCUSDT",
            OrderSide::Sell,
            PositionSide::Long,
            OrderType::StopLimit,
            dec!(1),
            Some(dec!(97.9)),
            Some(dec!(98)),
            true,
        )
        .await;

        assert!(sim.on_price("BTCUSDT", dec!(99)).await.is_empty());
        let fills = sim.on_price("BTCUSDT", dec!(98)).await;
        assert_eq!(fills.len(), 1);
        // Limit price wins over the stop when both are present
        assert_eq!(fills[0].price, dec!(97.9));
    }

    #[tokio::test]
    async fn test_buy_stop_already_passed_fills_at_stop() {
        let sim = sim();
        sim.place_order(
            "BTCUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            OrderType::StopMarket,
            dec!(1),
            None,
            Some(dec!(99)),
            false,
        )
        .await;

        // Tick 98: below the stop, nothing happens.
        assert!(sim.on_price("BTCUSDT", dec!(98)).await.is_empty());
        // Tick 100: price gapped over the stop; fill lands at the stop.
        let fills = sim.on_price("BTCUSDT", dec!(100)).await;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(99));
    }

    // =========================================================================
    // Position accounting
    // =========================================================================

    #[tokio::test]
    async fn test_adds_use_weighted_average_entry() {
        let sim = sim();
        for limit in [dec!(100), dec!(90)] {
            sim.place_order(
                "ETHUSDT",
                OrderSide::Buy,
                PositionSide::Long,
                OrderType::Limit,
                dec!(1),
                Some(limit),
                None,
                false,
            )
            .await;
        }

        sim.on_price("ETHUSDT", dec!(100)).await;
        sim.on_price("ETHUSDT", dec!(90)).await;

        let position = sim.position("ETHUSDT", PositionSide::Long).await;
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.entry_price, dec!(95));
    }

    #[tokio::test]
    async fn test_reduce_realises_proportional_pnl() {
        let sim = sim();
        sim.place_order(
            "ETHUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            OrderType::Limit,
            dec!(2),
            Some(dec!(100)),
            None,
            false,
        )
        .await;
        sim.on_price("ETHUSDT", dec!(100)).await;

        sim.place_order(
            "ETHUSDT",
            OrderSide::Sell,
            PositionSide::Long,
            OrderType::Limit,
            dec!(1),
            Some(dec!(110)),
            None,
            true,
        )
        .await;
        let fills = sim.on_price("ETHUSDT", dec!(110)).await;

        assert_eq!(fills[0].realized_pnl, dec!(10));
        let position = sim.position("ETHUSDT", PositionSide::Long).await;
        assert_eq!(position.quantity, dec!(1));
        assert_eq!(sim.balance().await, dec!(10010));
    }

    #[tokio::test]
    async fn test_short_leg_profits_when_price_falls() {
        let sim = sim();
        sim.place_order(
            "ETHUSDT",
            OrderSide::Sell,
            PositionSide::Short,
            OrderType::Limit,
            dec!(1),
            Some(dec!(100)),
            None,
            false,
        )
        .await;
        sim.on_price("ETHUSDT", dec!(100)).await;

        sim.place_order(
            "ETHUSDT",
            OrderSide::Buy,
            PositionSide::Short,
            OrderType::Limit,
            dec!(1),
            Some(dec!(95)),
            None,
            true,
        )
        .await;
        let fills = sim.on_price("ETHUSDT", dec!(95)).await;
        assert_eq!(fills[0].realized_pnl, dec!(5));
    }

    // =========================================================================
    // Fees & market orders
    // =========================================================================

    #[tokio::test]
    async fn test_fees_deducted_from_balance() {
        let sim = sim_with_fees();
        sim.place_order(
            "BTCUSDT",
            OrderSide::Buy,
            PositionSide::Long,
            OrderType::Limit,
            dec!(1),
            Some(dec!(50000)),
            None,
            false,
        )
        .await;
        sim.on_price("BTCUSDT", dec!(50000)).await;

        // Fee = 1 * 50000 * 0.0004 = 20
        assert_eq!(sim.balance().await, dec!(9980));
    }

    #[tokio::test]
    async fn test_market_order_uses_book_and_slippage() {
        let sim = sim_with_fees();
        sim.on_book_ticker("BTCUSDT", dec!(49990), dec!(50010)).await;

        let fill = sim
            .execute_market_order("BTCUSDT", OrderSide::Buy, PositionSide::Long, dec!(1), false)
            .await
            .unwrap();
        // Buy lifts the ask plus slippage
        assert_eq!(fill.price, dec!(50010) * dec!(1.0005));
    }

    #[tokio::test]
    async fn test_market_order_falls_back_to_mark() {
        let sim = sim();
        sim.on_price("BTCUSDT", dec!(50000)).await;
        let fill = sim
            .execute_market_order("BTCUSDT", OrderSide::Sell, PositionSide::Short, dec!(1), false)
            .await
            .unwrap();
        assert_eq!(fill.price, dec!(50000));
    }

    #[tokio::test]
    async fn test_market_order_without_any_price_is_rejected() {
        let sim = sim();
        assert!(sim
            .execute_market_order("NOPRICE", OrderSide::Buy, PositionSide::Long, dec!(1), false)
            .await
            .is_none());
    }

    // =========================================================================
    // Cancels
    // =========================================================================

    #[tokio::test]
    async fn test_cancel_removes_resting_order() {
        let sim = sim();
        let order = sim
            .place_order(
                "BTCUSDT",
                OrderSide::Buy,
                PositionSide::Long,
                OrderType::Limit,
                dec!(1),
                Some(dec!(99)),
                None,
                false,
            )
            .await;

        assert!(sim.cancel_order("BTCUSDT", &order.order_id).await.is_some());
        assert!(sim.cancel_order("BTCUSDT", &order.order_id).await.is_none());
        assert!(sim.on_price("BTCUSDT", dec!(99)).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_clears_symbol_only() {
        let sim = sim();
        for symbol in ["BTCUSDT", "ETHUSDT"] {
            sim.place_order(
                symbol,
                OrderSide::Buy,
                PositionSide::Long,
                OrderType::Limit,
                dec!(1),
                Some(dec!(99)),
                None,
                false,
            )
            .await;
        }

        let cancelled = sim.cancel_all("BTCUSDT").await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(sim.open_order_count("ETHUSDT").await, 1);
    }
}
