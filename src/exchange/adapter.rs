//! Exchange adapter: the single trading interface strategies drive.
//!
//! Presents symbol-agnostic market-data subscription, order routing, and an
//! order-event stream. In test mode every order op is served by the
//! deterministic simulator; in live mode plain orders go to the order
//! endpoint and conditional orders to the algo endpoint. Callers observe one
//! normalised order id either way.

use crate::config::{Config, Mode};
use crate::exchange::client::{OrderRequest, RestClient};
use crate::exchange::simulator::{SimFill, Simulator};
use crate::exchange::types::*;
use crate::exchange::websocket::{MarketSocket, MarketWsEvent, UserSocket, UserWsEvent};
use crate::utils::decimal::{floor_to_step, floor_to_tick};
use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Broadcast capacity for fan-out to traders.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The trading interface shared by every trader and the supervisor.
pub struct ExchangeAdapter {
    mode: Mode,
    rest: Arc<RestClient>,
    simulator: Option<Simulator>,
    events: broadcast::Sender<MarketEvent>,
    market_socket: MarketSocket,
    market_rx: tokio::sync::Mutex<Option<mpsc::Receiver<MarketWsEvent>>>,
    pump_started: AtomicBool,
    ws_up: AtomicBool,
    base_ws_url: String,
    /// algo id -> bot-assigned client algo id, for user-event normalisation
    algo_ids: RwLock<HashMap<i64, String>>,
    /// test-mode tick/step overrides, keyed by symbol
    filters_override: RwLock<HashMap<String, SymbolFilters>>,
    client_id_seq: AtomicU64,
}

impl ExchangeAdapter {
    pub fn new(config: &Config) -> Result<Self> {
        let rest = Arc::new(RestClient::new(&config.exchange)?);
        let simulator = match config.exchange.mode {
            Mode::Test => Some(Simulator::new(
                config.trading.starting_balance_usdt,
                config.exchange.fee_rate,
                config.exchange.slippage_rate,
            )),
            Mode::Live => None,
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (market_tx, market_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let market_socket = MarketSocket::new(config.exchange.base_ws_url.clone(), market_tx);

        Ok(Self {
            mode: config.exchange.mode,
            rest,
            simulator,
            events,
            market_socket,
            market_rx: tokio::sync::Mutex::new(Some(market_rx)),
            pump_started: AtomicBool::new(false),
            ws_up: AtomicBool::new(false),
            base_ws_url: config.exchange.base_ws_url.clone(),
            algo_ids: RwLock::new(HashMap::new()),
            filters_override: RwLock::new(HashMap::new()),
            client_id_seq: AtomicU64::new(1),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn is_test(&self) -> bool {
        self.mode == Mode::Test
    }

    /// Subscribe to the fan-out event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.events.subscribe()
    }

    /// Whether the market websocket currently has a live connection.
    pub fn ws_connected(&self) -> bool {
        self.ws_up.load(Ordering::Relaxed)
    }

    /// Bot-assigned client id: `BOT-<millis>-<seq>`.
    fn next_client_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis();
        let seq = self.client_id_seq.fetch_add(1, Ordering::SeqCst);
        format!("BOT-{millis}-{seq}")
    }

    // ==================== Market streams ====================

    /// Connect the combined market websocket for a symbol set.
    pub async fn start_market_streams(self: &Arc<Self>, symbols: Vec<String>) -> Result<()> {
        if !self.pump_started.swap(true, Ordering::SeqCst) {
            let rx = self
                .market_rx
                .lock()
                .await
                .take()
                .ok_or_else(|| anyhow!("market pump receiver already taken"))?;
            let adapter = Arc::clone(self);
            tokio::spawn(async move {
                adapter.market_pump(rx).await;
            });
        }
        self.market_socket.update_symbols(symbols).await;
        Ok(())
    }

    /// Replace the market-stream symbol set; unchanged membership is a no-op.
    pub async fn update_symbols(&self, symbols: Vec<String>) {
        self.market_socket.update_symbols(symbols).await;
    }

    async fn market_pump(self: Arc<Self>, mut rx: mpsc::Receiver<MarketWsEvent>) {
        while let Some(message) = rx.recv().await {
            match message {
                MarketWsEvent::Event(event) => self.process_market_event(event).await,
                MarketWsEvent::Up => {
                    self.ws_up.store(true, Ordering::Relaxed);
                    info!("Market stream up");
                }
                MarketWsEvent::Down => {
                    self.ws_up.store(false, Ordering::Relaxed);
                    warn!("Market stream down");
                }
            }
        }
    }

    /// Run a market event through the simulator (test mode) and fan it out.
    ///
    /// Public so tests can drive the adapter without a websocket.
    pub async fn process_market_event(&self, event: MarketEvent) {
        let fills = match (&self.simulator, &event) {
            (Some(sim), MarketEvent::MarkPrice { symbol, price }) => {
                sim.on_price(symbol, *price).await
            }
            (Some(sim), MarketEvent::BookTicker { symbol, bid, ask }) => {
                sim.on_book_ticker(symbol, *bid, *ask).await
            }
            _ => Vec::new(),
        };

        let _ = self.events.send(event);
        for fill in fills {
            let _ = self.events.send(Self::fill_event(&fill));
        }
    }

    fn fill_event(fill: &SimFill) -> MarketEvent {
        MarketEvent::OrderFilled(OrderFill {
            symbol: fill.order.symbol.clone(),
            order_id: fill.order.order_id.clone(),
            numeric_order_id: None,
            client_order_id: None,
            price: fill.price,
            quantity: fill.order.quantity,
            side: fill.order.side,
        })
    }

    // ==================== User-data stream (live) ====================

    /// Start the user-data stream. Live mode only.
    pub fn start_user_stream(self: &Arc<Self>) -> Result<()> {
        if self.is_test() {
            bail!("user-data stream is a live-mode facility");
        }
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let socket = UserSocket::new(self.base_ws_url.clone(), Arc::clone(&self.rest), tx);
        tokio::spawn(async move {
            if let Err(e) = socket.run().await {
                error!(error = %e, "User-data stream terminated");
            }
        });

        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    UserWsEvent::OrderUpdate(update) => adapter.process_order_update(update).await,
                    UserWsEvent::Up => info!("User stream up"),
                    UserWsEvent::Down => warn!("User stream down"),
                }
            }
        });
        Ok(())
    }

    /// Normalise a user-data order update into fan-out events.
    pub async fn process_order_update(&self, update: WsOrderUpdate) {
        let order_id = self.normalise_order_id(&update).await;
        let side = match update.side.as_str() {
            "BUY" => OrderSide::Buy,
            _ => OrderSide::Sell,
        };
        let order_type = match update.order_type.as_str() {
            "LIMIT" => OrderType::Limit,
            "STOP" | "STOP_LIMIT" => OrderType::StopLimit,
            "STOP_MARKET" => OrderType::StopMarket,
            _ => OrderType::Market,
        };

        match update.status.as_str() {
            "FILLED" => {
                let price = update
                    .avg_price
                    .as_deref()
                    .or(update.last_fill_price.as_deref())
                    .and_then(|p| p.parse::<Decimal>().ok())
                    .unwrap_or_default();
                let quantity = update
                    .filled_qty
                    .as_deref()
                    .and_then(|q| q.parse::<Decimal>().ok())
                    .unwrap_or_default();
                let _ = self.events.send(MarketEvent::OrderFilled(OrderFill {
                    symbol: update.symbol,
                    order_id,
                    numeric_order_id: Some(update.order_id),
                    client_order_id: update.client_order_id,
                    price,
                    quantity,
                    side,
                }));
            }
            "CANCELED" | "EXPIRED" | "REJECTED" => {
                let status = match update.status.as_str() {
                    "CANCELED" => OrderStatus::Canceled,
                    "EXPIRED" => OrderStatus::Expired,
                    _ => OrderStatus::Rejected,
                };
                let _ = self.events.send(MarketEvent::OrderCancelled(OrderCancel {
                    symbol: update.symbol,
                    order_id,
                    numeric_order_id: Some(update.order_id),
                    client_order_id: update.client_order_id,
                    status,
                    side,
                    order_type,
                }));
            }
            _ => debug!(status = %update.status, "Ignored order update"),
        }
    }

    /// Pick the emitted order id: a BOT-prefixed client id wins, then the
    /// client id mapped from the algo id, then the numeric exchange id.
    async fn normalise_order_id(&self, update: &WsOrderUpdate) -> String {
        if let Some(client_id) = &update.client_order_id {
            if client_id.starts_with("BOT-") {
                return client_id.clone();
            }
        }
        if let Some(algo_id) = update.algo_id {
            if let Some(client_id) = self.algo_ids.read().await.get(&algo_id) {
                return client_id.clone();
            }
        }
        update.order_id.to_string()
    }

    // ==================== Filters & rounding ====================

    /// Seed tick/step filters for a symbol (test mode).
    pub async fn set_symbol_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.filters_override
            .write()
            .await
            .insert(symbol.to_string(), filters);
    }

    async fn filters_for(&self, symbol: &str) -> SymbolFilters {
        if let Some(filters) = self.filters_override.read().await.get(symbol) {
            return *filters;
        }
        if self.is_test() {
            return SymbolFilters::default();
        }
        match self.rest.symbol_filters(symbol).await {
            Ok(filters) => filters,
            Err(e) => {
                warn!(%symbol, error = %e, "Filter lookup failed, using defaults");
                SymbolFilters::default()
            }
        }
    }

    // ==================== Read wrappers ====================

    /// Current mark price: simulator's last sample in test mode.
    pub async fn get_mark_price(&self, symbol: &str) -> Result<Decimal> {
        if let Some(sim) = &self.simulator {
            return sim
                .last_price(symbol)
                .await
                .ok_or_else(|| anyhow!("no simulated price for {symbol} yet"));
        }
        Ok(self.rest.get_mark_price(symbol).await?.mark_price)
    }

    /// Available USDT balance.
    pub async fn get_balance(&self) -> Result<Decimal> {
        if let Some(sim) = &self.simulator {
            return Ok(sim.balance().await);
        }
        let balances = self.rest.get_balance().await?;
        balances
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.available_balance)
            .ok_or_else(|| anyhow!("no USDT balance entry"))
    }

    /// Last traded price from the exchange, or the simulator's last sample.
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal> {
        if self.is_test() {
            return self.get_mark_price(symbol).await;
        }
        Ok(self.rest.get_ticker_price(symbol).await?.price)
    }

    pub async fn get_24h_tickers(&self) -> Result<Vec<Ticker24h>> {
        self.rest.get_24h_tickers().await
    }

    /// Open positions from the exchange. Empty in test mode, where each
    /// trader owns its simulated book.
    pub async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionRisk>> {
        if self.is_test() {
            return Ok(Vec::new());
        }
        self.rest.get_positions(symbol).await
    }

    pub async fn get_exchange_info(&self) -> Result<Arc<ExchangeInfo>> {
        self.rest.get_exchange_info().await
    }

    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        self.rest.get_klines(symbol, interval, limit).await
    }

    pub async fn get_depth(&self, symbol: &str, limit: u32) -> Result<Depth> {
        self.rest.get_depth(symbol, limit).await
    }

    /// Trade reports for realised-P&L reconciliation. Empty in test mode.
    pub async fn get_order_trades(&self, symbol: &str, order_id: &str) -> Result<Vec<UserTrade>> {
        if self.is_test() {
            return Ok(Vec::new());
        }
        let numeric: i64 = order_id
            .parse()
            .context("trade reports require a numeric order id")?;
        self.rest.get_order_trades(symbol, numeric).await
    }

    /// Set leverage for a symbol. No-op in test mode.
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        if self.is_test() {
            debug!(%symbol, leverage, "Sim set leverage");
            return Ok(());
        }
        self.rest.set_leverage(symbol, leverage).await
    }

    // ==================== Order operations ====================

    /// Place a plain limit order.
    pub async fn place_limit_order(
        &self,
        symbol: &str,
        position_side: PositionSide,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let filters = self.filters_for(symbol).await;
        let quantity = floor_to_step(quantity, filters.step_size);
        let price = floor_to_tick(price, filters.tick_size);
        anyhow::ensure!(quantity > Decimal::ZERO, "quantity rounds to zero");

        if let Some(sim) = &self.simulator {
            let order = sim
                .place_order(
                    symbol,
                    side,
                    position_side,
                    OrderType::Limit,
                    quantity,
                    Some(price),
                    None,
                    reduce_only,
                )
                .await;
            return Ok(self.ack_from_sim(&order));
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            reduce_only,
            client_order_id: Some(self.next_client_id()),
        };
        let response = self.rest.place_order(&request).await?;
        Ok(Self::ack_from_response(&request, &response))
    }

    /// Place a stop-limit order. Routed to the algo endpoint in live mode.
    pub async fn place_stop_limit_order(
        &self,
        symbol: &str,
        position_side: PositionSide,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let filters = self.filters_for(symbol).await;
        let quantity = floor_to_step(quantity, filters.step_size);
        let price = floor_to_tick(price, filters.tick_size);
        let stop_price = floor_to_tick(stop_price, filters.tick_size);
        anyhow::ensure!(quantity > Decimal::ZERO, "quantity rounds to zero");

        if let Some(sim) = &self.simulator {
            // The live exchange rejects a stop that is already triggerable.
            if let Some(last) = sim.last_price(symbol).await {
                let would_trigger = match side {
                    OrderSide::Buy => last >= stop_price,
                    OrderSide::Sell => last <= stop_price,
                };
                if would_trigger {
                    return Err(anyhow::Error::new(ExchangeError {
                        code: ERR_WOULD_TRIGGER_IMMEDIATELY,
                        message: "Order would immediately trigger.".to_string(),
                    }));
                }
            }
            let order = sim
                .place_order(
                    symbol,
                    side,
                    position_side,
                    OrderType::StopLimit,
                    quantity,
                    Some(price),
                    Some(stop_price),
                    reduce_only,
                )
                .await;
            return Ok(self.ack_from_sim(&order));
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: OrderType::StopLimit,
            quantity,
            price: Some(price),
            stop_price: Some(stop_price),
            reduce_only,
            client_order_id: None,
        };
        self.place_algo(&request).await
    }

    /// Place a market order; the ack carries the average fill price.
    pub async fn place_market_order(
        &self,
        symbol: &str,
        position_side: PositionSide,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let filters = self.filters_for(symbol).await;
        let quantity = floor_to_step(quantity, filters.step_size);
        anyhow::ensure!(quantity > Decimal::ZERO, "quantity rounds to zero");

        if let Some(sim) = &self.simulator {
            let fill = sim
                .execute_market_order(symbol, side, position_side, quantity, reduce_only)
                .await
                .ok_or_else(|| anyhow!("no simulated price for {symbol} yet"))?;
            let ack = OrderAck {
                order_id: fill.order.order_id.clone(),
                numeric_id: None,
                symbol: symbol.to_string(),
                side,
                order_type: OrderType::Market,
                quantity,
                price: None,
                stop_price: None,
                avg_fill_price: Some(fill.price),
                status: OrderStatus::Filled,
            };
            let _ = self.events.send(Self::fill_event(&fill));
            return Ok(ack);
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            reduce_only,
            client_order_id: Some(self.next_client_id()),
        };
        let response = self.rest.place_order(&request).await?;
        Ok(Self::ack_from_response(&request, &response))
    }

    /// Close a position leg at market with a reduce-only order.
    pub async fn close_position_market(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: Decimal,
    ) -> Result<OrderAck> {
        self.place_market_order(symbol, position_side, position_side.exit_side(), quantity, true)
            .await
    }

    /// Cancel by normalised id. Code -2011 (unknown order) is success.
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderStatus> {
        if let Some(sim) = &self.simulator {
            return match sim.cancel_order(symbol, order_id).await {
                Some(order) => {
                    let _ = self.events.send(MarketEvent::OrderCancelled(OrderCancel {
                        symbol: symbol.to_string(),
                        order_id: order.order_id.clone(),
                        numeric_order_id: None,
                        client_order_id: None,
                        status: OrderStatus::Canceled,
                        side: order.side,
                        order_type: order.order_type,
                    }));
                    Ok(OrderStatus::Canceled)
                }
                None => Ok(OrderStatus::Unknown),
            };
        }

        let result = if order_id.starts_with("BOT-") {
            self.rest
                .cancel_algo_order(symbol, order_id)
                .await
                .map(|_| OrderStatus::Canceled)
        } else {
            let numeric: i64 = order_id
                .parse()
                .context("plain cancel requires a numeric order id")?;
            self.rest
                .cancel_order(symbol, numeric)
                .await
                .map(|r| r.status)
        };

        match result {
            Ok(status) => Ok(status),
            Err(e) => match e.downcast_ref::<ExchangeError>() {
                Some(err) if err.code == ERR_UNKNOWN_ORDER => {
                    debug!(%symbol, %order_id, "Cancel target already gone");
                    Ok(OrderStatus::Unknown)
                }
                _ => Err(e),
            },
        }
    }

    /// Cancel every open order on a symbol.
    pub async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()> {
        if let Some(sim) = &self.simulator {
            let cancelled = sim.cancel_all(symbol).await;
            for order in cancelled {
                let _ = self.events.send(MarketEvent::OrderCancelled(OrderCancel {
                    symbol: symbol.to_string(),
                    order_id: order.order_id.clone(),
                    numeric_order_id: None,
                    client_order_id: None,
                    status: OrderStatus::Canceled,
                    side: order.side,
                    order_type: order.order_type,
                }));
            }
            return Ok(());
        }
        self.rest.cancel_all_open_orders(symbol).await
    }

    async fn place_algo(&self, request: &OrderRequest) -> Result<OrderAck> {
        // Routing a non-conditional type here is a bug in the caller, not a
        // recoverable exchange condition.
        anyhow::ensure!(
            request.order_type.is_conditional(),
            "only conditional orders may use the algo endpoint"
        );

        let client_algo_id = self.next_client_id();
        let response = self.rest.place_algo_order(request, &client_algo_id).await?;
        self.algo_ids
            .write()
            .await
            .insert(response.algo_id, client_algo_id.clone());

        Ok(OrderAck {
            order_id: client_algo_id,
            numeric_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            avg_fill_price: None,
            status: OrderStatus::New,
        })
    }

    fn ack_from_sim(&self, order: &crate::exchange::simulator::SimOrder) -> OrderAck {
        OrderAck {
            order_id: order.order_id.clone(),
            numeric_id: None,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
            stop_price: order.stop_price,
            avg_fill_price: None,
            status: OrderStatus::New,
        }
    }

    fn ack_from_response(request: &OrderRequest, response: &OrderResponse) -> OrderAck {
        let order_id = if response.client_order_id.starts_with("BOT-") {
            response.client_order_id.clone()
        } else {
            response.order_id.to_string()
        };
        OrderAck {
            order_id,
            numeric_id: Some(response.order_id),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            avg_fill_price: (response.avg_price > Decimal::ZERO).then_some(response.avg_price),
            status: response.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_adapter() -> Arc<ExchangeAdapter> {
        Arc::new(ExchangeAdapter::new(&Config::default()).unwrap())
    }

    async fn feed_price(adapter: &ExchangeAdapter, symbol: &str, price: Decimal) {
        adapter
            .process_market_event(MarketEvent::MarkPrice {
                symbol: symbol.to_string(),
                price,
            })
            .await;
    }

    #[tokio::test]
    async fn test_orders_are_rounded_to_filters() {
        let adapter = test_adapter();
        adapter
            .set_symbol_filters(
                "BTCUSDT",
                SymbolFilters {
                    tick_size: dec!(0.1),
                    step_size: dec!(0.001),
                },
            )
            .await;

        let ack = adapter
            .place_limit_order(
                "BTCUSDT",
                PositionSide::Long,
                OrderSide::Buy,
                dec!(0.0015789),
                dec!(50000.12345),
                false,
            )
            .await
            .unwrap();

        assert_eq!(ack.quantity, dec!(0.001));
        assert_eq!(ack.price, Some(dec!(50000.1)));
        // Integer multiples of the filters
        assert_eq!(ack.quantity % dec!(0.001), Decimal::ZERO);
        assert_eq!(ack.price.unwrap() % dec!(0.1), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_zero_quantity_after_rounding_is_rejected() {
        let adapter = test_adapter();
        adapter
            .set_symbol_filters(
                "BTCUSDT",
                SymbolFilters {
                    tick_size: dec!(0.1),
                    step_size: dec!(1),
                },
            )
            .await;

        let result = adapter
            .place_limit_order(
                "BTCUSDT",
                PositionSide::Long,
                OrderSide::Buy,
                dec!(0.5),
                dec!(100),
                false,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_limit_fill_emits_event_with_ack_id() {
        let adapter = test_adapter();
        let mut events = adapter.subscribe();

        let ack = adapter
            .place_limit_order(
                "ETHUSDT",
                PositionSide::Long,
                OrderSide::Buy,
                dec!(1),
                dec!(99),
                false,
            )
            .await
            .unwrap();

        feed_price(&adapter, "ETHUSDT", dec!(99)).await;

        // First the price event, then the fill
        assert!(matches!(
            events.recv().await.unwrap(),
            MarketEvent::MarkPrice { .. }
        ));
        match events.recv().await.unwrap() {
            MarketEvent::OrderFilled(fill) => {
                assert_eq!(fill.order_id, ack.order_id);
                assert_eq!(fill.price, dec!(99));
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_market_order_ack_carries_fill_price() {
        let adapter = test_adapter();
        feed_price(&adapter, "ETHUSDT", dec!(2000)).await;

        let ack = adapter
            .place_market_order(
                "ETHUSDT",
                PositionSide::Long,
                OrderSide::Buy,
                dec!(1),
                false,
            )
            .await
            .unwrap();

        assert_eq!(ack.status, OrderStatus::Filled);
        // Default slippage 0.0005 on the mark fallback
        assert_eq!(ack.avg_fill_price, Some(dec!(2000) * dec!(1.0005)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_success() {
        let adapter = test_adapter();
        let status = adapter.cancel_order("ETHUSDT", "SIM-404").await.unwrap();
        assert_eq!(status, OrderStatus::Unknown);
    }

    #[tokio::test]
    async fn test_cancel_emits_cancelled_event() {
        let adapter = test_adapter();
        let ack = adapter
            .place_stop_limit_order(
                "ETHUSDT",
                PositionSide::Long,
                OrderSide::Sell,
                dec!(1),
                dec!(95),
                dec!(95.5),
                true,
            )
            .await
            .unwrap();

        let mut events = adapter.subscribe();
        let status = adapter.cancel_order("ETHUSDT", &ack.order_id).await.unwrap();
        assert_eq!(status, OrderStatus::Canceled);

        match events.recv().await.unwrap() {
            MarketEvent::OrderCancelled(cancel) => {
                assert_eq!(cancel.order_id, ack.order_id);
                assert_eq!(cancel.order_type, OrderType::StopLimit);
            }
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_order_id_normalisation_priority() {
        let adapter = test_adapter();
        adapter
            .algo_ids
            .write()
            .await
            .insert(777, "BOT-1700-42".to_string());

        // BOT-prefixed client id wins outright
        let update = WsOrderUpdate {
            symbol: "BTCUSDT".to_string(),
            order_id: 123,
            client_order_id: Some("BOT-1700-99".to_string()),
            algo_id: Some(777),
            status: "FILLED".to_string(),
            side: "BUY".to_string(),
            order_type: "LIMIT".to_string(),
            filled_qty: None,
            last_fill_price: None,
            avg_price: None,
        };
        assert_eq!(adapter.normalise_order_id(&update).await, "BOT-1700-99");

        // Mapped algo id comes next
        let update = WsOrderUpdate {
            client_order_id: Some("exchange-generated".to_string()),
            ..update
        };
        assert_eq!(adapter.normalise_order_id(&update).await, "BOT-1700-42");

        // Numeric id is the fallback
        let update = WsOrderUpdate {
            algo_id: None,
            ..update
        };
        assert_eq!(adapter.normalise_order_id(&update).await, "123");
    }

    #[tokio::test]
    async fn test_balance_tracks_sim_fills() {
        let adapter = test_adapter();
        assert_eq!(adapter.get_balance().await.unwrap(), dec!(1000));

        feed_price(&adapter, "ETHUSDT", dec!(100)).await;
        adapter
            .place_market_order(
                "ETHUSDT",
                PositionSide::Long,
                OrderSide::Buy,
                dec!(1),
                false,
            )
            .await
            .unwrap();

        // One taker fee at the default rate
        assert!(adapter.get_balance().await.unwrap() < dec!(1000));
    }
}
