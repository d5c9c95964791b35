//! Type definitions for exchange API payloads and engine events.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened with this side.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type. `StopLimit` maps to the exchange's `STOP` wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    #[serde(rename = "STOP", alias = "STOP_LIMIT")]
    StopLimit,
    StopMarket,
    Market,
}

impl OrderType {
    /// Conditional orders route through the algo-order endpoint in live mode.
    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderType::StopLimit | OrderType::StopMarket)
    }
}

/// Position side in hedge mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Entry order side for this position side.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Exit (reduce-only) order side for this position side.
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short; multiplies price moves into P&L.
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
    /// Cancel of an order the exchange no longer knows (code -2011)
    Unknown,
}

/// Typed exchange rejection, parsed from a non-2xx REST body.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeError {
    pub code: i64,
    #[serde(rename = "msg")]
    pub message: String,
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exchange error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ExchangeError {}

/// Cancel target no longer exists on the exchange.
pub const ERR_UNKNOWN_ORDER: i64 = -2011;
/// Conditional order would trigger immediately at submission.
pub const ERR_WOULD_TRIGGER_IMMEDIATELY: i64 = -2021;

/// Per-symbol lot filters extracted from exchange info.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size: Decimal::new(1, 8),
            step_size: Decimal::new(1, 8),
        }
    }
}

/// Exchange info response.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

/// Trading pair metadata with raw filter entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub quote_asset: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// One entry of a symbol's filter array.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolFilter {
    pub filter_type: String,
    #[serde(default)]
    pub tick_size: Option<Decimal>,
    #[serde(default)]
    pub step_size: Option<Decimal>,
}

impl SymbolInfo {
    /// Extract tick and step sizes from the filter array.
    pub fn lot_filters(&self) -> SymbolFilters {
        let mut filters = SymbolFilters::default();
        for f in &self.filters {
            match f.filter_type.as_str() {
                "PRICE_FILTER" => {
                    if let Some(tick) = f.tick_size {
                        filters.tick_size = tick;
                    }
                }
                "LOT_SIZE" => {
                    if let Some(step) = f.step_size {
                        filters.step_size = step;
                    }
                }
                _ => {}
            }
        }
        filters
    }
}

/// Mark price (premium index) response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkPriceInfo {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
}

/// Last traded price.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

/// 24-hour ticker statistics.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price_change_percent: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,
}

/// One kline bar. The wire format is a positional array.
#[derive(Debug, Clone)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
}

impl<'de> Deserialize<'de> for Kline {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // [openTime, open, high, low, close, volume, closeTime, quoteVolume, ...]
        let raw: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
        let num = |i: usize| -> Result<Decimal, D::Error> {
            raw.get(i)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Decimal>().ok())
                .ok_or_else(|| serde::de::Error::custom(format!("bad kline field {i}")))
        };
        Ok(Kline {
            open_time: raw
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| serde::de::Error::custom("bad kline open time"))?,
            open: num(1)?,
            high: num(2)?,
            low: num(3)?,
            close: num(4)?,
            volume: num(5)?,
            quote_volume: num(7)?,
        })
    }
}

/// Order-book snapshot with [price, qty] levels.
#[derive(Debug, Clone, Deserialize)]
pub struct Depth {
    pub bids: Vec<[Decimal; 2]>,
    pub asks: Vec<[Decimal; 2]>,
}

impl Depth {
    /// Total quoted notional across both sides.
    pub fn notional(&self) -> Decimal {
        self.bids
            .iter()
            .chain(self.asks.iter())
            .map(|level| level[0] * level[1])
            .sum()
    }
}

/// Futures account balance entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
}

/// Position risk entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub un_realized_profit: Decimal,
}

/// Per-order trade report used for P&L reconciliation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrade {
    pub symbol: String,
    pub order_id: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub realized_pnl: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub commission: Decimal,
}

/// Listen-key issuance response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}

/// Plain order placement/cancel response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    pub client_order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
}

/// Algo (conditional) order placement response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoOrderResponse {
    pub algo_id: i64,
    #[serde(default)]
    pub client_algo_id: String,
    #[serde(default)]
    pub success: bool,
}

/// Normalised acknowledgement returned to strategies for every placement.
///
/// `order_id` is the single id strategies key their pending maps by; the
/// plain-vs-algo split never leaks past the adapter.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    /// Exchange-assigned numeric id, when one exists
    pub numeric_id: Option<i64>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// Average fill price when the order executed immediately (market orders)
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
}

/// Fill event delivered to traders. Carries all three id spaces so
/// consumers can reverse-lookup pending orders by any key.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub symbol: String,
    pub order_id: String,
    pub numeric_order_id: Option<i64>,
    pub client_order_id: Option<String>,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: OrderSide,
}

/// Cancellation/expiry event delivered to traders.
#[derive(Debug, Clone)]
pub struct OrderCancel {
    pub symbol: String,
    pub order_id: String,
    pub numeric_order_id: Option<i64>,
    pub client_order_id: Option<String>,
    pub status: OrderStatus,
    pub side: OrderSide,
    pub order_type: OrderType,
}

/// Event fanned out from the adapter to every subscribed trader.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    MarkPrice {
        symbol: String,
        price: Decimal,
    },
    BookTicker {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
    },
    OrderFilled(OrderFill),
    OrderCancelled(OrderCancel),
}

impl MarketEvent {
    /// Routing key for symbol-filtered dispatch.
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::MarkPrice { symbol, .. } => symbol,
            MarketEvent::BookTicker { symbol, .. } => symbol,
            MarketEvent::OrderFilled(fill) => &fill.symbol,
            MarketEvent::OrderCancelled(cancel) => &cancel.symbol,
        }
    }
}

// ==================== WebSocket payloads ====================

/// Mark-price stream update.
#[derive(Debug, Clone, Deserialize)]
pub struct WsMarkPrice {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub mark_price: String,
}

/// Book-ticker stream update.
#[derive(Debug, Clone, Deserialize)]
pub struct WsBookTicker {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid_price: String,
    #[serde(rename = "a")]
    pub ask_price: String,
}

/// User-data order update (`ORDER_TRADE_UPDATE`).
#[derive(Debug, Clone, Deserialize)]
pub struct WsOrderUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "c", default)]
    pub client_order_id: Option<String>,
    /// Present on conditional orders routed through the algo endpoint
    #[serde(rename = "ai", alias = "algoId", default)]
    pub algo_id: Option<i64>,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "z", default)]
    pub filled_qty: Option<String>,
    #[serde(rename = "L", default)]
    pub last_fill_price: Option<String>,
    #[serde(rename = "ap", default)]
    pub avg_price: Option<String>,
}
