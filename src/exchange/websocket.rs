//! WebSocket clients for market data and user-data streams.
//!
//! Both sockets reconnect on a fixed 3-second delay. Backoff is deliberately
//! not used: during a transient outage the priority is to minimise missed
//! fills, not to spare the endpoint. Concurrent reconnect attempts are
//! debounced by a generation counter; only the task holding the current
//! generation may reconnect.

use crate::exchange::client::RestClient;
use crate::exchange::types::{MarketEvent, WsBookTicker, WsMarkPrice, WsOrderUpdate};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Reconnect delay after close/error. Fixed on purpose.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// Watchdog polling cadence.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
/// Socket is considered dead after this much silence.
const STALE_AFTER: Duration = Duration::from_secs(10);
/// Listen-key keepalive cadence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25 * 60);

/// Message from the market socket to the adapter.
#[derive(Debug, Clone)]
pub enum MarketWsEvent {
    Event(MarketEvent),
    Up,
    Down,
}

/// Message from the user-data socket to the adapter.
#[derive(Debug, Clone)]
pub enum UserWsEvent {
    OrderUpdate(WsOrderUpdate),
    Up,
    Down,
}

/// Combined market-data socket over a dynamic symbol set.
///
/// Each subscribed symbol contributes two streams: `<s>@markPrice@1s` and
/// `<s>@bookTicker`.
pub struct MarketSocket {
    base_url: String,
    tx: mpsc::Sender<MarketWsEvent>,
    symbols: Mutex<Vec<String>>,
    generation: Arc<AtomicU64>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MarketSocket {
    pub fn new(base_url: String, tx: mpsc::Sender<MarketWsEvent>) -> Self {
        Self {
            base_url,
            tx,
            symbols: Mutex::new(Vec::new()),
            generation: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Replace the subscribed symbol set. An unchanged set is a no-op;
    /// a changed set tears the socket down and reconnects.
    pub async fn update_symbols(&self, symbols: Vec<String>) {
        let mut wanted: Vec<String> = symbols.into_iter().map(|s| s.to_lowercase()).collect();
        wanted.sort();
        wanted.dedup();

        {
            let mut current = self.symbols.lock().await;
            if *current == wanted {
                return;
            }
            *current = wanted.clone();
        }

        // Invalidate any in-flight reconnect before spawning the replacement.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }

        if wanted.is_empty() {
            info!("Market socket idle: no symbols subscribed");
            return;
        }

        let streams: Vec<String> = wanted
            .iter()
            .flat_map(|s| [format!("{s}@markPrice@1s"), format!("{s}@bookTicker")])
            .collect();
        let url = format!("{}/stream?streams={}", self.base_url, streams.join("/"));

        let tx = self.tx.clone();
        let gen_counter = Arc::clone(&self.generation);
        let handle = tokio::spawn(async move {
            market_socket_loop(url, tx, gen_counter, generation).await;
        });
        *self.task.lock().await = Some(handle);
    }

}

/// Connect-read-reconnect loop for the market socket.
async fn market_socket_loop(
    url: String,
    tx: mpsc::Sender<MarketWsEvent>,
    gen_counter: Arc<AtomicU64>,
    my_generation: u64,
) {
    loop {
        if gen_counter.load(Ordering::SeqCst) != my_generation {
            return;
        }

        info!(%url, "Connecting market websocket");
        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                let _ = tx.send(MarketWsEvent::Up).await;
                let (_write, mut read) = ws_stream.split();
                let mut last_message = Instant::now();
                let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
                watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                last_message = Instant::now();
                                if let Some(event) = parse_market_message(&text) {
                                    if tx.send(MarketWsEvent::Event(event)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                last_message = Instant::now();
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Market websocket closed by server");
                                break;
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "Market websocket error");
                                break;
                            }
                            Some(Ok(_)) => {}
                        },
                        _ = watchdog.tick() => {
                            if last_message.elapsed() > STALE_AFTER {
                                warn!(
                                    silent_for = ?last_message.elapsed(),
                                    "Market websocket stale, terminating"
                                );
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Market websocket connect failed");
            }
        }

        let _ = tx.send(MarketWsEvent::Down).await;
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Parse one combined-stream frame into a market event.
fn parse_market_message(text: &str) -> Option<MarketEvent> {
    #[derive(serde::Deserialize)]
    struct StreamWrapper {
        data: serde_json::Value,
    }

    let wrapper: StreamWrapper = serde_json::from_str(text).ok()?;
    match wrapper.data.get("e").and_then(|e| e.as_str()) {
        Some("markPriceUpdate") => {
            let update: WsMarkPrice = serde_json::from_value(wrapper.data).ok()?;
            Some(MarketEvent::MarkPrice {
                symbol: update.symbol,
                price: update.mark_price.parse::<Decimal>().ok()?,
            })
        }
        Some("bookTicker") | None => {
            // bookTicker frames omit the event tag on some gateways
            let update: WsBookTicker = serde_json::from_value(wrapper.data).ok()?;
            Some(MarketEvent::BookTicker {
                symbol: update.symbol,
                bid: update.bid_price.parse::<Decimal>().ok()?,
                ask: update.ask_price.parse::<Decimal>().ok()?,
            })
        }
        _ => None,
    }
}

/// User-data socket: order updates over a listen-keyed stream.
pub struct UserSocket {
    base_url: String,
    rest: Arc<RestClient>,
    tx: mpsc::Sender<UserWsEvent>,
}

impl UserSocket {
    pub fn new(base_url: String, rest: Arc<RestClient>, tx: mpsc::Sender<UserWsEvent>) -> Self {
        Self { base_url, rest, tx }
    }

    /// Obtain a listen key and run the socket until the receiver is dropped.
    ///
    /// Keeps the listen key alive on a 25-minute cadence; `listenKeyExpired`
    /// terminates the connection so the outer loop re-issues a fresh key.
    pub async fn run(self) -> Result<()> {
        loop {
            let listen_key = self
                .rest
                .start_user_data_stream()
                .await
                .context("Failed to obtain listen key")?
                .listen_key;
            let url = format!("{}/ws/{}", self.base_url, listen_key);

            info!("Connecting user-data websocket");
            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    let _ = self.tx.send(UserWsEvent::Up).await;
                    let (_write, mut read) = ws_stream.split();
                    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
                    keepalive.tick().await; // first tick fires immediately

                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    match parse_user_message(&text) {
                                        UserMessage::Order(update) => {
                                            if self.tx.send(UserWsEvent::OrderUpdate(update)).await.is_err() {
                                                return Ok(());
                                            }
                                        }
                                        UserMessage::ListenKeyExpired => {
                                            warn!("Listen key expired, reconnecting with a fresh key");
                                            break;
                                        }
                                        UserMessage::Other => {}
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    info!("User websocket closed by server");
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!(error = %e, "User websocket error");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            },
                            _ = keepalive.tick() => {
                                if let Err(e) = self.rest.keepalive_user_data_stream().await {
                                    warn!(error = %e, "Listen key keepalive failed");
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "User websocket connect failed");
                }
            }

            let _ = self.tx.send(UserWsEvent::Down).await;
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

enum UserMessage {
    Order(WsOrderUpdate),
    ListenKeyExpired,
    Other,
}

fn parse_user_message(text: &str) -> UserMessage {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return UserMessage::Other,
    };
    match value.get("e").and_then(|e| e.as_str()) {
        Some("ORDER_TRADE_UPDATE") => {
            match value
                .get("o")
                .cloned()
                .map(serde_json::from_value::<WsOrderUpdate>)
            {
                Some(Ok(update)) => UserMessage::Order(update),
                _ => {
                    debug!("Unparseable order update frame");
                    UserMessage::Other
                }
            }
        }
        Some("listenKeyExpired") => UserMessage::ListenKeyExpired,
        _ => UserMessage::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_mark_price_frame() {
        let frame = r#"{"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate","s":"BTCUSDT","p":"50000.10"}}"#;
        match parse_market_message(frame) {
            Some(MarketEvent::MarkPrice { symbol, price }) => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(price, dec!(50000.10));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_book_ticker_frame_without_event_tag() {
        let frame = r#"{"stream":"ethusdt@bookTicker","data":{"s":"ETHUSDT","b":"1800.5","B":"10","a":"1800.7","A":"8"}}"#;
        match parse_market_message(frame) {
            Some(MarketEvent::BookTicker { symbol, bid, ask }) => {
                assert_eq!(symbol, "ETHUSDT");
                assert_eq!(bid, dec!(1800.5));
                assert_eq!(ask, dec!(1800.7));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_user_order_update() {
        let frame = r#"{"e":"ORDER_TRADE_UPDATE","o":{"s":"BTCUSDT","i":123,"c":"BOT-1-2","X":"FILLED","S":"BUY","o":"LIMIT","z":"0.5","L":"49999.9","ap":"49999.9"}}"#;
        match parse_user_message(frame) {
            UserMessage::Order(update) => {
                assert_eq!(update.order_id, 123);
                assert_eq!(update.client_order_id.as_deref(), Some("BOT-1-2"));
                assert_eq!(update.status, "FILLED");
            }
            _ => panic!("expected order update"),
        }
    }

    #[test]
    fn test_parse_listen_key_expired() {
        assert!(matches!(
            parse_user_message(r#"{"e":"listenKeyExpired"}"#),
            UserMessage::ListenKeyExpired
        ));
    }

    #[tokio::test]
    async fn test_update_symbols_identical_set_is_noop() {
        let (tx, _rx) = mpsc::channel(16);
        let socket = MarketSocket::new("wss://example.invalid".to_string(), tx);

        socket
            .update_symbols(vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()])
            .await;
        let gen_after_first = socket.generation.load(Ordering::SeqCst);

        // Same membership in a different order must not bump the generation.
        socket
            .update_symbols(vec!["ETHUSDT".to_string(), "BTCUSDT".to_string()])
            .await;
        assert_eq!(socket.generation.load(Ordering::SeqCst), gen_after_first);

        // A genuine change reconnects.
        socket.update_symbols(vec!["BTCUSDT".to_string()]).await;
        assert_eq!(
            socket.generation.load(Ordering::SeqCst),
            gen_after_first + 1
        );
    }
}
