//! Signed REST client for the futures API.

use crate::config::ExchangeConfig;
use crate::exchange::types::*;
use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Exchange-info responses are reused for this long before a refetch.
const EXCHANGE_INFO_TTL: Duration = Duration::from_secs(600);

/// Parameters for a single order placement.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

/// REST client with HMAC-SHA256 request signing.
pub struct RestClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    recv_window: u64,
    exchange_info: RwLock<Option<(Instant, Arc<ExchangeInfo>)>>,
}

impl RestClient {
    /// Create a new client from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: config.base_rest_url.clone(),
            recv_window: config.recv_window,
            exchange_info: RwLock::new(None),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    fn encode_params(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Parse a response, surfacing non-2xx bodies as typed `ExchangeError`s.
    async fn handle<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .with_context(|| format!("Failed to parse {what} response"));
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ExchangeError>(&body) {
            Ok(err) => Err(anyhow::Error::new(err)),
            Err(_) => Err(anyhow!("{what} failed with HTTP {status}: {body}")),
        }
    }

    async fn public<T: DeserializeOwned>(&self, path: &str, query: &str, what: &str) -> Result<T> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {what}"))?;
        Self::handle(response, what).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        what: &str,
    ) -> Result<T> {
        params.push(("timestamp", Self::timestamp().to_string()));
        params.push(("recvWindow", self.recv_window.to_string()));
        let query = Self::encode_params(&params);
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("Failed to call {what}"))?;
        Self::handle(response, what).await
    }

    // ==================== Market data (public) ====================

    /// Get the current mark price for one symbol.
    #[instrument(skip(self))]
    pub async fn get_mark_price(&self, symbol: &str) -> Result<MarkPriceInfo> {
        self.public(
            "/fapi/v1/premiumIndex",
            &format!("symbol={symbol}"),
            "mark price",
        )
        .await
    }

    /// Get the last traded price for one symbol.
    #[instrument(skip(self))]
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<TickerPrice> {
        self.public(
            "/fapi/v1/ticker/price",
            &format!("symbol={symbol}"),
            "ticker price",
        )
        .await
    }

    /// Get 24-hour tickers for all symbols.
    #[instrument(skip(self))]
    pub async fn get_24h_tickers(&self) -> Result<Vec<Ticker24h>> {
        self.public("/fapi/v1/ticker/24hr", "", "24h tickers").await
    }

    /// Get exchange info, served from a 10-minute cache.
    pub async fn get_exchange_info(&self) -> Result<Arc<ExchangeInfo>> {
        if let Some((fetched_at, info)) = self.exchange_info.read().await.as_ref() {
            if fetched_at.elapsed() < EXCHANGE_INFO_TTL {
                return Ok(Arc::clone(info));
            }
        }

        let info: ExchangeInfo = self
            .public("/fapi/v1/exchangeInfo", "", "exchange info")
            .await?;
        let info = Arc::new(info);
        *self.exchange_info.write().await = Some((Instant::now(), Arc::clone(&info)));
        debug!(symbols = info.symbols.len(), "Exchange info refreshed");
        Ok(info)
    }

    /// Tick/step filters for one symbol, from the cached exchange info.
    pub async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let info = self.get_exchange_info().await?;
        Ok(info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.lot_filters())
            .unwrap_or_default())
    }

    /// Get recent klines for a symbol.
    #[instrument(skip(self))]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        self.public(
            "/fapi/v1/klines",
            &format!("symbol={symbol}&interval={interval}&limit={limit}"),
            "klines",
        )
        .await
    }

    /// Get an order-book snapshot.
    #[instrument(skip(self))]
    pub async fn get_depth(&self, symbol: &str, limit: u32) -> Result<Depth> {
        self.public(
            "/fapi/v1/depth",
            &format!("symbol={symbol}&limit={limit}"),
            "depth",
        )
        .await
    }

    // ==================== Account (signed) ====================

    /// Get account balances.
    #[instrument(skip(self))]
    pub async fn get_balance(&self) -> Result<Vec<AccountBalance>> {
        self.signed(Method::GET, "/fapi/v2/balance", vec![], "account balance")
            .await
    }

    /// Get open positions, optionally for one symbol.
    #[instrument(skip(self))]
    pub async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionRisk>> {
        let mut params = vec![];
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol.to_string()));
        }
        self.signed(Method::GET, "/fapi/v2/positionRisk", params, "positions")
            .await
    }

    /// Get the trade reports for one order.
    #[instrument(skip(self))]
    pub async fn get_order_trades(&self, symbol: &str, order_id: i64) -> Result<Vec<UserTrade>> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.signed(Method::GET, "/fapi/v1/userTrades", params, "order trades")
            .await
    }

    /// Set leverage for a symbol.
    #[instrument(skip(self))]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self
            .signed(Method::POST, "/fapi/v1/leverage", params, "set leverage")
            .await?;
        Ok(())
    }

    // ==================== Orders (signed) ====================

    fn order_params(req: &OrderRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("symbol", req.symbol.clone()),
            ("side", format!("{:?}", req.side).to_uppercase()),
            ("positionSide", req.position_side.to_string()),
            ("quantity", req.quantity.to_string()),
        ];
        if let Some(price) = req.price {
            params.push(("price", price.to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(stop) = req.stop_price {
            params.push(("stopPrice", stop.to_string()));
        }
        if req.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        params
    }

    /// Place a plain (non-conditional) order.
    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = ?req.side, order_type = ?req.order_type))]
    pub async fn place_order(&self, req: &OrderRequest) -> Result<OrderResponse> {
        let mut params = Self::order_params(req);
        params.push((
            "type",
            serde_json::to_value(req.order_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "LIMIT".to_string()),
        ));
        if let Some(client_id) = &req.client_order_id {
            params.push(("newClientOrderId", client_id.clone()));
        }

        debug!("Placing order");
        self.signed(Method::POST, "/fapi/v1/order", params, "place order")
            .await
    }

    /// Place a conditional (algo) order with a client-assigned id.
    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = ?req.side, order_type = ?req.order_type))]
    pub async fn place_algo_order(
        &self,
        req: &OrderRequest,
        client_algo_id: &str,
    ) -> Result<AlgoOrderResponse> {
        let mut params = Self::order_params(req);
        params.push((
            "type",
            serde_json::to_value(req.order_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "STOP".to_string()),
        ));
        params.push(("clientAlgoId", client_algo_id.to_string()));

        debug!(%client_algo_id, "Placing algo order");
        self.signed(Method::POST, "/fapi/v1/algoOrder", params, "place algo order")
            .await
    }

    /// Cancel a plain order by numeric id.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.signed(Method::DELETE, "/fapi/v1/order", params, "cancel order")
            .await
    }

    /// Cancel an algo order by its client-assigned id.
    #[instrument(skip(self))]
    pub async fn cancel_algo_order(
        &self,
        symbol: &str,
        client_algo_id: &str,
    ) -> Result<AlgoOrderResponse> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("clientAlgoId", client_algo_id.to_string()),
        ];
        self.signed(
            Method::DELETE,
            "/fapi/v1/algoOrder",
            params,
            "cancel algo order",
        )
        .await
    }

    /// Cancel every open order on a symbol.
    #[instrument(skip(self))]
    pub async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()> {
        let params = vec![("symbol", symbol.to_string())];
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                params,
                "cancel all open orders",
            )
            .await?;
        Ok(())
    }

    // ==================== User data stream (signed) ====================

    /// Obtain a listen key for the user-data websocket.
    #[instrument(skip(self))]
    pub async fn start_user_data_stream(&self) -> Result<ListenKey> {
        self.signed(Method::POST, "/fapi/v1/listenKey", vec![], "listen key")
            .await
    }

    /// Keep the current listen key alive.
    #[instrument(skip(self))]
    pub async fn keepalive_user_data_stream(&self) -> Result<()> {
        let _: serde_json::Value = self
            .signed(
                Method::PUT,
                "/fapi/v1/listenKey",
                vec![],
                "listen key keepalive",
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use rust_decimal_macros::dec;

    fn test_client() -> RestClient {
        RestClient::new(&Config::default().exchange).unwrap()
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let client = test_client();
        let sig = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, client.sign("symbol=BTCUSDT&timestamp=1700000000000"));
    }

    #[test]
    fn test_order_params_include_conditional_fields() {
        let req = OrderRequest {
            symbol: "ETHUSDT".to_string(),
            side: OrderSide::Sell,
            position_side: PositionSide::Long,
            order_type: OrderType::StopLimit,
            quantity: dec!(0.5),
            price: Some(dec!(1800)),
            stop_price: Some(dec!(1795.5)),
            reduce_only: true,
            client_order_id: None,
        };
        let params = RestClient::order_params(&req);
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| *key == k)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("positionSide").as_deref(), Some("LONG"));
        assert_eq!(get("stopPrice").as_deref(), Some("1795.5"));
        assert_eq!(get("reduceOnly").as_deref(), Some("true"));
        assert_eq!(get("timeInForce").as_deref(), Some("GTC"));
    }

    #[test]
    fn test_order_params_omit_absent_fields() {
        let req = OrderRequest {
            symbol: "ETHUSDT".to_string(),
            side: OrderSide::Buy,
            position_side: PositionSide::Long,
            order_type: OrderType::Market,
            quantity: dec!(1),
            price: None,
            stop_price: None,
            reduce_only: false,
            client_order_id: None,
        };
        let params = RestClient::order_params(&req);
        assert!(params.iter().all(|(k, _)| *k != "price"));
        assert!(params.iter().all(|(k, _)| *k != "stopPrice"));
        assert!(params.iter().all(|(k, _)| *k != "reduceOnly"));
    }
}
