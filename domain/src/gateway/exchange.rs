//! Adapter for the API-key exchange.
//!
//! Every request, including the session grant, is signed with the user's API
//! secret. Session tokens carry no reported lifetime, so they are only
//! refreshed after the exchange answers 401.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use integration_auth::error::{Error as AuthError, ErrorKind as AuthErrorKind, HttpErrorKind};
use integration_auth::http::{
    send_json, AuthenticatedClient, AuthenticatedClientBuilder, RequestSigner,
};
use integration_auth::session::{
    ApiRequest, AuthenticatedHttpClient, SessionManager, SessionState, Token,
};
use integration_auth::ProviderKind;
use log::*;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service::config::Config;

use super::broker::{
    validate_order_id, validate_symbol, Bar, BarInterval, BrokerAdapter, HistoryRange, Operation,
    Order, OrderRequest, OrderSide, OrderStatus, OrderStatusFilter, OrderType, Position, Quote,
};
use crate::error::Error;

#[derive(Clone)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub timeout: Duration,
}

impl ExchangeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.exchange_base_url().to_string(),
            timeout: config.http_timeout(),
        }
    }
}

/// API key pair issued by the exchange to the user.
#[derive(Clone)]
pub struct ExchangeKeys {
    pub api_key: String,
    pub api_secret: SecretString,
}

/// Stored credential blob: the key pair plus the current session tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeStoredCredentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Path and query exactly as they appear on the request line.
fn signing_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Signed transport for the exchange.
pub struct ExchangeClient {
    http: AuthenticatedClient,
    base_url: String,
    signer: RequestSigner,
}

impl ExchangeClient {
    pub fn new(settings: &ExchangeSettings, keys: &ExchangeKeys) -> Result<Self, AuthError> {
        Ok(Self {
            http: AuthenticatedClientBuilder::new()
                .with_timeout(settings.timeout)
                .with_default_header("accept", "application/json")
                .build()?,
            base_url: settings.base_url.clone(),
            signer: RequestSigner::new(
                SecretString::from(keys.api_key.clone()),
                keys.api_secret.clone(),
            ),
        })
    }

    async fn send_signed(
        &self,
        access_token: Option<&str>,
        request: &ApiRequest,
    ) -> Result<Value, AuthError> {
        let url = request.url(&self.base_url)?;
        let body = request.body_bytes();
        let headers = self
            .signer
            .headers(&request.method, &signing_path(&url), &body)?;

        let mut builder = self.http.request(request.method.clone(), url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(access_token) = access_token {
            builder = builder.bearer_auth(access_token);
        }
        if !body.is_empty() {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        send_json(builder).await
    }

    fn session_token(value: Value) -> Result<Token, AuthError> {
        let response: SessionResponse = serde_json::from_value(value).map_err(|e| AuthError {
            source: Some(Box::new(e)),
            error_kind: AuthErrorKind::Http(HttpErrorKind::InvalidResponse),
        })?;
        Ok(Token::new(response.access_token, response.refresh_token, None))
    }
}

#[async_trait]
impl AuthenticatedHttpClient for ExchangeClient {
    /// The key pair is already held by the client's signer.
    type Credentials = ();

    fn provider(&self) -> ProviderKind {
        ProviderKind::Exchange
    }

    async fn authenticate(&self, _: &()) -> Result<Token, AuthError> {
        let value = self
            .send_signed(None, &ApiRequest::post("/v2/auth/session"))
            .await?;
        Self::session_token(value)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Token, AuthError> {
        let request = ApiRequest::post("/v2/auth/refresh")
            .with_json(&serde_json::json!({ "refresh_token": refresh_token }))?;
        let value = self.send_signed(None, &request).await?;
        Self::session_token(value)
    }

    async fn request(&self, access_token: &str, request: &ApiRequest) -> Result<Value, AuthError> {
        self.send_signed(Some(access_token), request).await
    }
}

#[derive(Debug, Deserialize)]
struct BalancesEnvelope {
    balances: Vec<WireBalance>,
}

#[derive(Debug, Deserialize)]
struct WireBalance {
    asset: String,
    free: f64,
    #[serde(default)]
    locked: f64,
    #[serde(default)]
    avg_cost: f64,
    #[serde(default = "default_quote_currency")]
    quote_currency: String,
}

fn default_quote_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize)]
struct WireTicker {
    symbol: String,
    price: f64,
    #[serde(default)]
    change_24h_pct: Option<f64>,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OrdersEnvelope {
    orders: Vec<WireOrder>,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    order_id: String,
    symbol: String,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: OrderType,
    qty: f64,
    #[serde(default)]
    price: Option<f64>,
    state: String,
    #[serde(default)]
    created_ms: Option<i64>,
}

impl From<WireOrder> for Order {
    fn from(wire: WireOrder) -> Self {
        let status = match wire.state.as_str() {
            "filled" => OrderStatus::Filled,
            "canceled" | "cancelled" => OrderStatus::Cancelled,
            "rejected" | "expired" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        };
        Order {
            id: wire.order_id,
            symbol: wire.symbol,
            side: wire.side,
            order_type: wire.order_type,
            quantity: wire.qty,
            limit_price: wire.price,
            status,
            created_at: wire.created_ms.and_then(from_epoch_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TradesEnvelope {
    trades: Vec<WireTrade>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    trade_id: String,
    symbol: String,
    side: OrderSide,
    qty: f64,
    price: f64,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct CandlesEnvelope {
    candles: Vec<WireCandle>,
}

#[derive(Debug, Deserialize)]
struct WireCandle {
    open_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
}

fn kline_interval(interval: BarInterval) -> &'static str {
    match interval {
        BarInterval::Day => "1d",
        BarInterval::Week => "1w",
        BarInterval::Month => "1M",
    }
}

fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// First millisecond of `from` to the last millisecond of `to`.
fn range_bounds_ms(range: &HistoryRange) -> (i64, i64) {
    let start = day_start_ms(range.from);
    let end = range
        .to
        .succ_opt()
        .map(|next| day_start_ms(next) - 1)
        .unwrap_or(i64::MAX);
    (start, end)
}

fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

/// [`BrokerAdapter`] for the exchange.
pub struct ExchangeAdapter {
    session: SessionManager<ExchangeClient>,
    keys: ExchangeKeys,
}

impl ExchangeAdapter {
    /// Adapter for a key pair that has not opened a session yet.
    pub fn new(settings: &ExchangeSettings, keys: ExchangeKeys) -> Result<Self, Error> {
        let client = ExchangeClient::new(settings, &keys)?;
        Ok(Self {
            session: SessionManager::new(client, None),
            keys,
        })
    }

    /// Adapter resuming from credentials read out of the vault.
    pub fn from_stored(
        settings: &ExchangeSettings,
        stored: ExchangeStoredCredentials,
    ) -> Result<Self, Error> {
        let keys = ExchangeKeys {
            api_key: stored.api_key,
            api_secret: SecretString::from(stored.api_secret),
        };
        let token = stored
            .access_token
            .map(|access| Token::new(access, stored.refresh_token, None));
        let client = ExchangeClient::new(settings, &keys)?;
        Ok(Self {
            session: SessionManager::new(client, token),
            keys,
        })
    }

    /// Open a session with the key pair. Returns the credential JSON to
    /// encrypt and store.
    pub async fn connect(&self) -> Result<Value, Error> {
        let token = self.session.connect(&()).await?;
        info!("Exchange account connected");
        Ok(serde_json::to_value(self.stored_credentials(&token))?)
    }

    fn stored_credentials(&self, token: &Token) -> ExchangeStoredCredentials {
        ExchangeStoredCredentials {
            api_key: self.keys.api_key.clone(),
            api_secret: self.keys.api_secret.expose_secret().clone(),
            access_token: Some(token.access_token.expose_secret().clone()),
            refresh_token: token
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().clone()),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, Error> {
        let value = self.session.execute(&request).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl BrokerAdapter for ExchangeAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Exchange
    }

    async fn positions(&self) -> Result<Vec<Position>, Error> {
        let envelope: BalancesEnvelope = self.fetch(ApiRequest::get("/v2/balances")).await?;
        Ok(envelope
            .balances
            .into_iter()
            .filter(|b| b.free + b.locked > 0.0)
            .map(|b| Position {
                symbol: b.asset,
                quantity: b.free + b.locked,
                average_price: b.avg_cost,
                market_value: None,
                currency: b.quote_currency,
            })
            .collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, Error> {
        validate_symbol(symbol)?;
        let ticker: WireTicker = self
            .fetch(ApiRequest::get("/v2/ticker").with_query("symbol", symbol))
            .await?;
        Ok(Quote {
            symbol: ticker.symbol,
            price: ticker.price,
            change_percent: ticker.change_24h_pct,
            as_of: ticker.time.and_then(from_epoch_ms),
        })
    }

    async fn orders(&self, filter: OrderStatusFilter) -> Result<Vec<Order>, Error> {
        let request = ApiRequest::get("/v2/orders").with_query("state", filter.as_str());
        let envelope: OrdersEnvelope = self.fetch(request).await?;
        Ok(envelope.orders.into_iter().map(Order::from).collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<Order, Error> {
        order.validate()?;
        let mut body = serde_json::json!({
            "symbol": order.symbol,
            "side": order.side,
            "type": order.order_type,
            "qty": order.quantity,
        });
        if let Some(price) = order.limit_price {
            body["price"] = serde_json::json!(price);
        }
        let wire: WireOrder = self
            .fetch(ApiRequest::post("/v2/orders").with_json(&body)?)
            .await?;
        info!("Placed exchange order {} for {}", wire.order_id, wire.symbol);
        Ok(wire.into())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), Error> {
        validate_order_id(order_id)?;
        let path = format!("/v2/orders/{}", urlencoding::encode(order_id));
        self.session.execute(&ApiRequest::delete(path)).await?;
        info!("Cancelled exchange order {}", order_id);
        Ok(())
    }

    async fn history(
        &self,
        symbol: Option<&str>,
        range: &HistoryRange,
    ) -> Result<Vec<Operation>, Error> {
        range.validate()?;
        let (start_ms, end_ms) = range_bounds_ms(range);
        let mut request = ApiRequest::get("/v2/trades")
            .with_query("start_ms", start_ms)
            .with_query("end_ms", end_ms);
        if let Some(symbol) = symbol {
            validate_symbol(symbol)?;
            request = request.with_query("symbol", symbol);
        }

        let envelope: TradesEnvelope = self.fetch(request).await?;
        Ok(envelope
            .trades
            .into_iter()
            .filter_map(|t| {
                let executed_at = from_epoch_ms(t.time)?;
                let signed_amount = match t.side {
                    OrderSide::Buy => -(t.qty * t.price),
                    OrderSide::Sell => t.qty * t.price,
                };
                Some(Operation {
                    id: t.trade_id,
                    symbol: Some(t.symbol),
                    kind: match t.side {
                        OrderSide::Buy => "buy".to_string(),
                        OrderSide::Sell => "sell".to_string(),
                    },
                    quantity: Some(t.qty),
                    amount: signed_amount,
                    executed_at,
                })
            })
            .collect())
    }

    async fn price_history(
        &self,
        symbol: &str,
        range: &HistoryRange,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, Error> {
        validate_symbol(symbol)?;
        range.validate()?;
        let (start_ms, end_ms) = range_bounds_ms(range);
        let request = ApiRequest::get("/v2/klines")
            .with_query("symbol", symbol)
            .with_query("interval", kline_interval(interval))
            .with_query("start_ms", start_ms)
            .with_query("end_ms", end_ms);

        let envelope: CandlesEnvelope = self.fetch(request).await?;
        let mut bars: Vec<Bar> = envelope
            .candles
            .into_iter()
            .filter_map(|c| {
                Some(Bar {
                    start: from_epoch_ms(c.open_ms)?,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                })
            })
            .collect();
        bars.sort_by_key(|bar| bar.start);
        Ok(bars)
    }

    fn session_state(&self) -> SessionState {
        self.session.state()
    }

    fn take_refreshed_credentials(&self) -> Option<Value> {
        self.session
            .take_refreshed_token()
            .and_then(|token| serde_json::to_value(self.stored_credentials(&token)).ok())
    }
}
