//! Adapter for the OAuth-style brokerage API.
//!
//! Users connect with username and password once (password grant). The
//! brokerage returns a bearer token with a reported lifetime plus a refresh
//! token; only the tokens are stored, never the password.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use integration_auth::error::{Error as AuthError, ErrorKind as AuthErrorKind, HttpErrorKind};
use integration_auth::http::{send_json, AuthenticatedClient, AuthenticatedClientBuilder};
use integration_auth::session::{
    ApiRequest, AuthenticatedHttpClient, SessionManager, SessionState, StoredToken, Token,
};
use integration_auth::ProviderKind;
use log::*;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use service::config::Config;

use super::broker::{
    validate_order_id, validate_symbol, Bar, BarInterval, BrokerAdapter, HistoryRange, Operation,
    Order, OrderRequest, OrderSide, OrderStatus, OrderStatusFilter, OrderType, Position, Quote,
};
use crate::error::Error;

/// Connection settings for the brokerage API.
#[derive(Clone)]
pub struct BrokerageSettings {
    pub base_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub timeout: Duration,
    pub refresh_buffer: chrono::Duration,
}

impl BrokerageSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.brokerage_base_url().to_string(),
            client_id: config.brokerage_client_id(),
            client_secret: config.brokerage_client_secret().map(SecretString::from),
            timeout: config.http_timeout(),
            refresh_buffer: chrono::Duration::seconds(config.token_refresh_buffer_secs),
        }
    }
}

/// What the user types in when connecting the brokerage account.
pub struct BrokerageLogin {
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Transport and token grants for the brokerage.
pub struct BrokerageClient {
    http: AuthenticatedClient,
    base_url: String,
    client_id: Option<String>,
    client_secret: Option<SecretString>,
}

impl BrokerageClient {
    pub fn new(settings: &BrokerageSettings) -> Result<Self, AuthError> {
        let mut builder = AuthenticatedClientBuilder::new()
            .with_timeout(settings.timeout)
            .with_default_header("accept", "application/json");
        if let Some(client_id) = &settings.client_id {
            builder = builder.with_default_header("x-client-id", client_id.as_str());
        }

        Ok(Self {
            http: builder.build()?,
            base_url: settings.base_url.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
        })
    }

    async fn token_grant(&self, params: Vec<(&str, &str)>) -> Result<Token, AuthError> {
        let url = ApiRequest::post("/oauth/token").url(&self.base_url)?;

        let mut form = params;
        if let Some(client_id) = &self.client_id {
            form.push(("client_id", client_id.as_str()));
        }
        if let Some(client_secret) = &self.client_secret {
            form.push(("client_secret", client_secret.expose_secret().as_str()));
        }

        let value = send_json(self.http.post(url).form(&form)).await?;
        let response: TokenResponse = serde_json::from_value(value).map_err(|e| AuthError {
            source: Some(Box::new(e)),
            error_kind: AuthErrorKind::Http(HttpErrorKind::InvalidResponse),
        })?;

        Ok(Token::new(
            response.access_token,
            response.refresh_token,
            response.expires_in,
        ))
    }
}

#[async_trait]
impl AuthenticatedHttpClient for BrokerageClient {
    type Credentials = BrokerageLogin;

    fn provider(&self) -> ProviderKind {
        ProviderKind::Brokerage
    }

    async fn authenticate(&self, login: &BrokerageLogin) -> Result<Token, AuthError> {
        self.token_grant(vec![
            ("grant_type", "password"),
            ("username", login.username.as_str()),
            ("password", login.password.expose_secret().as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Token, AuthError> {
        self.token_grant(vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn request(&self, access_token: &str, request: &ApiRequest) -> Result<Value, AuthError> {
        let url = request.url(&self.base_url)?;
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .bearer_auth(access_token);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        send_json(builder).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionsEnvelope {
    positions: Vec<WirePosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    symbol: String,
    quantity: f64,
    average_price: f64,
    #[serde(default)]
    market_value: Option<f64>,
    #[serde(default = "default_currency")]
    currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQuote {
    symbol: String,
    last: f64,
    #[serde(default)]
    change_percent: Option<f64>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrdersEnvelope {
    orders: Vec<WireOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrder {
    id: String,
    symbol: String,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: OrderType,
    quantity: f64,
    #[serde(default)]
    limit_price: Option<f64>,
    status: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl From<WireOrder> for Order {
    fn from(wire: WireOrder) -> Self {
        let status = match wire.status.as_str() {
            "filled" => OrderStatus::Filled,
            "cancelled" | "canceled" => OrderStatus::Cancelled,
            "rejected" | "expired" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        };
        Order {
            id: wire.id,
            symbol: wire.symbol,
            side: wire.side,
            order_type: wire.order_type,
            quantity: wire.quantity,
            limit_price: wire.limit_price,
            status,
            created_at: wire.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationsEnvelope {
    operations: Vec<WireOperation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOperation {
    id: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    quantity: Option<f64>,
    amount: f64,
    date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BarsEnvelope {
    bars: Vec<WireBar>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBar {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
}

/// [`BrokerAdapter`] for the brokerage, backed by a session manager.
pub struct BrokerageAdapter {
    session: SessionManager<BrokerageClient>,
}

impl BrokerageAdapter {
    /// Adapter without a session; call [`BrokerageAdapter::connect`] next.
    pub fn new(settings: &BrokerageSettings) -> Result<Self, Error> {
        Self::with_token(settings, None)
    }

    /// Adapter resuming from credentials read out of the vault.
    pub fn from_stored(settings: &BrokerageSettings, stored: StoredToken) -> Result<Self, Error> {
        Self::with_token(settings, Some(Token::from(stored)))
    }

    fn with_token(settings: &BrokerageSettings, token: Option<Token>) -> Result<Self, Error> {
        let client = BrokerageClient::new(settings)?;
        Ok(Self {
            session: SessionManager::new(client, token).with_refresh_buffer(settings.refresh_buffer),
        })
    }

    /// Password grant. Returns the credential JSON to encrypt and store.
    pub async fn connect(&self, login: &BrokerageLogin) -> Result<Value, Error> {
        let token = self.session.connect(login).await?;
        info!("Brokerage account {} connected", login.username);
        Ok(serde_json::to_value(token.to_stored())?)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, Error> {
        let value = self.session.execute(&request).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn date_param(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[async_trait]
impl BrokerAdapter for BrokerageAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Brokerage
    }

    async fn positions(&self) -> Result<Vec<Position>, Error> {
        let envelope: PositionsEnvelope = self.fetch(ApiRequest::get("/portfolio/positions")).await?;
        debug!("Fetched {} brokerage positions", envelope.positions.len());
        Ok(envelope
            .positions
            .into_iter()
            .map(|p| Position {
                symbol: p.symbol,
                quantity: p.quantity,
                average_price: p.average_price,
                market_value: p.market_value,
                currency: p.currency,
            })
            .collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, Error> {
        validate_symbol(symbol)?;
        let path = format!("/marketdata/quotes/{}", urlencoding::encode(symbol));
        let wire: WireQuote = self.fetch(ApiRequest::get(path)).await?;
        Ok(Quote {
            symbol: wire.symbol,
            price: wire.last,
            change_percent: wire.change_percent,
            as_of: wire.timestamp,
        })
    }

    async fn orders(&self, filter: OrderStatusFilter) -> Result<Vec<Order>, Error> {
        let request = ApiRequest::get("/orders").with_query("status", filter.as_str());
        let envelope: OrdersEnvelope = self.fetch(request).await?;
        Ok(envelope.orders.into_iter().map(Order::from).collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<Order, Error> {
        order.validate()?;
        let body = serde_json::json!({
            "symbol": order.symbol,
            "side": order.side,
            "type": order.order_type,
            "quantity": order.quantity,
            "limitPrice": order.limit_price,
        });
        let request = ApiRequest::post("/orders").with_json(&body)?;
        let wire: WireOrder = self.fetch(request).await?;
        info!("Placed brokerage order {} for {}", wire.id, wire.symbol);
        Ok(wire.into())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), Error> {
        validate_order_id(order_id)?;
        let path = format!("/orders/{}", urlencoding::encode(order_id));
        self.session.execute(&ApiRequest::delete(path)).await?;
        info!("Cancelled brokerage order {}", order_id);
        Ok(())
    }

    async fn history(
        &self,
        symbol: Option<&str>,
        range: &HistoryRange,
    ) -> Result<Vec<Operation>, Error> {
        range.validate()?;
        let mut request = ApiRequest::get("/portfolio/operations")
            .with_query("from", date_param(range.from))
            .with_query("to", date_param(range.to));
        if let Some(symbol) = symbol {
            validate_symbol(symbol)?;
            request = request.with_query("symbol", symbol);
        }

        let envelope: OperationsEnvelope = self.fetch(request).await?;
        Ok(envelope
            .operations
            .into_iter()
            .map(|op| Operation {
                id: op.id,
                symbol: op.symbol,
                kind: op.kind,
                quantity: op.quantity,
                amount: op.amount,
                executed_at: op.date,
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
        let path = format!("/marketdata/history/{}", urlencoding::encode(symbol));
        let request = ApiRequest::get(path)
            .with_query("from", date_param(range.from))
            .with_query("to", date_param(range.to))
            .with_query("interval", interval.as_str());

        let envelope: BarsEnvelope = self.fetch(request).await?;
        let mut bars: Vec<Bar> = envelope
            .bars
            .into_iter()
            .filter_map(|bar| {
                Some(Bar {
                    start: bar.date.and_hms_opt(0, 0, 0)?.and_utc(),
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
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
            .and_then(|token| serde_json::to_value(token.to_stored()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DomainErrorKind, ExternalErrorKind, InternalErrorKind};
    use crate::gateway::broker::QuoteLookup;
    use mockito::{Matcher, Server, ServerGuard};

    fn settings(server: &ServerGuard) -> BrokerageSettings {
        BrokerageSettings {
            base_url: server.url(),
            client_id: Some("client-1".to_string()),
            client_secret: Some(SecretString::from("client-secret".to_string())),
            timeout: Duration::from_secs(5),
            refresh_buffer: chrono::Duration::seconds(300),
        }
    }

    fn stored(access: &str, expires_in: i64) -> StoredToken {
        StoredToken {
            access_token: access.to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_in_seconds: Some(expires_in),
            issued_at_epoch_ms: Some(Utc::now().timestamp_millis()),
        }
    }

    fn login() -> BrokerageLogin {
        BrokerageLogin {
            username: "jane".to_string(),
            password: SecretString::from("hunter2".to_string()),
        }
    }

    #[tokio::test]
    async fn test_connect_uses_password_grant() {
        let mut server = Server::new_async().await;
        let grant = server
            .mock("POST", "/oauth/token")
            .match_header("x-client-id", "client-1")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "password".into()),
                Matcher::UrlEncoded("username".into(), "jane".into()),
                Matcher::UrlEncoded("password".into(), "hunter2".into()),
                Matcher::UrlEncoded("client_secret".into(), "client-secret".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"access-1","refresh_token":"refresh-1","expires_in":3600}"#)
            .create_async()
            .await;
        let positions = server
            .mock("GET", "/portfolio/positions")
            .match_header("authorization", "Bearer access-1")
            .with_status(200)
            .with_body(r#"{"positions":[{"symbol":"AAPL","quantity":10,"averagePrice":150.25}]}"#)
            .create_async()
            .await;

        let adapter = BrokerageAdapter::new(&settings(&server)).unwrap();
        assert_eq!(adapter.session_state(), SessionState::Unauthenticated);

        let credentials = adapter.connect(&login()).await.unwrap();
        assert_eq!(credentials["accessToken"], "access-1");
        assert_eq!(credentials["refreshToken"], "refresh-1");
        assert_eq!(credentials["expiresInSeconds"], 3600);
        assert!(credentials.get("password").is_none());

        let result = adapter.positions().await.unwrap();
        assert_eq!(
            result,
            vec![Position {
                symbol: "AAPL".to_string(),
                quantity: 10.0,
                average_price: 150.25,
                market_value: None,
                currency: "USD".to_string(),
            }]
        );
        grant.assert_async().await;
        positions.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_password_is_authentication_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .create_async()
            .await;

        let adapter = BrokerageAdapter::new(&settings(&server)).unwrap();
        let err = adapter.connect(&login()).await.unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::External(ExternalErrorKind::AuthenticationFailed)
        );
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_and_replays() {
        let mut server = Server::new_async().await;
        let stale = server
            .mock("GET", "/marketdata/quotes/AAPL")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", "/marketdata/quotes/AAPL")
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_body(r#"{"symbol":"AAPL","last":187.5,"changePercent":1.2}"#)
            .expect(1)
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("stale", 3600)).unwrap();
        let quote = adapter.quote("AAPL").await.unwrap();
        assert_eq!(quote.price, 187.5);

        let persisted = adapter.take_refreshed_credentials().unwrap();
        assert_eq!(persisted["accessToken"], "fresh");
        // The provider omitted a new refresh token, so the old one is kept.
        assert_eq!(persisted["refreshToken"], "refresh-1");
        assert!(adapter.take_refreshed_credentials().is_none());

        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_unauthorized_requires_reconnect() {
        let mut server = Server::new_async().await;
        let positions = server
            .mock("GET", "/portfolio/positions")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","refresh_token":"refresh-2","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("stale", 3600)).unwrap();
        let err = adapter.positions().await.unwrap_err();
        assert!(err.requires_reconnect());
        assert_eq!(adapter.session_state(), SessionState::ReconnectRequired);

        // Fails fast from now on.
        let err = adapter.positions().await.unwrap_err();
        assert!(err.requires_reconnect());

        positions.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_near_expiry_token_is_refreshed_before_request() {
        let mut server = Server::new_async().await;
        let refresh = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","refresh_token":"refresh-2","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let orders = server
            .mock("GET", "/orders")
            .match_query(Matcher::UrlEncoded("status".into(), "open".into()))
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_body(
                r#"{"orders":[{"id":"o-1","symbol":"MSFT","side":"buy","type":"limit","quantity":3,"limitPrice":410.0,"status":"partially_filled"}]}"#,
            )
            .create_async()
            .await;

        // Expires in 60 seconds, inside the 5 minute buffer.
        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("old", 60)).unwrap();
        assert_eq!(adapter.session_state(), SessionState::NearExpiry);

        let result = adapter.orders(OrderStatusFilter::Open).await.unwrap();
        assert_eq!(result[0].status, OrderStatus::Open);
        assert_eq!(result[0].limit_price, Some(410.0));

        let persisted = adapter.take_refreshed_credentials().unwrap();
        assert_eq!(persisted["refreshToken"], "refresh-2");
        refresh.assert_async().await;
        orders.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_order_makes_no_network_call() {
        let mut server = Server::new_async().await;
        let orders = server
            .mock("POST", "/orders")
            .expect(0)
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("access", 3600)).unwrap();
        let mut order = OrderRequest::limit("AAPL", OrderSide::Buy, 1.0, 100.0);
        order.limit_price = None;
        let err = adapter.place_order(&order).await.unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::Validation)
        );
        orders.assert_async().await;
    }

    #[tokio::test]
    async fn test_place_and_cancel_order() {
        let mut server = Server::new_async().await;
        let place = server
            .mock("POST", "/orders")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "symbol": "AAPL",
                "side": "sell",
                "type": "market",
                "quantity": 2.0,
            })))
            .with_status(201)
            .with_body(
                r#"{"id":"o-9","symbol":"AAPL","side":"sell","type":"market","quantity":2,"status":"open","createdAt":"2026-03-02T14:30:00Z"}"#,
            )
            .create_async()
            .await;
        let cancel = server
            .mock("DELETE", "/orders/o-9")
            .with_status(204)
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("access", 3600)).unwrap();
        let order = adapter
            .place_order(&OrderRequest::market("AAPL", OrderSide::Sell, 2.0))
            .await
            .unwrap();
        assert_eq!(order.id, "o-9");
        assert!(order.created_at.is_some());
        adapter.cancel_order(&order.id).await.unwrap();

        place.assert_async().await;
        cancel.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_order_keeps_status() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/orders")
            .with_status(422)
            .with_body(r#"{"error":"insufficient buying power"}"#)
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("access", 3600)).unwrap();
        let err = adapter
            .place_order(&OrderRequest::market("AAPL", OrderSide::Buy, 1000.0))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(422));
        assert!(!err.requires_reconnect());
    }

    #[tokio::test]
    async fn test_history_sends_range() {
        let mut server = Server::new_async().await;
        let history = server
            .mock("GET", "/portfolio/operations")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("from".into(), "2026-01-01".into()),
                Matcher::UrlEncoded("to".into(), "2026-01-31".into()),
                Matcher::UrlEncoded("symbol".into(), "AAPL".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"operations":[{"id":"op-1","symbol":"AAPL","type":"dividend","amount":4.2,"date":"2026-01-15T00:00:00Z"}]}"#,
            )
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("access", 3600)).unwrap();
        let range = HistoryRange::new(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        )
        .unwrap();
        let operations = adapter.history(Some("AAPL"), &range).await.unwrap();
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].kind, "dividend");
        assert_eq!(operations[0].quantity, None);
        history.assert_async().await;
    }

    #[tokio::test]
    async fn test_price_history_is_sorted_by_date() {
        let mut server = Server::new_async().await;
        let bars = server
            .mock("GET", "/marketdata/history/AAPL")
            .match_header("authorization", "Bearer access")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("from".into(), "2026-01-01".into()),
                Matcher::UrlEncoded("to".into(), "2026-01-31".into()),
                Matcher::UrlEncoded("interval".into(), "week".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"bars":[
                    {"date":"2026-01-12","open":190.0,"high":195.0,"low":188.5,"close":194.25},
                    {"date":"2026-01-05","open":185.0,"high":191.0,"low":184.0,"close":190.0,"volume":1200000}
                ]}"#,
            )
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("access", 3600)).unwrap();
        let range = HistoryRange::new(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        )
        .unwrap();
        let series = adapter
            .price_history("AAPL", &range, BarInterval::Week)
            .await
            .unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].start.date_naive(), NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
        assert_eq!(series[0].volume, Some(1_200_000.0));
        assert_eq!(series[1].close, 194.25);
        assert_eq!(series[1].volume, None);
        bars.assert_async().await;
    }

    #[tokio::test]
    async fn test_price_history_rejects_empty_symbol() {
        let mut server = Server::new_async().await;
        let bars = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("access", 3600)).unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let range = HistoryRange::new(day, day).unwrap();
        let err = adapter
            .price_history(" ", &range, BarInterval::Day)
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::Validation)
        );
        bars.assert_async().await;
    }

    #[tokio::test]
    async fn test_batch_quotes_isolate_failures() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/marketdata/quotes/AAPL")
            .with_status(200)
            .with_body(r#"{"symbol":"AAPL","last":187.5}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/marketdata/quotes/NOPE")
            .with_status(404)
            .create_async()
            .await;

        let adapter =
            BrokerageAdapter::from_stored(&settings(&server), stored("access", 3600)).unwrap();
        let quotes = adapter
            .quotes(&["AAPL".to_string(), "NOPE".to_string()])
            .await;
        assert!(matches!(quotes["AAPL"], QuoteLookup::Available(ref q) if q.price == 187.5));
        assert_eq!(quotes["NOPE"], QuoteLookup::Unavailable);
    }
}
