//! Broker-neutral contract implemented by every brokerage adapter.
//!
//! Adapters translate between these types and each provider's wire format.
//! Every operation goes through the adapter's session, so token refresh and
//! the single replay after a 401 are handled below this layer.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use integration_auth::session::SessionState;
use integration_auth::ProviderKind;
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{validation_error, Error};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub average_price: f64,
    pub market_value: Option<f64>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change_percent: Option<f64>,
    pub as_of: Option<DateTime<Utc>>,
}

/// Result of one symbol inside a batch quote lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteLookup {
    Available(Quote),
    /// The provider failed for this symbol; the rest of the batch is unaffected.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatusFilter {
    Open,
    Closed,
    All,
}

impl OrderStatusFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatusFilter::Open => "open",
            OrderStatusFilter::Closed => "closed",
            OrderStatusFilter::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, quantity: f64, limit_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(limit_price),
        }
    }

    /// Reject orders the provider would refuse anyway.
    pub fn validate(&self) -> Result<(), Error> {
        validate_symbol(&self.symbol)?;
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(validation_error("order quantity must be positive"));
        }
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, None) => Err(validation_error("limit order requires a limit price")),
            (_, Some(price)) if !price.is_finite() || price <= 0.0 => {
                Err(validation_error("limit price must be positive"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: Option<DateTime<Utc>>,
}

/// Inclusive date range for operation history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl HistoryRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, Error> {
        let range = Self { from, to };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.from > self.to {
            return Err(validation_error("history range starts after it ends"));
        }
        Ok(())
    }
}

/// One executed account operation: a trade, dividend, fee or transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub symbol: Option<String>,
    pub kind: String,
    pub quantity: Option<f64>,
    pub amount: f64,
    pub executed_at: DateTime<Utc>,
}

/// Candle width for a price series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarInterval {
    Day,
    Week,
    Month,
}

impl BarInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarInterval::Day => "day",
            BarInterval::Week => "week",
            BarInterval::Month => "month",
        }
    }
}

/// One OHLC candle, keyed by the start of its interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

pub fn validate_symbol(symbol: &str) -> Result<(), Error> {
    if symbol.trim().is_empty() {
        return Err(validation_error("symbol must not be empty"));
    }
    Ok(())
}

pub fn validate_order_id(order_id: &str) -> Result<(), Error> {
    if order_id.trim().is_empty() {
        return Err(validation_error("order id must not be empty"));
    }
    Ok(())
}

/// Domain operations offered by one brokerage connection.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn positions(&self) -> Result<Vec<Position>, Error>;

    async fn quote(&self, symbol: &str) -> Result<Quote, Error>;

    /// Quotes for several symbols, fetched concurrently. A failure for one
    /// symbol marks only that entry unavailable.
    async fn quotes(&self, symbols: &[String]) -> HashMap<String, QuoteLookup> {
        let lookups = symbols.iter().map(|symbol| async move {
            let lookup = match self.quote(symbol).await {
                Ok(quote) => QuoteLookup::Available(quote),
                Err(e) => {
                    warn!("Quote for {} unavailable: {}", symbol, e);
                    QuoteLookup::Unavailable
                }
            };
            (symbol.clone(), lookup)
        });
        join_all(lookups).await.into_iter().collect()
    }

    async fn orders(&self, filter: OrderStatusFilter) -> Result<Vec<Order>, Error>;

    async fn place_order(&self, order: &OrderRequest) -> Result<Order, Error>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), Error>;

    async fn history(&self, symbol: Option<&str>, range: &HistoryRange)
        -> Result<Vec<Operation>, Error>;

    /// Price series for one instrument, oldest bar first.
    async fn price_history(
        &self,
        symbol: &str,
        range: &HistoryRange,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, Error>;

    fn session_state(&self) -> SessionState;

    /// Provider-specific credential JSON after a token refresh, once. The
    /// caller encrypts and persists it.
    fn take_refreshed_credentials(&self) -> Option<Value>;
}
