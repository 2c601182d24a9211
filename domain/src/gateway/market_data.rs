//! Metered market data (Alpha Vantage style API).
//!
//! The free tier allows a handful of calls per day, so every lookup goes
//! through one shared [`RateBudgetCache`]. Market data only enriches
//! portfolio views: every lookup returns `Option` and never fails the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use integration_auth::error::Error as AuthError;
use integration_auth::http::{endpoint, send_json, AuthenticatedClient, AuthenticatedClientBuilder};
use integration_auth::quota::{BudgetConfig, BudgetStatus, RateBudgetCache};
use log::*;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service::config::Config;

use crate::error::Error;

/// Bodies the provider sends with a 200 status instead of data.
const NOTICE_KEYS: [&str; 3] = ["Note", "Information", "Error Message"];

#[derive(Clone)]
pub struct MarketDataSettings {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub budget: BudgetConfig,
}

impl MarketDataSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.market_data_base_url().to_string(),
            api_key: config.market_data_api_key().map(SecretString::from),
            timeout: config.http_timeout(),
            cache_ttl: config.market_data_cache_ttl(),
            budget: BudgetConfig {
                daily_limit: config.market_data_daily_limit,
                reserve: config.market_data_reserve,
                warning_threshold: config.market_data_warning_threshold,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub price: f64,
    pub change_percent: Option<f64>,
    pub latest_trading_day: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyOverview {
    pub symbol: String,
    pub name: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub market_capitalization: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
}

/// Everything cached against the provider's single daily budget.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketPayload {
    Quote(MarketQuote),
    Overview(CompanyOverview),
}

/// Budget and cache shared by every [`MarketDataClient`] in the process.
pub type MarketDataCache = RateBudgetCache<MarketPayload>;

#[derive(Debug, Deserialize)]
struct WireGlobalQuote {
    #[serde(rename = "01. symbol")]
    symbol: String,
    #[serde(rename = "05. price")]
    price: String,
    #[serde(rename = "07. latest trading day", default)]
    latest_trading_day: Option<String>,
    #[serde(rename = "10. change percent", default)]
    change_percent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireOverview {
    #[serde(rename = "Symbol")]
    symbol: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Sector", default)]
    sector: Option<String>,
    #[serde(rename = "Industry", default)]
    industry: Option<String>,
    #[serde(rename = "MarketCapitalization", default)]
    market_capitalization: Option<String>,
    #[serde(rename = "PERatio", default)]
    pe_ratio: Option<String>,
    #[serde(rename = "DividendYield", default)]
    dividend_yield: Option<String>,
}

/// Numbers arrive as strings, with "None" or "-" for missing values.
fn parse_number(raw: Option<&str>) -> Option<f64> {
    raw.map(|s| s.trim().trim_end_matches('%'))
        .filter(|s| !s.is_empty() && *s != "None" && *s != "-")
        .and_then(|s| s.parse().ok())
}

fn present(raw: Option<String>) -> Option<String> {
    raw.filter(|s| !s.is_empty() && s != "None")
}

fn is_notice(body: &Value) -> bool {
    NOTICE_KEYS.iter().any(|key| body.get(key).is_some())
}

fn parse_quote(body: &Value) -> Option<MarketQuote> {
    if is_notice(body) {
        warn!("Market data provider returned a notice instead of a quote");
        return None;
    }
    let wire: WireGlobalQuote = serde_json::from_value(body.get("Global Quote")?.clone()).ok()?;
    Some(MarketQuote {
        price: parse_number(Some(&wire.price))?,
        change_percent: parse_number(wire.change_percent.as_deref()),
        latest_trading_day: wire
            .latest_trading_day
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        symbol: wire.symbol,
    })
}

fn parse_overview(body: &Value) -> Option<CompanyOverview> {
    if is_notice(body) {
        warn!("Market data provider returned a notice instead of an overview");
        return None;
    }
    let wire: WireOverview = serde_json::from_value(body.clone()).ok()?;
    Some(CompanyOverview {
        symbol: wire.symbol,
        name: wire.name,
        sector: present(wire.sector),
        industry: present(wire.industry),
        market_capitalization: parse_number(wire.market_capitalization.as_deref()),
        pe_ratio: parse_number(wire.pe_ratio.as_deref()),
        dividend_yield: parse_number(wire.dividend_yield.as_deref()),
    })
}

pub struct MarketDataClient {
    http: AuthenticatedClient,
    settings: MarketDataSettings,
    cache: Arc<MarketDataCache>,
}

impl MarketDataClient {
    /// The budget/cache to share between clients, sized from settings.
    pub fn shared_cache(settings: &MarketDataSettings) -> Arc<MarketDataCache> {
        Arc::new(RateBudgetCache::new(settings.budget))
    }

    pub fn new(settings: MarketDataSettings, cache: Arc<MarketDataCache>) -> Result<Self, Error> {
        let http = AuthenticatedClientBuilder::new()
            .with_timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            settings,
            cache,
        })
    }

    pub fn quota_status(&self) -> BudgetStatus {
        self.cache.status()
    }

    pub async fn quote(&self, symbol: &str) -> Option<MarketQuote> {
        let symbol = symbol.trim().to_uppercase();
        let key = format!("quote:{}", symbol);
        let payload = self
            .lookup(&key, &[("function", "GLOBAL_QUOTE"), ("symbol", symbol.as_str())], |body| {
                parse_quote(body).map(MarketPayload::Quote)
            })
            .await?;
        match payload {
            MarketPayload::Quote(quote) => Some(quote),
            MarketPayload::Overview(_) => None,
        }
    }

    pub async fn overview(&self, symbol: &str) -> Option<CompanyOverview> {
        let symbol = symbol.trim().to_uppercase();
        let key = format!("overview:{}", symbol);
        let payload = self
            .lookup(&key, &[("function", "OVERVIEW"), ("symbol", symbol.as_str())], |body| {
                parse_overview(body).map(MarketPayload::Overview)
            })
            .await?;
        match payload {
            MarketPayload::Overview(overview) => Some(overview),
            MarketPayload::Quote(_) => None,
        }
    }

    async fn lookup<F>(&self, key: &str, params: &[(&str, &str)], parse: F) -> Option<MarketPayload>
    where
        F: FnOnce(&Value) -> Option<MarketPayload>,
    {
        if key.ends_with(':') {
            warn!("Market data lookup without a symbol");
            return None;
        }
        let Some(api_key) = &self.settings.api_key else {
            warn!("Market data API key not configured, skipping {}", key);
            return None;
        };

        let http = &self.http;
        let base_url = self.settings.base_url.as_str();
        self.cache
            .get_or_fetch(key, self.settings.cache_ttl, || async move {
                let url = endpoint(base_url, "/query")?;
                let request = http
                    .get(url)
                    .query(params)
                    .query(&[("apikey", api_key.expose_secret().as_str())]);
                let body = send_json(request).await?;
                Ok::<_, AuthError>(parse(&body))
            })
            .await
    }
}
