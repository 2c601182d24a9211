//! Provider-facing half of the session layer.

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::Token;
use crate::error::Error;
use crate::http::endpoint;
use crate::provider::ProviderKind;

/// One authenticated call, described independently of the token used to send it.
///
/// Cloneable so the session manager can replay the exact same request after a
/// refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the provider base URL, e.g. `/portfolio/positions`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    /// Attach a JSON body. Serialization failures surface as a validation
    /// error since they can only come from caller-supplied data.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, Error> {
        let value = serde_json::to_value(body).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: crate::error::ErrorKind::Validation,
        })?;
        self.body = Some(value);
        Ok(self)
    }

    /// Absolute URL under `base_url`, query string included.
    pub fn url(&self, base_url: &str) -> Result<Url, Error> {
        let mut url = endpoint(base_url, &self.path)?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }

    /// Body as the exact bytes that go on the wire (empty when there is none).
    pub fn body_bytes(&self) -> Vec<u8> {
        self.body
            .as_ref()
            .map(|b| b.to_string().into_bytes())
            .unwrap_or_default()
    }
}

/// Authentication and transport for one brokerage, implemented once per provider.
///
/// The refresh/retry policy lives in [`super::SessionManager`]; implementations
/// only translate between tokens and the provider's wire format.
#[async_trait]
pub trait AuthenticatedHttpClient: Send + Sync {
    /// Whatever the user hands over when connecting (password, API key pair, ...).
    type Credentials: Send + Sync;

    fn provider(&self) -> ProviderKind;

    /// Exchange the user's secret for a token. Used once, at connection time.
    async fn authenticate(&self, credentials: &Self::Credentials) -> Result<Token, Error>;

    /// Obtain a new token using a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<Token, Error>;

    /// Send `request` with `access_token`. A 401 must come back as
    /// `HttpErrorKind::Unauthorized`.
    async fn request(&self, access_token: &str, request: &ApiRequest) -> Result<Value, Error>;
}
