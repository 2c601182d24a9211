//! HTTP client builder with request logging middleware.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::Extensions;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Request, Response};
use reqwest_middleware::{ClientBuilder, Middleware, Next};
use tracing::{debug, warn};

use crate::error::{http_error, Error, HttpErrorKind};

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout.
    pub timeout: Duration,
    /// User agent string.
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("integration-auth/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// HTTP client with middleware.
pub type AuthenticatedClient = reqwest_middleware::ClientWithMiddleware;

/// Builder for the HTTP clients used by the provider adapters.
///
/// The transport never retries. A retried request would replay a stale
/// token or a stale signature; retries are decided one level up, by the
/// session manager (401) or by a [`super::RetryExecutor`].
pub struct AuthenticatedClientBuilder {
    config: HttpClientConfig,
    default_headers: Vec<(&'static str, String)>,
}

impl AuthenticatedClientBuilder {
    /// Create a new client builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: HttpClientConfig::default(),
            default_headers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: HttpClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the user agent string.
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.config.user_agent = user_agent;
        self
    }

    /// Header sent with every request, e.g. `Accept` or a client id.
    pub fn with_default_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.default_headers.push((name, value.into()));
        self
    }

    /// Build the configured HTTP client.
    pub fn build(self) -> Result<AuthenticatedClient, Error> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error {
                source: Some(Box::new(e)),
                error_kind: crate::error::ErrorKind::Http(HttpErrorKind::BuilderFailed),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| Error {
                source: Some(Box::new(e)),
                error_kind: crate::error::ErrorKind::Http(HttpErrorKind::BuilderFailed),
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent)
            .default_headers(headers)
            .build()
            .map_err(|e| {
                warn!("Failed to build HTTP client: {:?}", e);
                http_error(HttpErrorKind::BuilderFailed, "failed to build HTTP client")
            })?;

        Ok(ClientBuilder::new(client).with(RequestLogger).build())
    }
}

impl Default for AuthenticatedClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs method, path, status and latency of every outbound request.
///
/// Query strings are left out of the log line since some providers take the
/// API key as a query parameter.
struct RequestLogger;

#[async_trait]
impl Middleware for RequestLogger {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let method = req.method().clone();
        let host = req.url().host_str().unwrap_or_default().to_string();
        let path = req.url().path().to_string();
        let started = Instant::now();

        let result = next.run(req, extensions).await;

        match &result {
            Ok(response) => debug!(
                "{} {}{} -> {} in {:?}",
                method,
                host,
                path,
                response.status().as_u16(),
                started.elapsed()
            ),
            Err(e) => warn!(
                "{} {}{} failed after {:?}: {}",
                method,
                host,
                path,
                started.elapsed(),
                e
            ),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default() {
        let builder = AuthenticatedClientBuilder::new();
        assert_eq!(builder.config.timeout, Duration::from_secs(30));
        assert!(builder.default_headers.is_empty());
    }

    #[test]
    fn test_builder_with_timeout() {
        let builder = AuthenticatedClientBuilder::new().with_timeout(Duration::from_secs(60));
        assert_eq!(builder.config.timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_build_client() {
        let result = AuthenticatedClientBuilder::new()
            .with_default_header("accept", "application/json")
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_header_value_fails() {
        let result = AuthenticatedClientBuilder::new()
            .with_default_header("x-client-id", "bad\nvalue")
            .build();
        assert!(matches!(
            result,
            Err(Error {
                error_kind: crate::error::ErrorKind::Http(HttpErrorKind::BuilderFailed),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_default_headers_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("x-client-id", "client-1")
            .with_status(200)
            .create_async()
            .await;

        let client = AuthenticatedClientBuilder::new()
            .with_default_header("x-client-id", "client-1")
            .build()
            .unwrap();
        let response = client
            .get(format!("{}/ping", server.url()))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 200);
        mock.assert_async().await;
    }
}
