//! Mapping of upstream responses onto [`Error`].

use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::{config_error, http_error, Error, ErrorKind, HttpErrorKind};

/// Longest slice of an error body carried into the error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Join a provider base URL (which may carry a path prefix such as `/v1`)
/// with a request path.
pub fn endpoint(base_url: &str, path: &str) -> Result<Url, Error> {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    Url::parse(&format!("{}/{}", base, path)).map_err(|e| {
        warn!("Invalid provider URL {}: {}", base_url, e);
        config_error("invalid provider base URL")
    })
}

/// Send a request and decode its JSON body.
pub async fn send_json(request: reqwest_middleware::RequestBuilder) -> Result<Value, Error> {
    let response = request.send().await?;
    read_json(response).await
}

/// Decode a response, turning non-2xx statuses into errors.
///
/// 401 becomes `HttpErrorKind::Unauthorized` so the session layer can react
/// to it; every other failure status becomes `HttpErrorKind::Upstream` with
/// the `Retry-After` hint attached. An empty 2xx body decodes to `null`.
pub async fn read_json(response: Response) -> Result<Value, Error> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED {
        debug!("Upstream rejected credentials: {}", response.url().path());
        return Err(http_error(HttpErrorKind::Unauthorized, "upstream returned 401"));
    }

    if !status.is_success() {
        let retry_after_secs = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        warn!("Upstream returned {}: {}", status.as_u16(), excerpt);
        return Err(http_error(
            HttpErrorKind::Upstream {
                status: status.as_u16(),
                retry_after_secs,
            },
            &format!("upstream returned {}: {}", status.as_u16(), excerpt),
        ));
    }

    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|e| Error {
        source: Some(Box::new(e)),
        error_kind: ErrorKind::Http(HttpErrorKind::InvalidResponse),
    })
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after_value(value, SystemTime::now())
}

fn parse_retry_after_value(value: &str, now: SystemTime) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(now)
            .unwrap_or(Duration::ZERO)
            .as_secs(),
    )
}
