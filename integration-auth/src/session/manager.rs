//! Token lifecycle for one brokerage connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{ApiRequest, AuthenticatedHttpClient, Token, DEFAULT_REFRESH_BUFFER_SECS};
use crate::error::{session_error, Error, ErrorKind, SessionErrorKind};

/// Requests sent per logical operation: the original plus one replay after a
/// refresh. Never more.
pub const MAX_REQUEST_ATTEMPTS: u32 = 2;

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Valid,
    NearExpiry,
    Refreshing,
    /// Terminal until the user reconnects.
    ReconnectRequired,
}

#[derive(Default)]
struct Slot {
    token: Option<Token>,
    reconnect_required: bool,
    /// Set by a refresh, cleared when the caller takes the token to persist it.
    refreshed: bool,
}

/// Keeps one connection's token valid across requests.
///
/// Near-expiry tokens are refreshed before sending. A 401 triggers at most one
/// refresh and one replay of the same request; a second 401, a failed refresh
/// or a missing refresh token moves the session to `ReconnectRequired`.
///
/// Refreshes are single-flight: concurrent requests that all see a stale token
/// wait on one refresh and reuse its result. The manager does not persist
/// anything; callers pick up new tokens through [`SessionManager::take_refreshed_token`].
pub struct SessionManager<C: AuthenticatedHttpClient> {
    client: C,
    slot: Mutex<Slot>,
    refresh_lock: tokio::sync::Mutex<()>,
    refreshing: AtomicBool,
    refresh_buffer: Duration,
}

impl<C: AuthenticatedHttpClient> SessionManager<C> {
    /// Wrap `client`, optionally with a token restored from storage.
    pub fn new(client: C, token: Option<Token>) -> Self {
        Self {
            client,
            slot: Mutex::new(Slot {
                token,
                ..Slot::default()
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            refreshing: AtomicBool::new(false),
            refresh_buffer: Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS),
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // Slot updates are single assignments, so a poisoned guard still holds
        // consistent data.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        let slot = self.slot();
        if slot.reconnect_required {
            return SessionState::ReconnectRequired;
        }
        if self.refreshing.load(Ordering::SeqCst) {
            return SessionState::Refreshing;
        }
        match &slot.token {
            None => SessionState::Unauthenticated,
            Some(token) if token.is_near_expiry_within(self.refresh_buffer) => {
                SessionState::NearExpiry
            }
            Some(_) => SessionState::Valid,
        }
    }

    /// Current token, if any.
    pub fn token(&self) -> Option<Token> {
        self.slot().token.clone()
    }

    /// Returns the token produced by the latest refresh, once.
    pub fn take_refreshed_token(&self) -> Option<Token> {
        let mut slot = self.slot();
        if slot.refreshed {
            slot.refreshed = false;
            slot.token.clone()
        } else {
            None
        }
    }

    /// Authenticate with the user's secret and start a fresh session.
    pub async fn connect(&self, credentials: &C::Credentials) -> Result<Token, Error> {
        let provider = self.client.provider();
        let token = self.client.authenticate(credentials).await.map_err(|err| {
            warn!("Authentication with {} failed: {}", provider.as_str(), err);
            if err.is_unauthorized() {
                Error {
                    source: Some(Box::new(err)),
                    error_kind: ErrorKind::Session(SessionErrorKind::AuthenticationFailed),
                }
            } else {
                err
            }
        })?;

        let mut slot = self.slot();
        slot.token = Some(token.clone());
        slot.reconnect_required = false;
        slot.refreshed = false;
        info!("Connected to {}", provider.as_str());
        Ok(token)
    }

    /// Send `request` with a valid token, refreshing as needed.
    pub async fn execute(&self, request: &ApiRequest) -> Result<Value, Error> {
        let (mut access_token, mut refreshed) = self.prepare().await?;

        for attempt in 1..=MAX_REQUEST_ATTEMPTS {
            let outcome = self
                .client
                .request(access_token.expose_secret(), request)
                .await;
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_unauthorized() => {
                    if refreshed || attempt == MAX_REQUEST_ATTEMPTS {
                        warn!(
                            "{} rejected a freshly refreshed token for {} {}",
                            self.client.provider().as_str(),
                            request.method,
                            request.path
                        );
                        return Err(self.require_reconnect(Box::new(err)));
                    }
                    debug!(
                        "{} returned 401 for {} {}, refreshing once",
                        self.client.provider().as_str(),
                        request.method,
                        request.path
                    );
                    let rejected = access_token.expose_secret().clone();
                    let fresh = self
                        .refresh_if(|current| *current.access_token.expose_secret() == rejected)
                        .await?;
                    access_token = fresh.access_token;
                    refreshed = true;
                }
                Err(err) => return Err(err),
            }
        }

        Err(self.require_reconnect("request attempts exhausted".into()))
    }

    /// Token to send with, refreshed first when it is near expiry.
    async fn prepare(&self) -> Result<(SecretString, bool), Error> {
        let token = self.current_token()?;

        if token.is_near_expiry_within(self.refresh_buffer) {
            debug!(
                "{} token near expiry, refreshing before request",
                self.client.provider().as_str()
            );
            let buffer = self.refresh_buffer;
            let fresh = self
                .refresh_if(|current| current.is_near_expiry_within(buffer))
                .await?;
            return Ok((fresh.access_token, true));
        }

        Ok((token.access_token, false))
    }

    fn current_token(&self) -> Result<Token, Error> {
        let slot = self.slot();
        if slot.reconnect_required {
            return Err(session_error(
                SessionErrorKind::Expired,
                "session expired, reconnect required",
            ));
        }
        slot.token
            .clone()
            .ok_or_else(|| session_error(SessionErrorKind::NotConnected, "no session established"))
    }

    /// Refresh under the per-connection lock, unless `still_needed` says a
    /// concurrent caller already did it.
    async fn refresh_if<F>(&self, still_needed: F) -> Result<Token, Error>
    where
        F: Fn(&Token) -> bool,
    {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current_token()?;
        if !still_needed(&current) {
            debug!("Token was refreshed by another request");
            return Ok(current);
        }

        let Some(refresh_token) = current
            .refresh_token
            .clone()
            .filter(|_| current.has_refresh_token())
        else {
            warn!(
                "No refresh token stored for {}",
                self.client.provider().as_str()
            );
            return Err(self.require_reconnect("no refresh token stored".into()));
        };

        let result = {
            let _refreshing = RefreshingFlag::raise(&self.refreshing);
            self.client.refresh(refresh_token.expose_secret()).await
        };

        match result {
            Ok(mut fresh) => {
                if !fresh.has_refresh_token() {
                    fresh.refresh_token = current.refresh_token.clone();
                }
                let mut slot = self.slot();
                slot.token = Some(fresh.clone());
                slot.refreshed = true;
                info!(
                    "Refreshed {} access token",
                    self.client.provider().as_str()
                );
                Ok(fresh)
            }
            Err(err) => {
                warn!(
                    "Refreshing {} token failed: {}",
                    self.client.provider().as_str(),
                    err
                );
                Err(self.require_reconnect(Box::new(err)))
            }
        }
    }

    fn require_reconnect(&self, source: Box<dyn std::error::Error + Send + Sync>) -> Error {
        self.slot().reconnect_required = true;
        Error {
            source: Some(source),
            error_kind: ErrorKind::Session(SessionErrorKind::Expired),
        }
    }
}

/// Marks a refresh in flight. Lowered on drop, so a cancelled request does
/// not leave the session reporting `Refreshing`.
struct RefreshingFlag<'a>(&'a AtomicBool);

impl<'a> RefreshingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{http_error, HttpErrorKind};
    use crate::provider::ProviderKind;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Client that replays scripted responses and counts network calls.
    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Value, Error>>>,
        scripted_refreshes: Mutex<VecDeque<Result<Token, Error>>>,
        auth_lifetime_secs: Option<i64>,
        refresh_delay_ms: u64,
        request_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        tokens_seen: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn respond(self, response: Result<Value, Error>) -> Self {
            self.responses.lock().unwrap().push_back(response);
            self
        }

        fn refresh_with(self, result: Result<Token, Error>) -> Self {
            self.scripted_refreshes.lock().unwrap().push_back(result);
            self
        }

        fn requests(&self) -> usize {
            self.request_calls.load(Ordering::SeqCst)
        }

        fn refreshes(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthenticatedHttpClient for Arc<ScriptedClient> {
        type Credentials = String;

        fn provider(&self) -> ProviderKind {
            ProviderKind::Brokerage
        }

        async fn authenticate(&self, credentials: &String) -> Result<Token, Error> {
            if credentials == "wrong" {
                return Err(http_error(HttpErrorKind::Unauthorized, "bad password"));
            }
            Ok(Token::new(
                "initial".to_string(),
                Some("refresh-1".to_string()),
                self.auth_lifetime_secs,
            ))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Token, Error> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.refresh_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.refresh_delay_ms)).await;
            }
            let scripted = self.scripted_refreshes.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(Token::new(
                    format!("refreshed-{}", self.refreshes()),
                    Some("refresh-2".to_string()),
                    Some(3600),
                ))
            })
        }

        async fn request(&self, access_token: &str, _request: &ApiRequest) -> Result<Value, Error> {
            self.request_calls.fetch_add(1, Ordering::SeqCst);
            self.tokens_seen.lock().unwrap().push(access_token.to_string());
            let scripted = self.responses.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(json!({"ok": true})))
        }
    }

    fn unauthorized() -> Result<Value, Error> {
        Err(http_error(HttpErrorKind::Unauthorized, "401"))
    }

    fn token(lifetime: i64, issued_ago: Duration, refresh: Option<&str>) -> Token {
        Token {
            access_token: SecretString::from("stored".to_string()),
            refresh_token: refresh.map(|r| SecretString::from(r.to_string())),
            expires_in_seconds: Some(lifetime),
            issued_at: Utc::now() - issued_ago,
        }
    }

    fn valid_token() -> Token {
        token(3600, Duration::zero(), Some("refresh-1"))
    }

    fn stale_token() -> Token {
        token(3600, Duration::hours(2), Some("refresh-1"))
    }

    #[tokio::test]
    async fn test_three_unauthorized_responses_stop_after_one_refresh() {
        let client = Arc::new(
            ScriptedClient::default()
                .respond(unauthorized())
                .respond(unauthorized())
                .respond(unauthorized()),
        );
        let manager = SessionManager::new(client.clone(), Some(valid_token()));

        let result = manager.execute(&ApiRequest::get("/positions")).await;

        assert!(result.unwrap_err().is_session_expired());
        assert_eq!(client.refreshes(), 1);
        assert_eq!(client.requests(), 2);
        assert_eq!(manager.state(), SessionState::ReconnectRequired);

        // The third scripted 401 is never consumed.
        let again = manager.execute(&ApiRequest::get("/positions")).await;
        assert!(again.unwrap_err().is_session_expired());
        assert_eq!(client.requests(), 2);
        assert_eq!(client.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_then_success_replays_with_new_token() {
        let client = Arc::new(
            ScriptedClient::default()
                .respond(unauthorized())
                .respond(Ok(json!({"positions": []}))),
        );
        let manager = SessionManager::new(client.clone(), Some(valid_token()));

        let value = manager.execute(&ApiRequest::get("/positions")).await.unwrap();

        assert_eq!(value, json!({"positions": []}));
        assert_eq!(client.refreshes(), 1);
        assert_eq!(
            *client.tokens_seen.lock().unwrap(),
            vec!["stored".to_string(), "refreshed-1".to_string()]
        );
        let persisted = manager.take_refreshed_token().expect("refreshed token");
        assert_eq!(persisted.access_token.expose_secret(), "refreshed-1");
        assert!(manager.take_refreshed_token().is_none());
        assert_eq!(manager.state(), SessionState::Valid);
    }

    #[tokio::test]
    async fn test_near_expiry_token_refreshed_before_request() {
        let client = Arc::new(ScriptedClient::default());
        let manager = SessionManager::new(client.clone(), Some(stale_token()));
        assert_eq!(manager.state(), SessionState::NearExpiry);

        manager.execute(&ApiRequest::get("/positions")).await.unwrap();

        assert_eq!(client.refreshes(), 1);
        assert_eq!(client.requests(), 1);
        assert_eq!(
            *client.tokens_seen.lock().unwrap(),
            vec!["refreshed-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unauthorized_after_proactive_refresh_does_not_refresh_again() {
        let client = Arc::new(ScriptedClient::default().respond(unauthorized()));
        let manager = SessionManager::new(client.clone(), Some(stale_token()));

        let result = manager.execute(&ApiRequest::get("/positions")).await;

        assert!(result.unwrap_err().is_session_expired());
        assert_eq!(client.refreshes(), 1);
        assert_eq!(client.requests(), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_requires_reconnect_without_network() {
        let client = Arc::new(ScriptedClient::default());
        let manager = SessionManager::new(
            client.clone(),
            Some(token(3600, Duration::hours(2), None)),
        );

        let result = manager.execute(&ApiRequest::get("/positions")).await;

        assert!(result.unwrap_err().is_session_expired());
        assert_eq!(client.refreshes(), 0);
        assert_eq!(client.requests(), 0);
        assert_eq!(manager.state(), SessionState::ReconnectRequired);
    }

    #[tokio::test]
    async fn test_failed_refresh_requires_reconnect() {
        let client = Arc::new(
            ScriptedClient::default().refresh_with(Err(http_error(
                HttpErrorKind::Upstream {
                    status: 400,
                    retry_after_secs: None,
                },
                "invalid_grant",
            ))),
        );
        let manager = SessionManager::new(client.clone(), Some(stale_token()));

        let err = manager
            .execute(&ApiRequest::get("/positions"))
            .await
            .unwrap_err();

        assert!(err.is_session_expired());
        assert_eq!(client.requests(), 0);
        assert_eq!(manager.state(), SessionState::ReconnectRequired);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let client = Arc::new(ScriptedClient::default());
        let manager = SessionManager::new(client.clone(), None);
        assert_eq!(manager.state(), SessionState::Unauthenticated);

        let err = manager
            .execute(&ApiRequest::get("/positions"))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::Session(SessionErrorKind::NotConnected)
        );
        assert_eq!(client.requests(), 0);
    }

    #[tokio::test]
    async fn test_upstream_errors_are_not_treated_as_auth_failures() {
        let client = Arc::new(ScriptedClient::default().respond(Err(http_error(
            HttpErrorKind::Upstream {
                status: 500,
                retry_after_secs: None,
            },
            "boom",
        ))));
        let manager = SessionManager::new(client.clone(), Some(valid_token()));

        let err = manager
            .execute(&ApiRequest::get("/positions"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(500));
        assert_eq!(client.refreshes(), 0);
        assert_eq!(manager.state(), SessionState::Valid);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_refresh() {
        let client = Arc::new(ScriptedClient {
            refresh_delay_ms: 20,
            ..ScriptedClient::default()
        });
        let manager = SessionManager::new(client.clone(), Some(stale_token()));
        let request = ApiRequest::get("/positions");

        let (first, second) = tokio::join!(manager.execute(&request), manager.execute(&request));

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(client.refreshes(), 1);
        assert_eq!(client.requests(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_refresh_does_not_stay_refreshing() {
        let client = Arc::new(ScriptedClient {
            refresh_delay_ms: 60_000,
            ..ScriptedClient::default()
        });
        let manager = SessionManager::new(client.clone(), Some(stale_token()));
        let request = ApiRequest::get("/positions");

        {
            let execute = manager.execute(&request);
            tokio::pin!(execute);
            let pending =
                tokio::time::timeout(std::time::Duration::from_millis(50), &mut execute).await;
            assert!(pending.is_err());
            assert_eq!(manager.state(), SessionState::Refreshing);
        }

        assert_eq!(client.refreshes(), 1);
        assert_eq!(client.requests(), 0);
        assert_eq!(manager.state(), SessionState::NearExpiry);
        assert!(manager.take_refreshed_token().is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_new_refresh_token_keeps_old_one() {
        let client = Arc::new(ScriptedClient::default().refresh_with(Ok(Token::new(
            "rotated-access".to_string(),
            None,
            Some(3600),
        ))));
        let manager = SessionManager::new(client.clone(), Some(stale_token()));

        manager.execute(&ApiRequest::get("/positions")).await.unwrap();

        let token = manager.token().unwrap();
        assert_eq!(token.access_token.expose_secret(), "rotated-access");
        assert_eq!(
            token.refresh_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("refresh-1")
        );
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_authentication() {
        let manager = SessionManager::new(Arc::new(ScriptedClient::default()), None);
        let err = manager.connect(&"wrong".to_string()).await.unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Session(SessionErrorKind::AuthenticationFailed)
        );
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_connect_then_expiry_triggers_single_proactive_refresh() {
        let client = Arc::new(ScriptedClient {
            auth_lifetime_secs: Some(1),
            ..ScriptedClient::default()
        });
        let manager = SessionManager::new(client.clone(), None)
            .with_refresh_buffer(Duration::milliseconds(500));

        manager.connect(&"password".to_string()).await.unwrap();
        manager.execute(&ApiRequest::get("/positions")).await.unwrap();
        assert_eq!(client.refreshes(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;

        manager.execute(&ApiRequest::get("/positions")).await.unwrap();
        assert_eq!(client.refreshes(), 1);
        assert_eq!(client.requests(), 2);
        assert_eq!(
            *client.tokens_seen.lock().unwrap(),
            vec!["initial".to_string(), "refreshed-1".to_string()]
        );
    }
}
