//! Access/refresh token types.

use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Refresh this long before the provider-reported expiry.
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 300;

/// Bearer credentials for one brokerage connection.
#[derive(Debug, Clone)]
pub struct Token {
    /// Access token for API requests.
    pub access_token: SecretString,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: Option<SecretString>,
    /// Lifetime reported by the provider. `None` when the provider does not
    /// report one; such tokens are only refreshed after a 401.
    pub expires_in_seconds: Option<i64>,
    /// When the access token was issued.
    pub issued_at: DateTime<Utc>,
}

impl Token {
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        expires_in_seconds: Option<i64>,
    ) -> Self {
        Self {
            access_token: SecretString::from(access_token),
            refresh_token: refresh_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            expires_in_seconds,
            issued_at: Utc::now(),
        }
    }

    /// When the access token expires, if the provider reported a lifetime.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_in_seconds
            .map(|secs| self.issued_at + Duration::seconds(secs))
    }

    /// True if the token expires within the default five minute buffer.
    pub fn is_near_expiry(&self) -> bool {
        self.is_near_expiry_within(Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS))
    }

    pub fn is_near_expiry_within(&self, buffer: Duration) -> bool {
        self.is_near_expiry_at(Utc::now(), buffer)
    }

    pub fn is_near_expiry_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.expires_at()
            .map(|expires| now > expires - buffer)
            .unwrap_or(false)
    }

    /// Whether a refresh can be attempted at all.
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_ref()
            .map(|t| !t.expose_secret().is_empty())
            .unwrap_or(false)
    }

    /// Plain representation for persistence. Only pass the result straight to
    /// the vault.
    pub fn to_stored(&self) -> StoredToken {
        StoredToken {
            access_token: self.access_token.expose_secret().clone(),
            refresh_token: self
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().clone()),
            expires_in_seconds: self.expires_in_seconds,
            issued_at_epoch_ms: Some(self.issued_at.timestamp_millis()),
        }
    }
}

/// JSON shape of a token inside a stored credential blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at_epoch_ms: Option<i64>,
}

impl From<StoredToken> for Token {
    fn from(stored: StoredToken) -> Self {
        // Records without an issue time are treated as issued now; the
        // reactive path still catches a token that is in fact stale.
        let issued_at = stored
            .issued_at_epoch_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Self {
            access_token: SecretString::from(stored.access_token),
            refresh_token: stored
                .refresh_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            expires_in_seconds: stored.expires_in_seconds,
            issued_at,
        }
    }
}
