//! Error types for the `integration-auth` crate.
//!
//! Follows the same pattern as domain::error with a root Error struct and error kind enums.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use reqwest_retry::Retryable;

use crate::http::{classify_status, ClassifyRetry};

/// Top-level error type for integration-auth crate.
/// Holds error kind and optional source for error chaining.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in integration-auth.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// The process-wide secret is missing or malformed. Never retried.
    Config,
    Vault(VaultErrorKind),
    Session(SessionErrorKind),
    Http(HttpErrorKind),
    /// The caller supplied input the upstream would reject anyway.
    Validation,
}

/// Errors from the credential vault.
#[derive(Debug, PartialEq)]
pub enum VaultErrorKind {
    EncryptionFailed,
    Serialization,
    /// The stored blob can neither be decrypted nor read as legacy JSON.
    /// The connection owning it has to be re-established by the user.
    Unrecoverable,
}

/// Errors from the token lifecycle.
#[derive(Debug, PartialEq)]
pub enum SessionErrorKind {
    /// No session has been established for this connection.
    NotConnected,
    /// Refresh failed or was impossible; the user must reconnect.
    Expired,
    /// The initial authentication was rejected by the provider.
    AuthenticationFailed,
}

/// Errors from outbound HTTP calls.
#[derive(Debug, PartialEq)]
pub enum HttpErrorKind {
    BuilderFailed,
    /// 401 from the upstream. Consumed by the session manager, which turns a
    /// persistent one into `SessionErrorKind::Expired`.
    Unauthorized,
    /// Any other non-2xx response.
    Upstream {
        status: u16,
        retry_after_secs: Option<u64>,
    },
    Timeout,
    Network,
    InvalidResponse,
}

impl Error {
    /// HTTP status carried by this error, if it came from an upstream response.
    pub fn status(&self) -> Option<u16> {
        match self.error_kind {
            ErrorKind::Http(HttpErrorKind::Upstream { status, .. }) => Some(status),
            ErrorKind::Http(HttpErrorKind::Unauthorized) => Some(401),
            _ => None,
        }
    }

    /// Server-requested delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.error_kind {
            ErrorKind::Http(HttpErrorKind::Upstream {
                retry_after_secs: Some(secs),
                ..
            }) => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.error_kind == ErrorKind::Http(HttpErrorKind::Unauthorized)
    }

    pub fn is_session_expired(&self) -> bool {
        self.error_kind == ErrorKind::Session(SessionErrorKind::Expired)
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.error_kind == ErrorKind::Vault(VaultErrorKind::Unrecoverable)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Config => write!(f, "Configuration error")?,
            ErrorKind::Vault(kind) => write!(f, "Vault error: {:?}", kind)?,
            ErrorKind::Session(kind) => write!(f, "Session error: {:?}", kind)?,
            ErrorKind::Http(kind) => write!(f, "HTTP error: {:?}", kind)?,
            ErrorKind::Validation => write!(f, "Validation error")?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl ClassifyRetry for Error {
    fn classify(&self) -> Retryable {
        match &self.error_kind {
            ErrorKind::Http(HttpErrorKind::Upstream { status, .. }) => classify_status(*status),
            ErrorKind::Http(HttpErrorKind::Timeout) | ErrorKind::Http(HttpErrorKind::Network) => {
                Retryable::Transient
            }
            _ => Retryable::Fatal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        Error::retry_after(self)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let error_kind = if err.is_timeout() {
            ErrorKind::Http(HttpErrorKind::Timeout)
        } else if err.is_builder() {
            ErrorKind::Http(HttpErrorKind::BuilderFailed)
        } else if err.is_decode() {
            ErrorKind::Http(HttpErrorKind::InvalidResponse)
        } else {
            ErrorKind::Http(HttpErrorKind::Network)
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => err.into(),
            reqwest_middleware::Error::Middleware(err) => Error {
                source: Some(err.into()),
                error_kind: ErrorKind::Http(HttpErrorKind::Network),
            },
        }
    }
}

/// Helper function to create configuration errors.
pub fn config_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Config,
    }
}

/// Helper function to create vault errors.
pub fn vault_error(kind: VaultErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Vault(kind),
    }
}

/// Helper function to create session errors.
pub fn session_error(kind: SessionErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Session(kind),
    }
}

/// Helper function to create HTTP errors.
pub fn http_error(kind: HttpErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Http(kind),
    }
}

/// Helper function to create validation errors.
pub fn validation_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Validation,
    }
}
