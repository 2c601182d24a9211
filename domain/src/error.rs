//! Error types for the `domain` layer.
use integration_auth::error::{
    Error as IntegrationAuthError, ErrorKind as IntegrationAuthErrorKind, HttpErrorKind,
    SessionErrorKind, VaultErrorKind,
};
use std::error::Error as StdError;
use std::fmt;

/// Top-level domain error type.
/// Errors in the Domain layer are modeled as a tree structure
/// with `domain::error::Error` as the root type holding a tree of `error_kind`
/// enums that represent the kinds of errors that can occur in the domain layer or
/// in lower layers. The `source` field is used to hold the original error that caused
/// the domain error. Callers above `domain` branch on the kinds, never on
/// `integration_auth` types directly.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: DomainErrorKind,
}

/// Enum representing the major categories of errors that can occur in the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum DomainErrorKind {
    Internal(InternalErrorKind),
    External(ExternalErrorKind),
}

/// Enum representing the various kinds of internal errors that can occur in the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum InternalErrorKind {
    /// Missing or malformed configuration, including the encryption key.
    Config,
    /// Input rejected before any network call.
    Validation,
    /// Stored credentials are tampered with or were sealed with another key.
    CredentialsUnrecoverable,
    Storage,
    Other(String),
}

/// Enum representing the various kinds of external errors that can occur in the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum ExternalErrorKind {
    Network,
    Timeout,
    /// Non-2xx from the provider after any retries.
    Upstream { status: u16 },
    /// No connection exists for this owner and provider.
    NotConnected,
    /// The provider no longer accepts the stored credentials; the user must reconnect.
    SessionExpired,
    /// The provider rejected the credentials given at connection time.
    AuthenticationFailed,
    InvalidResponse,
    Other(String),
}

impl Error {
    /// True when the only way forward is for the user to connect again.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self.error_kind,
            DomainErrorKind::External(ExternalErrorKind::SessionExpired)
                | DomainErrorKind::Internal(InternalErrorKind::CredentialsUnrecoverable)
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self.error_kind {
            DomainErrorKind::External(ExternalErrorKind::Upstream { status }) => Some(status),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Domain Error: {self:?}")
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

// This is where we translate errors from the `integration_auth` layer to the `domain` layer.
impl From<IntegrationAuthError> for Error {
    fn from(err: IntegrationAuthError) -> Self {
        let error_kind = match &err.error_kind {
            IntegrationAuthErrorKind::Config => DomainErrorKind::Internal(InternalErrorKind::Config),
            IntegrationAuthErrorKind::Validation => {
                DomainErrorKind::Internal(InternalErrorKind::Validation)
            }
            IntegrationAuthErrorKind::Vault(VaultErrorKind::Unrecoverable) => {
                DomainErrorKind::Internal(InternalErrorKind::CredentialsUnrecoverable)
            }
            IntegrationAuthErrorKind::Vault(_) => {
                DomainErrorKind::Internal(InternalErrorKind::Other(err.to_string()))
            }
            IntegrationAuthErrorKind::Session(SessionErrorKind::NotConnected) => {
                DomainErrorKind::External(ExternalErrorKind::NotConnected)
            }
            IntegrationAuthErrorKind::Session(SessionErrorKind::Expired) => {
                DomainErrorKind::External(ExternalErrorKind::SessionExpired)
            }
            IntegrationAuthErrorKind::Session(SessionErrorKind::AuthenticationFailed) => {
                DomainErrorKind::External(ExternalErrorKind::AuthenticationFailed)
            }
            IntegrationAuthErrorKind::Http(HttpErrorKind::Upstream { status, .. }) => {
                DomainErrorKind::External(ExternalErrorKind::Upstream { status: *status })
            }
            // A 401 that escaped the session manager (e.g. an API key rejected
            // by a metered provider).
            IntegrationAuthErrorKind::Http(HttpErrorKind::Unauthorized) => {
                DomainErrorKind::External(ExternalErrorKind::Upstream { status: 401 })
            }
            IntegrationAuthErrorKind::Http(HttpErrorKind::Timeout) => {
                DomainErrorKind::External(ExternalErrorKind::Timeout)
            }
            IntegrationAuthErrorKind::Http(HttpErrorKind::Network) => {
                DomainErrorKind::External(ExternalErrorKind::Network)
            }
            IntegrationAuthErrorKind::Http(HttpErrorKind::InvalidResponse) => {
                DomainErrorKind::External(ExternalErrorKind::InvalidResponse)
            }
            IntegrationAuthErrorKind::Http(HttpErrorKind::BuilderFailed) => {
                DomainErrorKind::Internal(InternalErrorKind::Other(err.to_string()))
            }
        };
        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: DomainErrorKind::External(ExternalErrorKind::InvalidResponse),
        }
    }
}

/// Helper for input rejected before any network call.
pub fn validation_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: DomainErrorKind::Internal(InternalErrorKind::Validation),
    }
}

/// Helper for credential store implementations.
pub fn storage_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: DomainErrorKind::Internal(InternalErrorKind::Storage),
    }
}

/// Helper for missing configuration values.
pub fn config_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: DomainErrorKind::Internal(InternalErrorKind::Config),
    }
}
