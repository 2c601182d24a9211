//! # integration-auth
//!
//! Resilience layer for every outbound integration of the portfolio service:
//! - Credential vault (AES-256-GCM blobs at rest, legacy plaintext passthrough)
//! - Token lifecycle with proactive and reactive refresh
//! - HTTP client building, response mapping and HMAC request signing
//! - Bounded retry with exponential backoff
//! - Daily call budgets and TTL caches for metered providers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use integration_auth::{
//!     session::{AuthenticatedHttpClient, SessionManager},
//!     vault::Vault,
//!     http::{AuthenticatedClientBuilder, RetryExecutor},
//!     quota::RateBudgetCache,
//! };
//! ```

pub mod error;
pub mod http;
pub mod provider;
pub mod quota;
pub mod session;
pub mod vault;

// Re-export commonly used types
pub use error::{Error, ErrorKind};
pub use provider::ProviderKind;
