//! Token lifecycle for brokerage connections: tokens, the per-provider client
//! trait and the session manager that keeps tokens valid.

mod client;
mod manager;
mod tokens;

pub use client::{ApiRequest, AuthenticatedHttpClient};
pub use manager::{SessionManager, SessionState, MAX_REQUEST_ATTEMPTS};
pub use tokens::{StoredToken, Token, DEFAULT_REFRESH_BUFFER_SECS};
