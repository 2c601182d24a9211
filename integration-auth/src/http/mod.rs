//! Outbound HTTP: client building, response mapping, signing and retries.

mod client;
mod response;
mod retry;
mod signing;

pub use client::{AuthenticatedClient, AuthenticatedClientBuilder, HttpClientConfig};
pub use response::{endpoint, parse_retry_after, read_json, send_json};
pub use retry::{classify_status, BackoffPolicy, ClassifyRetry, RetryExecutor};
pub use signing::{RequestSigner, API_KEY_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
