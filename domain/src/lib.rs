//! Brokerage connections, market data and analysis built on `integration_auth`.
//!
//! Callers above this crate deal in [`error::Error`] kinds and the broker-neutral
//! types of [`gateway::broker`]; provider wire formats stay in the adapters.

pub use integration_auth::ProviderKind;

pub mod broker_connection;
pub mod credential_store;
pub mod error;
pub mod gateway;
