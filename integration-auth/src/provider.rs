//! External providers this crate knows how to hold credentials for.

use serde::{Deserialize, Serialize};

/// Brokerages with a stored, refreshable session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OAuth-style brokerage: password grant, expiring tokens.
    Brokerage,
    /// Exchange with API key material and HMAC-signed requests.
    Exchange,
}

impl ProviderKind {
    /// Get the provider identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Brokerage => "brokerage",
            ProviderKind::Exchange => "exchange",
        }
    }

    pub fn parse(provider_id: &str) -> Option<Self> {
        match provider_id {
            "brokerage" => Some(ProviderKind::Brokerage),
            "exchange" => Some(ProviderKind::Exchange),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_roundtrip() {
        for kind in [ProviderKind::Brokerage, ProviderKind::Exchange] {
            assert_eq!(ProviderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("zoom"), None);
    }
}
