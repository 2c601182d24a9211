//! Persistence contract for encrypted brokerage credentials.
//!
//! One record per owner and provider. The blob is whatever the vault produced;
//! stores never see plaintext.

use std::collections::HashMap;

use async_trait::async_trait;
use integration_auth::ProviderKind;
#[cfg(test)]
use mockall::automock;
use tokio::sync::RwLock;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub provider_id: ProviderKind,
    pub owner_id: String,
    pub encrypted_blob: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(
        &self,
        owner_id: &str,
        provider_id: ProviderKind,
    ) -> Result<Option<CredentialRecord>, Error>;

    /// Inserts the record or replaces the blob of an existing one.
    async fn upsert(&self, record: CredentialRecord) -> Result<(), Error>;

    /// Removing a record that does not exist is not an error.
    async fn delete(&self, owner_id: &str, provider_id: ProviderKind) -> Result<(), Error>;
}

/// Process-local store. Records are lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: RwLock<HashMap<(String, ProviderKind), CredentialRecord>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(
        &self,
        owner_id: &str,
        provider_id: ProviderKind,
    ) -> Result<Option<CredentialRecord>, Error> {
        let records = self.records.read().await;
        Ok(records.get(&(owner_id.to_string(), provider_id)).cloned())
    }

    async fn upsert(&self, record: CredentialRecord) -> Result<(), Error> {
        let key = (record.owner_id.clone(), record.provider_id);
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn delete(&self, owner_id: &str, provider_id: ProviderKind) -> Result<(), Error> {
        self.records
            .write()
            .await
            .remove(&(owner_id.to_string(), provider_id));
        Ok(())
    }
}
