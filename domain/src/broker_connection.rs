//! Connecting, resuming and disconnecting brokerage accounts.
//!
//! Credentials only ever reach the store encrypted. A [`BrokerConnection`]
//! wraps one adapter and writes refreshed tokens back after every call, so
//! a rotated refresh token is never lost between requests.

use std::collections::HashMap;

use integration_auth::session::{SessionState, StoredToken};
use integration_auth::vault::Vault;
use integration_auth::ProviderKind;
use log::*;
use serde::Serialize;
use serde_json::Value;
use service::config::Config;

use crate::credential_store::{CredentialRecord, CredentialStore};
use crate::error::{DomainErrorKind, Error, ExternalErrorKind};
use crate::gateway::broker::{
    Bar, BarInterval, BrokerAdapter, HistoryRange, Operation, Order, OrderRequest,
    OrderStatusFilter, Position, Quote, QuoteLookup,
};
use crate::gateway::brokerage::{BrokerageAdapter, BrokerageLogin, BrokerageSettings};
use crate::gateway::exchange::{
    ExchangeAdapter, ExchangeKeys, ExchangeSettings, ExchangeStoredCredentials,
};

#[derive(Clone)]
pub struct ConnectionSettings {
    pub brokerage: BrokerageSettings,
    pub exchange: ExchangeSettings,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            brokerage: BrokerageSettings::from_config(config),
            exchange: ExchangeSettings::from_config(config),
        }
    }
}

/// What the user hands over once, at connection time.
pub enum ConnectSecret {
    Brokerage(BrokerageLogin),
    Exchange(ExchangeKeys),
}

impl ConnectSecret {
    pub fn provider(&self) -> ProviderKind {
        match self {
            ConnectSecret::Brokerage(_) => ProviderKind::Brokerage,
            ConnectSecret::Exchange(_) => ProviderKind::Exchange,
        }
    }
}

/// Connection state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    /// Credentials exist but can no longer be used; the user must reconnect.
    Expired,
    Disconnected,
}

fn not_connected(owner_id: &str, provider: ProviderKind) -> Error {
    Error {
        source: Some(format!("{} has no {} connection", owner_id, provider.as_str()).into()),
        error_kind: DomainErrorKind::External(ExternalErrorKind::NotConnected),
    }
}

fn unreadable(owner_id: &str, provider: ProviderKind, err: &impl std::fmt::Display) {
    warn!(
        "Cannot read {} credentials of {}: {}",
        provider.as_str(),
        owner_id,
        err
    );
}

/// Authenticate with the provider and store the resulting credentials.
pub async fn connect<'a>(
    store: &'a dyn CredentialStore,
    vault: &'a Vault,
    settings: &ConnectionSettings,
    owner_id: &str,
    secret: ConnectSecret,
) -> Result<BrokerConnection<'a>, Error> {
    let provider = secret.provider();
    let (adapter, credentials): (Box<dyn BrokerAdapter>, Value) = match secret {
        ConnectSecret::Brokerage(login) => {
            let adapter = BrokerageAdapter::new(&settings.brokerage)?;
            let credentials = adapter.connect(&login).await?;
            (Box::new(adapter), credentials)
        }
        ConnectSecret::Exchange(keys) => {
            let adapter = ExchangeAdapter::new(&settings.exchange, keys)?;
            let credentials = adapter.connect().await?;
            (Box::new(adapter), credentials)
        }
    };

    let connection = BrokerConnection::new(store, vault, owner_id, adapter);
    connection.save(&credentials).await?;
    info!("{} connected to {}", owner_id, provider.as_str());
    Ok(connection)
}

/// Resume a stored connection.
pub async fn open<'a>(
    store: &'a dyn CredentialStore,
    vault: &'a Vault,
    settings: &ConnectionSettings,
    owner_id: &str,
    provider: ProviderKind,
) -> Result<BrokerConnection<'a>, Error> {
    let record = store
        .get(owner_id, provider)
        .await?
        .ok_or_else(|| not_connected(owner_id, provider))?;

    let adapter: Box<dyn BrokerAdapter> = match provider {
        ProviderKind::Brokerage => {
            let stored: StoredToken = vault
                .decrypt_credentials(&record.encrypted_blob)
                .inspect_err(|e| unreadable(owner_id, provider, e))?;
            Box::new(BrokerageAdapter::from_stored(&settings.brokerage, stored)?)
        }
        ProviderKind::Exchange => {
            let stored: ExchangeStoredCredentials = vault
                .decrypt_credentials(&record.encrypted_blob)
                .inspect_err(|e| unreadable(owner_id, provider, e))?;
            Box::new(ExchangeAdapter::from_stored(&settings.exchange, stored)?)
        }
    };

    debug!("Opened {} connection for {}", provider.as_str(), owner_id);
    Ok(BrokerConnection::new(store, vault, owner_id, adapter))
}

pub async fn disconnect(
    store: &dyn CredentialStore,
    owner_id: &str,
    provider: ProviderKind,
) -> Result<(), Error> {
    store.delete(owner_id, provider).await?;
    info!("{} disconnected from {}", owner_id, provider.as_str());
    Ok(())
}

/// Status without contacting the provider: a record that cannot be
/// decrypted counts as expired.
pub async fn connection_status(
    store: &dyn CredentialStore,
    vault: &Vault,
    owner_id: &str,
    provider: ProviderKind,
) -> Result<ConnectionStatus, Error> {
    let Some(record) = store.get(owner_id, provider).await? else {
        return Ok(ConnectionStatus::Disconnected);
    };
    match vault.decrypt(&record.encrypted_blob) {
        Ok(_) => Ok(ConnectionStatus::Connected),
        Err(e) if e.is_unrecoverable() => Ok(ConnectionStatus::Expired),
        Err(e) => Err(e.into()),
    }
}

/// One owner's open connection to one provider.
pub struct BrokerConnection<'a> {
    store: &'a dyn CredentialStore,
    vault: &'a Vault,
    owner_id: String,
    adapter: Box<dyn BrokerAdapter>,
    /// Refreshed credentials not yet written to the store. The lock is held
    /// for the whole write so saves happen in refresh order.
    unsaved: tokio::sync::Mutex<Option<Value>>,
}

impl<'a> BrokerConnection<'a> {
    fn new(
        store: &'a dyn CredentialStore,
        vault: &'a Vault,
        owner_id: &str,
        adapter: Box<dyn BrokerAdapter>,
    ) -> Self {
        Self {
            store,
            vault,
            owner_id: owner_id.to_string(),
            adapter,
            unsaved: tokio::sync::Mutex::new(None),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.adapter.provider()
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.adapter.session_state() {
            SessionState::ReconnectRequired => ConnectionStatus::Expired,
            SessionState::Unauthenticated => ConnectionStatus::Disconnected,
            _ => ConnectionStatus::Connected,
        }
    }

    pub async fn positions(&self) -> Result<Vec<Position>, Error> {
        self.finish(self.adapter.positions().await).await
    }

    pub async fn quote(&self, symbol: &str) -> Result<Quote, Error> {
        self.finish(self.adapter.quote(symbol).await).await
    }

    pub async fn quotes(&self, symbols: &[String]) -> HashMap<String, QuoteLookup> {
        let lookups = self.adapter.quotes(symbols).await;
        self.persist_refreshed().await;
        lookups
    }

    pub async fn orders(&self, filter: OrderStatusFilter) -> Result<Vec<Order>, Error> {
        self.finish(self.adapter.orders(filter).await).await
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<Order, Error> {
        self.finish(self.adapter.place_order(order).await).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), Error> {
        self.finish(self.adapter.cancel_order(order_id).await).await
    }

    pub async fn history(
        &self,
        symbol: Option<&str>,
        range: &HistoryRange,
    ) -> Result<Vec<Operation>, Error> {
        self.finish(self.adapter.history(symbol, range).await).await
    }

    pub async fn price_history(
        &self,
        symbol: &str,
        range: &HistoryRange,
        interval: BarInterval,
    ) -> Result<Vec<Bar>, Error> {
        self.finish(self.adapter.price_history(symbol, range, interval).await)
            .await
    }

    /// True while refreshed credentials are waiting for a successful write.
    pub async fn has_unsaved_credentials(&self) -> bool {
        self.unsaved.lock().await.is_some()
    }

    /// Write refreshed credentials that are still pending. A failed write
    /// keeps them pending.
    pub async fn save_pending(&self) -> Result<(), Error> {
        let mut unsaved = self.unsaved.lock().await;
        let fresh = self.adapter.take_refreshed_credentials();
        let stale = unsaved.take();
        let Some(credentials) = fresh.or(stale) else {
            return Ok(());
        };
        match self.save(&credentials).await {
            Ok(()) => {
                debug!(
                    "Persisted refreshed {} credentials for {}",
                    self.provider().as_str(),
                    self.owner_id
                );
                Ok(())
            }
            Err(e) => {
                *unsaved = Some(credentials);
                Err(e)
            }
        }
    }

    /// Refreshes can happen before a later failure, so credentials are
    /// persisted whatever the outcome.
    async fn finish<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        self.persist_refreshed().await;
        if let Err(e) = &result {
            if e.requires_reconnect() {
                warn!(
                    "{} connection of {} needs to be re-established",
                    self.provider().as_str(),
                    self.owner_id
                );
            }
        }
        result
    }

    async fn persist_refreshed(&self) {
        if let Err(e) = self.save_pending().await {
            error!(
                "Failed to persist refreshed {} credentials for {}, retrying after the next call: {}",
                self.provider().as_str(),
                self.owner_id,
                e
            );
        }
    }

    async fn save(&self, credentials: &Value) -> Result<(), Error> {
        let encrypted_blob = self.vault.encrypt_credentials(credentials)?;
        self.store
            .upsert(CredentialRecord {
                provider_id: self.provider(),
                owner_id: self.owner_id.clone(),
                encrypted_blob,
            })
            .await
    }
}
