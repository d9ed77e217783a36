use crate::core::config::{AccountConfig, ConnectivityConfig};
use crate::core::errors::ExchangeError;
use crate::core::traits::ExchangeClient;
use crate::core::types::ExchangeKind;
use crate::utils::exchange_factory::ExchangeFactory;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{info, instrument};

/// Registry key: one client per exchange account.
pub type ClientKey = (ExchangeKind, String);

/// Process-wide table of exchange clients keyed by `(exchange, account_id)`.
///
/// Built once at startup and torn down with [`ConnectivityRegistry::shutdown`].
/// Each client owns its own limiter and sessions, so lookups never contend
/// beyond the map's shard locks.
#[derive(Default)]
pub struct ConnectivityRegistry {
    clients: DashMap<ClientKey, Arc<dyn ExchangeClient>>,
}

impl std::fmt::Debug for ConnectivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityRegistry")
            .field("clients", &self.keys())
            .finish()
    }
}

impl ConnectivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a client for every configured account.
    pub fn from_config(config: &ConnectivityConfig, factory: &ExchangeFactory) -> Result<Self, ExchangeError> {
        Self::from_config_with(config, |account| factory.create_client(account))
    }

    /// Like [`ConnectivityRegistry::from_config`] with a custom client constructor.
    pub fn from_config_with<F>(config: &ConnectivityConfig, mut build: F) -> Result<Self, ExchangeError>
    where
        F: FnMut(&AccountConfig) -> Result<Arc<dyn ExchangeClient>, ExchangeError>,
    {
        let registry = Self::new();
        for account in &config.accounts {
            registry.register(build(account)?)?;
        }
        info!(clients = registry.len(), "connectivity registry initialized");
        Ok(registry)
    }

    /// Add a client. A second client for the same key is rejected, never overwritten.
    pub fn register(&self, client: Arc<dyn ExchangeClient>) -> Result<(), ExchangeError> {
        let key = (client.exchange(), client.account_id().to_string());
        match self.clients.entry(key) {
            Entry::Occupied(occupied) => Err(ExchangeError::DuplicateClient {
                exchange: occupied.key().0.to_string(),
                account_id: occupied.key().1.clone(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(client);
                Ok(())
            }
        }
    }

    pub fn get(&self, exchange: ExchangeKind, account_id: &str) -> Option<Arc<dyn ExchangeClient>> {
        self.clients
            .get(&(exchange, account_id.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Detach a client without shutting it down.
    pub fn remove(&self, exchange: ExchangeKind, account_id: &str) -> Option<Arc<dyn ExchangeClient>> {
        self.clients
            .remove(&(exchange, account_id.to_string()))
            .map(|(_, client)| client)
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<ClientKey> {
        let mut keys: Vec<ClientKey> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Shut down and drop every client: streams close, in-flight calls are cancelled.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let keys = self.keys();
        let clients: Vec<Arc<dyn ExchangeClient>> = keys
            .iter()
            .filter_map(|key| self.clients.remove(key).map(|(_, client)| client))
            .collect();
        join_all(clients.iter().map(|client| client.shutdown())).await;
        info!(clients = clients.len(), "connectivity registry shut down");
    }
}
