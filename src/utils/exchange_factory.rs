use crate::core::config::AccountConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::{HttpTransport, WsConnector};
use crate::core::traits::{ExchangeClient, ResponseCache};
use crate::core::types::ExchangeKind;
use crate::exchanges::binance::BinanceClient;
use crate::exchanges::bybit::BybitClient;
use crate::exchanges::gate::GateClient;
use std::sync::Arc;

/// Builds exchange clients from account configuration.
#[derive(Clone, Default)]
pub struct ExchangeFactory {
    cache: Option<Arc<dyn ResponseCache>>,
}

impl std::fmt::Debug for ExchangeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeFactory")
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl ExchangeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share `cache` between every client this factory builds.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Create a client over the real HTTP and WebSocket transports.
    pub fn create_client(&self, config: &AccountConfig) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        Ok(match config.exchange {
            ExchangeKind::Binance => self.finish(BinanceClient::new(config)?),
            ExchangeKind::Bybit => self.finish(BybitClient::new(config)?),
            ExchangeKind::Gate => self.finish(GateClient::new(config)?),
        })
    }

    /// Create a client over caller-supplied transports.
    pub fn create_with_transports(
        &self,
        config: &AccountConfig,
        http: Arc<dyn HttpTransport>,
        connector: Arc<dyn WsConnector>,
    ) -> Arc<dyn ExchangeClient> {
        match config.exchange {
            ExchangeKind::Binance => self.finish(BinanceClient::with_transports(config, http, connector)),
            ExchangeKind::Bybit => self.finish(BybitClient::with_transports(config, http, connector)),
            ExchangeKind::Gate => self.finish(GateClient::with_transports(config, http, connector)),
        }
    }

    fn finish<C: Cached + ExchangeClient + 'static>(&self, client: C) -> Arc<dyn ExchangeClient> {
        match &self.cache {
            Some(cache) => Arc::new(client.cached(cache.clone())),
            None => Arc::new(client),
        }
    }
}

/// Clients that accept a response cache.
trait Cached: Sized {
    fn cached(self, cache: Arc<dyn ResponseCache>) -> Self;
}

impl Cached for BinanceClient {
    fn cached(self, cache: Arc<dyn ResponseCache>) -> Self {
        self.with_cache(cache)
    }
}

impl Cached for BybitClient {
    fn cached(self, cache: Arc<dyn ResponseCache>) -> Self {
        self.with_cache(cache)
    }
}

impl Cached for GateClient {
    fn cached(self, cache: Arc<dyn ResponseCache>) -> Self {
        self.with_cache(cache)
    }
}
