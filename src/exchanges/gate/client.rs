use crate::core::config::AccountConfig;
use crate::core::errors::{ExchangeError, NormalizedError};
use crate::core::kernel::{
    HttpTransport, RestClientBuilder, RestClientConfig, RestGateway, SessionKey, StreamHub,
    SubscriptionHandle, TungsteniteConnector, WsConnector,
};
use crate::core::traits::{
    AccountInfo, ExchangeClient, MarketData, MarketStreams, OrderPlacer, ResponseCache,
    StreamHandler,
};
use crate::core::types::{
    AccountSnapshot, Channel, ExchangeKind, Instrument, MarketKind, OrderAck, OrderRef,
    OrderRequest, RequestSpec, SessionNotice,
};
use crate::exchanges::gate::codec::GateCodec;
use crate::exchanges::gate::converters;
use crate::exchanges::gate::errors::GateErrors;
use crate::exchanges::gate::limits;
use crate::exchanges::gate::signer::GateSigner;
use crate::exchanges::gate::types::{
    GateContract, GateCurrencyPair, GateFuturesAccount, GateSpotBalance,
};
use crate::utils::cache::memoize;
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::instrument;

const INSTRUMENTS_TTL: Duration = Duration::from_secs(60 * 60);

fn parse<T: DeserializeOwned>(raw: Value) -> Result<T, NormalizedError> {
    Ok(serde_json::from_value(raw).map_err(ExchangeError::from)?)
}

/// Gate.io APIv4 spot or USDT-settled futures account.
pub struct GateClient {
    config: AccountConfig,
    gateway: RestGateway,
    codec: Arc<GateCodec>,
    streams: StreamHub,
    cache: Option<Arc<dyn ResponseCache>>,
}

impl std::fmt::Debug for GateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateClient")
            .field("account_id", &self.config.account_id)
            .field("market", &self.config.market)
            .finish_non_exhaustive()
    }
}

impl GateClient {
    pub fn new(config: &AccountConfig) -> Result<Self, ExchangeError> {
        // Only futures have a testnet.
        let base_url = match (config.market, config.credentials.testnet) {
            (MarketKind::Perpetual, true) => "https://fx-api-testnet.gateio.ws",
            _ => "https://api.gateio.ws",
        };
        let http = RestClientBuilder::new(RestClientConfig::for_account(config, base_url)).build()?;
        Ok(Self::with_transports(
            config,
            Arc::new(http),
            Arc::new(TungsteniteConnector),
        ))
    }

    pub fn with_transports(
        config: &AccountConfig,
        http: Arc<dyn HttpTransport>,
        connector: Arc<dyn WsConnector>,
    ) -> Self {
        let gateway = RestGateway::from_account(
            config,
            Arc::new(GateSigner),
            http,
            Arc::new(GateErrors),
            limits::buckets(),
            limits::cost,
        );
        let name = format!("{}/{}", ExchangeKind::Gate, config.account_id);
        Self {
            config: config.clone(),
            gateway,
            codec: Arc::new(GateCodec::new(config.market, Some(config.credentials.clone()))),
            streams: StreamHub::new(name, connector, config.stream.clone()),
            cache: None,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn gateway(&self) -> &RestGateway {
        &self.gateway
    }

    fn is_spot(&self) -> bool {
        self.config.market == MarketKind::Spot
    }

    /// The order collection of one pair or contract.
    fn orders_of(&self, method: Method, symbol: &str) -> RequestSpec {
        if self.is_spot() {
            RequestSpec::new(method, "/api/v4/spot/orders")
                .query("currency_pair", symbol.to_uppercase())
        } else {
            RequestSpec::new(method, "/api/v4/futures/usdt/orders")
                .query("contract", symbol.to_uppercase())
        }
    }

    fn default_ws_url(&self) -> &'static str {
        match (self.config.market, self.config.credentials.testnet) {
            (MarketKind::Spot, _) => "wss://api.gateio.ws/ws/v4/",
            (MarketKind::Perpetual, false) => "wss://fx-ws.gateio.ws/v4/ws/usdt",
            (MarketKind::Perpetual, true) => "wss://fx-ws-testnet.gateio.ws/v4/ws/usdt",
        }
    }

    /// Public and private channels share one endpoint unless configured apart.
    fn ws_url(&self, key: SessionKey) -> String {
        let configured = match key {
            SessionKey::Public => self.config.ws_public_url.as_ref(),
            SessionKey::Private => self
                .config
                .ws_private_url
                .as_ref()
                .or(self.config.ws_public_url.as_ref()),
        };
        configured
            .cloned()
            .unwrap_or_else(|| self.default_ws_url().to_string())
    }
}

#[async_trait]
impl AccountInfo for GateClient {
    #[instrument(skip(self), fields(exchange = "gate", account = %self.config.account_id))]
    async fn get_account(&self) -> Result<AccountSnapshot, NormalizedError> {
        let path = if self.is_spot() {
            "/api/v4/spot/accounts"
        } else {
            "/api/v4/futures/usdt/accounts"
        };
        let raw = self.gateway.call_idempotent(RequestSpec::get(path).signed()).await?;
        let balances = if self.is_spot() {
            converters::spot_balances(parse::<Vec<GateSpotBalance>>(raw.clone())?)
        } else {
            converters::futures_balances(parse::<GateFuturesAccount>(raw.clone())?)
        };
        Ok(AccountSnapshot {
            exchange: ExchangeKind::Gate,
            balances,
            raw,
        })
    }
}

#[async_trait]
impl OrderPlacer for GateClient {
    #[instrument(skip(self, order), fields(exchange = "gate", account = %self.config.account_id, symbol = %order.symbol))]
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, NormalizedError> {
        order.validate().map_err(NormalizedError::invalid_param)?;
        let spec = if self.is_spot() {
            RequestSpec::post("/api/v4/spot/orders").body(converters::spot_order_body(&order))
        } else {
            let body = converters::futures_order_body(&order).map_err(NormalizedError::invalid_param)?;
            RequestSpec::post("/api/v4/futures/usdt/orders").body(body)
        };
        let raw = self.gateway.call(spec.signed()).await?;
        converters::order_ack(&order.symbol, raw).map_err(|e| NormalizedError::unknown(None, e))
    }

    #[instrument(skip(self), fields(exchange = "gate", account = %self.config.account_id))]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, NormalizedError> {
        if symbol.is_empty() || order_id.is_empty() {
            return Err(NormalizedError::invalid_param("symbol and order_id are required"));
        }
        let spec = if self.is_spot() {
            RequestSpec::delete(format!("/api/v4/spot/orders/{}", order_id))
                .query("currency_pair", symbol.to_uppercase())
        } else {
            RequestSpec::delete(format!("/api/v4/futures/usdt/orders/{}", order_id))
        };
        let raw = self.gateway.call(spec.signed()).await?;
        converters::order_ack(symbol, raw).map_err(|e| NormalizedError::unknown(None, e))
    }

    #[instrument(skip(self), fields(exchange = "gate", account = %self.config.account_id))]
    async fn get_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderAck, NormalizedError> {
        if symbol.is_empty() || order.is_empty() {
            return Err(NormalizedError::invalid_param("symbol and order are required"));
        }
        // the path takes either the numeric id or the `t-` text
        let id = match order {
            OrderRef::Id(id) => id.clone(),
            OrderRef::Client(text) => converters::order_text(text),
        };
        let spec = if self.is_spot() {
            RequestSpec::get(format!("/api/v4/spot/orders/{}", id))
                .query("currency_pair", symbol.to_uppercase())
        } else {
            RequestSpec::get(format!("/api/v4/futures/usdt/orders/{}", id))
        };
        let raw = self.gateway.call_idempotent(spec.signed()).await?;
        converters::order_ack(symbol, raw).map_err(|e| NormalizedError::unknown(None, e))
    }

    #[instrument(skip(self), fields(exchange = "gate", account = %self.config.account_id))]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderAck>, NormalizedError> {
        if symbol.is_empty() {
            return Err(NormalizedError::invalid_param("symbol is required"));
        }
        let spec = self.orders_of(Method::GET, symbol).query("status", "open");
        let raw = self.gateway.call_idempotent(spec.signed()).await?;
        converters::order_acks(symbol, raw).map_err(|e| NormalizedError::unknown(None, e))
    }

    #[instrument(skip(self), fields(exchange = "gate", account = %self.config.account_id))]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<Vec<OrderAck>, NormalizedError> {
        if symbol.is_empty() {
            return Err(NormalizedError::invalid_param("symbol is required"));
        }
        let spec = self.orders_of(Method::DELETE, symbol);
        let raw = self.gateway.call(spec.signed()).await?;
        converters::order_acks(symbol, raw).map_err(|e| NormalizedError::unknown(None, e))
    }
}

#[async_trait]
impl MarketData for GateClient {
    #[instrument(skip(self), fields(exchange = "gate"))]
    async fn get_instruments(&self) -> Result<Vec<Instrument>, NormalizedError> {
        let (key, path) = if self.is_spot() {
            ("gate:spot:instruments", "/api/v4/spot/currency_pairs")
        } else {
            ("gate:perpetual:instruments", "/api/v4/futures/usdt/contracts")
        };
        let raw = memoize(self.cache.as_deref(), key, INSTRUMENTS_TTL, || {
            self.gateway.call_idempotent(RequestSpec::get(path))
        })
        .await?;
        Ok(if self.is_spot() {
            parse::<Vec<GateCurrencyPair>>(raw)?
                .into_iter()
                .map(converters::spot_instrument)
                .collect()
        } else {
            parse::<Vec<GateContract>>(raw)?
                .into_iter()
                .map(converters::futures_instrument)
                .collect()
        })
    }
}

#[async_trait]
impl MarketStreams for GateClient {
    #[instrument(skip(self, handler), fields(exchange = "gate", account = %self.config.account_id))]
    async fn subscribe(
        &self,
        channel: Channel,
        symbol: Option<&str>,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<SubscriptionHandle, NormalizedError> {
        let key = SessionKey::for_channel(&channel);
        if key == SessionKey::Private && !self.config.credentials.has_credentials() {
            return Err(ExchangeError::InvalidCredentials(
                "private streams require API credentials".to_string(),
            )
            .into());
        }
        let url = self.ws_url(key);
        self.streams
            .subscribe(key, self.codec.clone(), Arc::new(url), channel, symbol, handler)
            .await
    }

    async fn unsubscribe(&self, channel: Channel, symbol: Option<&str>) -> Result<(), NormalizedError> {
        self.streams.unsubscribe(&channel, symbol).await
    }

    async fn unsubscribe_all(&self) {
        self.streams.close_all().await;
    }

    fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.streams.notices()
    }
}

#[async_trait]
impl ExchangeClient for GateClient {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Gate
    }

    fn market(&self) -> MarketKind {
        self.config.market
    }

    fn account_id(&self) -> &str {
        &self.config.account_id
    }

    async fn shutdown(&self) {
        self.unsubscribe_all().await;
        self.gateway.shutdown();
    }
}
