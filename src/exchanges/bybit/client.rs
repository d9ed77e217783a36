use crate::core::config::AccountConfig;
use crate::core::errors::{ErrorKind, ExchangeError, NormalizedError};
use crate::core::kernel::{
    HttpTransport, RestClientBuilder, RestClientConfig, RestGateway, SessionKey, StreamCodec,
    StreamHub, SubscriptionHandle, TungsteniteConnector, WsConnector,
};
use crate::core::traits::{
    AccountInfo, ExchangeClient, MarketData, MarketStreams, OrderPlacer, ResponseCache,
    StreamHandler,
};
use crate::core::types::{
    AccountSnapshot, Channel, ExchangeKind, Instrument, MarketKind, OrderAck, OrderRef,
    OrderRequest, RequestSpec, SessionNotice,
};
use crate::exchanges::bybit::codec::BybitCodec;
use crate::exchanges::bybit::converters;
use crate::exchanges::bybit::errors::BybitErrors;
use crate::exchanges::bybit::limits;
use crate::exchanges::bybit::signer::BybitSigner;
use crate::exchanges::bybit::types::{
    BybitInstrument, BybitList, BybitOrderResult, BybitResponse, BybitWallet,
};
use crate::utils::cache::memoize;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::instrument;

const INSTRUMENTS_TTL: Duration = Duration::from_secs(60 * 60);

fn result<T: DeserializeOwned>(raw: Value) -> Result<T, NormalizedError> {
    let response: BybitResponse<T> = serde_json::from_value(raw).map_err(ExchangeError::from)?;
    Ok(response.result)
}

/// Bybit V5 unified account, spot or linear category.
pub struct BybitClient {
    config: AccountConfig,
    gateway: RestGateway,
    public_codec: Arc<BybitCodec>,
    streams: StreamHub,
    cache: Option<Arc<dyn ResponseCache>>,
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("account_id", &self.config.account_id)
            .field("market", &self.config.market)
            .finish_non_exhaustive()
    }
}

impl BybitClient {
    pub fn new(config: &AccountConfig) -> Result<Self, ExchangeError> {
        let base_url = if config.credentials.testnet {
            "https://api-testnet.bybit.com"
        } else {
            "https://api.bybit.com"
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
            Arc::new(BybitSigner::default()),
            http,
            Arc::new(BybitErrors),
            limits::buckets(),
            limits::cost,
        );
        let name = format!("{}/{}", ExchangeKind::Bybit, config.account_id);
        Self {
            config: config.clone(),
            gateway,
            public_codec: Arc::new(BybitCodec::public(config.market)),
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

    fn category(&self) -> &'static str {
        converters::category(self.config.market)
    }

    fn stream_host(&self) -> &'static str {
        if self.config.credentials.testnet {
            "wss://stream-testnet.bybit.com"
        } else {
            "wss://stream.bybit.com"
        }
    }

    fn public_url(&self) -> String {
        self.config
            .ws_public_url
            .clone()
            .unwrap_or_else(|| format!("{}/v5/public/{}", self.stream_host(), self.category()))
    }

    fn private_url(&self) -> String {
        self.config
            .ws_private_url
            .clone()
            .unwrap_or_else(|| format!("{}/v5/private", self.stream_host()))
    }

    /// `/v5/order/realtime` serves both single-order lookups and open orders.
    fn realtime_orders(&self, symbol: &str) -> RequestSpec {
        RequestSpec::get("/v5/order/realtime")
            .query("category", self.category())
            .query("symbol", symbol.to_uppercase())
    }

    fn order_ack(&self, symbol: &str, raw: Value) -> Result<OrderAck, NormalizedError> {
        let order: BybitOrderResult = result(raw.clone())?;
        Ok(OrderAck {
            order_id: order.order_id,
            client_order_id: order.order_link_id.filter(|id| !id.is_empty()),
            symbol: symbol.to_uppercase(),
            status: "New".to_string(),
            raw,
        })
    }
}

#[async_trait]
impl AccountInfo for BybitClient {
    #[instrument(skip(self), fields(exchange = "bybit", account = %self.config.account_id))]
    async fn get_account(&self) -> Result<AccountSnapshot, NormalizedError> {
        let spec = RequestSpec::get("/v5/account/wallet-balance")
            .query("accountType", "UNIFIED")
            .signed();
        let raw = self.gateway.call_idempotent(spec).await?;
        let wallets: BybitList<BybitWallet> = result(raw.clone())?;
        Ok(AccountSnapshot {
            exchange: ExchangeKind::Bybit,
            balances: converters::balances(wallets.list),
            raw,
        })
    }
}

#[async_trait]
impl OrderPlacer for BybitClient {
    #[instrument(skip(self, order), fields(exchange = "bybit", account = %self.config.account_id, symbol = %order.symbol))]
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, NormalizedError> {
        order.validate().map_err(NormalizedError::invalid_param)?;
        let spec = RequestSpec::post("/v5/order/create")
            .body(converters::order_body(self.config.market, &order))
            .signed();
        let raw = self.gateway.call(spec).await?;
        self.order_ack(&order.symbol, raw)
    }

    #[instrument(skip(self), fields(exchange = "bybit", account = %self.config.account_id))]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, NormalizedError> {
        if symbol.is_empty() || order_id.is_empty() {
            return Err(NormalizedError::invalid_param("symbol and order_id are required"));
        }
        let spec = RequestSpec::post("/v5/order/cancel")
            .body(json!({
                "category": self.category(),
                "symbol": symbol.to_uppercase(),
                "orderId": order_id,
            }))
            .signed();
        let raw = self.gateway.call(spec).await?;
        let mut ack = self.order_ack(symbol, raw)?;
        ack.status = "Cancelled".to_string();
        Ok(ack)
    }

    #[instrument(skip(self), fields(exchange = "bybit", account = %self.config.account_id))]
    async fn get_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderAck, NormalizedError> {
        if symbol.is_empty() || order.is_empty() {
            return Err(NormalizedError::invalid_param("symbol and order are required"));
        }
        let spec = self.realtime_orders(symbol);
        let spec = match order {
            OrderRef::Id(id) => spec.query("orderId", id.as_str()),
            OrderRef::Client(id) => spec.query("orderLinkId", id.as_str()),
        };
        let raw = self.gateway.call_idempotent(spec.signed()).await?;
        let list: BybitList<Value> = result(raw)?;
        let found = converters::orders(list.list, symbol, "New").map_err(ExchangeError::from)?;
        found.into_iter().next().ok_or_else(|| {
            NormalizedError::new(ErrorKind::ExchangeRejected, None, "order does not exist")
        })
    }

    #[instrument(skip(self), fields(exchange = "bybit", account = %self.config.account_id))]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderAck>, NormalizedError> {
        if symbol.is_empty() {
            return Err(NormalizedError::invalid_param("symbol is required"));
        }
        let spec = self.realtime_orders(symbol).query("openOnly", "0").signed();
        let raw = self.gateway.call_idempotent(spec).await?;
        let list: BybitList<Value> = result(raw)?;
        Ok(converters::orders(list.list, symbol, "New").map_err(ExchangeError::from)?)
    }

    #[instrument(skip(self), fields(exchange = "bybit", account = %self.config.account_id))]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<Vec<OrderAck>, NormalizedError> {
        if symbol.is_empty() {
            return Err(NormalizedError::invalid_param("symbol is required"));
        }
        let spec = RequestSpec::post("/v5/order/cancel-all")
            .body(json!({
                "category": self.category(),
                "symbol": symbol.to_uppercase(),
            }))
            .signed();
        let raw = self.gateway.call(spec).await?;
        let list: BybitList<Value> = result(raw)?;
        Ok(converters::orders(list.list, symbol, "Cancelled").map_err(ExchangeError::from)?)
    }
}

#[async_trait]
impl MarketData for BybitClient {
    #[instrument(skip(self), fields(exchange = "bybit"))]
    async fn get_instruments(&self) -> Result<Vec<Instrument>, NormalizedError> {
        let key = format!("bybit:{}:instruments", self.category());
        let spec = RequestSpec::get("/v5/market/instruments-info")
            .query("category", self.category())
            .query_opt(
                "limit",
                (self.config.market == MarketKind::Perpetual).then_some("1000"),
            );
        let raw = memoize(self.cache.as_deref(), &key, INSTRUMENTS_TTL, || {
            self.gateway.call_idempotent(spec)
        })
        .await?;
        let instruments: BybitList<BybitInstrument> = result(raw)?;
        Ok(instruments.list.into_iter().map(converters::instrument).collect())
    }
}

#[async_trait]
impl MarketStreams for BybitClient {
    #[instrument(skip(self, handler), fields(exchange = "bybit", account = %self.config.account_id))]
    async fn subscribe(
        &self,
        channel: Channel,
        symbol: Option<&str>,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<SubscriptionHandle, NormalizedError> {
        let key = SessionKey::for_channel(&channel);
        let (codec, url): (Arc<dyn StreamCodec>, String) = match key {
            SessionKey::Public => (self.public_codec.clone() as Arc<dyn StreamCodec>, self.public_url()),
            SessionKey::Private => {
                if !self.config.credentials.has_credentials() {
                    return Err(ExchangeError::InvalidCredentials(
                        "private streams require API credentials".to_string(),
                    )
                    .into());
                }
                let codec = BybitCodec::private(self.config.market, self.config.credentials.clone());
                (Arc::new(codec) as Arc<dyn StreamCodec>, self.private_url())
            }
        };
        self.streams
            .subscribe(key, codec, Arc::new(url), channel, symbol, handler)
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
impl ExchangeClient for BybitClient {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Bybit
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
