use crate::core::config::AccountConfig;
use crate::core::errors::{ExchangeError, NormalizedError};
use crate::core::kernel::{
    CostTable, HttpTransport, RestClientBuilder, RestClientConfig, RestGateway, SessionKey,
    StreamEndpoint, StreamHub, SubscriptionHandle, TungsteniteConnector, WsConnector,
};
use crate::core::traits::{
    AccountInfo, ExchangeClient, MarketData, MarketStreams, OrderPlacer, ResponseCache,
    StreamHandler,
};
use crate::core::types::{
    AccountSnapshot, Channel, ExchangeKind, Instrument, MarketKind, OrderAck, OrderRef,
    OrderRequest, RequestSpec, SessionNotice,
};
use crate::exchanges::binance::codec::BinanceCodec;
use crate::exchanges::binance::converters;
use crate::exchanges::binance::errors::BinanceErrors;
use crate::exchanges::binance::limits;
use crate::exchanges::binance::signer::BinanceSigner;
use crate::exchanges::binance::types::{
    BinanceAccountInfo, BinanceExchangeInfo, BinanceFuturesAccount, BinanceListenKey,
    BinanceOrderResponse,
};
use crate::utils::cache::memoize;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Listen keys expire after 60 minutes without a keepalive.
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);
const INSTRUMENTS_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct Endpoints {
    rest: &'static str,
    ws_public: &'static str,
    /// Base of the raw user-data socket; the listen key is appended as a path segment.
    ws_private: &'static str,
    account: &'static str,
    order: &'static str,
    open_orders: &'static str,
    cancel_all: &'static str,
    exchange_info: &'static str,
    listen_key: &'static str,
}

impl Endpoints {
    const fn for_market(market: MarketKind, testnet: bool) -> Self {
        match (market, testnet) {
            (MarketKind::Spot, false) => Self::spot(
                "https://api.binance.com",
                "wss://stream.binance.com:9443/stream",
                "wss://stream.binance.com:9443/ws",
            ),
            (MarketKind::Spot, true) => Self::spot(
                "https://testnet.binance.vision",
                "wss://testnet.binance.vision/stream",
                "wss://testnet.binance.vision/ws",
            ),
            (MarketKind::Perpetual, false) => Self::perp(
                "https://fapi.binance.com",
                "wss://fstream.binance.com/stream",
                "wss://fstream.binance.com/ws",
            ),
            (MarketKind::Perpetual, true) => Self::perp(
                "https://testnet.binancefuture.com",
                "wss://stream.binancefuture.com/stream",
                "wss://stream.binancefuture.com/ws",
            ),
        }
    }

    const fn spot(rest: &'static str, ws_public: &'static str, ws_private: &'static str) -> Self {
        Self {
            rest,
            ws_public,
            ws_private,
            account: "/api/v3/account",
            order: "/api/v3/order",
            open_orders: "/api/v3/openOrders",
            cancel_all: "/api/v3/openOrders",
            exchange_info: "/api/v3/exchangeInfo",
            listen_key: "/api/v3/userDataStream",
        }
    }

    const fn perp(rest: &'static str, ws_public: &'static str, ws_private: &'static str) -> Self {
        Self {
            rest,
            ws_public,
            ws_private,
            account: "/fapi/v2/account",
            order: "/fapi/v1/order",
            open_orders: "/fapi/v1/openOrders",
            cancel_all: "/fapi/v1/allOpenOrders",
            exchange_info: "/fapi/v1/exchangeInfo",
            listen_key: "/fapi/v1/listenKey",
        }
    }
}

/// An open user-data stream and the task keeping it alive.
struct ListenKeyLease {
    key: String,
    keepalive: JoinHandle<()>,
}

/// Socket endpoint of the user-data stream, addressed by a REST-issued listen key.
///
/// The key is created on first use and kept alive every 30 minutes. A renew request
/// (after the exchange reported the key expired) issues a fresh key.
struct UserDataStream {
    gateway: Arc<RestGateway>,
    path: &'static str,
    base: String,
    account_id: String,
    has_credentials: bool,
    lease: Mutex<Option<ListenKeyLease>>,
}

impl UserDataStream {
    async fn issue(&self) -> Result<ListenKeyLease, NormalizedError> {
        if !self.has_credentials {
            return Err(ExchangeError::InvalidCredentials(
                "private streams require API credentials".to_string(),
            )
            .into());
        }

        let response = self.gateway.call(RequestSpec::post(self.path).signed()).await?;
        let BinanceListenKey { listen_key } =
            serde_json::from_value(response).map_err(ExchangeError::from)?;

        let gateway = Arc::clone(&self.gateway);
        let path = self.path;
        let key = listen_key.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + LISTEN_KEY_KEEPALIVE,
                LISTEN_KEY_KEEPALIVE,
            );
            loop {
                ticker.tick().await;
                let spec = RequestSpec::put(path).query("listenKey", key.as_str()).signed();
                match gateway.call(spec).await {
                    Ok(_) => debug!("listen key kept alive"),
                    Err(err) => warn!(error = %err, "listen key keepalive failed"),
                }
            }
        });

        info!(account = %self.account_id, "user data stream opened");
        Ok(ListenKeyLease {
            key: listen_key,
            keepalive,
        })
    }

    /// Delete the listen key, if one is open.
    async fn close(&self) {
        let Some(lease) = self.lease.lock().await.take() else {
            return;
        };
        lease.keepalive.abort();
        let spec = RequestSpec::delete(self.path)
            .query("listenKey", lease.key)
            .signed();
        if let Err(err) = self.gateway.call(spec).await {
            warn!(error = %err, "failed to close listen key");
        }
    }
}

#[async_trait]
impl StreamEndpoint for UserDataStream {
    async fn resolve(&self, renew: bool) -> Result<String, NormalizedError> {
        let mut lease = self.lease.lock().await;
        match lease.as_ref() {
            Some(current) if !renew => return Ok(format!("{}/{}", self.base, current.key)),
            Some(_) => info!(account = %self.account_id, "listen key expired, issuing a new one"),
            None => {}
        }

        // An expired key cannot be deleted, only abandoned.
        if let Some(stale) = lease.take() {
            stale.keepalive.abort();
        }
        let fresh = self.issue().await?;
        let url = format!("{}/{}", self.base, fresh.key);
        *lease = Some(fresh);
        Ok(url)
    }
}

impl Drop for UserDataStream {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.get_mut().take() {
            lease.keepalive.abort();
        }
    }
}

/// Binance spot (`/api/v3`) or USDⓈ-M futures (`/fapi`) account.
pub struct BinanceClient {
    config: AccountConfig,
    endpoints: Endpoints,
    gateway: Arc<RestGateway>,
    codec: Arc<BinanceCodec>,
    streams: StreamHub,
    cache: Option<Arc<dyn ResponseCache>>,
    user_stream: Arc<UserDataStream>,
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("account_id", &self.config.account_id)
            .field("market", &self.config.market)
            .finish_non_exhaustive()
    }
}

impl BinanceClient {
    /// Client over reqwest and tungstenite.
    pub fn new(config: &AccountConfig) -> Result<Self, ExchangeError> {
        let endpoints = Endpoints::for_market(config.market, config.credentials.testnet);
        let http = RestClientBuilder::new(RestClientConfig::for_account(config, endpoints.rest)).build()?;
        Ok(Self::with_transports(
            config,
            Arc::new(http),
            Arc::new(TungsteniteConnector),
        ))
    }

    /// Client over caller-supplied transports.
    pub fn with_transports(
        config: &AccountConfig,
        http: Arc<dyn HttpTransport>,
        connector: Arc<dyn WsConnector>,
    ) -> Self {
        let endpoints = Endpoints::for_market(config.market, config.credentials.testnet);
        let (buckets, costs) = match config.market {
            MarketKind::Spot => (limits::spot_buckets(), limits::spot_cost as CostTable),
            MarketKind::Perpetual => (limits::perp_buckets(), limits::perp_cost as CostTable),
        };
        let gateway = RestGateway::from_account(
            config,
            Arc::new(BinanceSigner::default()),
            http,
            Arc::new(BinanceErrors),
            buckets,
            costs,
        );
        let name = format!("{}/{}", ExchangeKind::Binance, config.account_id);
        let gateway = Arc::new(gateway);
        let user_stream = UserDataStream {
            gateway: Arc::clone(&gateway),
            path: endpoints.listen_key,
            base: config
                .ws_private_url
                .clone()
                .unwrap_or_else(|| endpoints.ws_private.to_string()),
            account_id: config.account_id.clone(),
            has_credentials: config.credentials.has_credentials(),
            lease: Mutex::new(None),
        };

        Self {
            config: config.clone(),
            endpoints,
            gateway,
            codec: Arc::new(BinanceCodec::new(config.market)),
            streams: StreamHub::new(name, connector, config.stream.clone()),
            cache: None,
            user_stream: Arc::new(user_stream),
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

    fn public_url(&self) -> String {
        self.config
            .ws_public_url
            .clone()
            .unwrap_or_else(|| self.endpoints.ws_public.to_string())
    }
}

#[async_trait]
impl AccountInfo for BinanceClient {
    #[instrument(skip(self), fields(exchange = "binance", account = %self.config.account_id))]
    async fn get_account(&self) -> Result<AccountSnapshot, NormalizedError> {
        let raw = self
            .gateway
            .call_idempotent(RequestSpec::get(self.endpoints.account).signed())
            .await?;
        let balances = match self.config.market {
            MarketKind::Spot => converters::spot_balances(
                serde_json::from_value::<BinanceAccountInfo>(raw.clone()).map_err(ExchangeError::from)?,
            ),
            MarketKind::Perpetual => converters::futures_balances(
                serde_json::from_value::<BinanceFuturesAccount>(raw.clone())
                    .map_err(ExchangeError::from)?,
            ),
        };
        Ok(AccountSnapshot {
            exchange: ExchangeKind::Binance,
            balances,
            raw,
        })
    }
}

#[async_trait]
impl OrderPlacer for BinanceClient {
    #[instrument(skip(self, order), fields(exchange = "binance", account = %self.config.account_id, symbol = %order.symbol))]
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, NormalizedError> {
        order.validate().map_err(NormalizedError::invalid_param)?;
        let spec = converters::order_params(RequestSpec::post(self.endpoints.order), &order).signed();
        let raw = self.gateway.call(spec).await?;
        let response: BinanceOrderResponse =
            serde_json::from_value(raw.clone()).map_err(ExchangeError::from)?;
        Ok(converters::order_ack(response, raw))
    }

    #[instrument(skip(self), fields(exchange = "binance", account = %self.config.account_id))]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, NormalizedError> {
        if symbol.is_empty() || order_id.is_empty() {
            return Err(NormalizedError::invalid_param("symbol and order_id are required"));
        }
        let spec = RequestSpec::delete(self.endpoints.order)
            .query("symbol", symbol)
            .query("orderId", order_id)
            .signed();
        let raw = self.gateway.call(spec).await?;
        let response: BinanceOrderResponse =
            serde_json::from_value(raw.clone()).map_err(ExchangeError::from)?;
        Ok(converters::order_ack(response, raw))
    }

    #[instrument(skip(self), fields(exchange = "binance", account = %self.config.account_id))]
    async fn get_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderAck, NormalizedError> {
        if symbol.is_empty() || order.is_empty() {
            return Err(NormalizedError::invalid_param("symbol and order are required"));
        }
        let spec = RequestSpec::get(self.endpoints.order).query("symbol", symbol);
        let spec = match order {
            OrderRef::Id(id) => spec.query("orderId", id.as_str()),
            OrderRef::Client(id) => spec.query("origClientOrderId", id.as_str()),
        };
        let raw = self.gateway.call_idempotent(spec.signed()).await?;
        let response: BinanceOrderResponse =
            serde_json::from_value(raw.clone()).map_err(ExchangeError::from)?;
        Ok(converters::order_ack(response, raw))
    }

    #[instrument(skip(self), fields(exchange = "binance", account = %self.config.account_id))]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderAck>, NormalizedError> {
        if symbol.is_empty() {
            return Err(NormalizedError::invalid_param("symbol is required"));
        }
        let spec = RequestSpec::get(self.endpoints.open_orders)
            .query("symbol", symbol)
            .signed();
        let raw = self.gateway.call_idempotent(spec).await?;
        Ok(converters::order_acks(raw).map_err(ExchangeError::from)?)
    }

    #[instrument(skip(self), fields(exchange = "binance", account = %self.config.account_id))]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<Vec<OrderAck>, NormalizedError> {
        if symbol.is_empty() {
            return Err(NormalizedError::invalid_param("symbol is required"));
        }
        let spec = RequestSpec::delete(self.endpoints.cancel_all)
            .query("symbol", symbol)
            .signed();
        let raw = self.gateway.call(spec).await?;
        Ok(converters::order_acks(raw).map_err(ExchangeError::from)?)
    }
}

#[async_trait]
impl MarketData for BinanceClient {
    #[instrument(skip(self), fields(exchange = "binance"))]
    async fn get_instruments(&self) -> Result<Vec<Instrument>, NormalizedError> {
        let key = format!("binance:{:?}:instruments", self.config.market).to_lowercase();
        let raw = memoize(self.cache.as_deref(), &key, INSTRUMENTS_TTL, || {
            self.gateway
                .call_idempotent(RequestSpec::get(self.endpoints.exchange_info))
        })
        .await?;
        let info: BinanceExchangeInfo = serde_json::from_value(raw).map_err(ExchangeError::from)?;
        Ok(info.symbols.into_iter().map(converters::instrument).collect())
    }
}

#[async_trait]
impl MarketStreams for BinanceClient {
    #[instrument(skip(self, handler), fields(exchange = "binance", account = %self.config.account_id))]
    async fn subscribe(
        &self,
        channel: Channel,
        symbol: Option<&str>,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<SubscriptionHandle, NormalizedError> {
        let key = SessionKey::for_channel(&channel);
        let codec = self.codec.clone();
        match key {
            SessionKey::Public => {
                self.streams
                    .subscribe(key, codec, Arc::new(self.public_url()), channel, symbol, handler)
                    .await
            }
            SessionKey::Private => {
                let endpoint: Arc<dyn StreamEndpoint> = self.user_stream.clone();
                self.streams
                    .subscribe(key, codec, endpoint, channel, symbol, handler)
                    .await
            }
        }
    }

    async fn unsubscribe(&self, channel: Channel, symbol: Option<&str>) -> Result<(), NormalizedError> {
        self.streams.unsubscribe(&channel, symbol).await
    }

    async fn unsubscribe_all(&self) {
        self.streams.close_all().await;
        self.user_stream.close().await;
    }

    fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.streams.notices()
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Binance
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

