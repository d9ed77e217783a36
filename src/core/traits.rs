use crate::core::{
    errors::NormalizedError,
    kernel::session::SubscriptionHandle,
    types::{
        AccountSnapshot, Channel, ExchangeKind, Instrument, MarketKind, OrderAck, OrderRef,
        OrderRequest, SessionEvent, SessionNotice,
    },
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[async_trait]
pub trait AccountInfo {
    /// Balances of the account. Retried on transient network failures.
    async fn get_account(&self) -> Result<AccountSnapshot, NormalizedError>;
}

#[async_trait]
pub trait OrderPlacer {
    /// Place a new order. Never retried automatically; retry with the same
    /// `client_order_id` to keep it idempotent.
    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, NormalizedError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, NormalizedError>;

    /// Current state of one order. Retried on network failure, which makes it the
    /// way to find out whether a placement with a lost response reached the book.
    async fn get_order(&self, symbol: &str, order: &OrderRef) -> Result<OrderAck, NormalizedError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderAck>, NormalizedError>;

    /// Cancel every open order on `symbol`. Never retried.
    ///
    /// Returns the orders the exchange reports as cancelled; empty when the exchange
    /// only acknowledges the request.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<Vec<OrderAck>, NormalizedError>;
}

#[async_trait]
pub trait MarketData {
    /// Get all available trading pairs
    async fn get_instruments(&self) -> Result<Vec<Instrument>, NormalizedError>;
}

#[async_trait]
pub trait MarketStreams {
    async fn subscribe(
        &self,
        channel: Channel,
        symbol: Option<&str>,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<SubscriptionHandle, NormalizedError>;

    /// Unsubscribing from something not subscribed is a no-op.
    async fn unsubscribe(&self, channel: Channel, symbol: Option<&str>)
        -> Result<(), NormalizedError>;

    /// Close every stream session of this client.
    async fn unsubscribe_all(&self);

    /// Structured connection notices for an external notifier.
    fn notices(&self) -> broadcast::Receiver<SessionNotice>;
}

/// Uniform capability set every exchange implements.
#[async_trait]
pub trait ExchangeClient:
    AccountInfo + OrderPlacer + MarketData + MarketStreams + Send + Sync
{
    fn exchange(&self) -> ExchangeKind;

    fn market(&self) -> MarketKind;

    fn account_id(&self) -> &str;

    /// Close streams, cancel in-flight REST calls and rate-limit waiters.
    async fn shutdown(&self);
}

/// Receives events for one subscription. Runs on the subscription's dispatcher
/// task, so a slow handler never stalls the socket read loop.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_event(&self, event: SessionEvent);
}

impl<F> StreamHandler for F
where
    F: Fn(SessionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: SessionEvent) {
        self(event);
    }
}

/// Optional key-value memoization for REST responses. Failures degrade to a miss.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value, ttl: Duration);
}
