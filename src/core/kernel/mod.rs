/// exlink kernel - exchange-agnostic transport layer
///
/// The kernel contains no exchange-specific logic. Exchanges plug in through
/// three seams: a [`Signer`] for request authentication, an [`ErrorClassifier`]
/// for their error envelopes, and a [`StreamCodec`] for WebSocket framing.
///
/// # Architecture
///
/// ## REST
/// - `RateLimiter`: weighted token buckets per endpoint class
/// - `Signer`: pluggable authentication
/// - `RestTransport`: one HTTP round trip, every outcome normalized
/// - `RestGateway`: limiter, signer and transport composed, with retries for idempotent calls
///
/// ## Streams
/// - `StreamSession`: connection state machine with heartbeat, reconnect and resubscribe
/// - `StreamHub`: a client's public and private sessions, opened lazily
/// - `WsConnector` / `WsTransport`: socket seam, replaced by scripted sockets in tests
/// - `FrameThrottle`: outbound frame limit on tokio time
///
/// # Example
/// ```rust,no_run
/// use exlink::core::config::Credentials;
/// use exlink::core::kernel::*;
/// use exlink::core::types::RequestSpec;
/// use exlink::exchanges::binance::{signer::BinanceSigner, errors::BinanceErrors, limits};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let http = RestClientBuilder::new(RestClientConfig::new(
///     "https://api.binance.com".to_string(),
///     "binance".to_string(),
/// ))
/// .build()?;
/// let gateway = RestGateway::new(
///     "binance/main",
///     Credentials::new("api_key".to_string(), "secret_key".to_string()),
///     Arc::new(BinanceSigner::default()),
///     RestTransport::new(Arc::new(http), Arc::new(BinanceErrors)),
///     RateLimiter::new("binance/main", &limits::spot_buckets()),
///     limits::spot_cost,
/// );
///
/// let account = gateway
///     .call_idempotent(RequestSpec::get("/api/v3/account").signed())
///     .await?;
/// println!("{account}");
/// # Ok(())
/// # }
/// ```
pub mod backoff;
pub mod codec;
pub mod gateway;
pub mod hub;
pub mod rate_limit;
pub mod rest;
pub mod session;
pub mod signer;
pub mod throttle;
pub mod ws;

// Re-export key types for convenience
pub use backoff::Backoff;
pub use codec::{ControlFrame, DataFrame, Decoded, SequenceRange, StreamCodec};
pub use gateway::{CostTable, EndpointCost, RestGateway};
pub use hub::{SessionKey, StreamHub};
pub use rate_limit::RateLimiter;
pub use rest::{
    status_error, ErrorClassifier, HttpResponse, HttpTransport, ReqwestTransport,
    RestClientBuilder, RestClientConfig, RestTransport,
};
pub use session::{
    check_sequence, SequenceCheck, StreamEndpoint, StreamSession, SubscriptionHandle,
};
pub use signer::{current_timestamp_ms, Ed25519Key, Signer};
pub use throttle::{FrameThrottle, TokioClock};
pub use ws::{TungsteniteConnector, WsConnector, WsTransport};
