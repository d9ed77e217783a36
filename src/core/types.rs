use chrono::{DateTime, Utc};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Bybit,
    Gate,
}

impl ExchangeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Gate => "gate",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spot or USDT-margined perpetual market of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    #[default]
    Spot,
    Perpetual,
}

/// One outbound REST call, before signing.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    /// Ordered query parameters. Order is preserved into the signed query string.
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub requires_auth: bool,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            requires_auth: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn query_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.query(key, v),
            None => self,
        }
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn signed(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    /// `k=v&k=v` form-encoded in insertion order.
    pub fn encoded_query(&self) -> String {
        encode_pairs(&self.query)
    }
}

pub(crate) fn encode_pairs(pairs: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}

/// A request ready for the wire. The query string and body are sent byte-for-byte as signed.
#[derive(Clone)]
pub struct SignedRequest {
    pub spec: RequestSpec,
    pub timestamp: u64,
    pub signature: Option<String>,
    pub headers: Vec<(String, String)>,
    pub query_string: String,
    pub body: Option<String>,
}

impl SignedRequest {
    /// Wrap a public request that needs no signature.
    pub fn unsigned(spec: RequestSpec) -> Result<Self, serde_json::Error> {
        let query_string = spec.encoded_query();
        let body = spec.body.as_ref().map(serde_json::to_string).transpose()?;
        Ok(Self {
            spec,
            timestamp: 0,
            signature: None,
            headers: Vec::new(),
            query_string,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for SignedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedRequest")
            .field("method", &self.spec.method)
            .field("path", &self.spec.path)
            .field("timestamp", &self.timestamp)
            .field("signed", &self.signature.is_some())
            .field(
                "headers",
                &self.headers.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Logical stream channels. Exchanges map these onto their own topic names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Ticker,
    Trades,
    OrderBook { depth: u32 },
    Klines { interval: String },
    Orders,
    Balances,
}

impl Channel {
    pub const fn is_private(&self) -> bool {
        matches!(self, Self::Orders | Self::Balances)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticker => f.write_str("ticker"),
            Self::Trades => f.write_str("trades"),
            Self::OrderBook { depth } => write!(f, "orderbook{}", depth),
            Self::Klines { interval } => write!(f, "klines_{}", interval),
            Self::Orders => f.write_str("orders"),
            Self::Balances => f.write_str("balances"),
        }
    }
}

/// An active subscription held by a stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSubscription {
    pub channel: Channel,
    pub symbol: Option<String>,
    /// Exchange routing key for inbound frames, e.g. `btcusdt@trade`.
    pub topic: String,
    pub last_sequence_id: Option<u64>,
}

impl StreamSubscription {
    pub fn new(channel: Channel, symbol: Option<String>, topic: impl Into<String>) -> Self {
        Self {
            channel,
            symbol,
            topic: topic.into(),
            last_sequence_id: None,
        }
    }

    pub fn channel_name(&self) -> String {
        self.channel.to_string()
    }
}

/// A normalized inbound stream message.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub channel: Channel,
    pub symbol: Option<String>,
    pub topic: String,
    pub payload: Value,
    pub sequence: Option<u64>,
    pub received_at: DateTime<Utc>,
}

/// Detected hole in a sequenced stream. The caller should resync from a REST snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceGap {
    pub topic: String,
    pub expected: u64,
    pub received: u64,
}

/// What a subscription handler receives.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Data(StreamEvent),
    Gap(SequenceGap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    /// Heartbeat missed, reconnect not yet triggered.
    Degraded,
    Closing,
}

impl ConnectionState {
    /// States in which events flow to handlers.
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Subscribed | Self::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Subscribed => "SUBSCRIBED",
            Self::Degraded => "DEGRADED",
            Self::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Structured notifications for an external notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    ConnectionStateChanged {
        session: String,
        from: ConnectionState,
        to: ConnectionState,
    },
    FatalAuthFailure {
        session: String,
        reason: String,
    },
    SequenceGap {
        session: String,
        gap: SequenceGap,
    },
    /// The reconnect budget ran out; the session is terminal.
    ReconnectExhausted {
        session: String,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GTC, // Good Till Canceled
    IOC, // Immediate or Cancel
    FOK, // Fill or Kill
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    /// Idempotency key forwarded to the exchange when supported.
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: Some(TimeInForce::GTC),
            client_order_id: None,
        }
    }

    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            client_order_id: None,
        }
    }

    #[must_use]
    pub fn client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }

    /// Reject malformed calls before any I/O.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol must not be empty".to_string());
        }
        if self.quantity <= Decimal::ZERO {
            return Err(format!("quantity must be positive, got {}", self.quantity));
        }
        match (self.order_type, self.price) {
            (OrderType::Limit, None) => Err("limit order requires a price".to_string()),
            (OrderType::Limit, Some(p)) if p <= Decimal::ZERO => {
                Err(format!("price must be positive, got {}", p))
            }
            _ => Ok(()),
        }
    }
}

/// Names one order for a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRef {
    /// Exchange-assigned id.
    Id(String),
    /// The `client_order_id` the order was placed with. This is the only handle a
    /// caller has when the placement response was lost.
    Client(String),
}

impl OrderRef {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::Client(id.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Id(id) | Self::Client(id) => id.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub status: String,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub exchange: ExchangeKind,
    pub balances: Vec<Balance>,
    pub raw: Value,
}

/// Tradable symbol metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub trading: bool,
}

pub mod conversion {
    use rust_decimal::Decimal;
    use serde_json::Value;
    use std::str::FromStr;

    /// Parse a decimal that exchanges send either as a string or a number. Bad input reads as zero.
    pub fn value_to_decimal(value: Option<&Value>) -> Decimal {
        match value {
            Some(Value::String(s)) if !s.is_empty() => Decimal::from_str(s).unwrap_or_default(),
            Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).unwrap_or_default(),
            _ => Decimal::ZERO,
        }
    }

    /// Read a field that may be a string or an integer as text.
    pub fn value_to_string(value: Option<&Value>) -> Option<String> {
        match value {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}
