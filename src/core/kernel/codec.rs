use crate::core::errors::ExchangeError;
use crate::core::types::Channel;
use serde_json::Value;
use std::num::NonZeroU32;
use tokio_tungstenite::tungstenite::Message;

/// Sequence numbers carried by one frame: the first and last update ids it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub first: u64,
    pub last: u64,
    /// Snapshot frame: restart tracking from `last`.
    pub reset: bool,
}

impl SequenceRange {
    pub const fn single(id: u64) -> Self {
        Self {
            first: id,
            last: id,
            reset: false,
        }
    }

    pub const fn snapshot(id: u64) -> Self {
        Self {
            first: id,
            last: id,
            reset: true,
        }
    }
}

/// A data frame routed to a subscription by topic.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub topic: String,
    pub payload: Value,
    pub sequence: Option<SequenceRange>,
}

/// Protocol frames the session reacts to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    AuthOk,
    AuthFailed(String),
    SubscribeAck,
    Pong,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Data(DataFrame),
    Control(ControlFrame),
    Ignore,
}

/// Exchange-specific stream framing
///
/// Converts logical channels to topics, builds subscribe/auth/ping frames and
/// decodes inbound text frames. Implementations are stateless apart from the
/// credentials they may carry for private streams.
pub trait StreamCodec: Send + Sync + 'static {
    /// Routing key for a channel, e.g. `btcusdt@trade`.
    fn topic(&self, channel: &Channel, symbol: Option<&str>) -> Result<String, ExchangeError>;

    /// Reverse of [`StreamCodec::topic`] for events delivered to handlers.
    fn symbol_of(&self, topic: &str) -> Option<String>;

    fn encode_subscribe(&self, topics: &[String]) -> Result<Vec<Message>, ExchangeError>;

    fn encode_unsubscribe(&self, topics: &[String]) -> Result<Vec<Message>, ExchangeError>;

    /// Login frame sent after connecting. `None` skips authentication.
    fn encode_auth(&self, timestamp_ms: u64) -> Result<Option<Message>, ExchangeError>;

    /// Application or protocol level heartbeat.
    fn encode_ping(&self, timestamp_ms: u64) -> Message;

    /// Decode one text frame. Control frames (ping, pong, close) at the
    /// WebSocket level are handled by the session.
    fn decode(&self, text: &str) -> Result<Decoded, ExchangeError>;

    /// Outbound frame budget accepted by the exchange.
    fn frames_per_second(&self) -> NonZeroU32;
}
