use crate::core::config::Credentials;
use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::{ControlFrame, DataFrame, Decoded, SequenceRange, StreamCodec};
use crate::core::types::{Channel, MarketKind};
use crate::exchanges::bybit::signer::ws_auth_signature;
use nonzero_ext::nonzero;
use serde::Serialize;
use serde_json::Value;
use std::num::NonZeroU32;
use tokio_tungstenite::tungstenite::Message;

/// Spot connections accept at most 10 args per subscribe request.
const MAX_ARGS_PER_REQUEST: usize = 10;
/// Lifetime of the `op=auth` signature.
const AUTH_EXPIRY_MS: u64 = 10_000;
const PRIVATE_TOPICS: [&str; 4] = ["order", "wallet", "execution", "position"];

#[derive(Debug, Serialize)]
struct BybitRequest<'a> {
    op: &'a str,
    args: Vec<Value>,
}

impl BybitRequest<'_> {
    fn into_message(self) -> Result<Message, ExchangeError> {
        serde_json::to_string(&self)
            .map(Message::Text)
            .map_err(|e| ExchangeError::SerializationError(e.to_string()))
    }
}

/// Bybit V5 stream framing. Public sessions carry no credentials; the private
/// session authenticates with `op=auth` right after connecting.
#[derive(Debug)]
pub struct BybitCodec {
    market: MarketKind,
    credentials: Option<Credentials>,
}

impl BybitCodec {
    pub fn public(market: MarketKind) -> Self {
        Self {
            market,
            credentials: None,
        }
    }

    pub fn private(market: MarketKind, credentials: Credentials) -> Self {
        Self {
            market,
            credentials: Some(credentials),
        }
    }

    fn book_depth(&self, depth: u32) -> u32 {
        let supported: &[u32] = match self.market {
            MarketKind::Spot => &[1, 50, 200],
            MarketKind::Perpetual => &[1, 50, 200, 500],
        };
        supported
            .iter()
            .copied()
            .find(|d| *d >= depth)
            .or_else(|| supported.last().copied())
            .unwrap_or(depth)
    }

    fn requests(&self, op: &str, topics: &[String]) -> Result<Vec<Message>, ExchangeError> {
        topics
            .chunks(MAX_ARGS_PER_REQUEST)
            .map(|chunk| {
                BybitRequest {
                    op,
                    args: chunk.iter().cloned().map(Value::String).collect(),
                }
                .into_message()
            })
            .collect()
    }

    /// Private pushes may come as `order.spot` for an `order` subscription.
    fn route(topic: &str) -> &str {
        let head = topic.split('.').next().unwrap_or(topic);
        if PRIVATE_TOPICS.contains(&head) {
            head
        } else {
            topic
        }
    }
}

/// Kline intervals in Bybit notation: minutes, or `D`/`W`/`M`.
pub fn kline_interval(interval: &str) -> String {
    match interval {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "2h" => "120",
        "4h" => "240",
        "6h" => "360",
        "12h" => "720",
        "1d" => "D",
        "1w" => "W",
        "1M" => "M",
        other => other,
    }
    .to_string()
}

impl StreamCodec for BybitCodec {
    fn topic(&self, channel: &Channel, symbol: Option<&str>) -> Result<String, ExchangeError> {
        let symbol = || {
            symbol
                .filter(|s| !s.is_empty())
                .map(str::to_uppercase)
                .ok_or_else(|| ExchangeError::InvalidParameters(format!("{} requires a symbol", channel)))
        };

        Ok(match channel {
            Channel::Orders => "order".to_string(),
            Channel::Balances => "wallet".to_string(),
            Channel::Ticker => format!("tickers.{}", symbol()?),
            Channel::Trades => format!("publicTrade.{}", symbol()?),
            Channel::OrderBook { depth } => format!("orderbook.{}.{}", self.book_depth(*depth), symbol()?),
            Channel::Klines { interval } => format!("kline.{}.{}", kline_interval(interval), symbol()?),
        })
    }

    fn symbol_of(&self, topic: &str) -> Option<String> {
        topic
            .rsplit_once('.')
            .map(|(_, symbol)| symbol.to_string())
            .filter(|_| !PRIVATE_TOPICS.contains(&Self::route(topic)))
    }

    fn encode_subscribe(&self, topics: &[String]) -> Result<Vec<Message>, ExchangeError> {
        self.requests("subscribe", topics)
    }

    fn encode_unsubscribe(&self, topics: &[String]) -> Result<Vec<Message>, ExchangeError> {
        self.requests("unsubscribe", topics)
    }

    fn encode_auth(&self, timestamp_ms: u64) -> Result<Option<Message>, ExchangeError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        let expires = timestamp_ms + AUTH_EXPIRY_MS;
        let signature = ws_auth_signature(credentials, expires)?;
        BybitRequest {
            op: "auth",
            args: vec![
                Value::String(credentials.api_key().to_string()),
                Value::from(expires),
                Value::String(signature),
            ],
        }
        .into_message()
        .map(Some)
    }

    fn encode_ping(&self, _timestamp_ms: u64) -> Message {
        Message::Text(r#"{"op":"ping"}"#.to_string())
    }

    fn decode(&self, text: &str) -> Result<Decoded, ExchangeError> {
        let value: Value = serde_json::from_str(text)?;

        if let Some(topic) = value.get("topic").and_then(Value::as_str) {
            let data = value.get("data");
            let sequence = if topic.starts_with("orderbook.") {
                data.and_then(|d| d.get("u")).and_then(Value::as_u64).map(|u| {
                    // u == 1 also marks a snapshot after a service restart
                    if value.get("type").and_then(Value::as_str) == Some("snapshot") || u == 1 {
                        SequenceRange::snapshot(u)
                    } else {
                        SequenceRange::single(u)
                    }
                })
            } else {
                None
            };
            return Ok(Decoded::Data(DataFrame {
                topic: Self::route(topic).to_string(),
                payload: value.clone(),
                sequence,
            }));
        }

        let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
        let message = || {
            value
                .get("ret_msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let frame = match value.get("op").and_then(Value::as_str) {
            Some("ping" | "pong") => ControlFrame::Pong,
            Some("auth") if success => ControlFrame::AuthOk,
            Some("auth") => ControlFrame::AuthFailed(message()),
            Some("subscribe" | "unsubscribe") if success => ControlFrame::SubscribeAck,
            Some("subscribe" | "unsubscribe") => ControlFrame::Error(message()),
            _ => return Ok(Decoded::Ignore),
        };
        Ok(Decoded::Control(frame))
    }

    fn frames_per_second(&self) -> NonZeroU32 {
        nonzero!(10u32)
    }
}
