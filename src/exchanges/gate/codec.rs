use crate::core::config::Credentials;
use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::{ControlFrame, DataFrame, Decoded, SequenceRange, StreamCodec};
use crate::core::kernel::signer::current_timestamp_ms;
use crate::core::types::{Channel, MarketKind};
use crate::exchanges::gate::signer::ws_auth_signature;
use nonzero_ext::nonzero;
use serde_json::{json, Map, Value};
use std::num::NonZeroU32;
use tokio_tungstenite::tungstenite::Message;

/// Error code Gate uses for failed channel authentication.
const AUTH_FAILED_CODE: i64 = 4;

/// Gate.io APIv4 stream framing.
///
/// Topics are `<channel>.<key>`, e.g. `spot.trades.BTC_USDT` or
/// `spot.candlesticks.1m_BTC_USDT`. Private channels are account-wide and use the
/// channel name alone; each of their requests carries its own `auth` block.
#[derive(Debug)]
pub struct GateCodec {
    market: MarketKind,
    credentials: Option<Credentials>,
}

impl GateCodec {
    pub fn new(market: MarketKind, credentials: Option<Credentials>) -> Self {
        Self {
            market,
            credentials: credentials.filter(Credentials::has_credentials),
        }
    }

    const fn prefix(&self) -> &'static str {
        match self.market {
            MarketKind::Spot => "spot",
            MarketKind::Perpetual => "futures",
        }
    }

    fn is_private(channel: &str) -> bool {
        channel.ends_with(".orders") || channel.ends_with(".balances")
    }

    /// Split a topic into channel name and routing key.
    fn split(topic: &str) -> (&str, Option<&str>) {
        let mut parts = topic.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(prefix), Some(name), key) => (&topic[..prefix.len() + 1 + name.len()], key),
            _ => (topic, None),
        }
    }

    fn payload(channel: &str, key: Option<&str>) -> Vec<Value> {
        let key = key.unwrap_or_default();
        if channel.ends_with(".order_book_update") {
            vec![json!(key), json!("100ms")]
        } else if channel.ends_with(".candlesticks") {
            match key.split_once('_') {
                Some((interval, symbol)) => vec![json!(interval), json!(symbol)],
                None => vec![json!(key)],
            }
        } else if channel.ends_with(".orders") {
            vec![json!("!all")]
        } else if channel.ends_with(".balances") {
            Vec::new()
        } else {
            vec![json!(key)]
        }
    }

    fn request(&self, event: &str, topic: &str, time: u64) -> Result<Message, ExchangeError> {
        let (channel, key) = Self::split(topic);
        let mut frame = Map::new();
        frame.insert("time".into(), json!(time));
        frame.insert("channel".into(), json!(channel));
        frame.insert("event".into(), json!(event));
        frame.insert("payload".into(), Value::Array(Self::payload(channel, key)));

        if Self::is_private(channel) {
            let credentials = self.credentials.as_ref().ok_or_else(|| {
                ExchangeError::InvalidCredentials(format!("{} requires API credentials", channel))
            })?;
            let signature = ws_auth_signature(credentials, channel, event, time)?;
            frame.insert(
                "auth".into(),
                json!({ "method": "api_key", "KEY": credentials.api_key(), "SIGN": signature }),
            );
        }
        Ok(Message::Text(Value::Object(frame).to_string()))
    }

    fn requests(&self, event: &str, topics: &[String]) -> Result<Vec<Message>, ExchangeError> {
        let time = current_timestamp_ms()? / 1000;
        topics
            .iter()
            .map(|topic| self.request(event, topic, time))
            .collect()
    }

    /// Routing key of an update: pair, contract or candle name of the first item.
    fn routing_key(result: &Value) -> Option<&str> {
        let item = match result {
            Value::Array(items) => items.first()?,
            other => other,
        };
        ["currency_pair", "contract", "s", "n"]
            .iter()
            .find_map(|field| item.get(*field).and_then(Value::as_str))
    }
}

impl StreamCodec for GateCodec {
    fn topic(&self, channel: &Channel, symbol: Option<&str>) -> Result<String, ExchangeError> {
        let prefix = self.prefix();
        let symbol = || {
            symbol
                .filter(|s| !s.is_empty())
                .map(str::to_uppercase)
                .ok_or_else(|| ExchangeError::InvalidParameters(format!("{} requires a symbol", channel)))
        };

        Ok(match channel {
            Channel::Orders | Channel::Balances if self.market == MarketKind::Perpetual => {
                return Err(ExchangeError::InvalidParameters(
                    "Gate futures private channels are not supported".to_string(),
                ));
            }
            Channel::Orders => format!("{}.orders", prefix),
            Channel::Balances => format!("{}.balances", prefix),
            Channel::Ticker => format!("{}.tickers.{}", prefix, symbol()?),
            Channel::Trades => format!("{}.trades.{}", prefix, symbol()?),
            Channel::OrderBook { .. } => format!("{}.order_book_update.{}", prefix, symbol()?),
            Channel::Klines { interval } => format!("{}.candlesticks.{}_{}", prefix, interval, symbol()?),
        })
    }

    fn symbol_of(&self, topic: &str) -> Option<String> {
        let (channel, key) = Self::split(topic);
        let key = key?;
        if channel.ends_with(".candlesticks") {
            key.split_once('_').map(|(_, symbol)| symbol.to_string())
        } else {
            Some(key.to_string())
        }
    }

    fn encode_subscribe(&self, topics: &[String]) -> Result<Vec<Message>, ExchangeError> {
        self.requests("subscribe", topics)
    }

    fn encode_unsubscribe(&self, topics: &[String]) -> Result<Vec<Message>, ExchangeError> {
        self.requests("unsubscribe", topics)
    }

    fn encode_auth(&self, _timestamp_ms: u64) -> Result<Option<Message>, ExchangeError> {
        // Authentication rides on each private subscribe request.
        Ok(None)
    }

    fn encode_ping(&self, timestamp_ms: u64) -> Message {
        Message::Text(
            json!({ "time": timestamp_ms / 1000, "channel": format!("{}.ping", self.prefix()) })
                .to_string(),
        )
    }

    fn decode(&self, text: &str) -> Result<Decoded, ExchangeError> {
        let value: Value = serde_json::from_str(text)?;
        let channel = value.get("channel").and_then(Value::as_str).unwrap_or_default();
        if channel.ends_with(".pong") {
            return Ok(Decoded::Control(ControlFrame::Pong));
        }

        match value.get("event").and_then(Value::as_str) {
            Some("subscribe" | "unsubscribe") => {
                let frame = match value.get("error").filter(|e| !e.is_null()) {
                    None => ControlFrame::SubscribeAck,
                    Some(error) => {
                        let message = error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        if error.get("code").and_then(Value::as_i64) == Some(AUTH_FAILED_CODE) {
                            ControlFrame::AuthFailed(message)
                        } else {
                            ControlFrame::Error(message)
                        }
                    }
                };
                Ok(Decoded::Control(frame))
            }
            Some("update" | "all") => {
                let result = value.get("result").cloned().unwrap_or(Value::Null);
                let topic = if Self::is_private(channel) {
                    channel.to_string()
                } else {
                    let key = Self::routing_key(&result).ok_or_else(|| {
                        ExchangeError::DeserializationError(format!("no routing key in {} update", channel))
                    })?;
                    format!("{}.{}", channel, key)
                };
                let sequence = if channel.ends_with(".order_book_update") {
                    match (
                        result.get("U").and_then(Value::as_u64),
                        result.get("u").and_then(Value::as_u64),
                    ) {
                        (Some(first), Some(last)) => Some(SequenceRange {
                            first,
                            last,
                            reset: false,
                        }),
                        _ => None,
                    }
                } else {
                    None
                };
                Ok(Decoded::Data(DataFrame {
                    topic,
                    payload: value,
                    sequence,
                }))
            }
            _ => Ok(Decoded::Ignore),
        }
    }

    fn frames_per_second(&self) -> NonZeroU32 {
        nonzero!(10u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(message: &Message) -> Value {
        let Message::Text(text) = message else { panic!("expected text frame") };
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_topics_and_symbols() {
        let codec = GateCodec::new(MarketKind::Spot, None);
        let kline = codec
            .topic(&Channel::Klines { interval: "1m".into() }, Some("btc_usdt"))
            .unwrap();
        assert_eq!(kline, "spot.candlesticks.1m_BTC_USDT");
        assert_eq!(codec.symbol_of(&kline).as_deref(), Some("BTC_USDT"));
        assert_eq!(codec.topic(&Channel::Orders, None).unwrap(), "spot.orders");
        assert_eq!(codec.symbol_of("spot.orders"), None);

        let perp = GateCodec::new(MarketKind::Perpetual, None);
        assert_eq!(
            perp.topic(&Channel::OrderBook { depth: 20 }, Some("BTC_USDT")).unwrap(),
            "futures.order_book_update.BTC_USDT"
        );
        assert!(perp.topic(&Channel::Orders, None).is_err());
    }

    #[test]
    fn test_subscribe_payloads() {
        let codec = GateCodec::new(MarketKind::Spot, None);
        let frames = codec
            .encode_subscribe(&[
                "spot.order_book_update.BTC_USDT".to_string(),
                "spot.candlesticks.1m_ETH_USDT".to_string(),
            ])
            .unwrap();
        assert_eq!(frames.len(), 2);
        let book = text(&frames[0]);
        assert_eq!(book["channel"], "spot.order_book_update");
        assert_eq!(book["payload"], json!(["BTC_USDT", "100ms"]));
        assert!(book.get("auth").is_none());
        assert_eq!(text(&frames[1])["payload"], json!(["1m", "ETH_USDT"]));
    }

    #[test]
    fn test_private_subscribe_is_signed() {
        let credentials = Credentials::new("gate-key".into(), "gate-secret".into());
        let codec = GateCodec::new(MarketKind::Spot, Some(credentials.clone()));
        let frames = codec.encode_subscribe(&["spot.orders".to_string()]).unwrap();
        let frame = text(&frames[0]);
        let time = frame["time"].as_u64().unwrap();
        assert_eq!(frame["payload"], json!(["!all"]));
        assert_eq!(frame["auth"]["KEY"], "gate-key");
        assert_eq!(
            frame["auth"]["SIGN"],
            ws_auth_signature(&credentials, "spot.orders", "subscribe", time).unwrap()
        );

        let anonymous = GateCodec::new(MarketKind::Spot, None);
        assert!(anonymous.encode_subscribe(&["spot.orders".to_string()]).is_err());
    }

    #[test]
    fn test_decode_updates() {
        let codec = GateCodec::new(MarketKind::Spot, None);
        let Decoded::Data(frame) = codec
            .decode(r#"{"time":1,"channel":"spot.order_book_update","event":"update","result":{"s":"BTC_USDT","U":48776301,"u":48776306,"b":[],"a":[]}}"#)
            .unwrap()
        else {
            panic!("expected data")
        };
        assert_eq!(frame.topic, "spot.order_book_update.BTC_USDT");
        assert_eq!(
            frame.sequence,
            Some(SequenceRange { first: 48_776_301, last: 48_776_306, reset: false })
        );

        let Decoded::Data(frame) = codec
            .decode(r#"{"time":1,"channel":"spot.orders","event":"update","result":[{"currency_pair":"BTC_USDT"}]}"#)
            .unwrap()
        else {
            panic!("expected data")
        };
        assert_eq!(frame.topic, "spot.orders");
    }

    #[test]
    fn test_decode_control_frames() {
        let codec = GateCodec::new(MarketKind::Spot, None);
        assert_eq!(
            codec.decode(r#"{"time":1,"channel":"spot.pong","event":"","result":null}"#).unwrap(),
            Decoded::Control(ControlFrame::Pong)
        );
        assert_eq!(
            codec
                .decode(r#"{"time":1,"channel":"spot.orders","event":"subscribe","error":{"code":4,"message":"invalid key"},"result":null}"#)
                .unwrap(),
            Decoded::Control(ControlFrame::AuthFailed("invalid key".into()))
        );
        assert_eq!(
            codec
                .decode(r#"{"time":1,"channel":"spot.trades","event":"subscribe","error":null,"result":{"status":"success"}}"#)
                .unwrap(),
            Decoded::Control(ControlFrame::SubscribeAck)
        );
    }
}
