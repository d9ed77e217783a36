use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::{ControlFrame, DataFrame, Decoded, SequenceRange, StreamCodec};
use crate::core::types::{Channel, MarketKind};
use nonzero_ext::nonzero;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_tungstenite::tungstenite::Message;

/// Depths served by the partial book streams.
const PARTIAL_DEPTHS: [u32; 3] = [5, 10, 20];

/// Combined-stream framing (`{"stream": ..., "data": ...}`) for market data and
/// raw user-data events on listen-key sockets.
#[derive(Debug)]
pub struct BinanceCodec {
    market: MarketKind,
    next_id: AtomicU64,
}

impl BinanceCodec {
    pub fn new(market: MarketKind) -> Self {
        Self {
            market,
            next_id: AtomicU64::new(1),
        }
    }

    /// User-data event types have no `@`; they arrive unrequested on the listen-key socket.
    fn is_user_data(topic: &str) -> bool {
        !topic.contains('@')
    }

    fn request(&self, method: &str, topics: &[String]) -> Vec<Message> {
        let params: Vec<&str> = topics
            .iter()
            .map(String::as_str)
            .filter(|topic| !Self::is_user_data(topic))
            .collect();
        if params.is_empty() {
            return Vec::new();
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        vec![Message::Text(
            json!({ "method": method, "params": params, "id": id }).to_string(),
        )]
    }

    fn sequence(&self, topic: &str, data: &Value) -> Option<SequenceRange> {
        if !topic.contains("@depth") || PARTIAL_DEPTHS.iter().any(|d| topic.contains(&format!("@depth{}", d))) {
            return None;
        }
        let last = data.get("u")?.as_u64()?;
        // Futures diffs chain through `pu`, spot diffs through `U`.
        let first = match data.get("pu").and_then(Value::as_u64) {
            Some(previous) => previous + 1,
            None => data.get("U")?.as_u64()?,
        };
        Some(SequenceRange {
            first,
            last,
            reset: false,
        })
    }
}

impl StreamCodec for BinanceCodec {
    fn topic(&self, channel: &Channel, symbol: Option<&str>) -> Result<String, ExchangeError> {
        let perp = self.market == MarketKind::Perpetual;
        let symbol = || {
            symbol
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .ok_or_else(|| ExchangeError::InvalidParameters(format!("{} requires a symbol", channel)))
        };

        Ok(match channel {
            Channel::Orders if perp => "ORDER_TRADE_UPDATE".to_string(),
            Channel::Orders => "executionReport".to_string(),
            Channel::Balances if perp => "ACCOUNT_UPDATE".to_string(),
            Channel::Balances => "outboundAccountPosition".to_string(),
            Channel::Ticker => format!("{}@ticker", symbol()?),
            Channel::Trades if perp => format!("{}@aggTrade", symbol()?),
            Channel::Trades => format!("{}@trade", symbol()?),
            Channel::OrderBook { depth } if PARTIAL_DEPTHS.contains(depth) => {
                format!("{}@depth{}@100ms", symbol()?, depth)
            }
            Channel::OrderBook { .. } => format!("{}@depth@100ms", symbol()?),
            Channel::Klines { interval } => format!("{}@kline_{}", symbol()?, interval),
        })
    }

    fn symbol_of(&self, topic: &str) -> Option<String> {
        topic
            .split_once('@')
            .map(|(symbol, _)| symbol.to_uppercase())
    }

    fn encode_subscribe(&self, topics: &[String]) -> Result<Vec<Message>, ExchangeError> {
        Ok(self.request("SUBSCRIBE", topics))
    }

    fn encode_unsubscribe(&self, topics: &[String]) -> Result<Vec<Message>, ExchangeError> {
        Ok(self.request("UNSUBSCRIBE", topics))
    }

    fn encode_auth(&self, _timestamp_ms: u64) -> Result<Option<Message>, ExchangeError> {
        // Listen keys authenticate through the URL.
        Ok(None)
    }

    fn encode_ping(&self, _timestamp_ms: u64) -> Message {
        Message::Ping(Vec::new())
    }

    fn decode(&self, text: &str) -> Result<Decoded, ExchangeError> {
        let value: Value = serde_json::from_str(text)?;

        if let Some(stream) = value.get("stream").and_then(Value::as_str) {
            let data = value.get("data").cloned().ok_or_else(|| {
                ExchangeError::DeserializationError("Missing data field in stream message".to_string())
            })?;
            return Ok(Decoded::Data(DataFrame {
                sequence: self.sequence(stream, &data),
                topic: stream.to_string(),
                payload: data,
            }));
        }

        if let Some(event) = value.get("e").and_then(Value::as_str) {
            if event == "listenKeyExpired" {
                return Ok(Decoded::Control(ControlFrame::AuthFailed("listen key expired".to_string())));
            }
            return Ok(Decoded::Data(DataFrame {
                topic: event.to_string(),
                payload: value.clone(),
                sequence: None,
            }));
        }

        if let Some(error) = value.get("error") {
            return Ok(Decoded::Control(ControlFrame::Error(error.to_string())));
        }
        if value.get("result").is_some() && value.get("id").is_some() {
            return Ok(Decoded::Control(ControlFrame::SubscribeAck));
        }
        Ok(Decoded::Ignore)
    }

    fn frames_per_second(&self) -> NonZeroU32 {
        match self.market {
            MarketKind::Spot => nonzero!(5u32),
            MarketKind::Perpetual => nonzero!(10u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        let spot = BinanceCodec::new(MarketKind::Spot);
        assert_eq!(spot.topic(&Channel::Trades, Some("BTCUSDT")).unwrap(), "btcusdt@trade");
        assert_eq!(
            spot.topic(&Channel::OrderBook { depth: 10 }, Some("BTCUSDT")).unwrap(),
            "btcusdt@depth10@100ms"
        );
        assert_eq!(
            spot.topic(&Channel::OrderBook { depth: 0 }, Some("BTCUSDT")).unwrap(),
            "btcusdt@depth@100ms"
        );
        assert_eq!(spot.topic(&Channel::Orders, None).unwrap(), "executionReport");
        assert!(spot.topic(&Channel::Ticker, None).is_err());

        let perp = BinanceCodec::new(MarketKind::Perpetual);
        assert_eq!(perp.topic(&Channel::Trades, Some("ETHUSDT")).unwrap(), "ethusdt@aggTrade");
        assert_eq!(perp.topic(&Channel::Balances, None).unwrap(), "ACCOUNT_UPDATE");
    }

    #[test]
    fn test_subscribe_skips_user_data_topics() {
        let codec = BinanceCodec::new(MarketKind::Spot);
        let frames = codec
            .encode_subscribe(&["btcusdt@trade".to_string(), "executionReport".to_string()])
            .unwrap();
        assert_eq!(frames.len(), 1);
        let Message::Text(text) = &frames[0] else { panic!("expected text frame") };
        let value: Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        assert_eq!(value["params"], json!(["btcusdt@trade"]));

        assert!(codec
            .encode_subscribe(&["executionReport".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_decode_depth_diff_sequence() {
        let codec = BinanceCodec::new(MarketKind::Spot);
        let text = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","U":157,"u":160,"b":[],"a":[]}}"#;
        let Decoded::Data(frame) = codec.decode(text).unwrap() else { panic!("expected data") };
        assert_eq!(frame.topic, "btcusdt@depth@100ms");
        assert_eq!(frame.sequence, Some(SequenceRange { first: 157, last: 160, reset: false }));

        let perp = BinanceCodec::new(MarketKind::Perpetual);
        let text = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","U":150,"u":160,"pu":149}}"#;
        let Decoded::Data(frame) = perp.decode(text).unwrap() else { panic!("expected data") };
        assert_eq!(frame.sequence.map(|s| s.first), Some(150));
    }

    #[test]
    fn test_decode_user_data_and_acks() {
        let codec = BinanceCodec::new(MarketKind::Spot);
        let Decoded::Data(frame) = codec
            .decode(r#"{"e":"executionReport","s":"BTCUSDT","X":"NEW"}"#)
            .unwrap()
        else {
            panic!("expected data")
        };
        assert_eq!(frame.topic, "executionReport");

        assert_eq!(
            codec.decode(r#"{"result":null,"id":1}"#).unwrap(),
            Decoded::Control(ControlFrame::SubscribeAck)
        );
        assert!(codec.decode("not json").is_err());
    }

    #[test]
    fn test_expired_listen_key_is_an_auth_failure() {
        let codec = BinanceCodec::new(MarketKind::Spot);
        let decoded = codec
            .decode(r#"{"e":"listenKeyExpired","E":1576653824250,"listenKey":"OfYGbUzi3PraNagEkdKuFwUHn48brFsItTdsuiIXrucEvD0rhRXZ7I6URWfE8YE8"}"#)
            .unwrap();
        assert_eq!(
            decoded,
            Decoded::Control(ControlFrame::AuthFailed("listen key expired".to_string()))
        );
    }
}
