mod common;

use common::{eventually, quiet_stream_config, ScriptedConnector};
use exlink::core::config::{AccountConfig, Credentials, StreamConfig};
use exlink::core::kernel::StreamSession;
use exlink::exchanges::binance::BinanceCodec;
use exlink::{
    BybitClient, Channel, ConnectionState, ExchangeKind, MarketKind, MarketStreams, SessionEvent,
    SessionNotice, StreamHandler,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

type Recorded = Arc<Mutex<Vec<SessionEvent>>>;

fn recorder() -> (Recorded, Arc<dyn StreamHandler>) {
    let events: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (events, Arc::new(move |event: SessionEvent| sink.lock().push(event)))
}

fn spawn_binance(connector: Arc<ScriptedConnector>, config: StreamConfig) -> (StreamSession, broadcast::Receiver<SessionNotice>) {
    let (notices, notice_rx) = broadcast::channel(256);
    let session = StreamSession::spawn(
        "binance/test/public",
        "wss://mock.binance",
        Arc::new(BinanceCodec::new(MarketKind::Spot)),
        connector,
        config,
        notices,
    );
    (session, notice_rx)
}

fn transitions(notices: &mut broadcast::Receiver<SessionNotice>) -> Vec<(ConnectionState, ConnectionState)> {
    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let SessionNotice::ConnectionStateChanged { from, to, .. } = notice {
            seen.push((from, to));
        }
    }
    seen
}

fn trade_frame(id: u64) -> String {
    format!(r#"{{"stream":"btcusdt@trade","data":{{"e":"trade","t":{},"p":"100"}}}}"#, id)
}

fn trade_id(event: &SessionEvent) -> Option<u64> {
    match event {
        SessionEvent::Data(event) => event.payload["t"].as_u64(),
        SessionEvent::Gap(_) => None,
    }
}

/// One-second heartbeats: DEGRADED after two silent intervals, dropped after four.
fn heartbeat_config() -> StreamConfig {
    StreamConfig {
        heartbeat_interval_ms: 1_000,
        degrade_after_missed: 1,
        disconnect_after_missed: 3,
        ..quiet_stream_config()
    }
}

fn depth_frame(first: u64, last: u64) -> String {
    format!(
        r#"{{"stream":"btcusdt@depth@100ms","data":{{"e":"depthUpdate","U":{},"u":{},"b":[],"a":[]}}}}"#,
        first, last
    )
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resubscribes_active_topics() {
        let connector = ScriptedConnector::new();
        let mut first = connector.socket();
        let second = connector.socket();
        let (session, mut notices) = spawn_binance(connector.clone(), quiet_stream_config());

        // Record whether each event was delivered while the session was streaming.
        let delivered: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let state = session.state_watch();
        session
            .subscribe(
                Channel::Trades,
                Some("BTCUSDT"),
                Arc::new(move |_event: SessionEvent| sink.lock().push(state.borrow().is_streaming())),
            )
            .unwrap();

        assert!(eventually(|| first.sent_text().iter().any(|m| m.contains("btcusdt@trade"))).await);
        first.push(r#"{"stream":"btcusdt@trade","data":{"e":"trade","p":"100"}}"#);
        assert!(eventually(|| delivered.lock().len() == 1).await);

        // Queued on the replacement socket before it even connects.
        second.push(r#"{"stream":"btcusdt@trade","data":{"e":"trade","p":"101"}}"#);
        first.drop_connection();

        assert!(eventually(|| delivered.lock().len() == 2).await);
        assert_eq!(connector.connects(), 2);
        let resubscribe = second.sent_text();
        assert_eq!(resubscribe.len(), 1);
        assert!(resubscribe[0].contains("SUBSCRIBE"));
        assert!(resubscribe[0].contains("btcusdt@trade"));
        assert!(delivered.lock().iter().all(|streaming| *streaming));

        let seen = transitions(&mut notices);
        let reconnect = [
            (ConnectionState::Subscribed, ConnectionState::Disconnected),
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Subscribed),
        ];
        assert!(seen.windows(3).any(|window| window == reconnect), "{:?}", seen);
        assert_eq!(session.state(), ConnectionState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_gap_reported_once() {
        let connector = ScriptedConnector::new();
        let socket = connector.socket();
        let (session, mut notices) = spawn_binance(connector.clone(), quiet_stream_config());
        let (events, handler) = recorder();
        session
            .subscribe(Channel::OrderBook { depth: 1000 }, Some("BTCUSDT"), handler)
            .unwrap();

        for id in [1, 2, 3, 7, 8] {
            socket.push(depth_frame(id, id));
        }
        // Already seen: dropped as stale.
        socket.push(depth_frame(8, 8));

        assert!(eventually(|| events.lock().len() == 6).await);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let events = events.lock();
        assert_eq!(events.len(), 6);
        let gaps: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Gap(gap) => Some(gap.clone()),
                SessionEvent::Data(_) => None,
            })
            .collect();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].expected, 4);
        assert_eq!(gaps[0].received, 7);
        assert_eq!(gaps[0].topic, "btcusdt@depth@100ms");

        // The gap is delivered before the frame that revealed it.
        assert!(matches!(&events[3], SessionEvent::Gap(_)));
        match &events[4] {
            SessionEvent::Data(event) => {
                assert_eq!(event.sequence, Some(7));
                assert_eq!(event.symbol.as_deref(), Some("BTCUSDT"));
            }
            SessionEvent::Gap(_) => panic!("expected data after the gap"),
        }

        let mut gap_notices = 0;
        while let Ok(notice) = notices.try_recv() {
            if matches!(notice, SessionNotice::SequenceGap { .. }) {
                gap_notices += 1;
            }
        }
        assert_eq!(gap_notices, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery() {
        let connector = ScriptedConnector::new();
        let socket = connector.socket();
        let (session, _notices) = spawn_binance(connector.clone(), quiet_stream_config());
        let (events, handler) = recorder();
        session.subscribe(Channel::Ticker, Some("ETHUSDT"), handler).unwrap();
        assert!(eventually(|| socket.sent_text().len() == 1).await);

        session.unsubscribe(&Channel::Ticker, Some("ETHUSDT")).unwrap();
        assert!(eventually(|| socket.sent_text().len() == 2).await);
        assert!(socket.sent_text()[1].contains("UNSUBSCRIBE"));

        // Not subscribed: nothing sent, no error.
        session.unsubscribe(&Channel::Ticker, Some("ETHUSDT")).unwrap();
        session.unsubscribe(&Channel::Trades, Some("SOLUSDT")).unwrap();

        socket.push(r#"{"stream":"ethusdt@ticker","data":{"c":"1"}}"#);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(socket.sent_text().len(), 2);
        assert!(events.lock().is_empty());
        assert!(session.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_terminal() {
        let connector = ScriptedConnector::new();
        let _socket = connector.socket();
        let (session, _notices) = spawn_binance(connector.clone(), quiet_stream_config());
        let (_events, handler) = recorder();
        session.subscribe(Channel::Trades, Some("BTCUSDT"), handler).unwrap();
        assert!(eventually(|| session.state() == ConnectionState::Subscribed).await);

        session.close().await;

        assert!(session.is_terminated());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let (_events, handler) = recorder();
        assert!(session.subscribe(Channel::Trades, Some("ETHUSDT"), handler).is_err());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_exhausts() {
        let connector = ScriptedConnector::new();
        let mut only = connector.socket();
        let config = StreamConfig {
            max_reconnect_attempts: Some(2),
            ..quiet_stream_config()
        };
        let (session, mut notices) = spawn_binance(connector.clone(), config);
        let (_events, handler) = recorder();
        session.subscribe(Channel::Trades, Some("BTCUSDT"), handler).unwrap();
        assert!(eventually(|| session.state() == ConnectionState::Subscribed).await);

        only.drop_connection();

        assert!(eventually(|| session.is_terminated()).await);
        assert_eq!(connector.connects(), 3);
        let mut exhausted = None;
        while let Ok(notice) = notices.try_recv() {
            if let SessionNotice::ReconnectExhausted { attempts, .. } = notice {
                exhausted = Some(attempts);
            }
        }
        assert_eq!(exhausted, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_socket_degrades_then_recovers() {
        let connector = ScriptedConnector::new();
        let socket = connector.socket();
        let (session, mut notices) = spawn_binance(connector.clone(), heartbeat_config());
        let (events, handler) = recorder();
        session.subscribe(Channel::Trades, Some("BTCUSDT"), handler).unwrap();
        assert!(eventually(|| session.state() == ConnectionState::Subscribed).await);
        let subscribed_at = Instant::now();

        assert!(eventually(|| session.state() == ConnectionState::Degraded).await);
        assert!(subscribed_at.elapsed() >= Duration::from_millis(1_500));

        socket.push(trade_frame(1));
        assert!(eventually(|| session.state() == ConnectionState::Subscribed).await);
        assert!(eventually(|| events.lock().len() == 1).await);

        assert_eq!(connector.connects(), 1);
        let seen = transitions(&mut notices);
        assert!(seen.contains(&(ConnectionState::Subscribed, ConnectionState::Degraded)), "{:?}", seen);
        assert!(seen.contains(&(ConnectionState::Degraded, ConnectionState::Subscribed)), "{:?}", seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_socket_is_replaced() {
        let connector = ScriptedConnector::new();
        let _first = connector.socket();
        let second = connector.socket();
        let (session, mut notices) = spawn_binance(connector.clone(), heartbeat_config());
        let (_events, handler) = recorder();
        session.subscribe(Channel::Trades, Some("BTCUSDT"), handler).unwrap();
        assert!(eventually(|| session.state() == ConnectionState::Subscribed).await);
        let start = Instant::now();

        assert!(eventually(|| connector.connects() == 2).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3_500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "{:?}", elapsed);
        assert!(eventually(|| second.sent_text().iter().any(|m| m.contains("btcusdt@trade"))).await);

        let seen = transitions(&mut notices);
        let dead = [
            (ConnectionState::Subscribed, ConnectionState::Degraded),
            (ConnectionState::Degraded, ConnectionState::Disconnected),
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Subscribed),
        ];
        assert!(seen.windows(4).any(|window| window == dead), "{:?}", seen);

        // The replacement connection is watched the same way.
        assert!(eventually(|| session.state() == ConnectionState::Degraded).await);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_handler_loses_oldest_events() {
        let connector = ScriptedConnector::new();
        let socket = connector.socket();
        let config = StreamConfig {
            event_queue_capacity: 4,
            ..quiet_stream_config()
        };
        let (session, _notices) = spawn_binance(connector.clone(), config);
        let (events, handler) = recorder();
        let handle = session.subscribe(Channel::Trades, Some("BTCUSDT"), handler).unwrap();
        assert!(eventually(|| session.state() == ConnectionState::Subscribed).await);

        // Queued in one burst, before the dispatcher gets to run.
        for id in 0..50 {
            socket.push(trade_frame(id));
        }

        assert!(eventually(|| events.lock().last().and_then(trade_id) == Some(49)).await);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let ids: Vec<u64> = events.lock().iter().filter_map(trade_id).collect();
        assert_eq!(ids, vec![46, 47, 48, 49]);
        assert_eq!(handle.dropped_events(), 46);
    }
}

#[cfg(test)]
mod private_stream_tests {
    use super::*;
    use common::MockHttp;
    use exlink::core::kernel::HttpResponse;
    use exlink::BinanceClient;

    fn binance_account(stream: StreamConfig) -> AccountConfig {
        AccountConfig::new(
            "main",
            ExchangeKind::Binance,
            MarketKind::Spot,
            Credentials::new("test-key".into(), "test-secret".into()),
        )
        .stream(stream)
    }

    fn listen_key_requests(http: &MockHttp) -> usize {
        http.requests()
            .iter()
            .filter(|request| request.method == "POST" && request.path == "/api/v3/userDataStream")
            .count()
    }

    fn bybit_account(credentials: Credentials, stream: StreamConfig) -> AccountConfig {
        AccountConfig::new("main", ExchangeKind::Bybit, MarketKind::Spot, credentials).stream(stream)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bybit_private_stream_authenticates_before_subscribing() {
        let connector = ScriptedConnector::new();
        let socket = connector.socket();
        let config = bybit_account(
            Credentials::new("test-key".into(), "test-secret".into()),
            quiet_stream_config(),
        );
        let client = BybitClient::with_transports(&config, MockHttp::ok("{}"), connector.clone());
        let (events, handler) = recorder();

        client.subscribe(Channel::Orders, None, handler).await.unwrap();

        assert!(eventually(|| socket.sent_text().len() == 1).await);
        let auth = socket.sent_text()[0].clone();
        assert!(auth.contains(r#""op":"auth""#));
        assert!(auth.contains("test-key"));
        assert!(!auth.contains("test-secret"));

        socket.push(r#"{"op":"auth","success":true,"ret_msg":"","conn_id":"c1"}"#);
        assert!(eventually(|| socket.sent_text().len() == 2).await);
        assert!(socket.sent_text()[1].contains(r#""op":"subscribe""#));
        assert!(socket.sent_text()[1].contains(r#""order""#));
        assert_eq!(connector.urls(), vec!["wss://stream.bybit.com/v5/private".to_string()]);

        socket.push(r#"{"topic":"order.spot","data":[{"orderId":"1","orderStatus":"New"}]}"#);
        assert!(eventually(|| events.lock().len() == 1).await);
        match &events.lock()[0] {
            SessionEvent::Data(event) => assert_eq!(event.channel, Channel::Orders),
            SessionEvent::Gap(_) => panic!("unexpected gap"),
        };
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_auth_failure_is_fatal() {
        let connector = ScriptedConnector::new();
        let failure = r#"{"op":"auth","success":false,"ret_msg":"invalid signature"}"#;
        let first = connector.socket();
        let second = connector.socket();
        first.push(failure);
        second.push(failure);
        let stream = StreamConfig {
            max_auth_failures: 2,
            ..quiet_stream_config()
        };
        let config = bybit_account(Credentials::new("k".into(), "s".into()), stream);
        let client = BybitClient::with_transports(&config, MockHttp::ok("{}"), connector.clone());
        let mut notices = client.notices();
        let (_events, handler) = recorder();

        client.subscribe(Channel::Balances, None, handler).await.unwrap();

        let fatal = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match notices.recv().await {
                    Ok(SessionNotice::FatalAuthFailure { reason, .. }) => return reason,
                    Ok(_) => {}
                    Err(e) => panic!("notice channel failed: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(fatal, "invalid signature");
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_private_subscribe_without_credentials_fails() {
        let connector = ScriptedConnector::new();
        let config = bybit_account(Credentials::read_only(), quiet_stream_config());
        let client = BybitClient::with_transports(&config, MockHttp::ok("{}"), connector.clone());
        let (_events, handler) = recorder();

        let err = client.subscribe(Channel::Orders, None, handler).await.unwrap_err();
        assert_eq!(err.kind, exlink::ErrorKind::Auth);
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_without_session_is_noop() {
        let connector = ScriptedConnector::new();
        let config = bybit_account(Credentials::read_only(), quiet_stream_config());
        let client = BybitClient::with_transports(&config, MockHttp::ok("{}"), connector.clone());

        client.unsubscribe(Channel::Trades, Some("BTCUSDT")).await.unwrap();
        client.unsubscribe(Channel::Orders, None).await.unwrap();
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binance_user_stream_uses_listen_key() {
        let connector = ScriptedConnector::new();
        let _socket = connector.socket();
        let http = MockHttp::ok(r#"{"listenKey":"pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1"}"#);
        let config = binance_account(quiet_stream_config());
        let client = BinanceClient::with_transports(&config, http.clone(), connector.clone());
        let (_events, handler) = recorder();

        client.subscribe(Channel::Orders, None, handler).await.unwrap();
        assert!(eventually(|| connector.connects() == 1).await);
        assert_eq!(
            connector.urls(),
            vec!["wss://stream.binance.com:9443/ws/pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1".to_string()]
        );

        client.unsubscribe_all().await;

        let requests = http.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!((requests[0].method.as_str(), requests[0].path.as_str()), ("POST", "/api/v3/userDataStream"));
        assert_eq!(requests[1].method, "DELETE");
        assert!(requests[1].query.contains("listenKey=pqia91ma19a5s61cv6a81va65sdf19v8a65a1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_listen_key_is_renewed() {
        let connector = ScriptedConnector::new();
        let first = connector.socket();
        let _second = connector.socket();
        let http = MockHttp::ok(r#"{"listenKey":"KEY2"}"#);
        http.push(Ok(HttpResponse::new(200, r#"{"listenKey":"KEY1"}"#)));
        let client = BinanceClient::with_transports(&binance_account(quiet_stream_config()), http.clone(), connector.clone());
        let mut notices = client.notices();
        let (_events, handler) = recorder();

        client.subscribe(Channel::Orders, None, handler).await.unwrap();
        assert!(eventually(|| connector.connects() == 1).await);
        assert_eq!(listen_key_requests(&http), 1);

        first.push(r#"{"e":"listenKeyExpired","E":1576653824250,"listenKey":"KEY1"}"#);

        assert!(eventually(|| connector.connects() == 2).await);
        assert_eq!(
            connector.urls(),
            vec![
                "wss://stream.binance.com:9443/ws/KEY1".to_string(),
                "wss://stream.binance.com:9443/ws/KEY2".to_string(),
            ]
        );
        assert_eq!(listen_key_requests(&http), 2);

        let mut resubscribed = false;
        while let Ok(notice) = notices.try_recv() {
            match notice {
                SessionNotice::FatalAuthFailure { .. } => panic!("renewal should recover the stream"),
                SessionNotice::ConnectionStateChanged { to, .. } => {
                    resubscribed = to == ConnectionState::Subscribed;
                }
                _ => {}
            }
        }
        assert!(resubscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_key_that_cannot_be_renewed_is_fatal() {
        let connector = ScriptedConnector::new();
        let only = connector.socket();
        let http = MockHttp::respond(401, r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#);
        http.push(Ok(HttpResponse::new(200, r#"{"listenKey":"KEY1"}"#)));
        let stream = StreamConfig {
            max_auth_failures: 2,
            ..quiet_stream_config()
        };
        let client = BinanceClient::with_transports(&binance_account(stream), http.clone(), connector.clone());
        let mut notices = client.notices();
        let (_events, handler) = recorder();

        client.subscribe(Channel::Orders, None, handler).await.unwrap();
        assert!(eventually(|| connector.connects() == 1).await);
        only.push(r#"{"e":"listenKeyExpired","E":1576653824250,"listenKey":"KEY1"}"#);

        let fatal = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match notices.recv().await {
                    Ok(SessionNotice::FatalAuthFailure { reason, .. }) => return reason,
                    Ok(_) => {}
                    Err(e) => panic!("notice channel failed: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert!(fatal.contains("Invalid API-key"), "{}", fatal);
        assert_eq!(connector.connects(), 1);
        assert_eq!(listen_key_requests(&http), 2);
    }
}
