//! Scripted HTTP and WebSocket transports shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use exlink::core::config::StreamConfig;
use exlink::core::kernel::{HttpResponse, HttpTransport, WsConnector, WsTransport};
use exlink::{ExchangeError, NormalizedError, SignedRequest};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// What the mock HTTP transport saw for one request.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: Option<String>,
    pub signed: bool,
}

/// Replays queued responses, then repeats the fallback forever.
pub struct MockHttp {
    queued: Mutex<VecDeque<Result<HttpResponse, NormalizedError>>>,
    fallback: Result<HttpResponse, NormalizedError>,
    requests: Mutex<Vec<Recorded>>,
}

impl MockHttp {
    pub fn always(response: Result<HttpResponse, NormalizedError>) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: response,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(body: &str) -> Arc<Self> {
        Self::always(Ok(HttpResponse::new(200, body)))
    }

    pub fn respond(status: u16, body: &str) -> Arc<Self> {
        Self::always(Ok(HttpResponse::new(status, body)))
    }

    pub fn offline() -> Arc<Self> {
        Self::always(Err(NormalizedError::network("connection refused")))
    }

    pub fn push(&self, response: Result<HttpResponse, NormalizedError>) {
        self.queued.lock().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for MockHttp {
    async fn send(&self, request: &SignedRequest) -> Result<HttpResponse, NormalizedError> {
        self.requests.lock().push(Recorded {
            method: request.spec.method.to_string(),
            path: request.spec.path.clone(),
            query: request.query_string.clone(),
            body: request.body.clone(),
            signed: request.signature.is_some(),
        });
        let next = self.queued.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Test side of one scripted socket: push inbound frames, read what the session sent.
pub struct SocketControl {
    inbound: Option<mpsc::UnboundedSender<Message>>,
    sent: Arc<Mutex<Vec<Message>>>,
}

impl SocketControl {
    pub fn push(&self, text: impl Into<String>) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Message::Text(text.into()));
        }
    }

    /// Simulate the peer dropping the connection.
    pub fn drop_connection(&mut self) {
        self.inbound = None;
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                Message::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

struct ScriptedSocket {
    inbound: mpsc::UnboundedReceiver<Message>,
    sent: Arc<Mutex<Vec<Message>>>,
}

#[async_trait]
impl WsTransport for ScriptedSocket {
    async fn send(&mut self, message: Message) -> Result<(), ExchangeError> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn next(&mut self) -> Option<Result<Message, ExchangeError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// Hands out pre-built sockets in order; refuses to connect once they run out.
#[derive(Default)]
pub struct ScriptedConnector {
    sockets: Mutex<VecDeque<ScriptedSocket>>,
    urls: Mutex<Vec<String>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a socket for the next connect and return its control side.
    pub fn socket(&self) -> SocketControl {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.sockets.lock().push_back(ScriptedSocket {
            inbound: rx,
            sent: sent.clone(),
        });
        SocketControl {
            inbound: Some(tx),
            sent,
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl WsConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsTransport>, ExchangeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());
        match self.sockets.lock().pop_front() {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(ExchangeError::NetworkError("no scripted socket left".to_string())),
        }
    }
}

/// Session tuning with heartbeats far beyond any test's horizon and no jitter.
pub fn quiet_stream_config() -> StreamConfig {
    StreamConfig {
        heartbeat_interval_ms: 3_600_000,
        backoff_base_ms: 100,
        backoff_cap_ms: 1_000,
        backoff_jitter: false,
        ..StreamConfig::default()
    }
}

/// Poll `condition` on virtual time until it holds or a minute passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..600 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}
