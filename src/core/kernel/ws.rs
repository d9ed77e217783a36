use crate::core::errors::ExchangeError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, instrument};

/// One open WebSocket connection - pure transport layer
#[async_trait]
pub trait WsTransport: Send {
    /// Send a raw message
    async fn send(&mut self, message: Message) -> Result<(), ExchangeError>;

    /// Receive the next raw message. `None` once the peer closed the socket.
    async fn next(&mut self) -> Option<Result<Message, ExchangeError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), ExchangeError>;
}

/// Opens WebSocket connections. Swapped for a scripted connector in tests.
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn WsTransport>, ExchangeError>;
}

/// Tungstenite-based connector
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    #[instrument(skip(self))]
    async fn connect(&self, url: &str) -> Result<Box<dyn WsTransport>, ExchangeError> {
        let (stream, response) = connect_async(url).await.map_err(|e| {
            ExchangeError::NetworkError(format!("WebSocket connection failed: {}", e))
        })?;
        debug!(status = %response.status(), "websocket handshake complete");
        Ok(Box::new(TungsteniteTransport { stream }))
    }
}

pub struct TungsteniteTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WsTransport for TungsteniteTransport {
    async fn send(&mut self, message: Message) -> Result<(), ExchangeError> {
        self.stream
            .send(message)
            .await
            .map_err(|e| ExchangeError::NetworkError(format!("Failed to send message: {}", e)))
    }

    async fn next(&mut self) -> Option<Result<Message, ExchangeError>> {
        self.stream.next().await.map(|result| {
            result.map_err(|e| ExchangeError::NetworkError(format!("WebSocket error: {}", e)))
        })
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ExchangeError::NetworkError(format!("Failed to close connection: {}", e)))
    }
}
