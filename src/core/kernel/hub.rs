use crate::core::config::StreamConfig;
use crate::core::errors::NormalizedError;
use crate::core::kernel::codec::StreamCodec;
use crate::core::kernel::session::{StreamEndpoint, StreamSession, SubscriptionHandle};
use crate::core::kernel::ws::WsConnector;
use crate::core::traits::StreamHandler;
use crate::core::types::{Channel, ConnectionState, SessionNotice};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument};

/// Which socket of a client a subscription lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionKey {
    Public,
    Private,
}

impl SessionKey {
    pub const fn for_channel(channel: &Channel) -> Self {
        if channel.is_private() {
            Self::Private
        } else {
            Self::Public
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

/// Owns a client's stream sessions. Sessions are created on first subscription
/// and replaced if a previous one terminated.
pub struct StreamHub {
    name: String,
    connector: Arc<dyn WsConnector>,
    config: StreamConfig,
    notices: broadcast::Sender<SessionNotice>,
    sessions: Mutex<BTreeMap<SessionKey, StreamSession>>,
}

impl std::fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHub")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl StreamHub {
    pub fn new(name: impl Into<String>, connector: Arc<dyn WsConnector>, config: StreamConfig) -> Self {
        let (notices, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            connector,
            config,
            notices,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Subscribe on the session for `key`, opening it on `endpoint` if needed.
    ///
    /// The endpoint is resolved once up front so that bad credentials fail the
    /// call instead of the background session.
    #[instrument(skip(self, codec, endpoint, handler), fields(hub = %self.name))]
    pub async fn subscribe(
        &self,
        key: SessionKey,
        codec: Arc<dyn StreamCodec>,
        endpoint: Arc<dyn StreamEndpoint>,
        channel: Channel,
        symbol: Option<&str>,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<SubscriptionHandle, NormalizedError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(&key).is_some_and(StreamSession::is_terminated) {
            debug!(?key, "replacing terminated session");
            if let Some(stale) = sessions.remove(&key) {
                stale.close().await;
            }
        }

        if !sessions.contains_key(&key) {
            endpoint.resolve(false).await?;
            let session = StreamSession::spawn_with_endpoint(
                format!("{}/{}", self.name, key.label()),
                endpoint,
                codec,
                self.connector.clone(),
                self.config.clone(),
                self.notices.clone(),
            );
            sessions.insert(key, session);
        }

        let session = sessions
            .get(&key)
            .ok_or_else(|| NormalizedError::unknown(None, "stream session unavailable"))?;
        Ok(session.subscribe(channel, symbol, handler)?)
    }

    /// Idempotent: unknown channels and unopened sessions are a no-op.
    pub async fn unsubscribe(&self, channel: &Channel, symbol: Option<&str>) -> Result<(), NormalizedError> {
        let key = SessionKey::for_channel(channel);
        let sessions = self.sessions.lock().await;
        match sessions.get(&key) {
            Some(session) => Ok(session.unsubscribe(channel, symbol)?),
            None => Ok(()),
        }
    }

    /// Close and drop every session.
    pub async fn close_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().await);
        for (_, session) in sessions {
            session.close().await;
        }
    }

    pub async fn state(&self, key: SessionKey) -> Option<ConnectionState> {
        self.sessions.lock().await.get(&key).map(StreamSession::state)
    }

    pub async fn has_session(&self, key: SessionKey) -> bool {
        self.sessions.lock().await.contains_key(&key)
    }
}
