use crate::core::config::StreamConfig;
use crate::core::errors::{ErrorKind, ExchangeError, NormalizedError};
use crate::core::kernel::backoff::Backoff;
use crate::core::kernel::codec::{ControlFrame, DataFrame, Decoded, SequenceRange, StreamCodec};
use crate::core::kernel::signer::current_timestamp_ms;
use crate::core::kernel::throttle::FrameThrottle;
use crate::core::kernel::ws::{WsConnector, WsTransport};
use crate::core::traits::StreamHandler;
use crate::core::types::{
    Channel, ConnectionState, SequenceGap, SessionEvent, SessionNotice, StreamEvent,
    StreamSubscription,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, trace, warn};

/// Where a session connects, asked again before every connection attempt.
///
/// `renew` is set when the previous connection ended because the exchange rejected
/// its credentials, so endpoints built on short-lived tokens can issue a new one.
#[async_trait]
pub trait StreamEndpoint: Send + Sync + 'static {
    async fn resolve(&self, renew: bool) -> Result<String, NormalizedError>;
}

#[async_trait]
impl StreamEndpoint for String {
    async fn resolve(&self, _renew: bool) -> Result<String, NormalizedError> {
        Ok(self.clone())
    }
}

/// Returned by `subscribe`; exposes the drop-oldest overflow counter.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    topic: String,
    overflow: Arc<AtomicU64>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Events dropped because the handler fell behind the queue capacity.
    pub fn dropped_events(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

struct SubscriptionEntry {
    subscription: StreamSubscription,
    sender: broadcast::Sender<SessionEvent>,
    dispatcher: JoinHandle<()>,
}

type SubscriptionMap = Arc<Mutex<BTreeMap<String, SubscriptionEntry>>>;

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

/// Outcome of comparing a frame's sequence range against the last id seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    Gap { expected: u64, received: u64 },
    Stale,
}

pub fn check_sequence(last_seen: Option<u64>, range: SequenceRange) -> SequenceCheck {
    match last_seen {
        _ if range.reset => SequenceCheck::InOrder,
        None => SequenceCheck::InOrder,
        Some(last) if range.last <= last => SequenceCheck::Stale,
        Some(last) if range.first > last + 1 => SequenceCheck::Gap {
            expected: last + 1,
            received: range.first,
        },
        Some(_) => SequenceCheck::InOrder,
    }
}

/// One WebSocket connection with its subscriptions, kept alive by a background task.
///
/// The task owns the socket. Subscriptions live in a map shared with this handle so that
/// every reconnect re-issues exactly the set active at the time.
pub struct StreamSession {
    name: String,
    codec: Arc<dyn StreamCodec>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    subscriptions: SubscriptionMap,
    queue_capacity: usize,
    terminated: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Start a session on a fixed URL; it begins connecting immediately.
    pub fn spawn(
        name: impl Into<String>,
        url: impl Into<String>,
        codec: Arc<dyn StreamCodec>,
        connector: Arc<dyn WsConnector>,
        config: StreamConfig,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        let endpoint: Arc<dyn StreamEndpoint> = Arc::new(url.into());
        Self::spawn_with_endpoint(name, endpoint, codec, connector, config, notices)
    }

    /// Start a session whose URL is resolved before each connection attempt.
    pub fn spawn_with_endpoint(
        name: impl Into<String>,
        endpoint: Arc<dyn StreamEndpoint>,
        codec: Arc<dyn StreamCodec>,
        connector: Arc<dyn WsConnector>,
        config: StreamConfig,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        let name = name.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let subscriptions: SubscriptionMap = Arc::new(Mutex::new(BTreeMap::new()));
        let terminated = Arc::new(AtomicBool::new(false));
        let queue_capacity = config.event_queue_capacity.max(1);

        let task = SessionTask {
            name: name.clone(),
            endpoint,
            throttle: FrameThrottle::per_second(codec.frames_per_second()),
            codec: codec.clone(),
            connector,
            backoff: Backoff::from_config(&config),
            config,
            commands: commands_rx,
            state: state_tx,
            notices,
            subscriptions: subscriptions.clone(),
            terminated: terminated.clone(),
        };
        let handle = tokio::spawn(task.run());

        Self {
            name,
            codec,
            commands: commands_tx,
            state: state_rx,
            subscriptions,
            queue_capacity,
            terminated,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// True once the session closed or gave up reconnecting.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Snapshot of the active subscriptions, ordered by topic.
    pub fn subscriptions(&self) -> Vec<StreamSubscription> {
        self.subscriptions
            .lock()
            .values()
            .map(|entry| entry.subscription.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    /// Register a handler for a channel. Subscribing to an active topic replaces its handler.
    #[instrument(skip(self, handler), fields(session = %self.name))]
    pub fn subscribe(
        &self,
        channel: Channel,
        symbol: Option<&str>,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<SubscriptionHandle, ExchangeError> {
        if self.is_terminated() {
            return Err(ExchangeError::SessionClosed);
        }
        let topic = self.codec.topic(&channel, symbol)?;
        let symbol = symbol.map(str::to_string);

        let (sender, receiver) = broadcast::channel(self.queue_capacity);
        let overflow = Arc::new(AtomicU64::new(0));
        let dispatcher = tokio::spawn(dispatch(
            topic.clone(),
            receiver,
            self.state.clone(),
            handler,
            overflow.clone(),
        ));

        let mut entry = SubscriptionEntry {
            subscription: StreamSubscription::new(channel, symbol, topic.clone()),
            sender,
            dispatcher,
        };

        let replaced = {
            let mut subs = self.subscriptions.lock();
            if let Some(existing) = subs.get(&topic) {
                entry.subscription.last_sequence_id = existing.subscription.last_sequence_id;
            }
            subs.insert(topic.clone(), entry)
        };
        match replaced {
            Some(old) => {
                old.dispatcher.abort();
                debug!(topic = %topic, "replaced subscription handler");
            }
            None => {
                self.commands
                    .send(Command::Subscribe(topic.clone()))
                    .map_err(|_| ExchangeError::SessionClosed)?;
            }
        }

        Ok(SubscriptionHandle { topic, overflow })
    }

    /// Remove a subscription. Unknown subscriptions are a no-op.
    #[instrument(skip(self), fields(session = %self.name))]
    pub fn unsubscribe(&self, channel: &Channel, symbol: Option<&str>) -> Result<(), ExchangeError> {
        let topic = self.codec.topic(channel, symbol)?;
        let removed = self.subscriptions.lock().remove(&topic);
        let Some(entry) = removed else {
            trace!(topic = %topic, "not subscribed");
            return Ok(());
        };
        entry.dispatcher.abort();
        // A finished task has nothing left to unsubscribe from.
        let _ = self.commands.send(Command::Unsubscribe(topic));
        Ok(())
    }

    /// Close the socket and stop the session for good.
    #[instrument(skip(self), fields(session = %self.name))]
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "session task ended abnormally");
            }
        }
        let drained: Vec<SubscriptionEntry> = {
            let mut subs = self.subscriptions.lock();
            std::mem::take(&mut *subs).into_values().collect()
        };
        for entry in drained {
            entry.dispatcher.abort();
        }
        self.terminated.store(true, Ordering::Release);
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        for entry in self.subscriptions.lock().values() {
            entry.dispatcher.abort();
        }
    }
}

/// Delivers queued events to one handler, only while the session is streaming.
async fn dispatch(
    topic: String,
    mut events: broadcast::Receiver<SessionEvent>,
    mut state: watch::Receiver<ConnectionState>,
    handler: Arc<dyn StreamHandler>,
    overflow: Arc<AtomicU64>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if state.wait_for(|s| s.is_streaming()).await.is_err() {
                    return;
                }
                handler.on_event(event);
            }
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                overflow.fetch_add(dropped, Ordering::Relaxed);
                debug!(topic = %topic, dropped, "handler lagging, dropped oldest events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Why a connection ended.
#[derive(Debug)]
enum Exit {
    Closed,
    Network(String),
    Auth(String),
}

struct SessionTask {
    name: String,
    endpoint: Arc<dyn StreamEndpoint>,
    codec: Arc<dyn StreamCodec>,
    connector: Arc<dyn WsConnector>,
    config: StreamConfig,
    backoff: Backoff,
    throttle: FrameThrottle,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<SessionNotice>,
    subscriptions: SubscriptionMap,
    terminated: Arc<AtomicBool>,
}

impl SessionTask {
    #[instrument(name = "stream_session", skip(self), fields(session = %self.name))]
    async fn run(mut self) {
        let mut auth_failures = 0u32;
        let mut network_failures = 0u32;
        let mut renew = false;

        loop {
            let exit = self
                .connect_and_stream(renew, &mut auth_failures, &mut network_failures)
                .await;
            renew = matches!(exit, Exit::Auth(_));
            match exit {
                Exit::Closed => break,
                Exit::Auth(reason) => {
                    self.set_state(ConnectionState::Disconnected);
                    auth_failures += 1;
                    warn!(%reason, attempt = auth_failures, "authentication failed");
                    if auth_failures >= self.config.max_auth_failures {
                        self.notify(SessionNotice::FatalAuthFailure {
                            session: self.name.clone(),
                            reason,
                        });
                        break;
                    }
                }
                Exit::Network(reason) => {
                    self.set_state(ConnectionState::Disconnected);
                    network_failures += 1;
                    warn!(%reason, attempt = network_failures, "connection lost");
                    if let Some(max) = self.config.max_reconnect_attempts {
                        if network_failures > max {
                            self.notify(SessionNotice::ReconnectExhausted {
                                session: self.name.clone(),
                                attempts: max,
                            });
                            break;
                        }
                    }
                }
            }

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            if self.wait_or_close(Instant::now() + delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.terminated.store(true, Ordering::Release);
        info!("stream session stopped");
    }

    /// Sleep until `deadline`. Returns true if a close was requested meanwhile.
    async fn wait_or_close(&mut self, deadline: Instant) -> bool {
        loop {
            tokio::select! {
                () = sleep_until(deadline) => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => return true,
                    // Subscription changes are picked up from the shared map on reconnect.
                    Some(_) => {}
                },
            }
        }
    }

    async fn connect_and_stream(
        &mut self,
        renew: bool,
        auth_failures: &mut u32,
        network_failures: &mut u32,
    ) -> Exit {
        self.set_state(ConnectionState::Connecting);

        let endpoint = self.endpoint.clone();
        let connector = self.connector.clone();
        let connect_timeout = self.config.connect_timeout();
        let connect = async move {
            let url = endpoint.resolve(renew).await.map_err(|e| match e.kind {
                ErrorKind::Auth => Exit::Auth(e.raw_message),
                _ => Exit::Network(e.to_string()),
            })?;
            match timeout(connect_timeout, connector.connect(&url)).await {
                Ok(Ok(ws)) => Ok(ws),
                Ok(Err(e)) => Err(Exit::Network(e.to_string())),
                Err(_) => Err(Exit::Network("connect timed out".to_string())),
            }
        };
        tokio::pin!(connect);
        let mut ws = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(ws) => break ws,
                    Err(exit) => return exit,
                },
                command = self.commands.recv() => {
                    if matches!(command, Some(Command::Close) | None) {
                        return Exit::Closed;
                    }
                }
            }
        };

        if let Err(exit) = self.authenticate(ws.as_mut()).await {
            if matches!(exit, Exit::Closed) {
                self.set_state(ConnectionState::Closing);
                let _ = ws.close().await;
            }
            return exit;
        }

        let mut active = BTreeSet::new();
        if let Err(e) = self.resubscribe(ws.as_mut(), &mut active).await {
            return Exit::Network(e.to_string());
        }

        self.set_state(ConnectionState::Subscribed);
        self.backoff.reset();
        *auth_failures = 0;
        *network_failures = 0;

        let exit = self.stream(ws.as_mut(), &mut active).await;
        if matches!(exit, Exit::Closed) {
            self.set_state(ConnectionState::Closing);
            if let Err(e) = ws.close().await {
                debug!(error = %e, "close handshake failed");
            }
        }
        exit
    }

    async fn authenticate(&mut self, ws: &mut dyn WsTransport) -> Result<(), Exit> {
        let timestamp = current_timestamp_ms().map_err(|e| Exit::Network(e.to_string()))?;
        let auth = match self.codec.encode_auth(timestamp) {
            Ok(Some(auth)) => auth,
            Ok(None) => return Ok(()),
            Err(e) => return Err(Exit::Auth(e.to_string())),
        };

        self.set_state(ConnectionState::Authenticating);
        self.send(ws, auth)
            .await
            .map_err(|e| Exit::Network(e.to_string()))?;

        let deadline = Instant::now() + self.config.auth_timeout();
        loop {
            tokio::select! {
                () = sleep_until(deadline) => {
                    return Err(Exit::Network("authentication timed out".to_string()));
                }
                command = self.commands.recv() => {
                    if matches!(command, Some(Command::Close) | None) {
                        return Err(Exit::Closed);
                    }
                }
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => match self.codec.decode(&text) {
                        Ok(Decoded::Control(ControlFrame::AuthOk)) => {
                            debug!("authenticated");
                            return Ok(());
                        }
                        Ok(Decoded::Control(ControlFrame::AuthFailed(reason))) => {
                            return Err(Exit::Auth(reason));
                        }
                        Ok(_) => trace!("frame ignored while authenticating"),
                        Err(e) => debug!(error = %e, "undecodable frame while authenticating"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(Exit::Network("closed during authentication".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(Exit::Network(e.to_string())),
                },
            }
        }
    }

    async fn resubscribe(
        &mut self,
        ws: &mut dyn WsTransport,
        active: &mut BTreeSet<String>,
    ) -> Result<(), ExchangeError> {
        let topics: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        if topics.is_empty() {
            return Ok(());
        }
        info!(count = topics.len(), "re-establishing subscriptions");
        for message in self.codec.encode_subscribe(&topics)? {
            self.send(ws, message).await?;
        }
        active.extend(topics);
        Ok(())
    }

    async fn stream(&mut self, ws: &mut dyn WsTransport, active: &mut BTreeSet<String>) -> Exit {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0u32;
        let mut alive = false;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let result = match command {
                        Some(Command::Subscribe(topic)) => {
                            if active.contains(&topic) || !self.subscriptions.lock().contains_key(&topic) {
                                continue;
                            }
                            self.send_encoded(ws, self.codec.encode_subscribe(std::slice::from_ref(&topic)))
                                .await
                                .map(|()| { active.insert(topic); })
                        }
                        Some(Command::Unsubscribe(topic)) => {
                            if !active.remove(&topic) || self.subscriptions.lock().contains_key(&topic) {
                                continue;
                            }
                            self.send_encoded(ws, self.codec.encode_unsubscribe(std::slice::from_ref(&topic))).await
                        }
                        Some(Command::Close) | None => return Exit::Closed,
                    };
                    if let Err(e) = result {
                        return Exit::Network(e.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    if alive {
                        missed = 0;
                    } else {
                        missed += 1;
                    }
                    alive = false;

                    if missed > self.config.disconnect_after_missed {
                        return Exit::Network(format!("{} heartbeats missed", missed));
                    }
                    if missed > self.config.degrade_after_missed {
                        self.set_state(ConnectionState::Degraded);
                    }

                    let ping = match current_timestamp_ms() {
                        Ok(now) => self.codec.encode_ping(now),
                        Err(e) => return Exit::Network(e.to_string()),
                    };
                    if let Err(e) = self.send(ws, ping).await {
                        return Exit::Network(e.to_string());
                    }
                }
                frame = ws.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Exit::Network(e.to_string()),
                        None => return Exit::Network("connection closed".to_string()),
                    };

                    alive = true;
                    if missed > 0 || self.current_state() == ConnectionState::Degraded {
                        missed = 0;
                        self.set_state(ConnectionState::Subscribed);
                    }

                    let text = match message {
                        Message::Text(text) => text,
                        Message::Binary(bytes) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Message::Close(frame) => {
                            return Exit::Network(format!("closed by peer: {:?}", frame));
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    };

                    match self.codec.decode(&text) {
                        Ok(Decoded::Data(frame)) => self.route(frame),
                        Ok(Decoded::Control(ControlFrame::AuthFailed(reason))) => return Exit::Auth(reason),
                        Ok(Decoded::Control(ControlFrame::Error(reason))) => {
                            warn!(%reason, "exchange reported stream error");
                        }
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "undecodable frame"),
                    }
                }
            }
        }
    }

    /// Sequence-check a frame and queue it for its subscription's handler.
    fn route(&self, frame: DataFrame) {
        let mut subs = self.subscriptions.lock();
        let Some(entry) = subs.get_mut(&frame.topic) else {
            trace!(topic = %frame.topic, "frame for unknown topic");
            return;
        };

        if let Some(range) = frame.sequence {
            match check_sequence(entry.subscription.last_sequence_id, range) {
                SequenceCheck::Stale => {
                    trace!(topic = %frame.topic, last = range.last, "stale frame dropped");
                    return;
                }
                SequenceCheck::Gap { expected, received } => {
                    let gap = SequenceGap {
                        topic: frame.topic.clone(),
                        expected,
                        received,
                    };
                    warn!(topic = %frame.topic, expected, received, "sequence gap");
                    let _ = entry.sender.send(SessionEvent::Gap(gap.clone()));
                    self.notify(SessionNotice::SequenceGap {
                        session: self.name.clone(),
                        gap,
                    });
                }
                SequenceCheck::InOrder => {}
            }
            entry.subscription.last_sequence_id = Some(range.last);
        }

        let event = StreamEvent {
            channel: entry.subscription.channel.clone(),
            symbol: entry
                .subscription
                .symbol
                .clone()
                .or_else(|| self.codec.symbol_of(&frame.topic)),
            topic: frame.topic,
            payload: frame.payload,
            sequence: frame.sequence.map(|range| range.last),
            received_at: Utc::now(),
        };
        if entry.sender.send(SessionEvent::Data(event)).is_err() {
            trace!("no dispatcher listening");
        }
    }

    async fn send_encoded(
        &self,
        ws: &mut dyn WsTransport,
        messages: Result<Vec<Message>, ExchangeError>,
    ) -> Result<(), ExchangeError> {
        for message in messages? {
            self.send(ws, message).await?;
        }
        Ok(())
    }

    async fn send(&self, ws: &mut dyn WsTransport, message: Message) -> Result<(), ExchangeError> {
        self.throttle.ready().await;
        ws.send(message).await
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!(%from, %to, "connection state changed");
            self.notify(SessionNotice::ConnectionStateChanged {
                session: self.name.clone(),
                from,
                to,
            });
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // Nobody listening is fine.
        let _ = self.notices.send(notice);
    }
}
