//! Long-lived socket connection to the chat server.
//!
//! A [`TransportConnection`] owns at most one connection attempt at a time.
//! Inbound frames are decoded into [`ServerEvent`]s at this boundary and
//! handed to subscribers together with connection lifecycle events.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    error::SessionError,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

pub const CONNECT_EVENT: &str = "connect";
pub const DISCONNECT_EVENT: &str = "disconnect";
pub const CONNECT_ERROR_EVENT: &str = "connect_error";
pub const RECONNECT_ATTEMPT_EVENT: &str = "reconnect_attempt";

pub const CONNECTION_EVENT_NAMES: [&str; 4] = [
    CONNECT_EVENT,
    DISCONNECT_EVENT,
    CONNECT_ERROR_EVENT,
    RECONNECT_ATTEMPT_EVENT,
];

const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    /// A connection attempt failed; the server could not be reached.
    Unreachable { attempt: u32, error: String },
    Reconnecting { attempt: u32 },
    Server(ServerEvent),
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::Connected => CONNECT_EVENT,
            TransportEvent::Disconnected { .. } => DISCONNECT_EVENT,
            TransportEvent::Unreachable { .. } => CONNECT_ERROR_EVENT,
            TransportEvent::Reconnecting { .. } => RECONNECT_ATTEMPT_EVENT,
            TransportEvent::Server(event) => event.name(),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Handle returned by `subscribe`; the handler is removed when this is
/// dropped or [`Subscription::unsubscribe`] is called.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

struct Subscriber {
    id: u64,
    event_name: String,
    handler: EventHandler,
}

/// Event-name keyed handler table shared by transport implementations.
#[derive(Default)]
pub struct SubscriberRegistry {
    entries: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn subscribe(self: &Arc<Self>, event_name: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push(Subscriber {
            id,
            event_name: event_name.to_string(),
            handler,
        });
        let registry = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                lock(&registry.entries).retain(|entry| entry.id != id);
            }
        })
    }

    /// Calls every handler registered for the event's name and returns how
    /// many were invoked.
    pub fn dispatch(&self, event: &TransportEvent) -> usize {
        let handlers: Vec<EventHandler> = lock(&self.entries)
            .iter()
            .filter(|entry| entry.event_name == event.name())
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The transport surface the session layer depends on.
pub trait ServerLink: Send + Sync {
    fn connect(&self);
    fn disconnect(&self);
    fn send(&self, request: &ClientRequest) -> Result<(), SessionError>;
    fn state(&self) -> ConnectionState;
    fn subscribe(&self, event_name: &str, handler: EventHandler) -> Subscription;
}

/// Text frames flowing to and from an open socket. The connection is
/// considered closed once `inbound` yields `None`.
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<SocketLink>;
}

pub struct WsConnector;

#[async_trait]
impl SocketConnector for WsConnector {
    async fn open(&self, url: &str) -> Result<SocketLink> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut writer, mut reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = writer.send(WsMessage::Text(frame)).await {
                    warn!(error = %err, "websocket send failed");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Maps an http(s) or ws(s) server address to the websocket endpoint.
pub fn websocket_url(server_url: &str) -> Result<String> {
    let mut url = Url::parse(server_url.trim())
        .with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("unsupported server url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot use scheme {scheme} for {server_url}"))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url.to_string())
}

struct LinkState {
    generation: u64,
    driver: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct TransportShared {
    url: String,
    connector: Arc<dyn SocketConnector>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    link: Mutex<LinkState>,
    subscribers: Arc<SubscriberRegistry>,
}

#[derive(Clone)]
pub struct TransportConnection {
    shared: Arc<TransportShared>,
}

impl TransportConnection {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn SocketConnector>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(TransportShared {
                url: url.into(),
                connector,
                policy,
                state,
                link: Mutex::new(LinkState {
                    generation: 0,
                    driver: None,
                    outbound: None,
                }),
                subscribers: Arc::new(SubscriberRegistry::default()),
            }),
        }
    }

    pub fn websocket(server_url: &str, policy: ReconnectPolicy) -> Result<Self> {
        Ok(Self::new(
            websocket_url(server_url)?,
            Arc::new(WsConnector),
            policy,
        ))
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Starts connecting unless an attempt or a live connection already exists.
    pub fn connect(&self) {
        let mut link = lock(&self.shared.link);
        if link.driver.as_ref().is_some_and(|driver| !driver.is_finished()) {
            debug!(url = %self.shared.url, "connect ignored; connection already active");
            return;
        }
        link.generation += 1;
        let generation = link.generation;
        self.shared.state.send_replace(ConnectionState::Connecting);
        let shared = Arc::clone(&self.shared);
        link.driver = Some(tokio::spawn(shared.drive(generation)));
    }

    /// Closes the connection and cancels any pending reconnect.
    pub fn disconnect(&self) {
        let driver = {
            let mut link = lock(&self.shared.link);
            link.generation += 1;
            link.outbound = None;
            link.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        let previous = self
            .shared
            .state
            .send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(url = %self.shared.url, "transport disconnected by client");
            self.shared.subscribers.dispatch(&TransportEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
    }

    pub fn send(&self, request: &ClientRequest) -> Result<(), SessionError> {
        let frame = serde_json::to_string(request).map_err(|err| {
            SessionError::validation(format!("cannot encode {}: {err}", request.name()))
        })?;
        let link = lock(&self.shared.link);
        let outbound = match (&link.outbound, *self.shared.state.borrow()) {
            (Some(outbound), ConnectionState::Connected) => outbound,
            _ => return Err(SessionError::transport("not connected")),
        };
        outbound
            .send(frame)
            .map_err(|_| SessionError::transport("socket closed"))?;
        debug!(event = request.name(), "request sent");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self, event_name: &str, handler: EventHandler) -> Subscription {
        self.shared.subscribers.subscribe(event_name, handler)
    }
}

impl ServerLink for TransportConnection {
    fn connect(&self) {
        TransportConnection::connect(self);
    }

    fn disconnect(&self) {
        TransportConnection::disconnect(self);
    }

    fn send(&self, request: &ClientRequest) -> Result<(), SessionError> {
        TransportConnection::send(self, request)
    }

    fn state(&self) -> ConnectionState {
        TransportConnection::state(self)
    }

    fn subscribe(&self, event_name: &str, handler: EventHandler) -> Subscription {
        TransportConnection::subscribe(self, event_name, handler)
    }
}

impl TransportShared {
    async fn drive(self: Arc<Self>, generation: u64) {
        let mut retries = 0u32;
        loop {
            if !self.transition(generation, ConnectionState::Connecting, None) {
                return;
            }
            match self.connector.open(&self.url).await {
                Ok(SocketLink {
                    outbound,
                    mut inbound,
                }) => {
                    retries = 0;
                    if !self.transition(generation, ConnectionState::Connected, Some(outbound)) {
                        return;
                    }
                    info!(url = %self.url, "transport connected");
                    self.subscribers.dispatch(&TransportEvent::Connected);

                    while let Some(frame) = inbound.recv().await {
                        match serde_json::from_str::<ServerEvent>(&frame) {
                            Ok(event) => {
                                debug!(event = event.name(), "server event received");
                                self.subscribers.dispatch(&TransportEvent::Server(event));
                            }
                            Err(err) => {
                                warn!(error = %err, "dropping undecodable server frame");
                            }
                        }
                    }

                    if !self.transition(generation, ConnectionState::Disconnected, None) {
                        return;
                    }
                    warn!(url = %self.url, "transport connection lost");
                    self.subscribers.dispatch(&TransportEvent::Disconnected {
                        reason: "connection closed".to_string(),
                    });
                }
                Err(err) => {
                    if !self.transition(generation, ConnectionState::Disconnected, None) {
                        return;
                    }
                    warn!(
                        url = %self.url,
                        attempt = retries + 1,
                        error = %err,
                        "transport connection attempt failed"
                    );
                    self.subscribers.dispatch(&TransportEvent::Unreachable {
                        attempt: retries + 1,
                        error: format!("{err:#}"),
                    });
                }
            }

            if retries >= self.policy.max_attempts {
                warn!(
                    url = %self.url,
                    attempts = retries,
                    "reconnect attempts exhausted; staying disconnected"
                );
                return;
            }
            retries += 1;
            tokio::time::sleep(self.policy.delay).await;
            if !self.is_current(generation) {
                return;
            }
            self.subscribers
                .dispatch(&TransportEvent::Reconnecting { attempt: retries });
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.link).generation == generation
    }

    /// Applies a state change made by the driver of `generation`. Returns
    /// `false` when the driver has been superseded by `disconnect`/`connect`.
    fn transition(
        &self,
        generation: u64,
        state: ConnectionState,
        outbound: Option<mpsc::UnboundedSender<String>>,
    ) -> bool {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return false;
        }
        link.outbound = outbound;
        self.state.send_replace(state);
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
