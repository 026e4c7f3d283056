//! Persistent, auto-reconnecting push connection to the backend.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashSet;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    clock::SharedClock,
    dto::ws::{InboundMessage, OutboundMessage, SdkRequest},
    error::TransportError,
    services::{
        event_bus::{EventBus, Topic},
        transport::{Connector, Transport},
    },
};

/// Attempts made before the supervisor gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Fixed delay between attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Local events published by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A transport was established.
    Connected,
    /// The transport dropped.
    Disconnected {
        /// Why the connection ended.
        reason: String,
    },
    /// A frame failed to send or decode.
    Error {
        /// Description of the failure.
        message: String,
    },
    /// A decoded server message.
    Message(InboundMessage),
}

impl Topic for ConnectionEvent {
    fn topic(&self) -> &str {
        match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Disconnected { .. } => "disconnected",
            ConnectionEvent::Error { .. } => "error",
            ConnectionEvent::Message(message) => message.event_name(),
        }
    }
}

/// Owns the push connection. Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    connector: Arc<dyn Connector>,
    clock: SharedClock,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    bus: EventBus<ConnectionEvent>,
    games: DashSet<String>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// A queued frame, optionally with a channel told once the transport accepted it.
struct Outgoing {
    message: OutboundMessage,
    delivered: Option<oneshot::Sender<Result<(), TransportError>>>,
}

impl Outgoing {
    fn acknowledge(self, result: Result<(), TransportError>) {
        if let Some(delivered) = self.delivered {
            let _ = delivered.send(result);
        }
    }
}

impl ConnectionManager {
    /// Manager that opens transports through `connector`. Nothing connects until [`connect`].
    ///
    /// [`connect`]: ConnectionManager::connect
    pub fn new(connector: Arc<dyn Connector>, clock: SharedClock) -> Self {
        let (shutdown, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                connector,
                clock,
                connected: AtomicBool::new(false),
                outbound: Mutex::new(None),
                bus: EventBus::new(),
                games: DashSet::new(),
                supervisor: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Start the connection supervisor. No-op while a supervisor is already running.
    pub fn connect(&self) {
        let mut supervisor = self.inner.supervisor();
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("connect called while already connected or connecting");
            return;
        }

        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();
        *supervisor = Some(tokio::spawn(supervise(self.inner.clone(), shutdown)));
    }

    /// Close the transport and stop reconnecting. Registered games are kept.
    pub async fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        let task = self.inner.supervisor().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "connection supervisor ended abnormally");
        }
    }

    /// Whether a transport is currently established.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Bus carrying [`ConnectionEvent`]s; use `on`/`on_any`/`off` to listen.
    pub fn events(&self) -> &EventBus<ConnectionEvent> {
        &self.inner.bus
    }

    /// Queue a message for the live transport.
    pub fn emit(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.inner.emit(message)
    }

    /// Send a message and wait until the transport has written it.
    ///
    /// Fails when no transport is connected, when the write fails, or when the connection drops
    /// while the message is still queued.
    pub async fn send_confirmed(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let (ack, delivered) = oneshot::channel();
        self.inner.enqueue(Outgoing {
            message,
            delivered: Some(ack),
        })?;
        delivered.await.unwrap_or_else(|_| {
            Err(TransportError::Closed(
                "connection dropped before the frame was sent".into(),
            ))
        })
    }

    /// Track a game so it is (re)requested on every connect. Requests it now if connected.
    pub fn register_game(&self, game_id: &str) {
        if !self.inner.games.insert(game_id.to_string()) {
            return;
        }
        if self.is_connected() {
            let ids = vec![game_id.to_string()];
            let now = self.inner.clock.now();
            let result = self
                .emit(OutboundMessage::join_rooms(ids.clone(), now))
                .and_then(|()| self.emit(OutboundMessage::sdk(SdkRequest::GetGames { game_ids: ids }, now)));
            if let Err(err) = result {
                debug!(game_id, error = %err, "game registered while transport unavailable");
            }
        }
    }

    /// Stop tracking a game and leave its room if connected.
    pub fn unregister_game(&self, game_id: &str) {
        if self.inner.games.remove(game_id).is_none() {
            return;
        }
        if self.is_connected() {
            let now = self.inner.clock.now();
            if let Err(err) = self.emit(OutboundMessage::leave_rooms(vec![game_id.to_string()], now)) {
                debug!(game_id, error = %err, "failed to leave game room");
            }
        }
    }

    /// Registered games, sorted.
    pub fn registered_games(&self) -> Vec<String> {
        self.inner.registered_games()
    }

    /// Ask the backend for the current data of `game_ids`.
    pub fn request_games(&self, game_ids: Vec<String>) -> Result<(), TransportError> {
        if game_ids.is_empty() {
            return Ok(());
        }
        let now = self.inner.clock.now();
        self.emit(OutboundMessage::sdk(SdkRequest::GetGames { game_ids }, now))
    }

    /// Ask the backend for the promotion and experiment catalogs.
    pub fn request_catalogs(&self) -> Result<(), TransportError> {
        self.inner.request_catalogs()
    }

    /// Diagnostic room membership query for the registered games.
    pub fn request_room_counts(&self) -> Result<(), TransportError> {
        self.emit(OutboundMessage::GetRoomCounts {
            game_ids: self.registered_games(),
        })
    }
}

impl ConnectionInner {
    fn supervisor(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Outgoing>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.enqueue(Outgoing {
            message,
            delivered: None,
        })
    }

    fn enqueue(&self, outgoing: Outgoing) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let guard = self.outbound();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(outgoing).map_err(|_| TransportError::NotConnected)
    }

    fn registered_games(&self) -> Vec<String> {
        let mut games: Vec<String> = self.games.iter().map(|id| id.clone()).collect();
        games.sort();
        games
    }

    fn request_catalogs(&self) -> Result<(), TransportError> {
        let now = self.clock.now();
        self.emit(OutboundMessage::sdk(SdkRequest::GetPromotions {}, now))?;
        self.emit(OutboundMessage::sdk(SdkRequest::GetAbTests {}, now))
    }

    /// Join rooms and request data for every registered game, then the catalogs.
    fn resubscribe(&self) -> Result<(), TransportError> {
        let games = self.registered_games();
        if !games.is_empty() {
            let now = self.clock.now();
            self.emit(OutboundMessage::join_rooms(games.clone(), now))?;
            self.emit(OutboundMessage::sdk(SdkRequest::GetGames { game_ids: games }, now))?;
        }
        self.request_catalogs()
    }

    fn set_connected(&self, tx: Option<mpsc::UnboundedSender<Outgoing>>) {
        let connected = tx.is_some();
        *self.outbound() = tx;
        self.connected.store(connected, Ordering::SeqCst);
    }
}

/// Why the pump stopped.
enum PumpExit {
    Shutdown,
    Lost(String),
}

/// Keep a transport alive with bounded retries, publishing lifecycle events on the bus.
async fn supervise(inner: Arc<ConnectionInner>, mut shutdown: watch::Receiver<bool>) {
    let mut failures = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let attempt = tokio::select! {
            result = inner.connector.connect() => result,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok(transport) => {
                failures = 0;
                info!("push connection established");
                let exit = pump(&inner, transport, &mut shutdown).await;
                inner.set_connected(None);
                match exit {
                    PumpExit::Shutdown => {
                        inner.bus.publish(&ConnectionEvent::Disconnected {
                            reason: "client disconnect".into(),
                        });
                        break;
                    }
                    PumpExit::Lost(reason) => {
                        warn!(%reason, "push connection lost; reconnecting");
                        inner.bus.publish(&ConnectionEvent::Disconnected { reason });
                    }
                }
            }
            Err(err) => {
                failures += 1;
                warn!(attempt = failures, error = %err, "push connection attempt failed");
                inner.bus.publish(&ConnectionEvent::Error {
                    message: err.to_string(),
                });
                if failures >= MAX_RECONNECT_ATTEMPTS {
                    warn!(attempts = failures, "giving up on push connection");
                    inner.bus.publish(&ConnectionEvent::Error {
                        message: format!("gave up after {failures} attempts"),
                    });
                    break;
                }
            }
        }

        tokio::select! {
            _ = inner.clock.sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => break,
        }
    }

    inner.set_connected(None);
}

/// Shuttle frames between the outbound queue, the transport and the bus until the transport
/// ends or shutdown is requested.
///
/// Frames still queued when the pump returns are dropped with the queue, which fails their
/// pending acknowledgements.
async fn pump(
    inner: &ConnectionInner,
    mut transport: Box<dyn Transport>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    let (tx, mut rx) = mpsc::unbounded_channel();
    inner.set_connected(Some(tx));
    inner.bus.publish(&ConnectionEvent::Connected);
    if let Err(err) = inner.resubscribe() {
        warn!(error = %err, "failed to queue subscriptions after connect");
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                transport.close().await;
                return PumpExit::Shutdown;
            }
            Some(outgoing) = rx.recv() => {
                let event = outgoing.message.event_name();
                let frame = match serde_json::to_string(&outgoing.message) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(event, error = %err, "failed to encode outbound frame");
                        outgoing.acknowledge(Err(err.into()));
                        continue;
                    }
                };
                if let Err(err) = transport.send(frame).await {
                    let reason = err.to_string();
                    inner.bus.publish(&ConnectionEvent::Error { message: reason.clone() });
                    outgoing.acknowledge(Err(err));
                    return PumpExit::Lost(reason);
                }
                debug!(event, "frame sent");
                outgoing.acknowledge(Ok(()));
            }
            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => match InboundMessage::decode(&text) {
                    Ok(message) => inner.bus.publish(&ConnectionEvent::Message(message)),
                    Err(err) => {
                        warn!(error = %err, "failed to decode inbound frame");
                        inner.bus.publish(&ConnectionEvent::Error {
                            message: TransportError::from(err).to_string(),
                        });
                    }
                },
                Some(Err(err)) => {
                    inner.bus.publish(&ConnectionEvent::Error { message: err.to_string() });
                    return PumpExit::Lost(err.to_string());
                }
                None => return PumpExit::Lost("closed by peer".into()),
            },
        }
    }
}
