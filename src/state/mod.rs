//! Runtime context owning every component of a live page.

pub mod lifecycle;
pub mod video_store;

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::{
    sync::{Notify, RwLock, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    clock::SharedClock,
    config::{RuntimeConfig, generate_session_id},
    dao::event_store::EventStore,
    dom::Document,
    dto::{
        catalog::OverrideRecord,
        game::GameRecord,
        ws::{AbTestsPayload, GamesPayload, InboundMessage, PromotionsPayload},
    },
    error::RuntimeError,
    services::{
        analytics::{Analytics, BatchSink},
        connection::{ConnectionEvent, ConnectionManager},
        discovery::{self, DiscoveryState},
        event_bus::SubscriptionId,
        interaction::InteractionState,
        overrides::{CatalogOutcome, Overrides},
        resolution::ResolvedAsset,
        transport::Connector,
        update::{self, UpdateState},
    },
};

pub use self::video_store::{GameVisualState, VideoStateStore, VisualSnapshot};

/// Runtime handle shared by services and background tasks.
pub type SharedRuntime = Arc<Runtime>;

/// Collaborators injected by the host integration.
pub struct RuntimeDeps {
    /// Opens push transports.
    pub connector: Arc<dyn Connector>,
    /// Durable storage for undelivered analytics and the session id.
    pub event_store: Arc<dyn EventStore>,
    /// Time source for every timer.
    pub clock: SharedClock,
}

/// Explicit context passed to every service instead of page-global state.
pub struct Runtime {
    config: RuntimeConfig,
    session_id: String,
    clock: SharedClock,
    document: RwLock<Document>,
    store: VideoStateStore,
    games: DashMap<String, GameRecord>,
    overrides: RwLock<Overrides>,
    connection: ConnectionManager,
    analytics: Analytics,
    discovery: DiscoveryState,
    updates: UpdateState,
    interaction: InteractionState,
    media_ready: Notify,
    listener: Mutex<Option<SubscriptionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build the context without starting anything.
    pub fn new(config: RuntimeConfig, document: Document, deps: RuntimeDeps) -> SharedRuntime {
        let RuntimeDeps {
            connector,
            event_store,
            clock,
        } = deps;
        let session_id = config.session_id_or_generate(clock.now());
        let connection = ConnectionManager::new(connector, clock.clone());
        let sink: Arc<dyn BatchSink> = Arc::new(connection.clone());
        let analytics = Analytics::new(&config, session_id.clone(), sink, event_store, clock.clone());

        Arc::new(Self {
            overrides: RwLock::new(Overrides::new(Some(session_id.clone()))),
            session_id,
            clock,
            document: RwLock::new(document),
            store: VideoStateStore::new(),
            games: DashMap::new(),
            connection,
            analytics,
            discovery: DiscoveryState::default(),
            updates: UpdateState::default(),
            interaction: InteractionState::default(),
            media_ready: Notify::new(),
            listener: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Build the context, discover the tagged cards and open the push connection.
    ///
    /// Without a configured session id, the id saved by an earlier run is reused so the
    /// visitor keeps its experiment buckets.
    pub async fn init(
        mut config: RuntimeConfig,
        document: Document,
        deps: RuntimeDeps,
    ) -> Result<SharedRuntime, RuntimeError> {
        if config.application_key.as_deref().is_none_or(str::is_empty) {
            return Err(RuntimeError::MissingApplicationKey);
        }
        if config.session_id.as_deref().is_none_or(str::is_empty) {
            let session_id = restore_session_id(deps.event_store.as_ref(), deps.clock.now()).await;
            config.session_id = Some(session_id);
        }

        let runtime = Self::new(config, document, deps);
        runtime.start_event_loop();
        let discovered = discovery::scan(&runtime).await;
        runtime.connection.connect();
        info!(
            session_id = %runtime.session_id,
            discovered,
            "runtime started"
        );
        Ok(runtime)
    }

    /// Flush analytics, close the connection and stop every background task.
    pub async fn teardown(&self) {
        self.analytics.flush_all().await;
        self.connection.disconnect().await;
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            self.connection.events().off(id);
        }
        self.analytics.shutdown();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        info!(session_id = %self.session_id, "runtime stopped");
    }

    /// Configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Session id used for analytics and experiment bucketing.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Shared time source.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Mirror of the host page.
    pub fn document(&self) -> &RwLock<Document> {
        &self.document
    }

    /// Visual state of every discovered card.
    pub fn store(&self) -> &VideoStateStore {
        &self.store
    }

    /// Push connection to the backend.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Analytics recorder.
    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    /// Promotion and experiment catalogs.
    pub fn overrides(&self) -> &RwLock<Overrides> {
        &self.overrides
    }

    /// Discovery bookkeeping.
    pub fn discovery(&self) -> &DiscoveryState {
        &self.discovery
    }

    /// Update bookkeeping.
    pub fn updates(&self) -> &UpdateState {
        &self.updates
    }

    /// Interaction bookkeeping.
    pub fn interaction(&self) -> &InteractionState {
        &self.interaction
    }

    /// Signalled whenever the host reports a media element ready.
    pub fn media_ready(&self) -> &Notify {
        &self.media_ready
    }

    /// Latest backend record for `game_id`.
    pub fn game(&self, game_id: &str) -> Option<GameRecord> {
        self.games.get(game_id).map(|entry| entry.value().clone())
    }

    /// Store the latest backend record for a game.
    pub fn upsert_game(&self, game: GameRecord) {
        self.games.insert(game.id.clone(), game);
    }

    /// Asset `game` should show given the active overrides.
    pub async fn resolve(&self, game: &GameRecord) -> ResolvedAsset {
        self.overrides.read().await.resolve(game)
    }

    /// Spawn a background task that is aborted on teardown.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(future));
    }

    /// Forward connection events into a single ordered consumer.
    fn start_event_loop(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.connection.events().on_any(move |event: &ConnectionEvent| {
            let _ = tx.send(event.clone());
        });
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);

        let runtime = self.clone();
        self.spawn(async move {
            while let Some(event) = rx.recv().await {
                handle_connection_event(&runtime, event).await;
            }
        });
    }
}

async fn handle_connection_event(runtime: &SharedRuntime, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected => {
            let analytics = runtime.analytics().clone();
            runtime.spawn(async move { analytics.replay_pending().await });
        }
        ConnectionEvent::Disconnected { reason } => {
            info!(%reason, "push connection down; cards keep their current assets");
        }
        ConnectionEvent::Error { message } => {
            warn!(%message, "push connection error");
        }
        ConnectionEvent::Message(message) => handle_message(runtime, message).await,
    }
}

async fn handle_message(runtime: &SharedRuntime, message: InboundMessage) {
    match message {
        InboundMessage::GamesResponse(payload) | InboundMessage::GamesUpdated(payload) => {
            apply_games(runtime, payload).await;
        }
        InboundMessage::PromotionsResponse(payload) | InboundMessage::PromotionsUpdated(payload) => {
            apply_promotions(runtime, payload).await;
        }
        InboundMessage::AbTestsResponse(payload) | InboundMessage::AbTestsUpdated(payload) => {
            apply_experiments(runtime, payload).await;
        }
        InboundMessage::RoomCounts(payload) => {
            info!(rooms = ?payload.room_counts, "room membership counts");
        }
        InboundMessage::Unknown(event) => {
            debug!(%event, "ignoring unhandled push event");
        }
    }
}

/// Store pushed games and route each one to discovery or the update machine.
async fn apply_games(runtime: &SharedRuntime, payload: GamesPayload) {
    if !payload.success {
        warn!(error = ?payload.error, "backend rejected games request");
        return;
    }

    let learned = {
        let document = runtime.document.read().await;
        let mut overrides = runtime.overrides.write().await;
        overrides.learn_games(&payload.games, &document, runtime.clock.now())
    };

    for game in payload.games {
        debug!(game_id = %game.id, version = %game.version, published = game.published, "game data received");
        let game_id = game.id.clone();
        runtime.upsert_game(game.clone());
        if discovery::on_game_data(runtime, &game) {
            continue;
        }
        spawn_update(runtime, game_id);
    }

    if let Some(outcome) = learned {
        handle_catalog_outcome(runtime, outcome);
    }
}

async fn apply_promotions(runtime: &SharedRuntime, payload: PromotionsPayload) {
    if !payload.success {
        warn!("backend rejected promotions request");
        return;
    }
    let Some(records) = payload.promotions else {
        debug!("promotions changed; refetching catalogs");
        refetch_catalogs(runtime);
        return;
    };

    let records: Vec<OverrideRecord> = records.into_iter().map(Into::into).collect();
    let outcome = {
        let document = runtime.document.read().await;
        let mut overrides = runtime.overrides.write().await;
        overrides.apply_promotions(records, &document, runtime.clock.now())
    };
    handle_catalog_outcome(runtime, outcome);
}

async fn apply_experiments(runtime: &SharedRuntime, payload: AbTestsPayload) {
    if !payload.success {
        warn!("backend rejected experiments request");
        return;
    }
    let Some(records) = payload.abtests else {
        debug!("experiments changed; refetching catalogs");
        refetch_catalogs(runtime);
        return;
    };

    let records: Vec<OverrideRecord> = records.into_iter().map(Into::into).collect();
    let outcome = {
        let document = runtime.document.read().await;
        let mut overrides = runtime.overrides.write().await;
        overrides.apply_experiments(records, &document, runtime.clock.now())
    };
    handle_catalog_outcome(runtime, outcome);
}

/// Refresh rendered cards carrying an override and re-request every game that changed hands.
fn handle_catalog_outcome(runtime: &SharedRuntime, outcome: CatalogOutcome) {
    for game_id in outcome.applied.iter().chain(&outcome.reverted) {
        if runtime.store.contains(game_id) {
            spawn_update(runtime, game_id.clone());
        }
    }

    let targets = outcome.refresh_targets();
    if targets.is_empty() {
        return;
    }
    debug!(games = ?targets, "re-requesting games affected by override change");
    if let Err(err) = runtime.connection.request_games(targets) {
        debug!(error = %err, "could not re-request games after override change");
    }
}

fn refetch_catalogs(runtime: &SharedRuntime) {
    let result = runtime
        .connection
        .request_catalogs()
        .and_then(|()| runtime.connection.request_games(runtime.connection.registered_games()));
    if let Err(err) = result {
        debug!(error = %err, "could not refetch catalogs");
    }
}

fn spawn_update(runtime: &SharedRuntime, game_id: String) {
    let task_runtime = runtime.clone();
    runtime.spawn(async move {
        update::request(&task_runtime, &game_id).await;
    });
}

/// Session id saved by an earlier run, or a new one that is saved for the next.
async fn restore_session_id(store: &dyn EventStore, now: OffsetDateTime) -> String {
    match store.load_session().await {
        Ok(Some(session_id)) if !session_id.is_empty() => {
            debug!(%session_id, "reusing stored session id");
            return session_id;
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "stored session id unreadable; starting a new session"),
    }

    let session_id = generate_session_id(now);
    if let Err(err) = store.save_session(&session_id).await {
        warn!(error = %err, "failed to store session id; it will not survive a restart");
    }
    session_id
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use time::macros::datetime;

    use super::{Runtime, RuntimeDeps, SharedRuntime};
    use crate::{
        clock::VirtualClock,
        config::{RuntimeConfig, generate_session_id},
        dao::event_store::MemoryEventStore,
        dom::Document,
        services::transport::memory::{self, MemoryListener},
    };

    /// Runtime wired to in-memory collaborators, not yet started.
    pub struct Harness {
        pub runtime: SharedRuntime,
        pub listener: MemoryListener,
        pub clock: Arc<VirtualClock>,
        pub events: Arc<MemoryEventStore>,
    }

    pub fn harness(document: Document) -> Harness {
        harness_with(document, |_| {})
    }

    pub fn harness_with<F>(document: Document, configure: F) -> Harness
    where
        F: FnOnce(&mut RuntimeConfig),
    {
        let mut config = RuntimeConfig {
            application_key: Some("test-key".into()),
            session_id: Some("session-test".into()),
            ..RuntimeConfig::default()
        };
        configure(&mut config);

        let (connector, listener) = memory::pair();
        let clock = VirtualClock::new(datetime!(2024-01-05 10:00 UTC));
        let events = Arc::new(MemoryEventStore::new());
        let runtime = Runtime::new(
            config,
            document,
            RuntimeDeps {
                connector: Arc::new(connector),
                event_store: events.clone(),
                clock: clock.clone(),
            },
        );
        Harness {
            runtime,
            listener,
            clock,
            events,
        }
    }
}
