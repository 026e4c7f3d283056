//! Engagement analytics: batching, durable retry and impression tracking.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use dashmap::DashSet;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::SharedClock,
    config::{DeviceProfile, RuntimeConfig},
    dao::event_store::EventStore,
    dom::{GAME_ID_ATTR, NodeId},
    dto::{
        analytics::{AnalyticsEvent, AssetType, DeviceClass, EventType},
        format_timestamp,
        ws::OutboundMessage,
    },
    error::TransportError,
    services::{connection::ConnectionManager, overrides::Variant},
    state::SharedRuntime,
};

/// Visible fraction at which a card counts as seen.
pub const IMPRESSION_THRESHOLD: f64 = 0.5;
/// Most recent undelivered events kept per channel.
pub const STORAGE_CAP: usize = 1000;

/// Where batches are delivered.
pub trait BatchSink: Send + Sync {
    /// Whether a delivery attempt is worth making right now.
    fn is_available(&self) -> bool;

    /// Deliver one batch message. Resolves only once the message has left the process, so an
    /// error means the batch was not delivered.
    fn send(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), TransportError>>;
}

impl BatchSink for ConnectionManager {
    fn is_available(&self) -> bool {
        self.is_connected()
    }

    fn send(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.send_confirmed(message))
    }
}

/// Thresholds and storage key of one batch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Events that trigger an immediate flush.
    pub batch_size: usize,
    /// Longest an event waits in the buffer.
    pub max_wait: Duration,
    /// Storage key for undelivered events.
    pub storage_key: &'static str,
}

/// The two analytics streams the backend accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchChannel {
    /// Asset engagement events.
    Asset,
    /// Experiment exposure events.
    Experiment,
}

impl BatchChannel {
    /// Thresholds for this channel.
    pub fn policy(self) -> BatchPolicy {
        match self {
            BatchChannel::Asset => BatchPolicy {
                batch_size: 50,
                max_wait: Duration::from_secs(5),
                storage_key: "cardsync_analytics_pending_events",
            },
            BatchChannel::Experiment => BatchPolicy {
                batch_size: 10,
                max_wait: Duration::from_secs(5),
                storage_key: "cardsync_abtest_pending_events",
            },
        }
    }

    fn message(self, events: Vec<AnalyticsEvent>) -> OutboundMessage {
        match self {
            BatchChannel::Asset => OutboundMessage::AnalyticsEventBatch { events },
            BatchChannel::Experiment => OutboundMessage::AbtestAnalyticsBatch { events },
        }
    }
}

/// Size- and time-bounded buffer in front of a [`BatchSink`].
///
/// Undeliverable batches are appended to the [`EventStore`] under the channel key and replayed
/// once by [`BatchDispatcher::replay_pending`].
#[derive(Clone)]
pub struct BatchDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    channel: BatchChannel,
    policy: BatchPolicy,
    sink: Arc<dyn BatchSink>,
    store: Arc<dyn EventStore>,
    clock: SharedClock,
    state: Mutex<BatchState>,
    persist_gate: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct BatchState {
    buffer: Vec<AnalyticsEvent>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl BatchState {
    /// Take the whole buffer and disarm the pending timer.
    fn take_batch(&mut self) -> Vec<AnalyticsEvent> {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut self.buffer)
    }
}

impl BatchDispatcher {
    /// Dispatcher for `channel`, persisting undelivered batches to `store`.
    pub fn new(
        channel: BatchChannel,
        sink: Arc<dyn BatchSink>,
        store: Arc<dyn EventStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                channel,
                policy: channel.policy(),
                sink,
                store,
                clock,
                state: Mutex::new(BatchState::default()),
                persist_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Buffer `event`, flushing immediately once the batch size is reached.
    pub async fn enqueue(&self, event: AnalyticsEvent) {
        let ready = {
            let mut state = self.inner.state();
            state.buffer.push(event);
            if state.buffer.len() >= self.inner.policy.batch_size {
                Some(state.take_batch())
            } else {
                if state.timer.is_none() {
                    state.timer = Some(self.arm_timer(state.generation));
                }
                None
            }
        };

        if let Some(batch) = ready {
            self.inner.deliver(batch).await;
        }
    }

    /// Deliver everything buffered now.
    pub async fn flush(&self) {
        let batch = self.inner.state().take_batch();
        if !batch.is_empty() {
            self.inner.deliver(batch).await;
        }
    }

    /// Move stored events back into the buffer and flush them.
    ///
    /// The store is cleared before delivery, so a failed delivery persists the events again
    /// exactly once.
    pub async fn replay_pending(&self) {
        let key = self.inner.policy.storage_key;
        let stored = {
            let _gate = self.inner.persist_gate.lock().await;
            let stored = match self.inner.store.load(key).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(key, error = %err, "failed to load pending analytics");
                    return;
                }
            };
            if stored.is_empty() {
                return;
            }
            if let Err(err) = self.inner.store.clear(key).await {
                warn!(key, error = %err, "failed to clear pending analytics; skipping replay");
                return;
            }
            stored
        };

        info!(key, count = stored.len(), "replaying pending analytics");
        self.inner.state().buffer.extend(stored);
        self.flush().await;
    }

    /// Number of events waiting in memory.
    pub fn buffered(&self) -> usize {
        self.inner.state().buffer.len()
    }

    /// Disarm the timer. Buffered events are kept.
    pub fn shutdown(&self) {
        if let Some(timer) = self.inner.state().timer.take() {
            timer.abort();
        }
    }

    fn arm_timer(&self, generation: u64) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let wait = inner.clock.sleep(inner.policy.max_wait);
        tokio::spawn(async move {
            wait.await;
            let batch = {
                let mut state = inner.state();
                if state.generation != generation {
                    return;
                }
                // Release our own handle so taking the batch does not abort this task.
                state.timer = None;
                state.take_batch()
            };
            if !batch.is_empty() {
                inner.deliver(batch).await;
            }
        })
    }
}

impl DispatcherInner {
    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn deliver(&self, batch: Vec<AnalyticsEvent>) {
        let count = batch.len();
        if self.sink.is_available() {
            match self.sink.send(self.channel.message(batch.clone())).await {
                Ok(()) => {
                    debug!(channel = ?self.channel, count, "analytics batch sent");
                    return;
                }
                Err(err) => {
                    warn!(channel = ?self.channel, count, error = %err, "analytics batch failed; persisting");
                }
            }
        } else {
            debug!(channel = ?self.channel, count, "transport unavailable; persisting analytics");
        }
        self.persist(batch).await;
    }

    /// Append `batch` to the durable store, keeping the most recent events.
    async fn persist(&self, batch: Vec<AnalyticsEvent>) {
        let key = self.policy.storage_key;
        let _gate = self.persist_gate.lock().await;
        let mut stored = match self.store.load(key).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(key, error = %err, "pending analytics unreadable; starting over");
                Vec::new()
            }
        };
        stored.extend(batch);
        if stored.len() > STORAGE_CAP {
            let excess = stored.len() - STORAGE_CAP;
            stored.drain(..excess);
        }
        let count = stored.len();
        if let Err(err) = self.store.save(key, stored).await {
            warn!(key, count, error = %err, "failed to persist analytics; events dropped");
        }
    }
}

/// Builds events for the current session and routes them to the right channel.
#[derive(Clone)]
pub struct Analytics {
    enabled: bool,
    session_id: String,
    device: DeviceProfile,
    clock: SharedClock,
    assets: BatchDispatcher,
    experiments: BatchDispatcher,
    impressions: Arc<DashSet<NodeId>>,
}

impl Analytics {
    /// Analytics pipeline for one runtime session.
    pub fn new(
        config: &RuntimeConfig,
        session_id: String,
        sink: Arc<dyn BatchSink>,
        store: Arc<dyn EventStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            enabled: config.analytics_enabled,
            session_id,
            device: config.device.clone(),
            assets: BatchDispatcher::new(BatchChannel::Asset, sink.clone(), store.clone(), clock.clone()),
            experiments: BatchDispatcher::new(BatchChannel::Experiment, sink, store, clock.clone()),
            clock,
            impressions: Arc::new(DashSet::new()),
        }
    }

    /// Whether events are recorded at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Asset event dispatcher.
    pub fn assets(&self) -> &BatchDispatcher {
        &self.assets
    }

    /// Experiment event dispatcher.
    pub fn experiments(&self) -> &BatchDispatcher {
        &self.experiments
    }

    /// Structured event with the device context merged under `data`.
    pub fn build_event(
        &self,
        event_type: EventType,
        game_id: &str,
        asset_type: AssetType,
        asset_url: Option<&str>,
        variant: Option<Variant>,
        metadata: Map<String, Value>,
    ) -> AnalyticsEvent {
        let device = DeviceClass::from_user_agent(&self.device.user_agent);
        let mut data = Map::new();
        data.insert("viewportWidth".into(), json!(self.device.viewport_width));
        data.insert("viewportHeight".into(), json!(self.device.viewport_height));
        data.insert("deviceType".into(), json!(device));
        data.insert("isTouchDevice".into(), json!(self.device.touch));
        data.extend(metadata);

        AnalyticsEvent {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            game_id: game_id.to_string(),
            event_type,
            asset_type,
            asset_url: asset_url.unwrap_or_default().to_string(),
            session_id: self.session_id.clone(),
            device,
            variant,
            timestamp: format_timestamp(self.clock.now()),
            data,
        }
    }

    /// Queue an asset event.
    pub async fn track_event(
        &self,
        event_type: EventType,
        game_id: &str,
        asset_type: AssetType,
        asset_url: Option<&str>,
        metadata: Map<String, Value>,
    ) {
        let event = self.build_event(event_type, game_id, asset_type, asset_url, None, metadata);
        self.assets.enqueue(event).await;
    }

    /// Queue an experiment event tagged with `variant`.
    pub async fn track_experiment_event(
        &self,
        event_type: EventType,
        game_id: &str,
        asset_type: AssetType,
        asset_url: Option<&str>,
        variant: Variant,
        metadata: Map<String, Value>,
    ) {
        let event = self.build_event(event_type, game_id, asset_type, asset_url, Some(variant), metadata);
        self.experiments.enqueue(event).await;
    }

    /// Whether a visibility change on `node` starts a new impression.
    ///
    /// Each visibility session yields at most one impression; falling below the threshold ends
    /// the session.
    pub fn impression_due(&self, node: NodeId, ratio: f64) -> bool {
        if ratio >= IMPRESSION_THRESHOLD {
            self.impressions.insert(node)
        } else {
            self.impressions.remove(&node);
            false
        }
    }

    /// Send whatever both channels have buffered.
    pub async fn flush_all(&self) {
        self.assets.flush().await;
        self.experiments.flush().await;
    }

    /// Resend batches stored while the connection was down.
    pub async fn replay_pending(&self) {
        self.assets.replay_pending().await;
        self.experiments.replay_pending().await;
    }

    /// Cancel pending flush timers.
    pub fn shutdown(&self) {
        self.assets.shutdown();
        self.experiments.shutdown();
    }
}

/// Record an engagement for `game_id`, plus an experiment event while the game is bucketed.
///
/// Nothing is recorded while analytics is disabled, for games the backend has not described,
/// or for games whose own analytics flag is off.
pub async fn record(
    runtime: &SharedRuntime,
    event_type: EventType,
    game_id: &str,
    asset_type: AssetType,
    asset_url: Option<&str>,
    metadata: Map<String, Value>,
) {
    let analytics = runtime.analytics();
    if !analytics.enabled() {
        return;
    }
    match runtime.game(game_id) {
        Some(game) if game.analytics => {}
        Some(_) => {
            debug!(game_id, "analytics disabled for game");
            return;
        }
        None => {
            debug!(game_id, ?event_type, "dropping analytics for unknown game");
            return;
        }
    }

    let variant = runtime.overrides().read().await.experiments().variant_for(game_id);
    if let Some(variant) = variant {
        analytics
            .track_experiment_event(event_type, game_id, asset_type, asset_url, variant, metadata.clone())
            .await;
    }
    analytics
        .track_event(event_type, game_id, asset_type, asset_url, metadata)
        .await;
}

/// Report the visible fraction of a card (or any node inside one) as seen by the host.
pub async fn observe_visibility(runtime: &SharedRuntime, node: NodeId, ratio: f64) {
    let card = {
        let document = runtime.document().read().await;
        document
            .closest(node, |element| element.attribute(GAME_ID_ATTR).is_some())
            .and_then(|card| {
                document
                    .attribute(card, GAME_ID_ATTR)
                    .map(|game_id| (card, game_id.to_string()))
            })
    };
    let Some((card, game_id)) = card else {
        return;
    };
    if !runtime.analytics().impression_due(card, ratio) {
        return;
    }

    let (asset_type, url) = match runtime.store().get(&game_id) {
        Some(state) if state.animate_enabled && state.video_url.is_some() => {
            (AssetType::Video, state.video_url)
        }
        Some(state) => (AssetType::Image, state.poster_url),
        None => (AssetType::Image, None),
    };
    let mut metadata = Map::new();
    metadata.insert("visibility_ratio".into(), json!(ratio));
    record(runtime, EventType::Impression, &game_id, asset_type, url.as_deref(), metadata).await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use time::macros::datetime;

    use super::*;
    use crate::{
        clock::VirtualClock,
        dao::event_store::MemoryEventStore,
        dom::{Document, markup::MarkupNode},
        dto::game::GameRecord,
        services::transport::memory,
        state::{testing, video_store::VisualStateInit},
    };

    #[derive(Default)]
    struct RecordingSink {
        available: AtomicBool,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingSink {
        fn online() -> Arc<Self> {
            let sink = Arc::new(Self::default());
            sink.available.store(true, Ordering::SeqCst);
            sink
        }

        fn batches(&self) -> Vec<Vec<AnalyticsEvent>> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|message| match message {
                    OutboundMessage::AnalyticsEventBatch { events }
                    | OutboundMessage::AbtestAnalyticsBatch { events } => events.clone(),
                    other => panic!("unexpected message {other:?}"),
                })
                .collect()
        }
    }

    impl BatchSink for RecordingSink {
        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn send(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), TransportError>> {
            self.sent.lock().unwrap().push(message);
            Box::pin(async { Ok(()) })
        }
    }

    fn analytics(sink: Arc<RecordingSink>, store: Arc<MemoryEventStore>) -> Analytics {
        let clock = VirtualClock::new(datetime!(2024-01-05 10:00 UTC));
        Analytics::new(&RuntimeConfig::default(), "session-1".into(), sink, store, clock)
    }

    fn event(analytics: &Analytics, n: usize) -> AnalyticsEvent {
        let mut metadata = Map::new();
        metadata.insert("n".into(), json!(n));
        analytics.build_event(EventType::HoverStart, "game-1", AssetType::Video, None, None, metadata)
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_flushes_once_and_keeps_remainder() {
        let sink = RecordingSink::online();
        let analytics = analytics(sink.clone(), Arc::new(MemoryEventStore::new()));
        let dispatcher = analytics.experiments();

        for n in 0..12 {
            dispatcher.enqueue(event(&analytics, n)).await;
        }

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(dispatcher.buffered(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 2);
        assert_eq!(dispatcher.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_events_are_replayed_exactly_once() {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryEventStore::new());
        let analytics = analytics(sink.clone(), store.clone());
        let key = BatchChannel::Asset.policy().storage_key;

        for n in 0..3 {
            analytics.assets().enqueue(event(&analytics, n)).await;
        }
        analytics.assets().flush().await;
        assert!(sink.batches().is_empty());
        let stored = store.snapshot(key);
        assert_eq!(stored.len(), 3);

        sink.available.store(true, Ordering::SeqCst);
        analytics.replay_pending().await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], stored);
        assert!(store.snapshot(key).is_empty());

        analytics.replay_pending().await;
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn durable_store_keeps_most_recent_events() {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryEventStore::new());
        let analytics = analytics(sink, store.clone());

        for n in 0..(STORAGE_CAP + 5) {
            analytics.assets().enqueue(event(&analytics, n)).await;
        }
        analytics.assets().flush().await;

        let stored = store.snapshot(BatchChannel::Asset.policy().storage_key);
        assert_eq!(stored.len(), STORAGE_CAP);
        assert_eq!(stored[0].data["n"], json!(5));
        assert_eq!(stored[STORAGE_CAP - 1].data["n"], json!(STORAGE_CAP + 4));
    }

    #[test]
    fn events_carry_device_context() {
        let clock = VirtualClock::new(datetime!(2024-01-05 10:00 UTC));
        let analytics = Analytics::new(
            &RuntimeConfig::default(),
            "session-1".into(),
            RecordingSink::online(),
            Arc::new(MemoryEventStore::new()),
            clock,
        );
        let mut metadata = Map::new();
        metadata.insert("buttonHref".into(), json!("/play"));

        let event = analytics.build_event(
            EventType::ButtonClick,
            "game-1",
            AssetType::Button,
            None,
            Some(Variant::A),
            metadata,
        );

        assert!(event.id.starts_with("evt_"));
        assert_eq!(event.session_id, "session-1");
        assert_eq!(event.device, DeviceClass::Desktop);
        assert_eq!(event.variant, Some(Variant::A));
        assert_eq!(event.data["viewportWidth"], json!(1280));
        assert_eq!(event.data["isTouchDevice"], json!(false));
        assert_eq!(event.data["deviceType"], json!("desktop"));
        assert_eq!(event.data["buttonHref"], json!("/play"));
        assert!(event.timestamp.starts_with("2024-01-05T10:00:00"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_dropped_with_the_transport_is_stored_then_replayed() {
        let (connector, mut listener) = memory::pair();
        let clock = VirtualClock::new(datetime!(2024-01-05 10:00 UTC));
        let connection = ConnectionManager::new(Arc::new(connector), clock.clone());
        let store = Arc::new(MemoryEventStore::new());
        let analytics = Analytics::new(
            &RuntimeConfig::default(),
            "session-1".into(),
            Arc::new(connection.clone()),
            store.clone(),
            clock,
        );
        let key = BatchChannel::Asset.policy().storage_key;

        connection.connect();
        let mut server = listener.accept().await.unwrap();
        server.expect_event("sdk-event").await.unwrap();
        server.expect_event("sdk-event").await.unwrap();

        // The pump has not seen the peer go away yet, so the batch is handed to it.
        drop(server);
        let lost = event(&analytics, 0);
        let lost_id = lost.id.clone();
        analytics.assets().enqueue(lost).await;
        analytics.assets().flush().await;

        let stored = store.snapshot(key);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, lost_id);

        let mut server = listener.accept().await.unwrap();
        server.expect_event("sdk-event").await.unwrap();
        analytics.replay_pending().await;

        let batch = server.expect_event("analytics-event-batch").await.unwrap();
        assert_eq!(batch["data"]["events"].as_array().unwrap().len(), 1);
        assert_eq!(batch["data"]["events"][0]["id"], json!(lost_id));
        assert!(store.snapshot(key).is_empty());
        connection.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_logs_one_impression_per_session() {
        let harness = testing::harness(Document::from_markup(&[MarkupNode::new("div")
            .attr(GAME_ID_ATTR, "g1")
            .child(MarkupNode::new("img").attr("src", "g1.jpg"))]));
        let runtime = &harness.runtime;
        let (card, image) = {
            let document = runtime.document().read().await;
            let card = document.game_cards()[0].0;
            (card, document.placeholder(card).unwrap())
        };
        runtime.upsert_game(GameRecord::new("g1"));
        runtime.store().set_state(
            "g1",
            VisualStateInit {
                poster_url: Some("g1.jpg".into()),
                ..Default::default()
            },
        );

        observe_visibility(runtime, image, 0.3).await;
        observe_visibility(runtime, image, 0.8).await;
        observe_visibility(runtime, card, 1.0).await;
        observe_visibility(runtime, card, 0.1).await;
        observe_visibility(runtime, card, 0.6).await;
        runtime.analytics().flush_all().await;

        let stored = harness.events.snapshot(BatchChannel::Asset.policy().storage_key);
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|event| event.event_type == EventType::Impression));
        assert_eq!(stored[0].asset_type, AssetType::Image);
        assert_eq!(stored[0].asset_url, "g1.jpg");
        assert_eq!(stored[0].data["visibility_ratio"], json!(0.8));
        assert_eq!(stored[1].data["visibility_ratio"], json!(0.6));
        assert!(stored[0].data.get("visibleRatio").is_none());
    }

    #[test]
    fn one_impression_per_visibility_session() {
        let analytics = analytics(RecordingSink::online(), Arc::new(MemoryEventStore::new()));
        let node = crate::dom::Document::new().root();

        assert!(!analytics.impression_due(node, 0.2));
        assert!(analytics.impression_due(node, 0.6));
        assert!(!analytics.impression_due(node, 0.9));
        assert!(!analytics.impression_due(node, 0.1));
        assert!(analytics.impression_due(node, 0.5));
    }
}
