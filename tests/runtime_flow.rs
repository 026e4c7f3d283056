use std::{sync::Arc, time::Duration};

use cardsync::{
    clock::VirtualClock,
    config::RuntimeConfig,
    dao::event_store::{EventStore, MemoryEventStore},
    dom::{Document, GAME_ID_ATTR, GROUP_ATTR, markup::MarkupNode},
    dto::analytics::{AnalyticsEvent, AssetType, DeviceClass, EventType},
    error::RuntimeError,
    services::{
        overrides::{Variant, variant::determine_variant},
        resolution::AssetSource,
        transport::memory::{self, MemoryServer},
    },
    state::{Runtime, RuntimeDeps, SharedRuntime, lifecycle::DiscoveryPhase},
};
use serde_json::{Map, json};
use time::macros::datetime;

const PENDING_KEY: &str = "cardsync_analytics_pending_events";
const SESSION: &str = "visitor-0";

fn lobby() -> Document {
    Document::from_markup(&[MarkupNode::new("ul").attr(GROUP_ATTR, "lobby").child(
        MarkupNode::new("li")
            .attr(GAME_ID_ATTR, "g1")
            .child(MarkupNode::new("img").attr("src", "placeholder.jpg")),
    )])
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        application_key: Some("integration-key".into()),
        session_id: Some(SESSION.into()),
        ..RuntimeConfig::default()
    }
}

fn stored_event() -> AnalyticsEvent {
    AnalyticsEvent {
        id: "evt_offline".into(),
        game_id: "g1".into(),
        event_type: EventType::HoverStart,
        asset_type: AssetType::Video,
        asset_url: "g1.mp4".into(),
        session_id: SESSION.into(),
        device: DeviceClass::Desktop,
        variant: None,
        timestamp: "2024-01-04T09:00:00Z".into(),
        data: Map::new(),
    }
}

async fn start(events: Arc<MemoryEventStore>) -> (SharedRuntime, MemoryServer) {
    let (connector, mut listener) = memory::pair();
    let deps = RuntimeDeps {
        connector: Arc::new(connector),
        event_store: events,
        clock: VirtualClock::new(datetime!(2024-01-05 10:00 UTC)),
    };
    let runtime = Runtime::init(config(), lobby(), deps).await.unwrap();
    let server = listener.accept().await.unwrap();
    (runtime, server)
}

#[tokio::test(start_paused = true)]
async fn card_follows_backend_pushes() {
    let events = Arc::new(MemoryEventStore::new());
    events.save(PENDING_KEY, vec![stored_event()]).await.unwrap();
    let (runtime, mut server) = start(events.clone()).await;

    let join = server.expect_event("join-game-rooms").await.unwrap();
    assert_eq!(join["data"]["gameIds"], json!(["g1"]));
    let request = server.expect_event("sdk-event").await.unwrap();
    assert_eq!(request["data"]["event"], "get-games");
    assert_eq!(request["data"]["data"]["gameIds"], json!(["g1"]));

    let replayed = server.expect_event("analytics-event-batch").await.unwrap();
    assert_eq!(replayed["data"]["events"][0]["id"], "evt_offline");
    assert!(events.snapshot(PENDING_KEY).is_empty());

    server.push(
        "games-response",
        json!({
            "success": true,
            "games": [{
                "id": "g1",
                "version": 1,
                "published": true,
                "defaultImage": "g1.jpg",
                "defaultVideo": "g1.mp4"
            }]
        }),
    );
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(runtime.discovery().phase("g1"), Some(DiscoveryPhase::Complete));
    let state = runtime.store().get("g1").unwrap();
    assert_eq!(state.version, "1");
    assert_eq!(state.video_url.as_deref(), Some("g1.mp4"));
    assert!(!state.loading);
    assert!(runtime.interaction().is_attached("g1"));

    server.push(
        "games-updated",
        json!({
            "games": [{
                "id": "g1",
                "version": "2",
                "published": true,
                "defaultImage": "g1-v2.jpg",
                "defaultVideo": "g1-v2.mp4"
            }]
        }),
    );
    tokio::time::sleep(Duration::from_secs(10)).await;

    let state = runtime.store().get("g1").unwrap();
    assert_eq!(state.version, "2");
    assert_eq!(state.poster_url.as_deref(), Some("g1-v2.jpg"));
    assert_eq!(state.video_url.as_deref(), Some("g1-v2.mp4"));
    assert_eq!(state.source, AssetSource::Default);

    server.push(
        "abtests-response",
        json!({
            "success": true,
            "abtests": [{
                "id": "ab-1",
                "group": "lobby",
                "startDate": "2024-01-01",
                "endDate": "2024-01-10",
                "gameId": "g1",
                "imageVariantA": "a.jpg",
                "imageVariantB": "b.jpg",
                "videoVariantA": "a.mp4",
                "videoVariantB": "b.mp4"
            }]
        }),
    );
    tokio::time::sleep(Duration::from_secs(10)).await;

    let expected = determine_variant(Some(SESSION), "g1");
    let expected_video = match expected {
        Variant::A => "a.mp4",
        Variant::B => "b.mp4",
    };
    let state = runtime.store().get("g1").unwrap();
    assert_eq!(state.source, AssetSource::Experiment);
    assert_eq!(state.variant, Some(expected));
    assert_eq!(state.video_url.as_deref(), Some(expected_video));
    assert_eq!(state.version, "2");

    runtime.teardown().await;
    assert!(!runtime.connection().is_connected());
}

#[tokio::test(start_paused = true)]
async fn failed_games_response_keeps_the_loading_state() {
    let (runtime, mut server) = start(Arc::new(MemoryEventStore::new())).await;
    server.expect_event("join-game-rooms").await.unwrap();

    server.push(
        "games-response",
        json!({ "success": false, "error": "invalid key" }),
    );
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(runtime.discovery().phase("g1"), Some(DiscoveryPhase::Spinner));
    assert!(!runtime.store().contains("g1"));
    runtime.teardown().await;
}

#[tokio::test]
async fn init_requires_application_key() {
    let (connector, _listener) = memory::pair();
    let deps = RuntimeDeps {
        connector: Arc::new(connector),
        event_store: Arc::new(MemoryEventStore::new()),
        clock: VirtualClock::new(datetime!(2024-01-05 10:00 UTC)),
    };
    let config = RuntimeConfig {
        application_key: None,
        ..config()
    };

    let result = Runtime::init(config, lobby(), deps).await;
    assert!(matches!(result, Err(RuntimeError::MissingApplicationKey)));
}

#[tokio::test(start_paused = true)]
async fn generated_session_id_survives_a_restart() {
    let events = Arc::new(MemoryEventStore::new());
    let unnamed = || RuntimeConfig {
        session_id: None,
        ..config()
    };
    let deps = |events: Arc<MemoryEventStore>| {
        let (connector, listener) = memory::pair();
        let deps = RuntimeDeps {
            connector: Arc::new(connector),
            event_store: events,
            clock: VirtualClock::new(datetime!(2024-01-05 10:00 UTC)),
        };
        (deps, listener)
    };

    let (first_deps, _first_listener) = deps(events.clone());
    let first = Runtime::init(unnamed(), lobby(), first_deps).await.unwrap();
    let session_id = first.session_id().to_string();
    assert!(session_id.starts_with("cardsync_"));
    assert_eq!(events.load_session().await.unwrap(), Some(session_id.clone()));
    first.teardown().await;

    let (second_deps, _second_listener) = deps(events.clone());
    let second = Runtime::init(unnamed(), lobby(), second_deps).await.unwrap();
    assert_eq!(second.session_id(), session_id);
    second.teardown().await;

    let (third_deps, _third_listener) = deps(events.clone());
    let configured = Runtime::init(config(), lobby(), third_deps).await.unwrap();
    assert_eq!(configured.session_id(), SESSION);
    configured.teardown().await;
}
