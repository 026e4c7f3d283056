//! Playback control of rendered videos and readiness handshakes with the host.

use std::time::Duration;

use serde_json::{Map, json};
use tokio::pin;
use tracing::debug;

use crate::{
    dom::NodeId,
    dto::analytics::{AssetType, EventType},
    services::analytics,
    state::SharedRuntime,
};

/// Longest wait for the host to report a video ready before loading anyway.
pub const READY_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait until the host reports `node` ready, at most [`READY_TIMEOUT`], then ask it to load.
pub async fn load_when_ready(runtime: SharedRuntime, node: NodeId) {
    let deadline = runtime.clock().sleep(READY_TIMEOUT);
    pin!(deadline);

    loop {
        let notified = runtime.media_ready().notified();
        pin!(notified);
        notified.as_mut().enable();

        match runtime.document().read().await.media(node) {
            Some(media) if media.ready => break,
            Some(_) => {}
            None => {
                debug!(?node, "media node removed before it became ready");
                return;
            }
        }

        tokio::select! {
            _ = &mut deadline => {
                debug!(?node, "media readiness timed out; loading anyway");
                break;
            }
            _ = notified => {}
        }
    }

    if let Some(media) = runtime.document().write().await.media_mut(node) {
        media.load_requests += 1;
    }
}

/// Host callback: `node` has buffered enough data to play.
pub async fn report_ready(runtime: &SharedRuntime, node: NodeId) {
    if let Some(media) = runtime.document().write().await.media_mut(node) {
        media.ready = true;
    }
    runtime.media_ready().notify_waiters();
}

/// Host callback: playback of `node` reached the end.
pub async fn report_ended(runtime: &SharedRuntime, node: NodeId) {
    let Some(game_id) = game_for_node(runtime, node) else {
        return;
    };
    let url = {
        let mut document = runtime.document().write().await;
        let Some(media) = document.media_mut(node) else {
            return;
        };
        media.paused = true;
        media.current_time = 0.0;
        media.src.clone()
    };
    runtime.interaction().release_active(&game_id);
    analytics::record(
        runtime,
        EventType::VideoComplete,
        &game_id,
        AssetType::Video,
        url.as_deref(),
        Map::new(),
    )
    .await;
}

/// Start the video of `game_id`, pausing whichever card was playing. Returns `false` when the
/// card cannot play video.
pub async fn play(runtime: &SharedRuntime, game_id: &str) -> bool {
    let Some(state) = runtime.store().get(game_id) else {
        return false;
    };
    if !state.animate_enabled || state.video_url.is_none() {
        return false;
    }
    let Some(node) = state.video_node else {
        return false;
    };

    if let Some(previous) = runtime.interaction().replace_active(game_id)
        && previous != game_id
    {
        pause(runtime, &previous, true).await;
    }

    let started = {
        let mut document = runtime.document().write().await;
        match document.media_mut(node) {
            Some(media) if media.paused => {
                media.paused = false;
                true
            }
            Some(_) => false,
            None => {
                runtime.interaction().release_active(game_id);
                return false;
            }
        }
    };

    if started {
        analytics::record(
            runtime,
            EventType::VideoPlay,
            game_id,
            AssetType::Video,
            state.video_url.as_deref(),
            Map::new(),
        )
        .await;
    }
    true
}

/// Pause the video of `game_id`, rewinding it when `rewind` is set. Returns `false` when
/// nothing was playing.
pub async fn pause(runtime: &SharedRuntime, game_id: &str, rewind: bool) -> bool {
    runtime.interaction().release_active(game_id);
    let Some(state) = runtime.store().get(game_id) else {
        return false;
    };
    let Some(node) = state.video_node else {
        return false;
    };

    let position = {
        let mut document = runtime.document().write().await;
        let Some(media) = document.media_mut(node) else {
            return false;
        };
        if media.paused {
            if rewind {
                media.current_time = 0.0;
            }
            return false;
        }
        media.paused = true;
        let position = media.current_time;
        if rewind {
            media.current_time = 0.0;
        }
        position
    };

    let mut metadata = Map::new();
    metadata.insert("currentTime".into(), json!(position));
    analytics::record(
        runtime,
        EventType::VideoPause,
        game_id,
        AssetType::Video,
        state.video_url.as_deref(),
        metadata,
    )
    .await;
    true
}

/// Pause every playing video in place. Returns how many were playing.
pub async fn pause_all(runtime: &SharedRuntime) -> usize {
    let games: Vec<String> = runtime.store().snapshot().keys().cloned().collect();
    let mut paused = 0;
    for game_id in games {
        if pause(runtime, &game_id, false).await {
            paused += 1;
        }
    }
    paused
}

/// Whether the video of `game_id` is currently playing.
pub async fn is_playing(runtime: &SharedRuntime, game_id: &str) -> bool {
    let Some(node) = runtime.store().get(game_id).and_then(|state| state.video_node) else {
        return false;
    };
    runtime
        .document()
        .read()
        .await
        .media(node)
        .is_some_and(|media| !media.paused)
}

fn game_for_node(runtime: &SharedRuntime, node: NodeId) -> Option<String> {
    runtime
        .store()
        .snapshot()
        .iter()
        .find(|(_, state)| state.video_node == Some(node))
        .map(|(game_id, _)| game_id.clone())
}
