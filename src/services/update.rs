//! In-place refresh of revealed cards when their data or overrides change.

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, info, warn};

use crate::{
    dom::{NodeId, VERSION_ATTR},
    dto::game::GameRecord,
    services::{
        discovery::{LOADING_BLUR_PX, MEDIA_CLASS, fade},
        media,
        resolution::ResolvedAsset,
    },
    state::{
        SharedRuntime,
        lifecycle::{UPDATE_PHASES, UpdatePhase, drive},
        video_store::{GameVisualState, VisualStatePatch},
    },
};

/// Result of an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The card now shows the latest data.
    Applied,
    /// Nothing changed since the last applied push.
    Redundant,
    /// The card is not revealed yet, or its data is unknown.
    NotRendered,
    /// A run is in flight; it re-evaluates once it finishes.
    Deferred,
}

/// Per-game run bookkeeping. The flag records that another request arrived mid-run.
#[derive(Debug, Default)]
pub struct UpdateState {
    runs: DashMap<String, bool>,
}

impl UpdateState {
    /// Whether an update run is in flight for `game_id`.
    pub fn is_running(&self, game_id: &str) -> bool {
        self.runs.contains_key(game_id)
    }

    /// Claim the run slot, or park the request behind the current run.
    fn claim(&self, game_id: &str) -> bool {
        match self.runs.entry(game_id.to_string()) {
            Entry::Occupied(mut run) => {
                *run.get_mut() = true;
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
                true
            }
        }
    }

    /// Release the slot unless a parked request asks for another run.
    fn rerun_requested(&self, game_id: &str) -> bool {
        match self.runs.entry(game_id.to_string()) {
            Entry::Occupied(mut run) if *run.get() => {
                *run.get_mut() = false;
                true
            }
            Entry::Occupied(run) => {
                run.remove();
                false
            }
            Entry::Vacant(_) => false,
        }
    }
}

/// Bring the card of `game_id` in line with its latest data and overrides.
///
/// At most one run per game is in flight. Requests arriving meanwhile are parked and trigger
/// a single re-evaluation with the latest data once the run ends.
pub async fn request(runtime: &SharedRuntime, game_id: &str) -> UpdateOutcome {
    if !runtime.updates().claim(game_id) {
        debug!(game_id, "update in flight; request parked");
        return UpdateOutcome::Deferred;
    }

    let mut outcome = apply(runtime, game_id).await;
    while runtime.updates().rerun_requested(game_id) {
        outcome = apply(runtime, game_id).await;
    }
    outcome
}

/// What the card should show after the update.
struct Target {
    game: GameRecord,
    resolved: ResolvedAsset,
    video_url: Option<String>,
}

impl Target {
    fn is_shown_by(&self, state: &GameVisualState) -> bool {
        state.version == self.game.version
            && state.published == self.game.published
            && state.poster_url == self.resolved.image_url
            && state.video_url == self.video_url
    }
}

async fn apply(runtime: &SharedRuntime, game_id: &str) -> UpdateOutcome {
    let Some(game) = runtime.game(game_id) else {
        return UpdateOutcome::NotRendered;
    };
    let Some(state) = runtime.store().get(game_id) else {
        return UpdateOutcome::NotRendered;
    };
    if state.is_initial_load {
        return UpdateOutcome::NotRendered;
    }

    let resolved = runtime.resolve(&game).await;
    let video_url = resolved.video_url.clone().filter(|_| game.animate);
    let target = Target {
        game,
        resolved,
        video_url,
    };

    if target.is_shown_by(&state) {
        if state.hover_enabled != target.game.hover || state.animate_enabled != target.game.animate {
            runtime.store().update_state(
                game_id,
                VisualStatePatch {
                    hover_enabled: Some(target.game.hover),
                    animate_enabled: Some(target.game.animate),
                    ..Default::default()
                },
            );
        }
        debug!(game_id, version = %target.game.version, "redundant push ignored");
        return UpdateOutcome::Redundant;
    }

    info!(
        game_id,
        from = %state.version,
        to = %target.game.version,
        source = ?target.resolved.source,
        "updating card"
    );
    let clock = runtime.clock().clone();
    drive(clock.as_ref(), UPDATE_PHASES, |phase| {
        update_step(runtime, game_id, &target, phase)
    })
    .await;
    UpdateOutcome::Applied
}

async fn update_step(runtime: &SharedRuntime, game_id: &str, target: &Target, phase: UpdatePhase) {
    let Some(state) = runtime.store().get(game_id) else {
        warn!(game_id, ?phase, "card state vanished; skipping phase");
        return;
    };
    let transition = phase.transition();

    match phase {
        UpdatePhase::Prepare => {
            runtime.store().update_state(
                game_id,
                VisualStatePatch {
                    default_image_url: Some(state.poster_url.clone()),
                    loading: Some(true),
                    ..Default::default()
                },
            );
            {
                let mut document = runtime.document().write().await;
                for node in [state.container_node, state.spinner_node].into_iter().flatten() {
                    if let Some(style) = document.style_mut(node) {
                        style.hidden = false;
                    }
                }
            }
            runtime.clock().next_frame().await;
            for node in [state.container_node, state.spinner_node].into_iter().flatten() {
                fade(runtime, game_id, node, 1.0, transition).await;
            }
        }
        UpdatePhase::FadeOut => {
            if let Some(node) = state.video_node {
                fade(runtime, game_id, node, 0.0, transition).await;
            }
        }
        UpdatePhase::Blur => {
            let mut document = runtime.document().write().await;
            match state.video_node.and_then(|node| document.style_mut(node)) {
                Some(style) => {
                    style.blur_px = LOADING_BLUR_PX;
                    style.transition = None;
                }
                None => warn!(game_id, ?phase, "visual node missing; skipping phase"),
            }
        }
        UpdatePhase::Load => load(runtime, game_id, target, &state).await,
        UpdatePhase::SpinnerFadeOut => {
            if let Some(node) = state.spinner_node {
                fade(runtime, game_id, node, 0.0, transition).await;
            }
        }
        UpdatePhase::Settle => {
            let mut document = runtime.document().write().await;
            match state.video_node.and_then(|node| document.style_mut(node)) {
                Some(style) => {
                    style.opacity = 1.0;
                    style.blur_px = 0.0;
                    style.transition = transition;
                }
                None => warn!(game_id, ?phase, "visual node missing; skipping phase"),
            }
        }
        UpdatePhase::Cleanup => {
            {
                let mut document = runtime.document().write().await;
                for node in [state.container_node, state.spinner_node].into_iter().flatten() {
                    if let Some(style) = document.style_mut(node) {
                        style.hidden = true;
                        style.transition = None;
                    }
                }
            }
            runtime.store().update_state(
                game_id,
                VisualStatePatch {
                    loading: Some(false),
                    ..Default::default()
                },
            );
        }
    }
}

/// Assign the new asset, swapping an image visual for a video when needed.
async fn load(runtime: &SharedRuntime, game_id: &str, target: &Target, state: &GameVisualState) {
    let Some(current) = state.video_node else {
        warn!(game_id, "visual node missing; skipping load");
        return;
    };
    let poster = target.resolved.image_url.clone();
    runtime.interaction().release_active(game_id);

    let node = {
        let mut document = runtime.document().write().await;
        if !document.contains_node(current) {
            warn!(game_id, "visual node removed from page; skipping load");
            return;
        }
        let node = match (&target.video_url, document.media(current).is_some()) {
            (Some(_), false) => swap_for_video(&mut document, current),
            _ => current,
        };
        document.set_attribute(node, VERSION_ATTR, target.game.version.clone());
        if let Some(media) = document.media_mut(node) {
            media.src = target.video_url.clone();
            media.poster = poster.clone();
            media.paused = true;
            media.current_time = 0.0;
            media.ready = false;
        } else {
            match &poster {
                Some(image) => document.set_attribute(node, "src", image.clone()),
                None => document.remove_attribute(node, "src"),
            };
        }
        node
    };

    if target.video_url.is_some() {
        runtime.spawn(media::load_when_ready(runtime.clone(), node));
    }

    runtime.store().update_state(
        game_id,
        VisualStatePatch {
            video_node: Some(Some(node)),
            poster_url: Some(poster),
            video_url: Some(target.video_url.clone()),
            animate_enabled: Some(target.game.animate),
            hover_enabled: Some(target.game.hover),
            published_type: Some(target.game.published_type),
            variant: Some(target.resolved.variant),
            source: Some(target.resolved.source),
            ..Default::default()
        },
    );
    runtime
        .store()
        .record_push(game_id, &target.game.version, target.game.published);
}

/// Replace an image visual with a video node carrying the same classes and style.
fn swap_for_video(document: &mut crate::dom::Document, current: NodeId) -> NodeId {
    let video = document.create_element("video");
    if let Some(old) = document.get(current).cloned() {
        for class in &old.classes {
            document.add_class(video, class);
        }
        if let Some(style) = document.style_mut(video) {
            *style = old.style;
        }
    } else {
        document.add_class(video, MEDIA_CLASS);
    }
    if document.replace(current, video) {
        video
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        dom::{Document, GAME_ID_ATTR, markup::MarkupNode},
        services::discovery,
        state::testing::{self, Harness},
    };

    fn game(version: &str) -> GameRecord {
        let mut game = GameRecord::new("g1");
        game.version = version.into();
        game.published = true;
        game.default_image = Some(format!("g1-v{version}.jpg"));
        game.default_video = Some(format!("g1-v{version}.mp4"));
        game
    }

    /// Harness with `g1` already revealed at version 1.
    async fn revealed() -> Harness {
        let harness = testing::harness(Document::from_markup(&[MarkupNode::new("div")
            .attr(GAME_ID_ATTR, "g1")
            .child(MarkupNode::new("img").attr("src", "placeholder.jpg"))]));
        let runtime = harness.runtime.clone();
        runtime.upsert_game(game("1"));
        discovery::scan(&runtime).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!runtime.store().get("g1").unwrap().is_initial_load);
        harness
    }

    #[tokio::test(start_paused = true)]
    async fn identical_push_schedules_nothing() {
        let harness = revealed().await;
        let runtime = &harness.runtime;
        let before = runtime.store().snapshot();
        let sleeps = harness.clock.scheduled_sleeps();

        assert_eq!(request(runtime, "g1").await, UpdateOutcome::Redundant);
        assert_eq!(request(runtime, "g1").await, UpdateOutcome::Redundant);

        assert_eq!(harness.clock.scheduled_sleeps(), sleeps);
        assert!(std::sync::Arc::ptr_eq(&before, &runtime.store().snapshot()));
    }

    #[tokio::test(start_paused = true)]
    async fn new_version_runs_the_update_machine() {
        let harness = revealed().await;
        let runtime = &harness.runtime;
        runtime.upsert_game(game("2"));

        let started = tokio::time::Instant::now();
        assert_eq!(request(runtime, "g1").await, UpdateOutcome::Applied);
        assert!(started.elapsed() >= Duration::from_secs(5));

        let state = runtime.store().get("g1").unwrap();
        assert_eq!(state.version, "2");
        assert_eq!(state.poster_url.as_deref(), Some("g1-v2.jpg"));
        assert_eq!(state.video_url.as_deref(), Some("g1-v2.mp4"));
        assert_eq!(state.default_image_url.as_deref(), Some("g1-v1.jpg"));
        assert!(!state.loading);

        let document = runtime.document().read().await;
        let node = state.video_node.unwrap();
        let media = document.media(node).unwrap();
        assert_eq!(media.src.as_deref(), Some("g1-v2.mp4"));
        assert_eq!(document.attribute(node, VERSION_ATTR), Some("2"));
        let style = &document.get(node).unwrap().style;
        assert_eq!(style.opacity, 1.0);
        assert_eq!(style.blur_px, 0.0);
        assert!(document.get(state.spinner_node.unwrap()).unwrap().style.hidden);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_during_a_run_are_parked_then_reconciled() {
        let harness = revealed().await;
        let runtime = harness.runtime.clone();
        runtime.upsert_game(game("2"));

        let first = {
            let runtime = runtime.clone();
            tokio::spawn(async move { request(&runtime, "g1").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runtime.updates().is_running("g1"));

        runtime.upsert_game(game("3"));
        assert_eq!(request(&runtime, "g1").await, UpdateOutcome::Deferred);

        assert_eq!(first.await.unwrap(), UpdateOutcome::Applied);
        assert_eq!(runtime.store().get("g1").unwrap().version, "3");
        assert!(!runtime.updates().is_running("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn image_card_becomes_video_when_animation_turns_on() {
        let harness = testing::harness(Document::from_markup(&[MarkupNode::new("div")
            .attr(GAME_ID_ATTR, "g1")
            .child(MarkupNode::new("img").attr("src", "placeholder.jpg"))]));
        let runtime = harness.runtime.clone();
        let mut still = game("1");
        still.animate = false;
        runtime.upsert_game(still);
        discovery::scan(&runtime).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let before = runtime.store().get("g1").unwrap().video_node.unwrap();

        runtime.upsert_game(game("2"));
        assert_eq!(request(&runtime, "g1").await, UpdateOutcome::Applied);

        let state = runtime.store().get("g1").unwrap();
        let node = state.video_node.unwrap();
        assert_ne!(node, before);
        let document = runtime.document().read().await;
        assert!(!document.contains_node(before));
        assert_eq!(document.get(node).unwrap().tag, "video");
        assert!(document.get(node).unwrap().has_class(MEDIA_CLASS));
    }
}
