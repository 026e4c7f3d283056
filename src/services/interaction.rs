//! Pointer and touch handling for revealed cards.
//!
//! Controls inside a card (links, buttons, form fields, `role="button"`) keep their native
//! behaviour; their click is logged and pauses the card's video. Everything else is the media
//! surface, which toggles playback: hover on pointer devices, tap to toggle on touch devices.
//! A click or tap outside every card pauses all videos.

use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::{DashMap, DashSet};
use serde_json::{Map, json};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    dom::{Document, Element, GAME_ID_ATTR, NodeId},
    dto::analytics::{AssetType, EventType},
    services::{analytics, media},
    state::SharedRuntime,
};

const CONTROL_TAGS: &[&str] = &["a", "button", "input", "select", "textarea"];

/// Interaction bookkeeping shared by all cards.
#[derive(Debug, Default)]
pub struct InteractionState {
    attached: DashSet<String>,
    active_video: Mutex<Option<String>>,
    hover_started: DashMap<String, OffsetDateTime>,
    suppress_click: DashSet<String>,
}

impl InteractionState {
    /// Start handling pointer events for `game_id`. Returns `false` if already attached.
    pub fn attach(&self, game_id: &str) -> bool {
        self.attached.insert(game_id.to_string())
    }

    /// Whether `game_id` handles pointer events.
    pub fn is_attached(&self, game_id: &str) -> bool {
        self.attached.contains(game_id)
    }

    /// Game whose video is playing, if any.
    pub fn active(&self) -> Option<String> {
        self.active_slot().clone()
    }

    /// Mark `game_id` as the playing card and return the previous one.
    pub fn replace_active(&self, game_id: &str) -> Option<String> {
        self.active_slot().replace(game_id.to_string())
    }

    /// Clear the playing card if it is `game_id`.
    pub fn release_active(&self, game_id: &str) {
        let mut active = self.active_slot();
        if active.as_deref() == Some(game_id) {
            *active = None;
        }
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.active_video.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pointer input reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// Pointer entered the element.
    Enter,
    /// Pointer left the element.
    Leave,
    /// A finger touched the element.
    TouchStart,
    /// Click, or the synthetic click a touch device sends after a tap.
    Click,
}

/// What the host should do after the runtime handled an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionOutcome {
    /// Let the control perform its native action.
    Native {
        /// Link target of the control, if it has one.
        href: Option<String>,
    },
    /// A video started playing.
    Played,
    /// One or more videos were paused.
    Paused,
    /// The input does not concern a revealed card.
    Ignored,
    /// Synthetic click following a handled touch.
    Suppressed,
}

/// Role of the element an input landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Interactive control, with the node that owns the native behaviour.
    Control(NodeId),
    /// Anything else inside the card.
    MediaSurface,
}

fn is_control(element: &Element) -> bool {
    CONTROL_TAGS.contains(&element.tag.as_str()) || element.attribute("role") == Some("button")
}

/// Analytics label of a control: `link`, `anchor`, `button`, `submit`, `reset`,
/// `input-<type>`, `select`, `textarea`, `role-button` or `interactive`.
pub fn button_type(element: &Element) -> String {
    let kind = element
        .attribute("type")
        .filter(|kind| !kind.is_empty())
        .map(str::to_ascii_lowercase);
    match element.tag.as_str() {
        "a" => match element.attribute("href") {
            Some(href) if !href.is_empty() && !href.starts_with('#') => "link".into(),
            _ => "anchor".into(),
        },
        "button" => match kind.as_deref() {
            Some("submit") => "submit".into(),
            Some("reset") => "reset".into(),
            _ => "button".into(),
        },
        "input" => format!("input-{}", kind.as_deref().unwrap_or("text")),
        "select" | "textarea" => element.tag.clone(),
        _ if element.attribute("role") == Some("button") => "role-button".into(),
        _ => "interactive".into(),
    }
}

/// Classify `target` within `card`. Controls outside the card do not count.
pub fn classify(document: &Document, card: NodeId, target: NodeId) -> TargetKind {
    match document.closest(target, is_control) {
        Some(control) if document.contains(card, control) => TargetKind::Control(control),
        _ => TargetKind::MediaSurface,
    }
}

struct Control {
    kind: String,
    href: Option<String>,
}

struct Located {
    game_id: String,
    control: Option<Control>,
}

async fn locate(runtime: &SharedRuntime, target: NodeId) -> Option<Located> {
    let document = runtime.document().read().await;
    let card = document.closest(target, |element| element.attribute(GAME_ID_ATTR).is_some())?;
    let game_id = document.attribute(card, GAME_ID_ATTR)?.to_string();
    let control = match classify(&document, card, target) {
        TargetKind::Control(node) => document.get(node).map(|element| Control {
            kind: button_type(element),
            href: element.attribute("href").map(str::to_string),
        }),
        TargetKind::MediaSurface => None,
    };
    Some(Located { game_id, control })
}

/// Handle one pointer input landing on `target`.
pub async fn handle(runtime: &SharedRuntime, target: NodeId, kind: PointerKind) -> InteractionOutcome {
    let Some(Located { game_id, control }) = locate(runtime, target).await else {
        return match kind {
            PointerKind::Click | PointerKind::TouchStart => pause_everything(runtime).await,
            PointerKind::Enter | PointerKind::Leave => InteractionOutcome::Ignored,
        };
    };
    if !runtime.interaction().is_attached(&game_id) {
        return InteractionOutcome::Ignored;
    }

    match (kind, control) {
        (PointerKind::Click, Some(control)) => {
            let mut metadata = Map::new();
            metadata.insert("buttonType".into(), json!(control.kind));
            metadata.insert("buttonHref".into(), json!(control.href));
            analytics::record(
                runtime,
                EventType::ButtonClick,
                &game_id,
                AssetType::Button,
                control.href.as_deref(),
                metadata,
            )
            .await;
            if media::pause(runtime, &game_id, false).await {
                debug!(game_id, "video paused for control activation");
            }
            InteractionOutcome::Native { href: control.href }
        }
        (PointerKind::TouchStart, Some(control)) => InteractionOutcome::Native { href: control.href },
        (PointerKind::Enter, _) => hover_start(runtime, &game_id).await,
        (PointerKind::Leave, _) => hover_end(runtime, &game_id).await,
        (PointerKind::TouchStart, None) => {
            runtime.interaction().suppress_click.insert(game_id.clone());
            touch_toggle(runtime, &game_id).await
        }
        (PointerKind::Click, None) => {
            if runtime.interaction().suppress_click.remove(&game_id).is_some() {
                debug!(game_id, "click suppressed after touch");
                return InteractionOutcome::Suppressed;
            }
            toggle(runtime, &game_id).await
        }
    }
}

fn hover_allowed(runtime: &SharedRuntime, game_id: &str) -> bool {
    !runtime.config().device.touch
        && runtime
            .store()
            .get(game_id)
            .is_some_and(|state| state.hover_enabled)
}

async fn hover_start(runtime: &SharedRuntime, game_id: &str) -> InteractionOutcome {
    if !hover_allowed(runtime, game_id) {
        return InteractionOutcome::Ignored;
    }
    engagement_started(runtime, game_id, false).await;

    if media::play(runtime, game_id).await {
        InteractionOutcome::Played
    } else {
        InteractionOutcome::Ignored
    }
}

async fn hover_end(runtime: &SharedRuntime, game_id: &str) -> InteractionOutcome {
    if !hover_allowed(runtime, game_id) {
        return InteractionOutcome::Ignored;
    }
    engagement_ended(runtime, game_id, false).await;

    if media::pause(runtime, game_id, true).await {
        InteractionOutcome::Paused
    } else {
        InteractionOutcome::Ignored
    }
}

/// Log `hover_start` and remember when the engagement began. Touch engagements are tagged
/// with `device: touch`.
async fn engagement_started(runtime: &SharedRuntime, game_id: &str, touch: bool) {
    runtime
        .interaction()
        .hover_started
        .insert(game_id.to_string(), runtime.clock().now());
    let mut metadata = Map::new();
    if touch {
        metadata.insert("device".into(), json!("touch"));
    }
    let (asset_type, url) = current_asset(runtime, game_id);
    analytics::record(runtime, EventType::HoverStart, game_id, asset_type, url.as_deref(), metadata).await;
}

/// Log `hover_end` with the engagement duration. A touch engagement is only closed once.
async fn engagement_ended(runtime: &SharedRuntime, game_id: &str, touch: bool) {
    let started = runtime.interaction().hover_started.remove(game_id);
    if touch && started.is_none() {
        return;
    }
    let mut metadata = Map::new();
    if let Some((_, started)) = started {
        let elapsed = runtime.clock().now() - started;
        metadata.insert("hoverDuration".into(), json!(elapsed.whole_milliseconds() as i64));
    }
    if touch {
        metadata.insert("device".into(), json!("touch"));
    }
    let (asset_type, url) = current_asset(runtime, game_id);
    analytics::record(runtime, EventType::HoverEnd, game_id, asset_type, url.as_deref(), metadata).await;
}

/// Tap on the media surface: toggle playback and track the touch engagement it opens or
/// closes.
async fn touch_toggle(runtime: &SharedRuntime, game_id: &str) -> InteractionOutcome {
    let previous = runtime.interaction().active();
    let outcome = toggle(runtime, game_id).await;
    match outcome {
        InteractionOutcome::Played => {
            if let Some(previous) = previous.filter(|previous| previous != game_id) {
                engagement_ended(runtime, &previous, true).await;
            }
            engagement_started(runtime, game_id, true).await;
        }
        InteractionOutcome::Paused => engagement_ended(runtime, game_id, true).await,
        _ => {}
    }
    outcome
}

/// Click or tap outside every card: pause all videos and close open touch engagements.
async fn pause_everything(runtime: &SharedRuntime) -> InteractionOutcome {
    let paused = media::pause_all(runtime).await;
    if runtime.config().device.touch {
        let open: Vec<String> = runtime
            .interaction()
            .hover_started
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for game_id in open {
            engagement_ended(runtime, &game_id, true).await;
        }
    }
    if paused == 0 {
        InteractionOutcome::Ignored
    } else {
        debug!(paused, "videos paused by an outside interaction");
        InteractionOutcome::Paused
    }
}

/// Tap or click on the media surface: pause in place, or start playing.
async fn toggle(runtime: &SharedRuntime, game_id: &str) -> InteractionOutcome {
    let (asset_type, url) = current_asset(runtime, game_id);
    analytics::record(runtime, EventType::VideoClick, game_id, asset_type, url.as_deref(), Map::new()).await;

    if media::is_playing(runtime, game_id).await {
        media::pause(runtime, game_id, false).await;
        InteractionOutcome::Paused
    } else if media::play(runtime, game_id).await {
        InteractionOutcome::Played
    } else {
        InteractionOutcome::Ignored
    }
}

fn current_asset(runtime: &SharedRuntime, game_id: &str) -> (AssetType, Option<String>) {
    match runtime.store().get(game_id) {
        Some(state) if state.animate_enabled && state.video_url.is_some() => {
            (AssetType::Video, state.video_url)
        }
        Some(state) => (AssetType::Image, state.poster_url),
        None => (AssetType::Image, None),
    }
}
