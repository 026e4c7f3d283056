//! First reveal of tagged cards found on the page.
//!
//! A card waits briefly for its data, shows a loading affordance when the data is late, and
//! once data is available replaces its placeholder through the reveal choreography. A reveal
//! that has started always runs to completion.

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    dom::{NodeId, VERSION_ATTR},
    dto::game::GameRecord,
    services::{media, resolution::ResolvedAsset, update},
    state::{
        SharedRuntime,
        lifecycle::{DiscoveryEvent, DiscoveryPhase, REVEAL_PHASES, RevealPhase, drive},
        video_store::{VisualStateInit, VisualStatePatch},
    },
};

/// How long a new card waits for data before showing the spinner.
pub const DISCOVERY_WAIT: Duration = Duration::from_secs(2);
/// Bounded wait with the spinner shown.
pub const SPINNER_WAIT: Duration = Duration::from_secs(3);

/// Class marking a card whose data is still loading.
pub const LOADING_CLASS: &str = "cardsync-loading";
/// Class of the wrapper inserted around a card visual.
pub const CONTAINER_CLASS: &str = "cardsync-container";
/// Class of the spinner shown during the bounded wait.
pub const SPINNER_CLASS: &str = "cardsync-spinner";
/// Class of the video element the runtime inserts.
pub const MEDIA_CLASS: &str = "cardsync-media";
/// Blur applied to a visual while its asset loads.
pub const LOADING_BLUR_PX: f32 = 10.0;

struct DiscoveryEntry {
    phase: DiscoveryPhase,
    card: NodeId,
    pending: Option<GameRecord>,
    notify: Arc<Notify>,
}

/// Discovery progress keyed by game id.
#[derive(Default)]
pub struct DiscoveryState {
    entries: DashMap<String, DiscoveryEntry>,
}

impl DiscoveryState {
    /// Discovery phase of `game_id`, `None` for cards never discovered.
    pub fn phase(&self, game_id: &str) -> Option<DiscoveryPhase> {
        self.entries.get(game_id).map(|entry| entry.phase)
    }

    fn card(&self, game_id: &str) -> Option<NodeId> {
        self.entries.get(game_id).map(|entry| entry.card)
    }

    fn take_pending(&self, game_id: &str) -> Option<GameRecord> {
        self.entries
            .get_mut(game_id)
            .and_then(|mut entry| entry.pending.take())
    }

    fn advance(&self, game_id: &str, event: DiscoveryEvent) {
        let Some(mut entry) = self.entries.get_mut(game_id) else {
            return;
        };
        match entry.phase.next(event) {
            Ok(next) => {
                debug!(game_id, from = ?entry.phase, to = ?next, "discovery phase");
                entry.phase = next;
            }
            Err(err) => warn!(game_id, error = %err, "ignoring discovery event"),
        }
    }
}

/// Register every tagged card that has no state yet and start its discovery. Returns the
/// number of newly discovered cards.
pub async fn scan(runtime: &SharedRuntime) -> usize {
    let cards = runtime.document().read().await.game_cards();
    let mut discovered = 0;

    for (card, game_id) in cards {
        if runtime.store().contains(&game_id) {
            continue;
        }
        let notify = Arc::new(Notify::new());
        match runtime.discovery().entries.entry(game_id.clone()) {
            Entry::Occupied(_) => {
                debug!(game_id, "card already being discovered");
                continue;
            }
            Entry::Vacant(slot) => {
                slot.insert(DiscoveryEntry {
                    phase: DiscoveryPhase::Waiting,
                    card,
                    pending: runtime.game(&game_id),
                    notify: notify.clone(),
                });
            }
        }

        debug!(game_id, "discovered game card");
        runtime.connection().register_game(&game_id);
        let task_runtime = runtime.clone();
        runtime.spawn(async move { run(task_runtime, game_id, notify).await });
        discovered += 1;
    }
    discovered
}

/// Hand backend data to a card still being discovered. Returns `false` when the card is not
/// in discovery and the caller should route the data to the update machine.
pub fn on_game_data(runtime: &SharedRuntime, game: &GameRecord) -> bool {
    let Some(mut entry) = runtime.discovery().entries.get_mut(&game.id) else {
        return false;
    };
    match entry.phase {
        DiscoveryPhase::Waiting | DiscoveryPhase::Spinner => {
            entry.pending = Some(game.clone());
            entry.notify.notify_one();
            true
        }
        // The reveal reconciles with the latest data once it finishes.
        DiscoveryPhase::Transition => true,
        DiscoveryPhase::Complete => false,
    }
}

async fn run(runtime: SharedRuntime, game_id: String, notify: Arc<Notify>) {
    let clock = runtime.clock().clone();
    let game = match wait_for_data(&runtime, clock.as_ref(), &game_id, &notify, DISCOVERY_WAIT).await {
        Some(game) => game,
        None => {
            runtime.discovery().advance(&game_id, DiscoveryEvent::WaitElapsed);
            show_spinner(&runtime, &game_id).await;
            match wait_for_data(&runtime, clock.as_ref(), &game_id, &notify, SPINNER_WAIT).await {
                Some(game) => game,
                None => {
                    runtime.discovery().advance(&game_id, DiscoveryEvent::SpinnerTimedOut);
                    info!(game_id, "no data yet; card keeps its placeholder until data arrives");
                    loop {
                        notify.notified().await;
                        if let Some(game) = runtime.discovery().take_pending(&game_id) {
                            break game;
                        }
                    }
                }
            }
        }
    };

    runtime.discovery().advance(&game_id, DiscoveryEvent::DataArrived);
    reveal(&runtime, &game_id, &game).await;
    runtime.discovery().advance(&game_id, DiscoveryEvent::RevealFinished);

    if runtime.interaction().attach(&game_id) {
        debug!(game_id, "card accepts interaction");
    }
    // Data may have moved on while the reveal ran.
    update::request(&runtime, &game_id).await;
}

async fn wait_for_data(
    runtime: &SharedRuntime,
    clock: &dyn Clock,
    game_id: &str,
    notify: &Notify,
    limit: Duration,
) -> Option<GameRecord> {
    let deadline = clock.sleep(limit);
    tokio::pin!(deadline);
    loop {
        if let Some(game) = runtime.discovery().take_pending(game_id) {
            return Some(game);
        }
        tokio::select! {
            biased;
            _ = notify.notified() => {}
            _ = &mut deadline => return runtime.discovery().take_pending(game_id),
        }
    }
}

async fn show_spinner(runtime: &SharedRuntime, game_id: &str) {
    let Some(card) = runtime.discovery().card(game_id) else {
        return;
    };
    debug!(game_id, "data late; showing loading state");
    runtime.document().write().await.add_class(card, LOADING_CLASS);
}

/// Nodes created for a reveal, plus the placeholder they replace.
struct RevealNodes {
    card: NodeId,
    placeholder: Option<NodeId>,
    media: NodeId,
    container: NodeId,
    spinner: NodeId,
}

async fn reveal(runtime: &SharedRuntime, game_id: &str, game: &GameRecord) {
    let Some(card) = runtime.discovery().card(game_id) else {
        return;
    };
    let resolved = runtime.resolve(game).await;
    let use_video = game.animate && resolved.video_url.is_some();
    let nodes = render(runtime, card, game, &resolved, use_video).await;

    runtime.store().set_state(
        game_id,
        VisualStateInit {
            video_node: Some(nodes.media),
            container_node: Some(nodes.container),
            spinner_node: Some(nodes.spinner),
            poster_url: resolved.image_url.clone(),
            video_url: resolved.video_url.clone().filter(|_| use_video),
            default_image_url: resolved.image_url.clone(),
            version: Some(game.version.clone()),
            published: Some(game.published),
            loading: Some(true),
            is_initial_load: Some(true),
            animate_enabled: Some(game.animate),
            hover_enabled: Some(game.hover),
            published_type: Some(game.published_type),
            variant: resolved.variant,
            source: Some(resolved.source),
        },
    );
    if use_video {
        runtime.spawn(media::load_when_ready(runtime.clone(), nodes.media));
    }

    let clock = runtime.clock().clone();
    drive(clock.as_ref(), REVEAL_PHASES, |phase| {
        reveal_step(runtime, game_id, &nodes, phase)
    })
    .await;
    info!(game_id, version = %game.version, source = ?resolved.source, "card revealed");
}

/// Build the replacement visual, container and spinner, all fully transparent.
async fn render(
    runtime: &SharedRuntime,
    card: NodeId,
    game: &GameRecord,
    resolved: &ResolvedAsset,
    use_video: bool,
) -> RevealNodes {
    let mut document = runtime.document().write().await;
    let placeholder = document.placeholder(card);

    let media = document.create_element(if use_video { "video" } else { "img" });
    document.add_class(media, MEDIA_CLASS);
    document.set_attribute(media, VERSION_ATTR, game.version.clone());
    if let Some(style) = document.style_mut(media) {
        style.opacity = 0.0;
        style.blur_px = if use_video { LOADING_BLUR_PX } else { 0.0 };
    }
    if let Some(state) = document.media_mut(media) {
        state.src = resolved.video_url.clone();
        state.poster = resolved.image_url.clone();
    } else if let Some(image) = &resolved.image_url {
        document.set_attribute(media, "src", image.clone());
    }

    let container = document.create_element("div");
    document.add_class(container, CONTAINER_CLASS);
    let spinner = document.create_element("div");
    document.add_class(spinner, SPINNER_CLASS);
    for node in [container, spinner] {
        if let Some(style) = document.style_mut(node) {
            style.opacity = 0.0;
        }
    }

    document.append_child(card, media);
    document.append_child(card, container);
    document.append_child(container, spinner);

    RevealNodes {
        card,
        placeholder,
        media,
        container,
        spinner,
    }
}

async fn reveal_step(runtime: &SharedRuntime, game_id: &str, nodes: &RevealNodes, phase: RevealPhase) {
    let transition = phase.transition();
    match phase {
        RevealPhase::Render => {
            // Let the host commit the transparent nodes before anything fades.
            runtime.clock().next_frame().await;
        }
        RevealPhase::ContainerFadeIn => fade(runtime, game_id, nodes.container, 1.0, transition).await,
        RevealPhase::SpinnerFadeIn => fade(runtime, game_id, nodes.spinner, 1.0, transition).await,
        RevealPhase::VisualFadeIn => {
            let mut document = runtime.document().write().await;
            match document.style_mut(nodes.media) {
                Some(style) => {
                    style.opacity = 1.0;
                    style.blur_px = 0.0;
                    style.transition = transition;
                }
                None => warn!(game_id, ?phase, "visual node missing; skipping phase"),
            }
        }
        RevealPhase::Finalize => {
            {
                let mut document = runtime.document().write().await;
                if let Some(placeholder) = nodes.placeholder {
                    document.remove(placeholder);
                }
                for node in [nodes.container, nodes.spinner] {
                    if let Some(style) = document.style_mut(node) {
                        style.hidden = true;
                        style.transition = None;
                    }
                }
                document.remove_class(nodes.card, LOADING_CLASS);
            }
            runtime.store().update_state(
                game_id,
                VisualStatePatch {
                    loading: Some(false),
                    is_initial_load: Some(false),
                    ..Default::default()
                },
            );
        }
    }
}

pub(crate) async fn fade(
    runtime: &SharedRuntime,
    game_id: &str,
    node: NodeId,
    opacity: f32,
    transition: Option<Duration>,
) {
    let mut document = runtime.document().write().await;
    match document.style_mut(node) {
        Some(style) => {
            style.opacity = opacity;
            style.transition = transition;
        }
        None => warn!(game_id, ?node, "animated node missing; skipping phase"),
    }
}
