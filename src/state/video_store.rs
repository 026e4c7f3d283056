//! Reactive per-game store of what each rendered card currently shows.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::{
    dom::NodeId,
    dto::game::PublishedType,
    services::{overrides::Variant, resolution::AssetSource},
};

/// Immutable snapshot handed to observers. Every write publishes a new map.
pub type VisualSnapshot = Arc<HashMap<String, GameVisualState>>;

/// What a discovered card shows and the nodes that render it.
#[derive(Debug, Clone, PartialEq)]
pub struct GameVisualState {
    /// Video element rendered for the card.
    pub video_node: Option<NodeId>,
    /// Wrapper holding the media and the spinner.
    pub container_node: Option<NodeId>,
    /// Loading spinner element.
    pub spinner_node: Option<NodeId>,
    /// Poster currently shown.
    pub poster_url: Option<String>,
    /// Video source currently assigned.
    pub video_url: Option<String>,
    /// Poster shown before the running update, kept as a fallback.
    pub default_image_url: Option<String>,
    /// Version of the last applied backend push.
    pub version: String,
    /// Publish flag of the last applied backend push.
    pub published: bool,
    /// An update choreography is running.
    pub loading: bool,
    /// The first reveal has not finished yet.
    pub is_initial_load: bool,
    /// Whether video may play; otherwise only the poster is shown.
    pub animate_enabled: bool,
    /// Whether hover starts playback.
    pub hover_enabled: bool,
    /// Which kind of asset the backend published.
    pub published_type: PublishedType,
    /// Experiment variant shown, if any.
    pub variant: Option<Variant>,
    /// Where the shown asset came from.
    pub source: AssetSource,
}

/// Initial values for [`VideoStateStore::set_state`]. Omitted fields take their defaults.
#[derive(Debug, Clone, Default)]
pub struct VisualStateInit {
    /// Video element rendered for the card.
    pub video_node: Option<NodeId>,
    /// Wrapper holding the media and the spinner.
    pub container_node: Option<NodeId>,
    /// Loading spinner element.
    pub spinner_node: Option<NodeId>,
    /// Poster to show.
    pub poster_url: Option<String>,
    /// Video source to assign.
    pub video_url: Option<String>,
    /// Fallback poster.
    pub default_image_url: Option<String>,
    /// Defaults to `"0"`.
    pub version: Option<String>,
    /// Defaults to `true`.
    pub published: Option<bool>,
    /// Defaults to `false`.
    pub loading: Option<bool>,
    /// Defaults to `true`.
    pub is_initial_load: Option<bool>,
    /// Defaults to `true`.
    pub animate_enabled: Option<bool>,
    /// Defaults to `true`.
    pub hover_enabled: Option<bool>,
    /// Defaults to [`PublishedType::Default`].
    pub published_type: Option<PublishedType>,
    /// Experiment variant shown, if any.
    pub variant: Option<Variant>,
    /// Defaults to [`AssetSource::Default`].
    pub source: Option<AssetSource>,
}

impl From<VisualStateInit> for GameVisualState {
    fn from(init: VisualStateInit) -> Self {
        Self {
            video_node: init.video_node,
            container_node: init.container_node,
            spinner_node: init.spinner_node,
            poster_url: init.poster_url,
            video_url: init.video_url,
            default_image_url: init.default_image_url,
            version: init.version.unwrap_or_else(|| "0".into()),
            published: init.published.unwrap_or(true),
            loading: init.loading.unwrap_or(false),
            is_initial_load: init.is_initial_load.unwrap_or(true),
            animate_enabled: init.animate_enabled.unwrap_or(true),
            hover_enabled: init.hover_enabled.unwrap_or(true),
            published_type: init.published_type.unwrap_or_default(),
            variant: init.variant,
            source: init.source.unwrap_or_default(),
        }
    }
}

/// Partial update merged by [`VideoStateStore::update_state`].
///
/// `version` and `published` are deliberately absent: they only change through
/// [`VideoStateStore::record_push`].
#[derive(Debug, Clone, Default)]
pub struct VisualStatePatch {
    /// Replace the video element.
    pub video_node: Option<Option<NodeId>>,
    /// Replace the poster.
    pub poster_url: Option<Option<String>>,
    /// Replace the video source.
    pub video_url: Option<Option<String>>,
    /// Replace the fallback poster.
    pub default_image_url: Option<Option<String>>,
    /// Set the loading flag.
    pub loading: Option<bool>,
    /// Set the first-reveal flag.
    pub is_initial_load: Option<bool>,
    /// Set the animation switch.
    pub animate_enabled: Option<bool>,
    /// Set the hover switch.
    pub hover_enabled: Option<bool>,
    /// Set the published asset kind.
    pub published_type: Option<PublishedType>,
    /// Replace the experiment variant.
    pub variant: Option<Option<Variant>>,
    /// Set the asset origin.
    pub source: Option<AssetSource>,
}

impl VisualStatePatch {
    fn apply(self, state: &mut GameVisualState) {
        if let Some(value) = self.video_node {
            state.video_node = value;
        }
        if let Some(value) = self.poster_url {
            state.poster_url = value;
        }
        if let Some(value) = self.video_url {
            state.video_url = value;
        }
        if let Some(value) = self.default_image_url {
            state.default_image_url = value;
        }
        if let Some(value) = self.loading {
            state.loading = value;
        }
        if let Some(value) = self.is_initial_load {
            state.is_initial_load = value;
        }
        if let Some(value) = self.animate_enabled {
            state.animate_enabled = value;
        }
        if let Some(value) = self.hover_enabled {
            state.hover_enabled = value;
        }
        if let Some(value) = self.published_type {
            state.published_type = value;
        }
        if let Some(value) = self.variant {
            state.variant = value;
        }
        if let Some(value) = self.source {
            state.source = value;
        }
    }
}

/// Copy-on-write map from game id to [`GameVisualState`].
pub struct VideoStateStore {
    states: watch::Sender<VisualSnapshot>,
}

impl Default for VideoStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoStateStore {
    /// Empty store.
    pub fn new() -> Self {
        let (states, _rx) = watch::channel(Arc::new(HashMap::new()));
        Self { states }
    }

    /// Create or fully replace the record for `game_id`.
    pub fn set_state(&self, game_id: &str, init: VisualStateInit) {
        let state = GameVisualState::from(init);
        self.states.send_modify(|snapshot| {
            let mut next = HashMap::clone(snapshot);
            next.insert(game_id.to_string(), state);
            *snapshot = Arc::new(next);
        });
    }

    /// Merge `patch` into an existing record. Returns `false`, changing nothing, if the game
    /// has no record.
    pub fn update_state(&self, game_id: &str, patch: VisualStatePatch) -> bool {
        self.modify(game_id, |state| patch.apply(state))
    }

    /// Record the version and publish flag of an applied backend push.
    pub fn record_push(&self, game_id: &str, version: &str, published: bool) -> bool {
        self.modify(game_id, |state| {
            state.version = version.to_string();
            state.published = published;
        })
    }

    /// Current record of `game_id`.
    pub fn get(&self, game_id: &str) -> Option<GameVisualState> {
        self.states.borrow().get(game_id).cloned()
    }

    /// Whether `game_id` has a record.
    pub fn contains(&self, game_id: &str) -> bool {
        self.states.borrow().contains_key(game_id)
    }

    /// Current map, shared with observers.
    pub fn snapshot(&self) -> VisualSnapshot {
        self.states.borrow().clone()
    }

    /// Observe every write. Each notification carries a fresh map reference.
    pub fn subscribe(&self) -> watch::Receiver<VisualSnapshot> {
        self.states.subscribe()
    }

    /// Stream of snapshots published after this call. The current map is not replayed.
    pub fn changes(&self) -> WatchStream<VisualSnapshot> {
        WatchStream::from_changes(self.states.subscribe())
    }

    fn modify<F>(&self, game_id: &str, change: F) -> bool
    where
        F: FnOnce(&mut GameVisualState),
    {
        self.states.send_if_modified(|snapshot| {
            let Some(current) = snapshot.get(game_id) else {
                return false;
            };
            let mut state = current.clone();
            change(&mut state);
            let mut next = HashMap::clone(snapshot);
            next.insert(game_id.to_string(), state);
            *snapshot = Arc::new(next);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_state_fills_defaults() {
        let store = VideoStateStore::new();
        store.set_state("game-1", VisualStateInit::default());

        let state = store.get("game-1").unwrap();
        assert_eq!(state.version, "0");
        assert!(state.published);
        assert!(!state.loading);
        assert!(state.is_initial_load);
        assert!(state.animate_enabled);
        assert!(state.hover_enabled);
        assert_eq!(state.published_type, PublishedType::Default);
        assert_eq!(state.source, AssetSource::Default);
    }

    #[test]
    fn update_on_missing_game_is_a_no_op() {
        let store = VideoStateStore::new();
        let before = store.snapshot();

        let patched = store.update_state(
            "ghost",
            VisualStatePatch {
                loading: Some(true),
                ..Default::default()
            },
        );

        assert!(!patched);
        assert!(!store.contains("ghost"));
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
        assert!(!store.record_push("ghost", "2", true));
    }

    #[test]
    fn every_write_publishes_a_new_map() {
        let store = VideoStateStore::new();
        let mut rx = store.subscribe();
        store.set_state("game-1", VisualStateInit::default());
        let first = rx.borrow_and_update().clone();

        store.update_state(
            "game-1",
            VisualStatePatch {
                poster_url: Some(Some("p.jpg".into())),
                ..Default::default()
            },
        );
        assert!(rx.has_changed().unwrap());
        let second = rx.borrow_and_update().clone();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first["game-1"].poster_url, None);
        assert_eq!(second["game-1"].poster_url.as_deref(), Some("p.jpg"));
    }

    #[test]
    fn record_push_only_touches_version_and_flag() {
        let store = VideoStateStore::new();
        store.set_state(
            "game-1",
            VisualStateInit {
                poster_url: Some("p.jpg".into()),
                ..Default::default()
            },
        );

        store.record_push("game-1", "7", false);
        let state = store.get("game-1").unwrap();
        assert_eq!(state.version, "7");
        assert!(!state.published);
        assert_eq!(state.poster_url.as_deref(), Some("p.jpg"));
    }

    #[tokio::test]
    async fn changes_stream_skips_the_current_map() {
        use tokio_stream::StreamExt;

        let store = VideoStateStore::new();
        store.set_state("game-1", VisualStateInit::default());
        let mut changes = store.changes();

        store.record_push("game-1", "2", true);
        let snapshot = changes.next().await.unwrap();
        assert_eq!(snapshot["game-1"].version, "2");
    }
}
