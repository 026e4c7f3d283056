//! Asset precedence: promotion, then experiment, then the published type, then the default pair.

use serde::Serialize;

use crate::{
    dto::game::{AssetPair, GameRecord, PublishedType},
    services::overrides::{OverrideAsset, variant::Variant},
};

/// Where a resolved asset came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetSource {
    /// The game's own published assets.
    #[default]
    Default,
    /// A promotion binding won.
    Promotion,
    /// An experiment arm won.
    Experiment,
}

/// Asset a card should show, derived on demand and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAsset {
    /// Image to show, if any.
    pub image_url: Option<String>,
    /// Video to play, if any.
    pub video_url: Option<String>,
    /// Experiment arm, set only for experiment assets.
    pub variant: Option<Variant>,
    /// Where the pair came from.
    pub source: AssetSource,
}

/// Pair selected by the game's own publish state.
///
/// Unpublished games show the default pair. `current`, `theme` and `promo` select their pair,
/// falling back field by field to the default pair.
pub fn published_assets(game: &GameRecord) -> AssetPair {
    let default = game.default_pair();
    if !game.published {
        return default;
    }
    match game.published_type {
        PublishedType::Current => game.current_pair().or(&default),
        PublishedType::Theme => game.theme_pair().or(&default),
        PublishedType::Promo => game.promo_pair().or(&default),
        PublishedType::Default | PublishedType::Unknown => default,
    }
}

/// Apply the precedence chain. Missing override fields fall back to the published pair.
pub fn resolve_asset(
    game: &GameRecord,
    promotion: Option<&OverrideAsset>,
    experiment: Option<&OverrideAsset>,
) -> ResolvedAsset {
    let published = published_assets(game);
    match promotion.or(experiment) {
        Some(winner) => {
            let pair = winner.pair.clone().or(&published);
            ResolvedAsset {
                image_url: pair.image,
                video_url: pair.video,
                variant: winner.variant,
                source: winner.source,
            }
        }
        None => ResolvedAsset {
            image_url: published.image,
            video_url: published.video,
            variant: None,
            source: AssetSource::Default,
        },
    }
}
