//! Override catalogs pushed by the backend and their normalised form.

use serde::{Deserialize, Serialize};
use serde_with::{NoneAsEmptyString, serde_as};

use crate::dto::game::AssetPair;

/// Promotion as sent in `promotions-response` / `promotions-updated`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionRecord {
    /// Backend identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Group key scoping the promotion to card groups.
    #[serde(default)]
    pub group: String,
    /// First active day; empty means absent.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub start_date: Option<String>,
    /// Last active day; empty means absent.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub end_date: Option<String>,
    /// Absent means published.
    #[serde(default)]
    pub published: Option<bool>,
    /// Per-game asset assignments.
    #[serde(default)]
    pub games: Vec<PromotionGame>,
}

/// Asset pair a promotion assigns to one game, keyed by its content-management id.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionGame {
    /// Content-management id of the game.
    pub game_cms_id: String,
    /// Promotion poster.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub promo_image: Option<String>,
    /// Promotion video.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub promo_video: Option<String>,
}

/// A/B experiment as sent in `abtests-response` / `abtests-updated`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbTestRecord {
    /// Backend identifier.
    pub id: String,
    /// Group key scoping the experiment to card groups.
    #[serde(default)]
    pub group: String,
    /// First active day.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub start_date: Option<String>,
    /// Last active day.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub end_date: Option<String>,
    /// Absent means published.
    #[serde(default)]
    pub published: Option<bool>,
    /// Internal id of the game under test.
    pub game_id: String,
    /// Poster of arm A.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub image_variant_a: Option<String>,
    /// Poster of arm B.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub image_variant_b: Option<String>,
    /// Video of arm A.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub video_variant_a: Option<String>,
    /// Video of arm B.
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub video_variant_b: Option<String>,
    /// Creator of the experiment; older backends send `user_id`.
    #[serde(default, alias = "user_id")]
    pub user_id: Option<String>,
}

/// Common shape of promotions and experiments once normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideRecord {
    /// Backend identifier.
    pub id: String,
    /// Group key scoping the record.
    pub group: String,
    /// First active day.
    pub start_date: Option<String>,
    /// Last active day.
    pub end_date: Option<String>,
    /// Whether the record may apply at all.
    pub published: bool,
    /// Games the record assigns assets to.
    pub bindings: Vec<GameBinding>,
}

/// Asset assignment for one game inside an override record.
#[derive(Debug, Clone, PartialEq)]
pub struct GameBinding {
    /// Content-management id for promotions, internal game id for experiments.
    pub game_key: String,
    /// Assets of the only promotion arm, or experiment arm A.
    pub asset_a: AssetPair,
    /// Second experiment arm. Promotions only carry `asset_a`.
    pub asset_b: Option<AssetPair>,
}

impl From<PromotionRecord> for OverrideRecord {
    fn from(value: PromotionRecord) -> Self {
        let bindings = value
            .games
            .into_iter()
            .map(|game| GameBinding {
                game_key: game.game_cms_id,
                asset_a: AssetPair::new(game.promo_image, game.promo_video),
                asset_b: None,
            })
            .collect();

        Self {
            id: value.id,
            group: value.group,
            start_date: value.start_date,
            end_date: value.end_date,
            published: value.published.unwrap_or(true),
            bindings,
        }
    }
}

impl From<AbTestRecord> for OverrideRecord {
    fn from(value: AbTestRecord) -> Self {
        let asset_b = AssetPair::new(value.image_variant_b, value.video_variant_b);
        let binding = GameBinding {
            game_key: value.game_id,
            asset_a: AssetPair::new(value.image_variant_a, value.video_variant_a),
            asset_b: (!asset_b.is_empty()).then_some(asset_b),
        };

        Self {
            id: value.id,
            group: value.group,
            start_date: value.start_date,
            end_date: value.end_date,
            published: value.published.unwrap_or(true),
            bindings: vec![binding],
        }
    }
}
