use std::collections::{HashMap, HashSet};

use time::OffsetDateTime;
use tracing::{debug, info};

use super::{CatalogOutcome, OverrideAsset, matched_bindings};
use crate::{
    dom::groups::GroupIndex,
    dto::{catalog::OverrideRecord, game::GameRecord},
    services::resolution::AssetSource,
};

/// Active promotions keyed by internal game id.
///
/// Promotions bind games by content-management id, resolved through a lookup table fed by game
/// records. Unknown ids are used as-is.
#[derive(Debug, Default)]
pub struct PromotionManager {
    catalog: Option<Vec<OverrideRecord>>,
    active: HashMap<String, OverrideAsset>,
    cms_ids: HashMap<String, String>,
}

impl PromotionManager {
    /// Manager with no catalog loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the content-management id of `game`. Returns `true` if the table changed.
    pub fn learn_game(&mut self, game: &GameRecord) -> bool {
        let Some(cms_id) = game.cms_id.as_ref() else {
            return false;
        };
        if self.cms_ids.get(cms_id) == Some(&game.id) {
            return false;
        }
        self.cms_ids.insert(cms_id.clone(), game.id.clone());
        true
    }

    /// Internal id for a content-management id, falling back to the raw key.
    pub fn resolve_cms_id(&self, cms_id: &str) -> String {
        self.cms_ids
            .get(cms_id)
            .cloned()
            .unwrap_or_else(|| cms_id.to_string())
    }

    /// Whether a catalog has been received.
    pub fn has_catalog(&self) -> bool {
        self.catalog.is_some()
    }

    /// Replace the catalog and recompute active bindings.
    pub fn update_catalog(
        &mut self,
        records: Vec<OverrideRecord>,
        groups: &GroupIndex,
        now: OffsetDateTime,
    ) -> CatalogOutcome {
        info!(count = records.len(), "promotion catalog received");
        self.catalog = Some(records);
        self.evaluate(groups, now)
    }

    /// Recompute active bindings from the stored catalog.
    pub fn evaluate(&mut self, groups: &GroupIndex, now: OffsetDateTime) -> CatalogOutcome {
        let previous: HashSet<String> = self.active.drain().map(|(id, _)| id).collect();
        let records = self.catalog.as_deref().unwrap_or_default();

        let mut active = HashMap::new();
        for (record, binding, game_id) in
            matched_bindings(records, groups, now, |key| self.resolve_cms_id(key))
        {
            debug!(game_id = %game_id, promotion_id = %record.id, "promotion applies");
            active.insert(
                game_id,
                OverrideAsset {
                    override_id: record.id.clone(),
                    pair: binding.asset_a.clone(),
                    variant: None,
                    source: AssetSource::Promotion,
                },
            );
        }
        self.active = active;

        CatalogOutcome::between(previous, &self.active)
    }

    /// Winning promotion for `game_id`, if any.
    pub fn promotion_assets(&self, game_id: &str) -> Option<&OverrideAsset> {
        self.active.get(game_id)
    }

    /// Whether an active promotion owns `game_id`.
    pub fn claims(&self, game_id: &str) -> bool {
        self.active.contains_key(game_id)
    }
}
