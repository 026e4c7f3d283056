use std::collections::{HashMap, HashSet};

use time::OffsetDateTime;
use tracing::{debug, info};

use super::{
    CatalogOutcome, OverrideAsset, matched_bindings,
    promotion::PromotionManager,
    variant::{Variant, determine_variant},
};
use crate::{dom::groups::GroupIndex, dto::catalog::OverrideRecord, services::resolution::AssetSource};

/// Active experiments keyed by game id, with the session used for bucketing.
#[derive(Debug)]
pub struct ExperimentManager {
    session_id: Option<String>,
    catalog: Option<Vec<OverrideRecord>>,
    active: HashMap<String, OverrideAsset>,
}

impl ExperimentManager {
    /// Manager that buckets with `session_id`.
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            catalog: None,
            active: HashMap::new(),
        }
    }

    /// Replace the catalog and recompute active bindings.
    pub fn update_catalog(
        &mut self,
        records: Vec<OverrideRecord>,
        groups: &GroupIndex,
        promotions: &PromotionManager,
        now: OffsetDateTime,
    ) -> CatalogOutcome {
        info!(count = records.len(), "experiment catalog received");
        self.catalog = Some(records);
        self.evaluate(groups, promotions, now)
    }

    /// Recompute active bindings. Games claimed by a promotion are skipped.
    pub fn evaluate(
        &mut self,
        groups: &GroupIndex,
        promotions: &PromotionManager,
        now: OffsetDateTime,
    ) -> CatalogOutcome {
        let previous: HashSet<String> = self.active.drain().map(|(id, _)| id).collect();
        let records = self.catalog.as_deref().unwrap_or_default();

        let mut active = HashMap::new();
        for (record, binding, game_id) in matched_bindings(records, groups, now, str::to_string) {
            if promotions.claims(&game_id) {
                debug!(game_id = %game_id, experiment_id = %record.id, "experiment yields to promotion");
                continue;
            }

            let assigned = determine_variant(self.session_id.as_deref(), &game_id);
            // A missing B arm shows the A asset and is reported as A.
            let (variant, pair) = match (assigned, binding.asset_b.as_ref()) {
                (Variant::B, Some(asset_b)) => (Variant::B, asset_b.clone()),
                _ => (Variant::A, binding.asset_a.clone()),
            };
            debug!(game_id = %game_id, experiment_id = %record.id, %variant, "experiment applies");
            active.insert(
                game_id,
                OverrideAsset {
                    override_id: record.id.clone(),
                    pair,
                    variant: Some(variant),
                    source: AssetSource::Experiment,
                },
            );
        }
        self.active = active;

        CatalogOutcome::between(previous, &self.active)
    }

    /// Winning experiment binding for `game_id`, if any.
    pub fn experiment_assets(&self, game_id: &str) -> Option<&OverrideAsset> {
        self.active.get(game_id)
    }

    /// Assigned arm for `game_id` while an experiment is active for it.
    pub fn variant_for(&self, game_id: &str) -> Option<Variant> {
        self.active.get(game_id).and_then(|asset| asset.variant)
    }
}
