//! Promotion and experiment overrides.
//!
//! Each catalog change clears the active bindings, recomputes them from the records that are
//! active now and scoped to tagged cards, and reports which games changed hands so the caller
//! can refresh them.

/// Experiment bindings and variant assignment.
pub mod experiment;
/// Promotion bindings.
pub mod promotion;
/// Deterministic A/B bucketing.
pub mod variant;
/// Date windows that activate override records.
pub mod window;

use std::collections::{BTreeSet, HashMap, HashSet};

use time::OffsetDateTime;
use tracing::debug;

use crate::{
    dom::{Document, groups::GroupIndex},
    dto::{
        catalog::{GameBinding, OverrideRecord},
        game::{AssetPair, GameRecord},
    },
    services::resolution::{AssetSource, ResolvedAsset, resolve_asset},
};

pub use self::{experiment::ExperimentManager, promotion::PromotionManager, variant::Variant};

/// Winning override binding for one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideAsset {
    /// Id of the promotion or experiment.
    pub override_id: String,
    /// Assets the binding supplies.
    pub pair: AssetPair,
    /// Experiment arm, `None` for promotions.
    pub variant: Option<Variant>,
    /// Kind of override.
    pub source: AssetSource,
}

/// Games affected by a catalog recomputation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogOutcome {
    /// Games currently carrying an override, sorted.
    pub applied: Vec<String>,
    /// Games that lost their override.
    pub reverted: Vec<String>,
    /// Games that gained an override.
    pub gained: Vec<String>,
}

impl CatalogOutcome {
    fn between(previous: HashSet<String>, current: &HashMap<String, OverrideAsset>) -> Self {
        let current_ids: BTreeSet<&String> = current.keys().collect();
        let mut reverted: Vec<String> = previous
            .iter()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        reverted.sort();

        Self {
            applied: current_ids.iter().map(|id| (*id).clone()).collect(),
            reverted,
            gained: current_ids
                .into_iter()
                .filter(|id| !previous.contains(*id))
                .cloned()
                .collect(),
        }
    }

    /// Combine two outcomes, keeping each list sorted and unique.
    pub fn merge(self, other: CatalogOutcome) -> CatalogOutcome {
        fn union(a: Vec<String>, b: Vec<String>) -> Vec<String> {
            a.into_iter().chain(b).collect::<BTreeSet<_>>().into_iter().collect()
        }
        CatalogOutcome {
            applied: union(self.applied, other.applied),
            reverted: union(self.reverted, other.reverted),
            gained: union(self.gained, other.gained),
        }
    }

    /// Games that must be re-requested from the backend.
    pub fn refresh_targets(&self) -> Vec<String> {
        self.reverted
            .iter()
            .chain(&self.gained)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Bindings of active records whose game is a tagged card inside the record's group.
///
/// `resolve_key` maps a binding key to an internal game id. The first record claiming a game
/// wins.
fn matched_bindings<'a, F>(
    records: &'a [OverrideRecord],
    groups: &GroupIndex,
    now: OffsetDateTime,
    resolve_key: F,
) -> Vec<(&'a OverrideRecord, &'a GameBinding, String)>
where
    F: Fn(&str) -> String,
{
    let mut claimed = HashSet::new();
    let mut matched = Vec::new();
    for record in records.iter().filter(|record| window::is_active(record, now)) {
        let members = groups.members(&record.group);
        if members.is_empty() {
            debug!(override_id = %record.id, group = %record.group, "override group has no tagged cards");
            continue;
        }
        for binding in &record.bindings {
            let game_id = resolve_key(&binding.game_key);
            if !members.iter().any(|member| member.game_key == game_id) {
                continue;
            }
            if claimed.insert(game_id.clone()) {
                matched.push((record, binding, game_id));
            }
        }
    }
    matched
}

/// Both override managers and the group index they share.
#[derive(Debug)]
pub struct Overrides {
    groups: GroupIndex,
    promotions: PromotionManager,
    experiments: ExperimentManager,
}

impl Overrides {
    /// Empty override state for `session_id`.
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            groups: GroupIndex::new(),
            promotions: PromotionManager::new(),
            experiments: ExperimentManager::new(session_id),
        }
    }

    /// Promotion catalog state.
    pub fn promotions(&self) -> &PromotionManager {
        &self.promotions
    }

    /// Experiment catalog state.
    pub fn experiments(&self) -> &ExperimentManager {
        &self.experiments
    }

    /// Install a promotion catalog, then re-evaluate experiments so they yield to it.
    pub fn apply_promotions(
        &mut self,
        records: Vec<OverrideRecord>,
        document: &Document,
        now: OffsetDateTime,
    ) -> CatalogOutcome {
        self.groups.refresh(document);
        let promoted = self.promotions.update_catalog(records, &self.groups, now);
        let experiments = self.experiments.evaluate(&self.groups, &self.promotions, now);
        promoted.merge(experiments)
    }

    /// Install an experiment catalog.
    pub fn apply_experiments(
        &mut self,
        records: Vec<OverrideRecord>,
        document: &Document,
        now: OffsetDateTime,
    ) -> CatalogOutcome {
        self.groups.refresh(document);
        self.experiments
            .update_catalog(records, &self.groups, &self.promotions, now)
    }

    /// Record content-management ids of `games`. If a promotion catalog is installed and the
    /// lookup table changed, both managers are re-evaluated.
    pub fn learn_games(
        &mut self,
        games: &[GameRecord],
        document: &Document,
        now: OffsetDateTime,
    ) -> Option<CatalogOutcome> {
        let learned = games
            .iter()
            .fold(false, |learned, game| self.promotions.learn_game(game) || learned);
        if !learned || !self.promotions.has_catalog() {
            return None;
        }
        Some(self.reevaluate(document, now))
    }

    /// Recompute both managers from their stored catalogs, e.g. after the page changed.
    pub fn reevaluate(&mut self, document: &Document, now: OffsetDateTime) -> CatalogOutcome {
        self.groups.refresh(document);
        let promoted = self.promotions.evaluate(&self.groups, now);
        let experiments = self.experiments.evaluate(&self.groups, &self.promotions, now);
        promoted.merge(experiments)
    }

    /// Asset `game` should show given the current overrides.
    pub fn resolve(&self, game: &GameRecord) -> ResolvedAsset {
        resolve_asset(
            game,
            self.promotions.promotion_assets(&game.id),
            self.experiments.experiment_assets(&game.id),
        )
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::dom::{GAME_ID_ATTR, GROUP_ATTR, markup::MarkupNode};

    fn page() -> Document {
        Document::from_markup(&[MarkupNode::new("section")
            .attr(GROUP_ATTR, "g1")
            .child(MarkupNode::new("div").attr(GAME_ID_ATTR, "A"))
            .child(MarkupNode::new("div").attr(GAME_ID_ATTR, "B"))])
    }

    fn experiment(game: &str) -> OverrideRecord {
        OverrideRecord {
            id: format!("ab-{game}"),
            group: "g1".into(),
            start_date: Some("2024-01-01".into()),
            end_date: Some("2024-01-10".into()),
            published: true,
            bindings: vec![GameBinding {
                game_key: game.into(),
                asset_a: AssetPair::new(Some("imgA".into()), None),
                asset_b: Some(AssetPair::new(Some("imgB".into()), None)),
            }],
        }
    }

    fn promotion(cms: &str) -> OverrideRecord {
        OverrideRecord {
            id: "promo-1".into(),
            group: "g1".into(),
            start_date: Some("2024-01-01".into()),
            end_date: Some("2024-01-10".into()),
            published: true,
            bindings: vec![GameBinding {
                game_key: cms.into(),
                asset_a: AssetPair::new(Some("promo.jpg".into()), None),
                asset_b: None,
            }],
        }
    }

    fn game(id: &str, cms: &str) -> GameRecord {
        let mut game = GameRecord::new(id);
        game.cms_id = Some(cms.into());
        game.published = true;
        game.default_image = Some(format!("{id}.jpg"));
        game
    }

    #[test]
    fn experiment_scenario_depends_on_date() {
        let doc = page();
        let mut overrides = Overrides::new(Some("S".into()));

        let outcome = overrides.apply_experiments(vec![experiment("A")], &doc, datetime!(2024-01-05 12:00 UTC));
        assert_eq!(outcome.gained, vec!["A"]);
        let resolved = overrides.resolve(&game("A", "cms-a"));
        assert_eq!(resolved.source, AssetSource::Experiment);
        assert!(matches!(resolved.variant, Some(Variant::A | Variant::B)));
        assert!(resolved.image_url.is_some());

        let outcome = overrides.apply_experiments(vec![experiment("A")], &doc, datetime!(2024-02-01 12:00 UTC));
        assert_eq!(outcome.reverted, vec!["A"]);
        assert!(outcome.applied.is_empty());
        let resolved = overrides.resolve(&game("A", "cms-a"));
        assert_eq!(resolved.source, AssetSource::Default);
        assert_eq!(resolved.variant, None);
    }

    #[test]
    fn promotion_claims_game_and_experiment_yields() {
        let doc = page();
        let now = datetime!(2024-01-05 12:00 UTC);
        let mut overrides = Overrides::new(Some("S".into()));
        overrides.apply_experiments(vec![experiment("A")], &doc, now);
        assert!(overrides.learn_games(&[game("A", "cms-a")], &doc, now).is_none());

        let outcome = overrides.apply_promotions(vec![promotion("cms-a")], &doc, now);
        assert_eq!(outcome.applied, vec!["A"]);
        assert!(overrides.experiments().experiment_assets("A").is_none());

        let resolved = overrides.resolve(&game("A", "cms-a"));
        assert_eq!(resolved.source, AssetSource::Promotion);
        assert_eq!(resolved.image_url.as_deref(), Some("promo.jpg"));

        // Promotion ends: the experiment takes the game back.
        let outcome = overrides.apply_promotions(Vec::new(), &doc, now);
        assert_eq!(outcome.applied, vec!["A"]);
        assert_eq!(overrides.resolve(&game("A", "cms-a")).source, AssetSource::Experiment);
    }

    #[test]
    fn learning_cms_ids_after_catalog_applies_promotion() {
        let doc = page();
        let now = datetime!(2024-01-05 12:00 UTC);
        let mut overrides = Overrides::new(Some("S".into()));

        let outcome = overrides.apply_promotions(vec![promotion("cms-b")], &doc, now);
        assert!(outcome.applied.is_empty());

        let outcome = overrides.learn_games(&[game("B", "cms-b")], &doc, now).unwrap();
        assert_eq!(outcome.gained, vec!["B"]);
        assert!(overrides.learn_games(&[game("B", "cms-b")], &doc, now).is_none());
    }

    #[test]
    fn outcome_refresh_targets_are_unique_and_sorted() {
        let outcome = CatalogOutcome {
            applied: vec![],
            reverted: vec!["b".into(), "a".into()],
            gained: vec!["a".into(), "c".into()],
        };
        assert_eq!(outcome.refresh_targets(), vec!["a", "b", "c"]);
    }
}
