use std::cmp::Ordering;

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crucible_core::SelectorConfig;
use crucible_types::{ModelDescriptor, ModelRequirements};

use crate::SelectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Strict,
    AnyCapability,
    CostOnly,
    AnyGroup,
    AnyActive,
}

const CASCADE: [Step; 5] = [
    Step::Strict,
    Step::AnyCapability,
    Step::CostOnly,
    Step::AnyGroup,
    Step::AnyActive,
];

/// Ranks catalog models against task requirements, relaxing constraints step
/// by step until something qualifies. Two rules hold at every step: the cost
/// ceiling is enforced and explicitly excluded ids are never returned.
pub struct ModelSelector {
    config: SelectorConfig,
    catalog: RwLock<Vec<ModelDescriptor>>,
    rng: Mutex<SmallRng>,
}

impl ModelSelector {
    pub fn new(catalog: Vec<ModelDescriptor>, config: SelectorConfig) -> Self {
        Self {
            config,
            catalog: RwLock::new(catalog),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(SmallRng::seed_from_u64(seed));
        self
    }

    pub fn set_catalog(&self, catalog: Vec<ModelDescriptor>) {
        *self.catalog.write() = catalog;
    }

    pub fn catalog(&self) -> Vec<ModelDescriptor> {
        self.catalog.read().clone()
    }

    /// Random pick among the top-N survivors of the cascade.
    pub fn resolve(
        &self,
        requirements: &ModelRequirements,
        excluded_ids: &[String],
        excluded_group_ids: &[String],
    ) -> Result<String, SelectionError> {
        let shortlist = self.shortlist(requirements, excluded_ids, excluded_group_ids)?;
        let mut rng = self.rng.lock();
        shortlist
            .choose(&mut *rng)
            .map(|model| model.id.clone())
            .ok_or(SelectionError::NoActiveModels)
    }

    /// The ranked top-N of the first cascade step that yields anything.
    pub fn shortlist(
        &self,
        requirements: &ModelRequirements,
        excluded_ids: &[String],
        excluded_group_ids: &[String],
    ) -> Result<Vec<ModelDescriptor>, SelectionError> {
        let catalog = self.catalog.read();
        for step in CASCADE {
            let survivors = catalog
                .iter()
                .filter(|model| {
                    admits(step, model, requirements, excluded_ids, excluded_group_ids)
                })
                .collect::<Vec<_>>();
            if survivors.is_empty() {
                continue;
            }
            if step != CASCADE[0] {
                tracing::debug!(?step, "model selection relaxed constraints");
            }
            let pool = if matches!(step, Step::AnyGroup | Step::AnyActive) {
                survivors
            } else {
                self.demote_low_priority(survivors)
            };
            let mut ranked = pool.into_iter().cloned().collect::<Vec<_>>();
            ranked.sort_by(rank);
            ranked.truncate(self.config.top_n.max(1));
            return Ok(ranked);
        }
        Err(SelectionError::NoActiveModels)
    }

    fn demote_low_priority<'a>(&self, pool: Vec<&'a ModelDescriptor>) -> Vec<&'a ModelDescriptor> {
        let (secondary, primary): (Vec<_>, Vec<_>) = pool
            .into_iter()
            .partition(|model| model.in_group(&self.config.low_priority_groups));
        if primary.is_empty() {
            secondary
        } else {
            primary
        }
    }
}

fn admits(
    step: Step,
    model: &ModelDescriptor,
    requirements: &ModelRequirements,
    excluded_ids: &[String],
    excluded_group_ids: &[String],
) -> bool {
    if !model.active || excluded_ids.iter().any(|id| id == &model.id) {
        return false;
    }
    if let Some(ceiling) = requirements.max_cost_per_1k {
        if model.cost_per_1k > ceiling {
            return false;
        }
    }
    if step == Step::AnyActive {
        return true;
    }
    if !model.enabled {
        return false;
    }
    if step == Step::AnyGroup {
        return true;
    }
    if model.in_group(excluded_group_ids) {
        return false;
    }
    if step == Step::CostOnly {
        return true;
    }
    if let Some(min) = requirements.min_context_window {
        if model.context_window < min {
            return false;
        }
    }
    step == Step::AnyCapability || model.capabilities.satisfies(&requirements.capabilities)
}

fn rank(a: &ModelDescriptor, b: &ModelDescriptor) -> Ordering {
    a.cost_per_1k
        .partial_cmp(&b.cost_per_1k)
        .unwrap_or(Ordering::Equal)
        .then(a.context_window.cmp(&b.context_window))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_types::ModelCapabilities;

    fn model(id: &str, cost: f64, ctx: usize) -> ModelDescriptor {
        let mut m = ModelDescriptor::new(id, "p");
        m.cost_per_1k = cost;
        m.context_window = ctx;
        m
    }

    fn selector(catalog: Vec<ModelDescriptor>) -> ModelSelector {
        ModelSelector::new(catalog, SelectorConfig::default()).with_seed(1)
    }

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn shortlist_sorts_by_cost_then_context() {
        let s = selector(vec![
            model("pricey", 3.0, 8_000),
            model("cheap-big", 0.5, 200_000),
            model("cheap-small", 0.5, 32_000),
            model("mid", 1.0, 8_000),
        ]);
        let ids = s
            .shortlist(&ModelRequirements::default(), &[], &[])
            .expect("shortlist")
            .into_iter()
            .map(|m| m.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["cheap-small", "cheap-big", "mid"]);
    }

    #[test]
    fn capability_relaxation_keeps_context_and_cost() {
        let mut vision = model("vision", 5.0, 128_000);
        vision.capabilities.vision = true;
        let s = selector(vec![vision, model("plain", 1.0, 128_000), model("tiny", 0.1, 4_000)]);
        let req = ModelRequirements {
            capabilities: ModelCapabilities {
                vision: true,
                reasoning: true,
                coding: false,
            },
            min_context_window: Some(100_000),
            max_cost_per_1k: Some(2.0),
        };
        // No model has vision+reasoning under the ceiling; step 2 keeps the
        // context floor so `tiny` is still out.
        assert_eq!(s.resolve(&req, &[], &[]).expect("model"), "plain");
    }

    #[test]
    fn cost_ceiling_is_never_skipped() {
        let s = selector(vec![model("a", 5.0, 8_000), model("b", 9.0, 8_000)]);
        let req = ModelRequirements {
            max_cost_per_1k: Some(1.0),
            ..ModelRequirements::default()
        };
        assert_eq!(s.resolve(&req, &[], &[]), Err(SelectionError::NoActiveModels));
    }

    #[test]
    fn excluded_ids_survive_every_fallback() {
        let mut disabled = model("disabled", 0.1, 8_000);
        disabled.enabled = false;
        let mut retired = model("retired", 0.1, 8_000);
        retired.active = false;
        let s = selector(vec![model("only", 1.0, 8_000), disabled, retired]);
        let excluded = strings(&["only"]);
        for _ in 0..20 {
            let picked = s
                .resolve(&ModelRequirements::default(), &excluded, &[])
                .expect("fallback");
            assert_eq!(picked, "disabled");
        }
        let all = strings(&["only", "disabled"]);
        assert_eq!(
            s.resolve(&ModelRequirements::default(), &all, &[]),
            Err(SelectionError::NoActiveModels)
        );
    }

    #[test]
    fn group_exclusion_relaxes_only_when_nothing_else_is_left() {
        let mut a = model("a", 0.1, 8_000);
        a.group_id = Some("vendor-x".into());
        let s = selector(vec![a]);
        let picked = s
            .resolve(&ModelRequirements::default(), &[], &strings(&["vendor-x"]))
            .expect("group relaxed");
        assert_eq!(picked, "a");
    }

    #[test]
    fn low_priority_group_is_a_secondary_pool() {
        let mut cheap = model("cheap-lp", 0.1, 8_000);
        cheap.group_id = Some("Budget".into());
        let config = SelectorConfig {
            top_n: 3,
            low_priority_groups: strings(&["budget"]),
        };
        let s = ModelSelector::new(vec![cheap.clone(), model("main", 2.0, 8_000)], config.clone())
            .with_seed(9);
        for _ in 0..10 {
            assert_eq!(
                s.resolve(&ModelRequirements::default(), &[], &[]).expect("model"),
                "main"
            );
        }
        let fallback = ModelSelector::new(vec![cheap], config);
        assert_eq!(
            fallback
                .resolve(&ModelRequirements::default(), &[], &[])
                .expect("secondary"),
            "cheap-lp"
        );
    }

    #[test]
    fn empty_catalog_has_no_active_models() {
        let s = selector(Vec::new());
        assert_eq!(
            s.resolve(&ModelRequirements::default(), &[], &[]),
            Err(SelectionError::NoActiveModels)
        );
    }
}
