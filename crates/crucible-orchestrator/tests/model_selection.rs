use crucible_core::SelectorConfig;
use crucible_orchestrator::{ModelSelector, SelectionError};
use crucible_types::{ModelDescriptor, ModelRequirements};

fn catalog() -> Vec<ModelDescriptor> {
    let mut cheap_a = ModelDescriptor::new("budget-small", "openrouter");
    cheap_a.group_id = Some("budget".to_string());
    cheap_a.cost_per_1k = 0.01;
    let mut cheap_b = ModelDescriptor::new("budget-large", "openrouter");
    cheap_b.group_id = Some("budget".to_string());
    cheap_b.cost_per_1k = 0.02;
    let mut main = ModelDescriptor::new("primary", "openai");
    main.group_id = Some("frontier".to_string());
    main.cost_per_1k = 1.5;
    vec![cheap_a, cheap_b, main]
}

#[test]
fn test_excluded_group_loses_to_the_remaining_model() {
    let selector = ModelSelector::new(catalog(), SelectorConfig::default());
    let excluded_groups = vec!["budget".to_string()];
    for _ in 0..50 {
        let picked = selector
            .resolve(&ModelRequirements::default(), &[], &excluded_groups)
            .unwrap();
        assert_eq!(picked, "primary");
    }
}

#[test]
fn test_low_priority_group_loses_to_the_remaining_model() {
    let config = SelectorConfig {
        low_priority_groups: vec!["budget".to_string()],
        ..SelectorConfig::default()
    };
    let selector = ModelSelector::new(catalog(), config);
    for _ in 0..50 {
        let picked = selector
            .resolve(&ModelRequirements::default(), &[], &[])
            .unwrap();
        assert_eq!(picked, "primary");
    }
}

#[test]
fn test_excluded_ids_hold_through_every_fallback() {
    let selector = ModelSelector::new(catalog(), SelectorConfig::default());
    let excluded_ids = vec!["primary".to_string()];
    let excluded_groups = vec!["budget".to_string()];
    for _ in 0..50 {
        let picked = selector
            .resolve(&ModelRequirements::default(), &excluded_ids, &excluded_groups)
            .unwrap();
        assert_ne!(picked, "primary");
    }

    let everything = catalog().into_iter().map(|m| m.id).collect::<Vec<_>>();
    assert_eq!(
        selector.resolve(&ModelRequirements::default(), &everything, &[]),
        Err(SelectionError::NoActiveModels)
    );
}
