use thiserror::Error;

pub mod agent_loop;
pub mod bandit;
pub mod directive;
pub mod evolution;
pub mod model_selector;
pub mod task_queue;

pub use agent_loop::{scan_capability_request, AgentLoop, LoopState};
pub use bandit::BanditSelector;
pub use directive::{
    ArenaTaskExecutor, DirectiveRunner, Planner, SingleTaskPlanner, TaskAttempt, TaskExecutor,
};
pub use evolution::{
    AgentLoopFactory, Assessment, Assessor, EvolutionEngine, EvolutionError, Experiment,
    ExperimentStatus, HeuristicAssessor, LlmAssessor, Submission, VariantConfig, VariantKind,
    VariantOutcome, VariantRunnerFactory,
};
pub use model_selector::ModelSelector;
pub use task_queue::{FailOutcome, QueueError, TaskQueue};

/// Selection exhaustion. Surfaced to the caller, never retried internally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no candidate arms to select from")]
    NoCandidates,

    #[error("no active models available")]
    NoActiveModels,
}
