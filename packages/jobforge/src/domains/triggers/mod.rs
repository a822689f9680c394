//! Trigger rules and their evaluator.

mod evaluator;
mod rule;

pub use evaluator::{
    render_template, BundleResolver, SafetyChecks, TriggerDecision, TriggerEvaluationResult,
    TriggerEvaluator,
};
pub use rule::{
    severity_rank, ActionSpec, BundleRequestTemplate, BundleSource, MatchSpec, SafetySpec,
    TriggerRule, SEVERITY_LEVELS,
};
