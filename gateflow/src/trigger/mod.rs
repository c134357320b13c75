//! Trigger rules and their evaluation.
//!
//! Trigger conditions are evaluated here and nowhere else: the engine only
//! sees the resulting [`Enablement`].

mod evaluator;
mod rule;

pub use evaluator::{Enablement, TriggerEvaluator, DEFAULT_PRIMARY_BRANCH};
pub use rule::TriggerRule;
