//! Control-flow hardening: step budgets, intent classification, output
//! sanitisation.

mod budget;
mod intent;
mod sanitize;

pub use budget::{BudgetSnapshot, QueryComplexity, StepBudget};
pub use intent::{
    fnv1a_64, IntentClassifier, IntentResult, DEFAULT_INTENT_CACHE_CAP,
    DEFAULT_INTENT_CACHE_TTL,
};
pub use sanitize::{ModelFamily, SanitizeOutcome, Sanitizer};
