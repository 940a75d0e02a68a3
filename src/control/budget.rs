//! Step-budget partitioning between exploration and synthesis.
//!
//! A fixed step budget is split by classified query complexity; the
//! remainder is held back as a synthesis reserve so the loop never spends
//! every step gathering evidence it has no budget left to use.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{LazyLock, Mutex};

/// Classified complexity of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    Simple,
    Medium,
    Complex,
}

impl QueryComplexity {
    /// Percentage of the budget available for exploration.
    pub fn exploration_percent(&self) -> u32 {
        match self {
            Self::Simple => 50,
            Self::Medium => 70,
            Self::Complex => 85,
        }
    }
}

static COMPLEX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        architecture|architect|design|overview|
        how\s+do(es)?\s+.+\s+interact|
        relationship\s+between|across|entire
        ",
    )
    .expect("invalid regex")
});

static SIMPLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        what\s+is|where\s+is|show\s+me|find\s+the|
        \blist\b|which\s+file|which\s+function
        ",
    )
    .expect("invalid regex")
});

impl QueryComplexity {
    /// Classify a query. Complex markers override simple markers; the
    /// default is medium.
    pub fn classify(query: &str) -> Self {
        if COMPLEX_PATTERN.is_match(query) {
            Self::Complex
        } else if SIMPLE_PATTERN.is_match(query) {
            Self::Simple
        } else {
            Self::Medium
        }
    }
}

impl std::fmt::Display for QueryComplexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BudgetState {
    total_steps: u32,
    current_step: u32,
    exploration_budget: u32,
    complexity: QueryComplexity,
    synthesis_mode: bool,
}

/// Consistent snapshot of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub total_steps: u32,
    pub current_step: u32,
    pub exploration_budget: u32,
    pub complexity: QueryComplexity,
    pub synthesis_mode: bool,
}

/// Lock-guarded step budget for one session.
#[derive(Debug)]
pub struct StepBudget {
    state: Mutex<BudgetState>,
}

impl StepBudget {
    /// Split `total_steps` for a query: simple 50%, medium 70%, complex
    /// 85% exploration; the remainder is the synthesis reserve.
    pub fn for_query(total_steps: u32, query: &str) -> Self {
        let complexity = QueryComplexity::classify(query);
        Self::with_complexity(total_steps, complexity)
    }

    pub fn with_complexity(total_steps: u32, complexity: QueryComplexity) -> Self {
        let total_steps = total_steps.max(1);
        let exploration_budget =
            (total_steps * complexity.exploration_percent() / 100).clamp(1, total_steps);
        Self {
            state: Mutex::new(BudgetState {
                total_steps,
                current_step: 0,
                exploration_budget,
                complexity,
                synthesis_mode: false,
            }),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True iff not in synthesis mode and exploration steps remain.
    pub fn can_explore(&self) -> bool {
        let state = self.locked();
        !state.synthesis_mode && state.current_step < state.exploration_budget
    }

    /// True iff in synthesis mode or the exploration budget is spent.
    pub fn must_synthesize(&self) -> bool {
        let state = self.locked();
        state.synthesis_mode || state.current_step >= state.exploration_budget
    }

    /// Record one consumed exploration step.
    pub fn increment_step(&self) {
        let mut state = self.locked();
        state.current_step += 1;
    }

    /// Enter explicit synthesis mode.
    pub fn enter_synthesis(&self) {
        let mut state = self.locked();
        state.synthesis_mode = true;
    }

    /// Whether explicit synthesis mode is set.
    pub fn in_synthesis(&self) -> bool {
        self.locked().synthesis_mode
    }

    /// Steps remaining against the total budget.
    pub fn remaining_steps(&self) -> u32 {
        let state = self.locked();
        state.total_steps.saturating_sub(state.current_step)
    }

    /// Steps remaining against the exploration budget.
    pub fn remaining_exploration_steps(&self) -> u32 {
        let state = self.locked();
        state.exploration_budget.saturating_sub(state.current_step)
    }

    /// Grant extra exploration steps for a grounding feedback loop and
    /// leave synthesis mode.
    pub fn extend_exploration(&self, extra: u32) {
        let mut state = self.locked();
        state.exploration_budget = state.current_step + extra.max(1);
        state.total_steps = state.total_steps.max(state.exploration_budget + 1);
        state.synthesis_mode = false;
    }

    /// Reset counters, keeping the split.
    pub fn reset(&self) {
        let mut state = self.locked();
        state.current_step = 0;
        state.synthesis_mode = false;
    }

    /// Consistent snapshot.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.locked();
        BudgetSnapshot {
            total_steps: state.total_steps,
            current_step: state.current_step,
            exploration_budget: state.exploration_budget,
            complexity: state.complexity,
            synthesis_mode: state.synthesis_mode,
        }
    }
}
